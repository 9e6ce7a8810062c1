use crate::error::EvalError;
use crate::pac::builtins::PacBuiltins;
use crate::pac::interp::{Interpreter, Value};
use crate::pac::parser::parse;

const ENTRY_POINT: &str = "FindProxyForURL";

/// Evaluates PAC scripts against the builtin host functions. Each call gets
/// a fresh interpreter, so no script state leaks between evaluations.
pub struct ScriptSandbox {
    builtins: PacBuiltins,
}

impl ScriptSandbox {
    pub fn new(builtins: PacBuiltins) -> Self {
        Self { builtins }
    }

    /// Runs the script's top-level statements, then invokes
    /// `FindProxyForURL(url, host)` and returns its string result.
    pub fn evaluate(&self, script: &str, url: &str, host: &str) -> Result<String, EvalError> {
        let program = parse(script)?;
        let mut interp = Interpreter::new(&self.builtins);
        interp.run(&program)?;

        if !interp.has_function(ENTRY_POINT) {
            return Err(EvalError::MissingEntryPoint);
        }

        let args = vec![
            Value::Str(url.to_string()),
            Value::Str(host.to_string()),
        ];
        match interp.call_function(ENTRY_POINT, args)? {
            Value::Str(result) => Ok(result),
            other => Err(EvalError::NonStringResult(other.type_name())),
        }
    }
}
