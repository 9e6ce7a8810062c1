use std::collections::HashMap;

use crate::error::EvalError;
use crate::pac::parser::{BinaryOp, Expr, FunctionDecl, Program, Stmt, UnaryOp};

/// Execution budget for one evaluation. PAC scripts are tiny; anything that
/// burns through this is looping and gets cut off.
const STEP_BUDGET: u64 = 1_000_000;
const MAX_CALL_DEPTH: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Num(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
        }
    }

    /// String coercion with JS-style number formatting (no trailing `.0`).
    pub fn coerce_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Value::Str(s) => s.clone(),
        }
    }
}

/// Host-function dispatch bound into the evaluation context. The interpreter
/// itself has no I/O; everything effectful lives behind this trait.
pub trait HostFunctions {
    /// Returns None if `name` is not a host function.
    fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>>;
}

enum Flow {
    Normal,
    Return(Value),
}

pub struct Interpreter<'a> {
    host: &'a dyn HostFunctions,
    functions: HashMap<String, FunctionDecl>,
    globals: HashMap<String, Value>,
    steps_remaining: u64,
    call_depth: u32,
}

impl<'a> Interpreter<'a> {
    pub fn new(host: &'a dyn HostFunctions) -> Self {
        Self {
            host,
            functions: HashMap::new(),
            globals: HashMap::new(),
            steps_remaining: STEP_BUDGET,
            call_depth: 0,
        }
    }

    /// Declares the program's functions and runs its top-level statements.
    pub fn run(&mut self, program: &Program) -> Result<(), EvalError> {
        for function in &program.functions {
            self.functions
                .insert(function.name.clone(), function.clone());
        }
        let mut scope = HashMap::new();
        for stmt in &program.statements {
            let flow = self.exec_stmt(stmt, &mut scope)?;
            // Top-level bindings become globals statement by statement, so a
            // function invoked by a later statement already sees them.
            for (name, value) in scope.drain() {
                self.globals.insert(name, value);
            }
            if let Flow::Return(_) = flow {
                break;
            }
        }
        Ok(())
    }

    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        let function = match self.functions.get(name) {
            Some(f) => f.clone(),
            None => {
                return Err(EvalError::Runtime(format!("{name} is not defined")));
            }
        };
        self.call_declared(&function, args)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn call_declared(
        &mut self,
        function: &FunctionDecl,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(EvalError::Runtime(format!(
                "call depth limit exceeded in {}",
                function.name
            )));
        }
        self.call_depth += 1;

        let mut scope = HashMap::new();
        for (i, param) in function.params.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Undefined);
            scope.insert(param.clone(), value);
        }

        let mut result = Value::Undefined;
        for stmt in &function.body {
            match self.exec_stmt(stmt, &mut scope) {
                Ok(Flow::Return(value)) => {
                    result = value;
                    break;
                }
                Ok(Flow::Normal) => {}
                Err(e) => {
                    self.call_depth -= 1;
                    return Err(e);
                }
            }
        }

        self.call_depth -= 1;
        Ok(result)
    }

    fn step(&mut self) -> Result<(), EvalError> {
        if self.steps_remaining == 0 {
            return Err(EvalError::BudgetExceeded);
        }
        self.steps_remaining -= 1;
        Ok(())
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &mut HashMap<String, Value>,
    ) -> Result<Flow, EvalError> {
        self.step()?;
        match stmt {
            Stmt::Var(declarations) => {
                for (name, init) in declarations {
                    let value = match init {
                        Some(expr) => self.eval(expr, scope)?,
                        None => Value::Undefined,
                    };
                    scope.insert(name.clone(), value);
                }
                Ok(Flow::Normal)
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition, scope)?.truthy() {
                    self.exec_stmts(then_branch, scope)
                } else if let Some(else_branch) = else_branch {
                    self.exec_stmts(else_branch, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { condition, body } => {
                while self.eval(condition, scope)?.truthy() {
                    if let Flow::Return(value) = self.exec_stmts(body, scope)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                condition,
                update,
                body,
            } => {
                if let Some(init) = init {
                    self.exec_stmt(init, scope)?;
                }
                loop {
                    if let Some(condition) = condition {
                        if !self.eval(condition, scope)?.truthy() {
                            break;
                        }
                    }
                    if let Flow::Return(value) = self.exec_stmts(body, scope)? {
                        return Ok(Flow::Return(value));
                    }
                    if let Some(update) = update {
                        self.eval(update, scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn exec_stmts(
        &mut self,
        stmts: &[Stmt],
        scope: &mut HashMap<String, Value>,
    ) -> Result<Flow, EvalError> {
        for stmt in stmts {
            if let Flow::Return(value) = self.exec_stmt(stmt, scope)? {
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Normal)
    }

    fn eval(
        &mut self,
        expr: &Expr,
        scope: &mut HashMap<String, Value>,
    ) -> Result<Value, EvalError> {
        self.step()?;
        match expr {
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Ident(name) => {
                if let Some(value) = scope.get(name) {
                    return Ok(value.clone());
                }
                if let Some(value) = self.globals.get(name) {
                    return Ok(value.clone());
                }
                Err(EvalError::Runtime(format!("{name} is not defined")))
            }
            Expr::Assign { target, value } => {
                let value = self.eval(value, scope)?;
                if scope.contains_key(target) {
                    scope.insert(target.clone(), value.clone());
                } else {
                    // Assignment to an undeclared name creates a global.
                    self.globals.insert(target.clone(), value.clone());
                }
                Ok(value)
            }
            Expr::Ternary {
                condition,
                then_value,
                else_value,
            } => {
                if self.eval(condition, scope)?.truthy() {
                    self.eval(then_value, scope)
                } else {
                    self.eval(else_value, scope)
                }
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, scope)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Num(-value.to_number()),
                    UnaryOp::Plus => Value::Num(value.to_number()),
                })
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, scope),
            Expr::Call { function, args } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg, scope)?);
                }
                // Script-defined functions shadow host builtins.
                if self.functions.contains_key(function) {
                    return self.call_function(function, arg_values);
                }
                match self.host.call(function, &arg_values) {
                    Some(result) => result,
                    None => Err(EvalError::Runtime(format!("{function} is not defined"))),
                }
            }
            Expr::Member {
                object,
                property,
                args,
            } => {
                let object = self.eval(object, scope)?;
                let mut arg_values = Vec::new();
                if let Some(args) = args {
                    for arg in args {
                        arg_values.push(self.eval(arg, scope)?);
                    }
                }
                eval_string_member(&object, property, args.is_some(), &arg_values)
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        scope: &mut HashMap<String, Value>,
    ) -> Result<Value, EvalError> {
        // Short-circuit operators evaluate JS-style: the result is the
        // deciding operand itself, not a coerced boolean.
        match op {
            BinaryOp::And => {
                let left = self.eval(left, scope)?;
                if !left.truthy() {
                    return Ok(left);
                }
                return self.eval(right, scope);
            }
            BinaryOp::Or => {
                let left = self.eval(left, scope)?;
                if left.truthy() {
                    return Ok(left);
                }
                return self.eval(right, scope);
            }
            _ => {}
        }

        let left = self.eval(left, scope)?;
        let right = self.eval(right, scope)?;
        let value = match op {
            BinaryOp::Add => match (&left, &right) {
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    Value::Str(format!("{}{}", left.coerce_string(), right.coerce_string()))
                }
                _ => Value::Num(left.to_number() + right.to_number()),
            },
            BinaryOp::Sub => Value::Num(left.to_number() - right.to_number()),
            BinaryOp::Mul => Value::Num(left.to_number() * right.to_number()),
            BinaryOp::Div => Value::Num(left.to_number() / right.to_number()),
            BinaryOp::Rem => Value::Num(left.to_number() % right.to_number()),
            BinaryOp::Eq => Value::Bool(loose_eq(&left, &right)),
            BinaryOp::NotEq => Value::Bool(!loose_eq(&left, &right)),
            BinaryOp::StrictEq => Value::Bool(strict_eq(&left, &right)),
            BinaryOp::StrictNotEq => Value::Bool(!strict_eq(&left, &right)),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                compare(op, &left, &right)
            }
            BinaryOp::And | BinaryOp::Or => unreachable!(),
        };
        Ok(value)
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Value {
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Value::Bool(match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            _ => unreachable!(),
        });
    }
    let a = left.to_number();
    let b = right.to_number();
    Value::Bool(match op {
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Gt => a > b,
        BinaryOp::Ge => a >= b,
        _ => unreachable!(),
    })
}

fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Num(a), Value::Num(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Undefined, Value::Undefined) => true,
        _ => false,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Undefined) | (Value::Undefined, Value::Null) => true,
        (Value::Num(_), Value::Str(_))
        | (Value::Str(_), Value::Num(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_)) => {
            let a = left.to_number();
            let b = right.to_number();
            a == b
        }
        _ => strict_eq(left, right),
    }
}

/// String property access and method calls, the only member operations the
/// subset supports. Chars are indexed by Unicode scalar, which matches JS
/// for the ASCII inputs PAC scripts deal in.
fn eval_string_member(
    object: &Value,
    property: &str,
    is_call: bool,
    args: &[Value],
) -> Result<Value, EvalError> {
    let s = match object {
        Value::Str(s) => s,
        other => {
            return Err(EvalError::Runtime(format!(
                "cannot read property {property} of {}",
                other.type_name()
            )));
        }
    };

    if !is_call {
        return match property {
            "length" => Ok(Value::Num(s.chars().count() as f64)),
            _ => Err(EvalError::Runtime(format!(
                "unsupported string property: {property}"
            ))),
        };
    }

    let chars: Vec<char> = s.chars().collect();
    let arg_num = |i: usize| -> f64 { args.get(i).map(|v| v.to_number()).unwrap_or(f64::NAN) };

    match property {
        "indexOf" => {
            let needle = args
                .first()
                .map(|v| v.coerce_string())
                .unwrap_or_else(|| "undefined".to_string());
            let from = arg_num(1);
            let from = if from.is_nan() {
                0
            } else {
                (from.max(0.0) as usize).min(chars.len())
            };
            let haystack: String = chars[from..].iter().collect();
            match haystack.find(&needle) {
                Some(byte_pos) => {
                    let char_pos = haystack[..byte_pos].chars().count();
                    Ok(Value::Num((from + char_pos) as f64))
                }
                None => Ok(Value::Num(-1.0)),
            }
        }
        "lastIndexOf" => {
            let needle = args
                .first()
                .map(|v| v.coerce_string())
                .unwrap_or_else(|| "undefined".to_string());
            // A match counts when it starts at or before fromIndex; NaN (and
            // a missing argument) searches the whole string.
            let from = arg_num(1);
            let limit = if from.is_nan() {
                chars.len()
            } else if from < 0.0 {
                0
            } else {
                (from as usize).min(chars.len())
            };
            let end = (limit + needle.chars().count()).min(chars.len());
            let haystack: String = chars[..end].iter().collect();
            match haystack.rfind(&needle) {
                Some(byte_pos) => {
                    Ok(Value::Num(haystack[..byte_pos].chars().count() as f64))
                }
                None => Ok(Value::Num(-1.0)),
            }
        }
        "substring" => {
            let clamp = |n: f64| -> usize {
                if n.is_nan() {
                    0
                } else {
                    (n.max(0.0) as usize).min(chars.len())
                }
            };
            let mut start = clamp(arg_num(0));
            let mut end = if args.len() > 1 {
                clamp(arg_num(1))
            } else {
                chars.len()
            };
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }
            Ok(Value::Str(chars[start..end].iter().collect()))
        }
        "charAt" => {
            let i = arg_num(0);
            let i = if i.is_nan() { 0.0 } else { i };
            if i < 0.0 || i as usize >= chars.len() {
                Ok(Value::Str(String::new()))
            } else {
                Ok(Value::Str(chars[i as usize].to_string()))
            }
        }
        "toLowerCase" => Ok(Value::Str(s.to_lowercase())),
        "toUpperCase" => Ok(Value::Str(s.to_uppercase())),
        other => Err(EvalError::Runtime(format!(
            "unsupported string method: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pac::parser::parse;

    struct NoHost;

    impl HostFunctions for NoHost {
        fn call(&self, _name: &str, _args: &[Value]) -> Option<Result<Value, EvalError>> {
            None
        }
    }

    struct UpcaseHost;

    impl HostFunctions for UpcaseHost {
        fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
            if name != "upcase" {
                return None;
            }
            let arg = args.first().map(|v| v.coerce_string()).unwrap_or_default();
            Some(Ok(Value::Str(arg.to_uppercase())))
        }
    }

    fn eval_script(host: &dyn HostFunctions, script: &str, args: Vec<Value>) -> Value {
        let program = parse(script).unwrap();
        let mut interp = Interpreter::new(host);
        interp.run(&program).unwrap();
        interp.call_function("f", args).unwrap()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        let result = eval_script(
            &NoHost,
            "function f(a, b) { return a + ':' + (b * 2); }",
            vec![Value::Str("x".to_string()), Value::Num(21.0)],
        );
        assert_eq!(result, Value::Str("x:42".to_string()));
    }

    #[test]
    fn test_control_flow() {
        let script = r#"
            function f(n) {
                var total = 0;
                for (var i = 1; i <= n; i = i + 1) {
                    if (i % 2 == 0) total = total + i;
                }
                return total;
            }
        "#;
        assert_eq!(eval_script(&NoHost, script, vec![Value::Num(10.0)]), Value::Num(30.0));
    }

    #[test]
    fn test_host_function_dispatch_and_shadowing() {
        let result = eval_script(
            &UpcaseHost,
            "function f(s) { return upcase(s); }",
            vec![Value::Str("abc".to_string())],
        );
        assert_eq!(result, Value::Str("ABC".to_string()));

        // A script-defined function with the same name wins.
        let result = eval_script(
            &UpcaseHost,
            "function upcase(s) { return s; } function f(s) { return upcase(s); }",
            vec![Value::Str("abc".to_string())],
        );
        assert_eq!(result, Value::Str("abc".to_string()));
    }

    #[test]
    fn test_string_members() {
        let script = r#"
            function f(host) {
                if (host.length < 4) return "short";
                return host.substring(0, host.indexOf(".")).toUpperCase();
            }
        "#;
        assert_eq!(
            eval_script(&NoHost, script, vec![Value::Str("www.example.com".to_string())]),
            Value::Str("WWW".to_string())
        );
    }

    #[test]
    fn test_top_level_vars_visible_during_top_level_calls() {
        // f runs while the later top-level statements are still executing;
        // it must already see the earlier top-level var.
        let script = r#"
            var base = 1;
            function helper() { return base; }
            var total = helper() + 1;
            function f() { return total; }
        "#;
        assert_eq!(eval_script(&NoHost, script, vec![]), Value::Num(2.0));
    }

    #[test]
    fn test_last_index_of_from_index() {
        let script = "function f(s, from) { return s.lastIndexOf('ab', from); }";
        let eval = |from: Value| {
            eval_script(&NoHost, script, vec![Value::Str("abab".to_string()), from])
        };
        // Only matches starting at or before fromIndex count.
        assert_eq!(eval(Value::Num(1.0)), Value::Num(0.0));
        assert_eq!(eval(Value::Num(2.0)), Value::Num(2.0));
        assert_eq!(eval(Value::Num(99.0)), Value::Num(2.0));
        assert_eq!(eval(Value::Num(-5.0)), Value::Num(0.0));
        // Missing fromIndex searches the whole string.
        assert_eq!(eval(Value::Undefined), Value::Num(2.0));

        let script = "function f(s) { return s.lastIndexOf('zz', 1); }";
        assert_eq!(
            eval_script(&NoHost, script, vec![Value::Str("abab".to_string())]),
            Value::Num(-1.0)
        );
    }

    #[test]
    fn test_loose_and_strict_equality() {
        let script = "function f() { return (1 == '1') && !(1 === '1') && (null == undefined); }";
        assert_eq!(eval_script(&NoHost, script, vec![]), Value::Bool(true));
    }

    #[test]
    fn test_step_budget_stops_infinite_loop() {
        let program = parse("function f() { while (true) {} }").unwrap();
        let mut interp = Interpreter::new(&NoHost);
        interp.run(&program).unwrap();
        let err = interp.call_function("f", vec![]).unwrap_err();
        assert!(matches!(err, EvalError::BudgetExceeded));
    }

    #[test]
    fn test_undefined_function_is_an_error() {
        let program = parse("function f() { return nope(); }").unwrap();
        let mut interp = Interpreter::new(&NoHost);
        interp.run(&program).unwrap();
        assert!(interp.call_function("f", vec![]).is_err());
    }
}
