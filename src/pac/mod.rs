pub mod builtins;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod sandbox;
pub mod source;

pub use builtins::PacBuiltins;
pub use resolver::{LoopGuardPolicy, ProxyDescriptor, ProxyResolver};
pub use sandbox::ScriptSandbox;
pub use source::ScriptSource;
