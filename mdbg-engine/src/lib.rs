// Managed-runtime debugging engine
//
// Drives a debug session against a managed target through a native debugging
// layer:
// - Breakpoints bound through source symbols, re-bound as modules load
// - Stepping, including stepping over `await` across threads
// - Stack, scope and variable inspection through stable handles
// - C#-style expression evaluation with remote calls into the target
// - An agent client implementing the native layer over TCP

pub mod agent;
pub mod breakpoints;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod eval;
pub mod handles;
pub mod native;
pub mod remote_call;
pub mod session;
pub mod stepper;
pub mod symbols;
pub mod types;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::AgentConnection;
pub use breakpoints::{BreakpointInfo, BreakpointRequest};
pub use config::{ExceptionBreakMode, SessionConfig};
pub use dispatcher::{SessionEvent, StopReason};
pub use error::{EngineError, EngineResult, EvalError, NativeError, NativeResult};
pub use native::{LaunchRequest, NativeDebugger, NativeEvent};
pub use session::{EvaluateResult, Session, StackFrameInfo, ThreadInfo};
pub use variables::{Scope, Variable};
