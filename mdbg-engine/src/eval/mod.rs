// Expression evaluation
//
// Text is compiled into a stack-machine program once, then interpreted
// against a stopped frame. Primitive results stay local; anything else lives
// in the target.

pub mod compiler;
pub mod format;
pub mod interpreter;
pub mod operators;
pub mod parser;

pub use compiler::{compile, Instruction, OpCode, Program};
pub use interpreter::{EvalContext, Interpreter};

use crate::error::EvalResult;
use crate::types::{Primitive, RemoteValue};

/// Result of an expression or of one of its sub-expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    /// Computed or literal value not materialized in the target.
    Primitive(Primitive),
    /// `null` literal.
    Null,
    Remote(RemoteValue),
    /// A call to a method returning nothing.
    Void,
}

impl EvalValue {
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Remote(v) => v.is_null(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Evaluated {
    pub value: EvalValue,
    /// The value designates storage (local, argument, field, element).
    pub editable: bool,
}

pub async fn evaluate(ctx: EvalContext<'_>, text: &str) -> EvalResult<Evaluated> {
    let program = compile(text)?;
    Interpreter::new(ctx).run(&program).await
}
