// Expression compiler
//
// Turns the syntax tree into a flat stack-machine program. Operands are
// emitted before their operator; member chains emit the target, then the
// member name followed by `MemberAccess`, which folds the name into the
// entry below it.

use crate::error::{EvalError, EvalResult};
use crate::eval::operators::{BinaryOp, UnaryOp};
use crate::eval::parser::{parser, Expr, InterpolatedPart, Literal, TypeName};
use chumsky::Parser;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    Text(String),
    /// Next value popped from the stack, in source order.
    Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    Identifier(String),
    GenericName {
        name: String,
        type_args: Vec<TypeName>,
    },
    This,
    PredefinedType(String),
    Literal(Literal),
    /// Pop a name entry and append it to the chain of the entry below.
    MemberAccess,
    /// Resolve the top entry; a null value short-circuits the rest of the
    /// chain.
    ConditionalAccess,
    ElementAccess {
        args: usize,
    },
    Invocation {
        args: usize,
    },
    Unary(UnaryOp),
    Binary(BinaryOp),
    SizeOf(TypeName),
    InterpolatedString {
        pieces: Vec<Piece>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: OpCode,
    /// Overflow checking in effect at this point of the source.
    pub checked: bool,
}

pub type Program = Vec<Instruction>;

pub fn compile(text: &str) -> EvalResult<Program> {
    let exprs = parser().parse(text).into_result().map_err(|errs| {
        let detail = errs
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "syntax error".to_string());
        EvalError::compilation(format!("error CS1525: Invalid expression: {}", detail))
    })?;

    let expr = match exprs.len() {
        0 => return Err(EvalError::compilation("error CS1733: Expected expression")),
        1 => &exprs[0],
        n => {
            return Err(EvalError::compilation(format!(
                "error: only one expression can be evaluated, found {}",
                n
            )))
        }
    };

    let mut compiler = Compiler::default();
    compiler.visit(expr)?;
    trace!("Compiled '{}' into {} instructions", text, compiler.program.len());
    Ok(compiler.program)
}

#[derive(Default)]
struct Compiler {
    program: Program,
    checked: bool,
}

impl Compiler {
    fn emit(&mut self, op: OpCode) {
        self.program.push(Instruction {
            op,
            checked: self.checked,
        });
    }

    fn visit_all(&mut self, exprs: &[Expr]) -> EvalResult<()> {
        for e in exprs {
            self.visit(e)?;
        }
        Ok(())
    }

    fn emit_name(&mut self, name: &str, type_args: &Option<Vec<TypeName>>) -> EvalResult<()> {
        match type_args {
            None => self.emit(OpCode::Identifier(name.to_string())),
            Some(args) => {
                if args.is_empty() {
                    return Err(generic_without_args(name));
                }
                self.emit(OpCode::GenericName {
                    name: name.to_string(),
                    type_args: args.clone(),
                })
            }
        }
        Ok(())
    }

    fn visit(&mut self, expr: &Expr) -> EvalResult<()> {
        match expr {
            Expr::Literal(lit) => self.emit(OpCode::Literal(lit.clone())),
            Expr::Identifier(name) => self.emit(OpCode::Identifier(name.clone())),
            Expr::GenericName { name, type_args } => {
                self.emit_name(name, &Some(type_args.clone()))?;
            }
            Expr::This => self.emit(OpCode::This),
            Expr::PredefinedType(name) => self.emit(OpCode::PredefinedType(name.clone())),
            Expr::MemberAccess {
                target,
                name,
                type_args,
                conditional,
            } => {
                self.visit(target)?;
                if *conditional {
                    self.emit(OpCode::ConditionalAccess);
                }
                self.emit_name(name, type_args)?;
                self.emit(OpCode::MemberAccess);
            }
            Expr::ElementAccess {
                target,
                args,
                conditional,
            } => {
                if args.is_empty() {
                    return Err(EvalError::compilation(
                        "error CS0443: Syntax error; value expected",
                    ));
                }
                self.visit(target)?;
                if *conditional {
                    self.emit(OpCode::ConditionalAccess);
                }
                self.visit_all(args)?;
                self.emit(OpCode::ElementAccess { args: args.len() });
            }
            Expr::Invocation { target, args } => {
                match target.as_ref() {
                    Expr::Identifier(_) | Expr::GenericName { .. } | Expr::MemberAccess { .. } => {}
                    Expr::Unsupported(keyword) => return Err(unsupported(keyword)),
                    _ => return Err(EvalError::compilation("error CS0149: Method name expected")),
                }
                self.visit(target)?;
                self.visit_all(args)?;
                self.emit(OpCode::Invocation { args: args.len() });
            }
            Expr::Unary(op, operand) => {
                self.visit(operand)?;
                self.emit(OpCode::Unary(*op));
            }
            Expr::Binary(op, lhs, rhs) => {
                self.visit(lhs)?;
                self.visit(rhs)?;
                self.emit(OpCode::Binary(*op));
            }
            Expr::Checked(checked, inner) => {
                let outer = std::mem::replace(&mut self.checked, *checked);
                let result = self.visit(inner);
                self.checked = outer;
                result?;
            }
            Expr::SizeOf(ty) => self.emit(OpCode::SizeOf(ty.clone())),
            Expr::Interpolated(parts) => {
                let mut pieces = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        InterpolatedPart::Text(text) => pieces.push(Piece::Text(text.clone())),
                        InterpolatedPart::Hole(e) => {
                            self.visit(e)?;
                            pieces.push(Piece::Value);
                        }
                    }
                }
                self.emit(OpCode::InterpolatedString { pieces });
            }
            Expr::Unsupported(keyword) => return Err(unsupported(keyword)),
        }
        Ok(())
    }
}

fn generic_without_args(name: &str) -> EvalError {
    EvalError::compilation(format!(
        "error CS7003: Unexpected use of an unbound generic name '{}'",
        name
    ))
}

fn unsupported(keyword: &str) -> EvalError {
    EvalError::compilation(format!(
        "error: '{}' is not supported in expressions",
        keyword
    ))
}
