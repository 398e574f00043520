// Operator table for locally computed primitives
//
// Binary numeric promotion: double > float > ulong > long > uint > int, with
// every smaller integral type (and char) promoted to int first. Shift counts
// are masked to the width of the promoted left operand.

use crate::error::{EvalError, EvalResult};
use crate::types::{ElementType, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Not => "!",
            Self::BitNot => "~",
        }
    }

    /// Name of the user-defined operator method.
    pub fn method_name(self) -> &'static str {
        match self {
            Self::Plus => "op_UnaryPlus",
            Self::Minus => "op_UnaryNegation",
            Self::Not => "op_LogicalNot",
            Self::BitNot => "op_OnesComplement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
    Coalesce,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
            Self::And => "&&",
            Self::Or => "||",
            Self::Coalesce => "??",
        }
    }

    /// Name of the user-defined operator method, if the operator can be
    /// overloaded.
    pub fn method_name(self) -> Option<&'static str> {
        Some(match self {
            Self::Mul => "op_Multiply",
            Self::Div => "op_Division",
            Self::Rem => "op_Modulus",
            Self::Add => "op_Addition",
            Self::Sub => "op_Subtraction",
            Self::Shl => "op_LeftShift",
            Self::Shr => "op_RightShift",
            Self::Lt => "op_LessThan",
            Self::Gt => "op_GreaterThan",
            Self::Le => "op_LessThanOrEqual",
            Self::Ge => "op_GreaterThanOrEqual",
            Self::Eq => "op_Equality",
            Self::Ne => "op_Inequality",
            Self::BitAnd => "op_BitwiseAnd",
            Self::BitXor => "op_ExclusiveOr",
            Self::BitOr => "op_BitwiseOr",
            Self::And | Self::Or | Self::Coalesce => return None,
        })
    }

    pub fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Lt | Self::Gt | Self::Le | Self::Ge | Self::Eq | Self::Ne
        )
    }
}

pub fn overflow() -> EvalError {
    EvalError::runtime("Arithmetic operation resulted in an overflow.")
}

pub fn divide_by_zero() -> EvalError {
    EvalError::runtime("Attempted to divide by zero.")
}

pub fn binary_not_applicable(op: BinaryOp, lhs: &str, rhs: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS0019: Operator '{}' cannot be applied to operands of type '{}' and '{}'",
        op.symbol(),
        lhs,
        rhs
    ))
}

pub fn unary_not_applicable(op: UnaryOp, operand: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS0023: Operator '{}' cannot be applied to operand of type '{}'",
        op.symbol(),
        operand
    ))
}

// Operand after unary numeric promotion
#[derive(Debug, Clone, Copy)]
enum Num {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Num {
    fn promote(p: Primitive) -> Option<Self> {
        Some(match p {
            Primitive::Bool(_) => return None,
            Primitive::Char(v) => Self::I32(v as i32),
            Primitive::I8(v) => Self::I32(v as i32),
            Primitive::U8(v) => Self::I32(v as i32),
            Primitive::I16(v) => Self::I32(v as i32),
            Primitive::U16(v) => Self::I32(v as i32),
            Primitive::I32(v) => Self::I32(v),
            Primitive::U32(v) => Self::U32(v),
            Primitive::I64(v) => Self::I64(v),
            Primitive::U64(v) => Self::U64(v),
            Primitive::F32(v) => Self::F32(v),
            Primitive::F64(v) => Self::F64(v),
        })
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::I32(v) => v as f64,
            Self::U32(v) => v as f64,
            Self::I64(v) => v as f64,
            Self::U64(v) => v as f64,
            Self::F32(v) => v as f64,
            Self::F64(v) => v,
        }
    }

    fn as_f32(self) -> f32 {
        match self {
            Self::F32(v) => v,
            other => other.as_f64() as f32,
        }
    }

    // Integral operands only
    fn as_i128(self) -> Option<i128> {
        match self {
            Self::I32(v) => Some(v as i128),
            Self::U32(v) => Some(v as i128),
            Self::I64(v) => Some(v as i128),
            Self::U64(v) => Some(v as i128),
            Self::F32(_) | Self::F64(_) => None,
        }
    }

    fn is_negative_signed(self) -> bool {
        match self {
            Self::I32(v) => v < 0,
            Self::I64(v) => v < 0,
            _ => false,
        }
    }
}

/// Bring both operands to their common type.
fn unify(op: BinaryOp, a: Primitive, b: Primitive) -> EvalResult<(Num, Num)> {
    let not_applicable =
        || binary_not_applicable(op, a.element_type().keyword(), b.element_type().keyword());
    let x = Num::promote(a).ok_or_else(not_applicable)?;
    let y = Num::promote(b).ok_or_else(not_applicable)?;

    let pair = match (x, y) {
        (Num::F64(_), _) | (_, Num::F64(_)) => (Num::F64(x.as_f64()), Num::F64(y.as_f64())),
        (Num::F32(_), _) | (_, Num::F32(_)) => (Num::F32(x.as_f32()), Num::F32(y.as_f32())),
        (Num::U64(_), _) | (_, Num::U64(_)) => {
            // ulong mixes with a signed operand only when that operand is a
            // non-negative value that converts implicitly
            if x.is_negative_signed() || y.is_negative_signed() {
                return Err(EvalError::resolution(format!(
                    "error CS0034: Operator '{}' is ambiguous on operands of type '{}' and '{}'",
                    op.symbol(),
                    a.element_type().keyword(),
                    b.element_type().keyword()
                )));
            }
            let cast = |n: Num| Num::U64(n.as_i128().unwrap_or(0) as u64);
            (cast(x), cast(y))
        }
        (Num::I64(_), _) | (_, Num::I64(_)) => {
            let cast = |n: Num| Num::I64(n.as_i128().unwrap_or(0) as i64);
            (cast(x), cast(y))
        }
        (Num::U32(l), Num::U32(r)) => (Num::U32(l), Num::U32(r)),
        // uint with int widens to long
        (Num::U32(_), _) | (_, Num::U32(_)) => {
            let cast = |n: Num| Num::I64(n.as_i128().unwrap_or(0) as i64);
            (cast(x), cast(y))
        }
        (Num::I32(l), Num::I32(r)) => (Num::I32(l), Num::I32(r)),
    };
    Ok(pair)
}

fn arith<T>(checked: bool, exact: Option<T>, wrapped: T) -> EvalResult<T> {
    if checked {
        exact.ok_or_else(overflow)
    } else {
        Ok(wrapped)
    }
}

macro_rules! integral_op {
    ($op:expr, $x:expr, $y:expr, $checked:expr, $ctor:path, $a:expr, $b:expr) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinaryOp::Add => arith($checked, x.checked_add(y), x.wrapping_add(y)).map($ctor),
            BinaryOp::Sub => arith($checked, x.checked_sub(y), x.wrapping_sub(y)).map($ctor),
            BinaryOp::Mul => arith($checked, x.checked_mul(y), x.wrapping_mul(y)).map($ctor),
            BinaryOp::Div if y == 0 => Err(divide_by_zero()),
            BinaryOp::Div => x.checked_div(y).map($ctor).ok_or_else(overflow),
            BinaryOp::Rem if y == 0 => Err(divide_by_zero()),
            BinaryOp::Rem => x.checked_rem(y).map($ctor).ok_or_else(overflow),
            BinaryOp::BitAnd => Ok($ctor(x & y)),
            BinaryOp::BitOr => Ok($ctor(x | y)),
            BinaryOp::BitXor => Ok($ctor(x ^ y)),
            BinaryOp::Lt => Ok(Primitive::Bool(x < y)),
            BinaryOp::Gt => Ok(Primitive::Bool(x > y)),
            BinaryOp::Le => Ok(Primitive::Bool(x <= y)),
            BinaryOp::Ge => Ok(Primitive::Bool(x >= y)),
            BinaryOp::Eq => Ok(Primitive::Bool(x == y)),
            BinaryOp::Ne => Ok(Primitive::Bool(x != y)),
            _ => Err(binary_not_applicable(
                $op,
                $a.element_type().keyword(),
                $b.element_type().keyword(),
            )),
        }
    }};
}

macro_rules! float_op {
    ($op:expr, $x:expr, $y:expr, $ctor:path, $a:expr, $b:expr) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinaryOp::Add => Ok($ctor(x + y)),
            BinaryOp::Sub => Ok($ctor(x - y)),
            BinaryOp::Mul => Ok($ctor(x * y)),
            BinaryOp::Div => Ok($ctor(x / y)),
            BinaryOp::Rem => Ok($ctor(x % y)),
            BinaryOp::Lt => Ok(Primitive::Bool(x < y)),
            BinaryOp::Gt => Ok(Primitive::Bool(x > y)),
            BinaryOp::Le => Ok(Primitive::Bool(x <= y)),
            BinaryOp::Ge => Ok(Primitive::Bool(x >= y)),
            BinaryOp::Eq => Ok(Primitive::Bool(x == y)),
            BinaryOp::Ne => Ok(Primitive::Bool(x != y)),
            _ => Err(binary_not_applicable(
                $op,
                $a.element_type().keyword(),
                $b.element_type().keyword(),
            )),
        }
    }};
}

pub fn binary(op: BinaryOp, a: Primitive, b: Primitive, checked: bool) -> EvalResult<Primitive> {
    match (a, b) {
        (Primitive::Bool(x), Primitive::Bool(y)) => {
            return match op {
                BinaryOp::Eq => Ok(Primitive::Bool(x == y)),
                BinaryOp::Ne => Ok(Primitive::Bool(x != y)),
                BinaryOp::And | BinaryOp::BitAnd => Ok(Primitive::Bool(x & y)),
                BinaryOp::Or | BinaryOp::BitOr => Ok(Primitive::Bool(x | y)),
                BinaryOp::BitXor => Ok(Primitive::Bool(x ^ y)),
                _ => Err(binary_not_applicable(op, "bool", "bool")),
            };
        }
        _ if matches!(op, BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce) => {
            return Err(binary_not_applicable(
                op,
                a.element_type().keyword(),
                b.element_type().keyword(),
            ));
        }
        _ => {}
    }

    if matches!(op, BinaryOp::Shl | BinaryOp::Shr) {
        return shift(op, a, b);
    }

    match unify(op, a, b)? {
        (Num::I32(x), Num::I32(y)) => integral_op!(op, x, y, checked, Primitive::I32, a, b),
        (Num::U32(x), Num::U32(y)) => integral_op!(op, x, y, checked, Primitive::U32, a, b),
        (Num::I64(x), Num::I64(y)) => integral_op!(op, x, y, checked, Primitive::I64, a, b),
        (Num::U64(x), Num::U64(y)) => integral_op!(op, x, y, checked, Primitive::U64, a, b),
        (Num::F32(x), Num::F32(y)) => float_op!(op, x, y, Primitive::F32, a, b),
        (Num::F64(x), Num::F64(y)) => float_op!(op, x, y, Primitive::F64, a, b),
        _ => Err(binary_not_applicable(
            op,
            a.element_type().keyword(),
            b.element_type().keyword(),
        )),
    }
}

fn shift(op: BinaryOp, a: Primitive, b: Primitive) -> EvalResult<Primitive> {
    let not_applicable =
        || binary_not_applicable(op, a.element_type().keyword(), b.element_type().keyword());
    let value = Num::promote(a).ok_or_else(not_applicable)?;
    let count = Num::promote(b)
        .and_then(Num::as_i128)
        .ok_or_else(not_applicable)? as i64;
    let left = op == BinaryOp::Shl;

    Ok(match value {
        Num::I32(v) => {
            let n = (count & 31) as u32;
            Primitive::I32(if left { v.wrapping_shl(n) } else { v >> n })
        }
        Num::U32(v) => {
            let n = (count & 31) as u32;
            Primitive::U32(if left { v.wrapping_shl(n) } else { v >> n })
        }
        Num::I64(v) => {
            let n = (count & 63) as u32;
            Primitive::I64(if left { v.wrapping_shl(n) } else { v >> n })
        }
        Num::U64(v) => {
            let n = (count & 63) as u32;
            Primitive::U64(if left { v.wrapping_shl(n) } else { v >> n })
        }
        Num::F32(_) | Num::F64(_) => return Err(not_applicable()),
    })
}

pub fn unary(op: UnaryOp, value: Primitive, checked: bool) -> EvalResult<Primitive> {
    let not_applicable = || unary_not_applicable(op, value.element_type().keyword());

    if let Primitive::Bool(b) = value {
        return match op {
            UnaryOp::Not => Ok(Primitive::Bool(!b)),
            _ => Err(not_applicable()),
        };
    }
    let num = Num::promote(value).ok_or_else(not_applicable)?;

    match op {
        UnaryOp::Not => Err(not_applicable()),
        UnaryOp::Plus => Ok(from_num(num)),
        UnaryOp::BitNot => match num {
            Num::I32(v) => Ok(Primitive::I32(!v)),
            Num::U32(v) => Ok(Primitive::U32(!v)),
            Num::I64(v) => Ok(Primitive::I64(!v)),
            Num::U64(v) => Ok(Primitive::U64(!v)),
            Num::F32(_) | Num::F64(_) => Err(not_applicable()),
        },
        UnaryOp::Minus => match num {
            Num::I32(v) => arith(checked, v.checked_neg(), v.wrapping_neg()).map(Primitive::I32),
            // -uint is a long
            Num::U32(v) => Ok(Primitive::I64(-(v as i64))),
            Num::I64(v) => arith(checked, v.checked_neg(), v.wrapping_neg()).map(Primitive::I64),
            Num::U64(_) => Err(not_applicable()),
            Num::F32(v) => Ok(Primitive::F32(-v)),
            Num::F64(v) => Ok(Primitive::F64(-v)),
        },
    }
}

fn from_num(num: Num) -> Primitive {
    match num {
        Num::I32(v) => Primitive::I32(v),
        Num::U32(v) => Primitive::U32(v),
        Num::I64(v) => Primitive::I64(v),
        Num::U64(v) => Primitive::U64(v),
        Num::F32(v) => Primitive::F32(v),
        Num::F64(v) => Primitive::F64(v),
    }
}

/// Implicit numeric conversion `from -> to`.
pub fn is_widening(from: ElementType, to: ElementType) -> bool {
    use ElementType::*;
    if from == to {
        return true;
    }
    match from {
        I1 => matches!(to, I2 | I4 | I8 | R4 | R8),
        U1 => matches!(to, I2 | U2 | I4 | U4 | I8 | U8 | R4 | R8),
        I2 => matches!(to, I4 | I8 | R4 | R8),
        U2 | Char => matches!(to, I4 | U4 | I8 | U8 | R4 | R8) || (from == Char && to == U2),
        I4 => matches!(to, I8 | R4 | R8),
        U4 => matches!(to, I8 | U8 | R4 | R8),
        I8 | U8 => matches!(to, R4 | R8),
        R4 => to == R8,
        Boolean | R8 => false,
    }
}

/// Value conversion to another primitive type; callers check
/// `is_widening` first.
pub fn convert(value: Primitive, to: ElementType) -> Option<Primitive> {
    if value.element_type() == to {
        return Some(value);
    }
    if let Primitive::Bool(_) = value {
        return None;
    }
    let float = match value {
        Primitive::F32(v) => Some(v as f64),
        Primitive::F64(v) => Some(v),
        _ => None,
    };
    let int = Num::promote(value).and_then(Num::as_i128);

    Some(match (to, int, float) {
        (ElementType::R4, Some(i), _) => Primitive::F32(i as f32),
        (ElementType::R4, None, Some(f)) => Primitive::F32(f as f32),
        (ElementType::R8, Some(i), _) => Primitive::F64(i as f64),
        (ElementType::R8, None, Some(f)) => Primitive::F64(f),
        (ElementType::I1, Some(i), _) => Primitive::I8(i as i8),
        (ElementType::U1, Some(i), _) => Primitive::U8(i as u8),
        (ElementType::I2, Some(i), _) => Primitive::I16(i as i16),
        (ElementType::U2, Some(i), _) => Primitive::U16(i as u16),
        (ElementType::Char, Some(i), _) => Primitive::Char(i as u16),
        (ElementType::I4, Some(i), _) => Primitive::I32(i as i32),
        (ElementType::U4, Some(i), _) => Primitive::U32(i as u32),
        (ElementType::I8, Some(i), _) => Primitive::I64(i as i64),
        (ElementType::U8, Some(i), _) => Primitive::U64(i as u64),
        _ => return None,
    })
}

/// Integral value usable as an index or count.
pub fn as_index(value: Primitive) -> Option<i64> {
    match value {
        Primitive::Bool(_) | Primitive::F32(_) | Primitive::F64(_) => None,
        Primitive::U64(v) => i64::try_from(v).ok(),
        other => Num::promote(other)
            .and_then(Num::as_i128)
            .map(|v| v as i64),
    }
}

/// Text produced by the runtime's `ToString()` for a primitive.
pub fn to_clr_string(value: Primitive) -> String {
    let float = |v: f64, text: String| {
        if v.is_nan() {
            "NaN".to_string()
        } else if v == f64::INFINITY {
            "∞".to_string()
        } else if v == f64::NEG_INFINITY {
            "-∞".to_string()
        } else {
            text
        }
    };
    match value {
        Primitive::Bool(true) => "True".to_string(),
        Primitive::Bool(false) => "False".to_string(),
        Primitive::Char(c) => char::from_u32(c as u32)
            .map(String::from)
            .unwrap_or_default(),
        Primitive::F32(v) => float(v as f64, v.to_string()),
        Primitive::F64(v) => float(v, v.to_string()),
        other => other.to_string(),
    }
}
