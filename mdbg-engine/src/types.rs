// Engine type definitions
//
// Identifiers shared by the native layer, the symbol adapter and the session:
// threads, modules, methods, breakpoints, evaluations and remote values.

use serde::{Deserialize, Serialize};
use std::fmt;

// OS thread ids of the target process
pub type ThreadId = u32;

// Metadata tokens are 4 bytes, scoped to their module
pub type MethodToken = u32;
pub type TypeToken = u32;
pub type FieldToken = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

/// A method identified by its module and metadata token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub module: ModuleId,
    pub token: MethodToken,
}

impl MethodRef {
    pub fn new(module: ModuleId, token: MethodToken) -> Self {
        Self { module, token }
    }
}

/// A loaded type. `name` is the full metadata name, nested types use `+`
/// (`Ns.Outer+Inner`), arrays end in `[]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeRef {
    pub module: ModuleId,
    pub token: TypeToken,
    pub name: String,
}

impl TypeRef {
    /// Namespace part of the type name (`Ns.Sub` for `Ns.Sub.Outer+Inner`).
    pub fn namespace(&self) -> &str {
        let outer = self.name.split('+').next().unwrap_or(&self.name);
        match outer.rfind('.') {
            Some(pos) => &outer[..pos],
            None => "",
        }
    }
}

/// Handle of a breakpoint created in the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeBreakpointId(pub u32);

/// Identity of one remote evaluation (call or object construction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvalId(pub u64);

impl fmt::Display for EvalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eval#{}", self.0)
    }
}

/// Handle of a value living in the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u64);

// Primitive element types, tagged with their metadata signature codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementType {
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0a,
    U8 = 0x0b,
    R4 = 0x0c,
    R8 = 0x0d,
}

impl ElementType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x02 => Self::Boolean,
            0x03 => Self::Char,
            0x04 => Self::I1,
            0x05 => Self::U1,
            0x06 => Self::I2,
            0x07 => Self::U2,
            0x08 => Self::I4,
            0x09 => Self::U4,
            0x0a => Self::I8,
            0x0b => Self::U8,
            0x0c => Self::R4,
            0x0d => Self::R8,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Size in bytes of the raw representation.
    pub fn size(self) -> usize {
        match self {
            Self::Boolean | Self::I1 | Self::U1 => 1,
            Self::Char | Self::I2 | Self::U2 => 2,
            Self::I4 | Self::U4 | Self::R4 => 4,
            Self::I8 | Self::U8 | Self::R8 => 8,
        }
    }

    /// Runtime type name (`System.Int32`).
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Boolean => "System.Boolean",
            Self::Char => "System.Char",
            Self::I1 => "System.SByte",
            Self::U1 => "System.Byte",
            Self::I2 => "System.Int16",
            Self::U2 => "System.UInt16",
            Self::I4 => "System.Int32",
            Self::U4 => "System.UInt32",
            Self::I8 => "System.Int64",
            Self::U8 => "System.UInt64",
            Self::R4 => "System.Single",
            Self::R8 => "System.Double",
        }
    }

    /// Language keyword (`int`).
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Boolean => "bool",
            Self::Char => "char",
            Self::I1 => "sbyte",
            Self::U1 => "byte",
            Self::I2 => "short",
            Self::U2 => "ushort",
            Self::I4 => "int",
            Self::U4 => "uint",
            Self::I8 => "long",
            Self::U8 => "ulong",
            Self::R4 => "float",
            Self::R8 => "double",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "System.Boolean" => Self::Boolean,
            "System.Char" => Self::Char,
            "System.SByte" => Self::I1,
            "System.Byte" => Self::U1,
            "System.Int16" => Self::I2,
            "System.UInt16" => Self::U2,
            "System.Int32" => Self::I4,
            "System.UInt32" => Self::U4,
            "System.Int64" => Self::I8,
            "System.UInt64" => Self::U8,
            "System.Single" => Self::R4,
            "System.Double" => Self::R8,
            _ => return None,
        })
    }

    pub fn is_integral(self) -> bool {
        !matches!(self, Self::Boolean | Self::R4 | Self::R8)
    }
}

/// A primitive value held locally by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    Bool(bool),
    Char(u16),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Primitive {
    pub fn element_type(&self) -> ElementType {
        match self {
            Self::Bool(_) => ElementType::Boolean,
            Self::Char(_) => ElementType::Char,
            Self::I8(_) => ElementType::I1,
            Self::U8(_) => ElementType::U1,
            Self::I16(_) => ElementType::I2,
            Self::U16(_) => ElementType::U2,
            Self::I32(_) => ElementType::I4,
            Self::U32(_) => ElementType::U4,
            Self::I64(_) => ElementType::I8,
            Self::U64(_) => ElementType::U8,
            Self::F32(_) => ElementType::R4,
            Self::F64(_) => ElementType::R8,
        }
    }

    /// Raw little-endian bytes, as stored in target memory.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Self::Bool(v) => vec![v as u8],
            Self::Char(v) => v.to_le_bytes().to_vec(),
            Self::I8(v) => v.to_le_bytes().to_vec(),
            Self::U8(v) => vec![v],
            Self::I16(v) => v.to_le_bytes().to_vec(),
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::I64(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    /// Decode raw little-endian bytes of the given element type.
    pub fn from_bytes(element_type: ElementType, bytes: &[u8]) -> Option<Self> {
        if bytes.len() < element_type.size() {
            return None;
        }
        let b = bytes;
        Some(match element_type {
            ElementType::Boolean => Self::Bool(b[0] != 0),
            ElementType::Char => Self::Char(u16::from_le_bytes([b[0], b[1]])),
            ElementType::I1 => Self::I8(b[0] as i8),
            ElementType::U1 => Self::U8(b[0]),
            ElementType::I2 => Self::I16(i16::from_le_bytes([b[0], b[1]])),
            ElementType::U2 => Self::U16(u16::from_le_bytes([b[0], b[1]])),
            ElementType::I4 => Self::I32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ElementType::U4 => Self::U32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ElementType::I8 => Self::I64(i64::from_le_bytes(b[..8].try_into().ok()?)),
            ElementType::U8 => Self::U64(u64::from_le_bytes(b[..8].try_into().ok()?)),
            ElementType::R4 => Self::F32(f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            ElementType::R8 => Self::F64(f64::from_le_bytes(b[..8].try_into().ok()?)),
        })
    }

    /// Result of raw operator output whose static type is unknown: the byte
    /// width picks the unsigned representation.
    pub fn from_raw_width(bytes: &[u8]) -> Option<Self> {
        let element_type = match bytes.len() {
            1 => ElementType::U1,
            2 => ElementType::U2,
            4 => ElementType::U4,
            8 => ElementType::U8,
            _ => return None,
        };
        Self::from_bytes(element_type, bytes)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Char(v) => {
                let c = char::from_u32(v as u32).unwrap_or('?');
                write!(f, "{} '{}'", v, c.escape_default())
            }
            Self::I8(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::F32(v) if v.is_finite() => write!(f, "{}", v),
            Self::F32(v) => f.write_str(&format_float(v as f64)),
            Self::F64(v) => f.write_str(&format_float(v)),
        }
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format!("{}", v)
    }
}

/// Closed set of remote value shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Primitive(ElementType),
    String,
    Object,
    Array,
    Boxed,
    NullReference,
}

/// Reference to a value in the target process. Valid only while the target
/// stays stopped, unless it was promoted to a strong handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteValue {
    pub id: ValueId,
    pub kind: ValueKind,
    /// Full runtime type name (`System.String`, `Ns.Foo`, `System.Int32[]`).
    pub type_name: String,
}

impl RemoteValue {
    pub fn is_null(&self) -> bool {
        self.kind == ValueKind::NullReference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_bytes_are_little_endian() {
        let value = Primitive::I32(0x12345678);
        assert_eq!(value.to_bytes(), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            Primitive::from_bytes(ElementType::I4, &value.to_bytes()),
            Some(value)
        );
    }

    #[test]
    fn test_raw_width_picks_unsigned_type() {
        assert_eq!(Primitive::from_raw_width(&[7]), Some(Primitive::U8(7)));
        assert_eq!(Primitive::from_raw_width(&[1, 0]), Some(Primitive::U16(1)));
        assert_eq!(
            Primitive::from_raw_width(&16u32.to_le_bytes()),
            Some(Primitive::U32(16))
        );
        assert_eq!(Primitive::from_raw_width(&[1, 2, 3]), None);
    }

    #[test]
    fn test_primitive_display() {
        assert_eq!(Primitive::F64(3.5).to_string(), "3.5");
        assert_eq!(Primitive::F64(3.0).to_string(), "3");
        assert_eq!(Primitive::Char(97).to_string(), "97 'a'");
        assert_eq!(Primitive::Bool(true).to_string(), "true");
    }

    #[test]
    fn test_type_namespace() {
        let ty = TypeRef {
            module: ModuleId(1),
            token: 0x02000002,
            name: "App.Models.Outer+Inner".to_string(),
        };
        assert_eq!(ty.namespace(), "App.Models");
    }
}
