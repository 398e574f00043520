// Value presentation
//
// Display text and type names for evaluation results and variables.

use crate::error::NativeResult;
use crate::eval::EvalValue;
use crate::native::NativeDebugger;
use crate::types::{ElementType, RemoteValue, ValueKind};

/// Type name as the user writes it: keywords for primitives, `.` for nested
/// types, array suffixes kept.
pub fn display_type_name(name: &str) -> String {
    let (base, suffix) = match name.find('[') {
        Some(pos) => name.split_at(pos),
        None => (name, ""),
    };
    let base = match base {
        "System.String" => "string".to_string(),
        "System.Object" => "object".to_string(),
        "System.Void" => "void".to_string(),
        "System.Decimal" => "decimal".to_string(),
        other => match ElementType::from_type_name(other) {
            Some(t) => t.keyword().to_string(),
            None => other.replace('+', "."),
        },
    };
    format!("{}{}", base, suffix)
}

pub fn quote_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// `{int[2, 3]}` for a two-dimensional array, `{int[3][]}` for a jagged one.
fn array_text(type_name: &str, dims: &[u32]) -> String {
    let (element, rest) = match type_name.find('[') {
        Some(pos) => type_name.split_at(pos),
        None => (type_name, "[]"),
    };
    let outer_rank_end = rest.find(']').map(|p| p + 1).unwrap_or(rest.len());
    let dims = dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{{{}[{}]{}}}",
        display_type_name(element),
        dims,
        &rest[outer_rank_end..]
    )
}

pub fn value_type_name(value: &EvalValue) -> String {
    match value {
        EvalValue::Primitive(p) => p.element_type().keyword().to_string(),
        EvalValue::Null => "object".to_string(),
        EvalValue::Void => "void".to_string(),
        EvalValue::Remote(v) => display_type_name(&v.type_name),
    }
}

pub async fn format_remote(
    native: &dyn NativeDebugger,
    value: &RemoteValue,
) -> NativeResult<String> {
    Ok(match value.kind {
        ValueKind::NullReference => "null".to_string(),
        ValueKind::Primitive(_) => native.read_primitive(value).await?.to_string(),
        ValueKind::String => quote_string(&native.read_string(value).await?),
        ValueKind::Array => {
            let dims = native.array_dimensions(value).await?;
            array_text(&value.type_name, &dims)
        }
        ValueKind::Boxed => {
            let inner = native.unbox(value).await?;
            match inner.kind {
                ValueKind::Primitive(_) => native.read_primitive(&inner).await?.to_string(),
                _ => format!("{{{}}}", display_type_name(&inner.type_name)),
            }
        }
        ValueKind::Object => format!("{{{}}}", display_type_name(&value.type_name)),
    })
}

pub async fn format_value(native: &dyn NativeDebugger, value: &EvalValue) -> NativeResult<String> {
    match value {
        EvalValue::Primitive(p) => Ok(p.to_string()),
        EvalValue::Null => Ok("null".to_string()),
        EvalValue::Void => Ok("Expression has been evaluated and has no value".to_string()),
        EvalValue::Remote(v) => format_remote(native, v).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_type_names() {
        assert_eq!(display_type_name("System.Int32"), "int");
        assert_eq!(display_type_name("System.String[]"), "string[]");
        assert_eq!(display_type_name("App.Outer+Inner"), "App.Outer.Inner");
    }

    #[test]
    fn test_array_text() {
        assert_eq!(array_text("System.Int32[]", &[3]), "{int[3]}");
        assert_eq!(array_text("System.Int32[,]", &[2, 3]), "{int[2, 3]}");
        assert_eq!(array_text("System.Int32[][]", &[4]), "{int[4][]}");
    }

    #[test]
    fn test_quote_string() {
        assert_eq!(quote_string("a\"b\n"), "\"a\\\"b\\n\"");
    }
}
