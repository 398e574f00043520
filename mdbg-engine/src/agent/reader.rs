// Helper functions for reading and writing agent data types

use super::commands::value_tags;
use crate::error::{NativeError, NativeResult};
use crate::native::{
    FieldInfo, FrameKind, MethodDesc, ModuleInfo, NativeFrame, NativeThread, ParamInfo,
    PropertyInfo, TypeInfo,
};
use crate::symbols::{
    AsyncSteppingInfo, AwaitBlock, LocalName, MethodSymbols, ModuleSymbols, SequencePoint,
};
use crate::types::{
    ElementType, MethodRef, ModuleId, Primitive, RemoteValue, TypeRef, ValueId, ValueKind,
};
use bytes::{Buf, BufMut};

/// Read an agent string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> NativeResult<String> {
    let len = read_u32(buf)? as usize;

    if buf.remaining() < len {
        return Err(NativeError::Protocol(format!(
            "Not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| NativeError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}

pub fn read_u8(buf: &mut &[u8]) -> NativeResult<u8> {
    if buf.remaining() < 1 {
        return Err(NativeError::Protocol("Not enough data for u8".to_string()));
    }
    Ok(buf.get_u8())
}

pub fn read_bool(buf: &mut &[u8]) -> NativeResult<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn read_u32(buf: &mut &[u8]) -> NativeResult<u32> {
    if buf.remaining() < 4 {
        return Err(NativeError::Protocol("Not enough data for u32".to_string()));
    }
    Ok(buf.get_u32())
}

pub fn read_i32(buf: &mut &[u8]) -> NativeResult<i32> {
    if buf.remaining() < 4 {
        return Err(NativeError::Protocol("Not enough data for i32".to_string()));
    }
    Ok(buf.get_i32())
}

pub fn read_u64(buf: &mut &[u8]) -> NativeResult<u64> {
    if buf.remaining() < 8 {
        return Err(NativeError::Protocol("Not enough data for u64".to_string()));
    }
    Ok(buf.get_u64())
}

/// Element count of a list; lists longer than the rest of the packet are
/// rejected before anything is allocated.
fn read_count(buf: &mut &[u8]) -> NativeResult<usize> {
    let count = read_i32(buf)?;
    if count < 0 || count as usize > buf.remaining() {
        return Err(NativeError::Protocol(format!("Invalid element count: {}", count)));
    }
    Ok(count as usize)
}

pub fn read_list<T>(
    buf: &mut &[u8],
    mut item: impl FnMut(&mut &[u8]) -> NativeResult<T>,
) -> NativeResult<Vec<T>> {
    let count = read_count(buf)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(item(buf)?);
    }
    Ok(items)
}

pub fn read_option<T>(
    buf: &mut &[u8],
    item: impl FnOnce(&mut &[u8]) -> NativeResult<T>,
) -> NativeResult<Option<T>> {
    if read_bool(buf)? {
        Ok(Some(item(buf)?))
    } else {
        Ok(None)
    }
}

pub fn read_method_ref(buf: &mut &[u8]) -> NativeResult<MethodRef> {
    let module = ModuleId(read_u64(buf)?);
    let token = read_u32(buf)?;
    Ok(MethodRef::new(module, token))
}

pub fn read_type_ref(buf: &mut &[u8]) -> NativeResult<TypeRef> {
    Ok(TypeRef {
        module: ModuleId(read_u64(buf)?),
        token: read_u32(buf)?,
        name: read_string(buf)?,
    })
}

pub fn read_value(buf: &mut &[u8]) -> NativeResult<RemoteValue> {
    let id = ValueId(read_u64(buf)?);
    let kind = match read_u8(buf)? {
        value_tags::PRIMITIVE => {
            let tag = read_u8(buf)?;
            let element = ElementType::from_tag(tag)
                .ok_or_else(|| NativeError::Protocol(format!("Invalid element type: {:#x}", tag)))?;
            ValueKind::Primitive(element)
        }
        value_tags::STRING => ValueKind::String,
        value_tags::OBJECT => ValueKind::Object,
        value_tags::ARRAY => ValueKind::Array,
        value_tags::BOXED => ValueKind::Boxed,
        value_tags::NULL => ValueKind::NullReference,
        tag => return Err(NativeError::Protocol(format!("Invalid value tag: {}", tag))),
    };
    let type_name = read_string(buf)?;
    Ok(RemoteValue { id, kind, type_name })
}

/// Element tag followed by the raw bytes. A zero tag carries operator output
/// of unknown static type, typed by its width.
pub fn read_primitive(buf: &mut &[u8]) -> NativeResult<Primitive> {
    let tag = read_u8(buf)?;
    let len = read_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(NativeError::Protocol("Not enough data for primitive".to_string()));
    }
    let bytes = &buf[..len];
    buf.advance(len);

    let value = match ElementType::from_tag(tag) {
        Some(element) => Primitive::from_bytes(element, bytes),
        None if tag == 0 => Primitive::from_raw_width(bytes),
        None => None,
    };
    value.ok_or_else(|| {
        NativeError::Protocol(format!("Invalid primitive (tag {:#x}, {} bytes)", tag, len))
    })
}

pub fn read_module(buf: &mut &[u8]) -> NativeResult<ModuleInfo> {
    Ok(ModuleInfo {
        id: ModuleId(read_u64(buf)?),
        name: read_string(buf)?,
        path: read_string(buf)?,
    })
}

pub fn read_thread(buf: &mut &[u8]) -> NativeResult<NativeThread> {
    Ok(NativeThread {
        id: read_u32(buf)?,
        name: read_option(buf, read_string)?,
    })
}

pub fn read_frame(buf: &mut &[u8]) -> NativeResult<NativeFrame> {
    let kind = match read_u8(buf)? {
        0 => FrameKind::Managed,
        1 => FrameKind::Native,
        2 => FrameKind::Runtime,
        other => return Err(NativeError::Protocol(format!("Invalid frame kind: {}", other))),
    };
    Ok(NativeFrame {
        kind,
        method: read_option(buf, read_method_ref)?,
        offset: read_u32(buf)?,
    })
}

pub fn read_method_desc(buf: &mut &[u8]) -> NativeResult<MethodDesc> {
    Ok(MethodDesc {
        method: read_method_ref(buf)?,
        name: read_string(buf)?,
        declaring_type: read_type_ref(buf)?,
        is_static: read_bool(buf)?,
        parameters: read_list(buf, |buf| {
            Ok(ParamInfo {
                name: read_string(buf)?,
                type_name: read_string(buf)?,
            })
        })?,
        generic_arity: read_u32(buf)?,
        return_type: read_string(buf)?,
        non_user_code: read_bool(buf)?,
    })
}

pub fn read_type_info(buf: &mut &[u8]) -> NativeResult<TypeInfo> {
    Ok(TypeInfo {
        ty: read_type_ref(buf)?,
        base: read_option(buf, read_type_ref)?,
        is_value_type: read_bool(buf)?,
        fields: read_list(buf, |buf| {
            Ok(FieldInfo {
                token: read_u32(buf)?,
                name: read_string(buf)?,
                type_name: read_string(buf)?,
                is_static: read_bool(buf)?,
            })
        })?,
        properties: read_list(buf, |buf| {
            Ok(PropertyInfo {
                name: read_string(buf)?,
                type_name: read_string(buf)?,
                getter: read_option(buf, read_method_ref)?,
                is_static: read_bool(buf)?,
            })
        })?,
        methods: read_list(buf, read_method_desc)?,
    })
}

fn read_method_symbols(buf: &mut &[u8]) -> NativeResult<MethodSymbols> {
    Ok(MethodSymbols {
        token: read_u32(buf)?,
        document: read_string(buf)?,
        code_size: read_u32(buf)?,
        sequence_points: read_list(buf, |buf| {
            Ok(SequencePoint {
                offset: read_u32(buf)?,
                start_line: read_u32(buf)?,
                end_line: read_u32(buf)?,
                start_column: read_u32(buf)?,
                end_column: read_u32(buf)?,
            })
        })?,
        async_info: read_option(buf, |buf| {
            Ok(AsyncSteppingInfo {
                awaits: read_list(buf, |buf| {
                    Ok(AwaitBlock {
                        yield_offset: read_u32(buf)?,
                        resume_offset: read_u32(buf)?,
                    })
                })?,
                last_user_code_offset: read_u32(buf)?,
            })
        })?,
        locals: read_list(buf, |buf| {
            Ok(LocalName {
                slot: read_u32(buf)?,
                name: read_string(buf)?,
                start_offset: read_u32(buf)?,
                end_offset: read_u32(buf)?,
            })
        })?,
        imported_namespaces: read_list(buf, read_string)?,
    })
}

pub fn read_module_symbols(buf: &mut &[u8]) -> NativeResult<ModuleSymbols> {
    Ok(ModuleSymbols {
        methods: read_list(buf, read_method_symbols)?,
        entry_point: read_option(buf, read_u32)?,
    })
}

pub fn put_string(data: &mut Vec<u8>, text: &str) {
    data.put_u32(text.len() as u32);
    data.put_slice(text.as_bytes());
}

pub fn put_method_ref(data: &mut Vec<u8>, method: MethodRef) {
    data.put_u64(method.module.0);
    data.put_u32(method.token);
}

pub fn put_type_ref(data: &mut Vec<u8>, ty: &TypeRef) {
    data.put_u64(ty.module.0);
    data.put_u32(ty.token);
    put_string(data, &ty.name);
}

pub fn put_primitive(data: &mut Vec<u8>, value: Primitive) {
    let bytes = value.to_bytes();
    data.put_u8(value.element_type().tag());
    data.put_u32(bytes.len() as u32);
    data.put_slice(&bytes);
}
