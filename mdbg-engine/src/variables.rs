// Variable expansion
//
// Children of a frame scope, an object, an array or a type's static members.
// Expansion talks to the target first and only then hands out handles, so the
// handle table is never locked across a remote call.

use crate::config::SessionConfig;
use crate::error::{EngineResult, EvalError};
use crate::eval::format::{display_type_name, format_remote};
use crate::handles::{FrameHandle, HandleTable, ReferenceKind, VariablesReference};
use crate::native::NativeDebugger;
use crate::remote_call::RemoteCaller;
use crate::symbols::SymbolAdapter;
use crate::types::{RemoteValue, ThreadId, TypeRef, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

const MAX_TYPE_DEPTH: usize = 64;
const STATIC_MEMBERS: &str = "Static members";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Non-zero when the value has children.
    pub variables_reference: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluate_name: Option<String>,
}

#[derive(Debug, Clone)]
enum ChildValue {
    Value(RemoteValue),
    /// A getter that threw or could not run.
    Failed { text: String, type_name: String },
    Statics(TypeRef),
}

#[derive(Debug, Clone)]
struct Child {
    name: String,
    value: ChildValue,
    evaluate_name: Option<String>,
}

/// A described variable whose handle has not been allocated yet.
#[derive(Debug, Clone)]
pub struct PendingVariable {
    variable: Variable,
    expand: Option<VariablesReference>,
}

impl PendingVariable {
    pub fn register(self, handles: &mut HandleTable) -> Variable {
        let mut variable = self.variable;
        if let Some(expand) = self.expand {
            variable.variables_reference = handles.alloc_reference(expand);
        }
        variable
    }
}

#[derive(Clone, Copy)]
pub struct VariablesContext<'a> {
    pub caller: &'a RemoteCaller,
    pub symbols: &'a dyn SymbolAdapter,
    pub config: &'a SessionConfig,
}

impl VariablesContext<'_> {
    fn native(&self) -> &dyn NativeDebugger {
        &**self.caller.native()
    }
}

pub fn scopes(handles: &mut HandleTable, frame: FrameHandle) -> Vec<Scope> {
    let locals = handles.alloc_reference(VariablesReference {
        kind: ReferenceKind::Scope,
        value: None,
        ty: None,
        thread: frame.thread,
        depth: frame.depth,
        evaluate_name: String::new(),
    });
    vec![Scope {
        name: "Locals".to_string(),
        variables_reference: locals,
        expensive: false,
    }]
}

/// Children of `reference`. `count == 0` means "as many as allowed".
pub async fn variables(
    ctx: VariablesContext<'_>,
    reference: &VariablesReference,
    start: usize,
    count: usize,
) -> EngineResult<Vec<PendingVariable>> {
    let children = match reference.kind {
        ReferenceKind::Scope => frame_children(&ctx, reference.thread, reference.depth).await?,
        ReferenceKind::StaticClassPseudoScope => match &reference.ty {
            Some(ty) => static_children(&ctx, reference.thread, ty).await?,
            None => Vec::new(),
        },
        ReferenceKind::StackVariable => match &reference.value {
            Some(value) => value_children(&ctx, reference, value, start, count).await?,
            None => Vec::new(),
        },
    };

    let mut pending = Vec::with_capacity(children.len());
    for child in children {
        pending.push(describe(ctx.native(), child, reference.thread, reference.depth).await?);
    }
    Ok(pending)
}

/// Describe a single value, e.g. an evaluation result.
pub async fn describe_value(
    native: &dyn NativeDebugger,
    name: &str,
    value: RemoteValue,
    thread: ThreadId,
    depth: u32,
) -> EngineResult<PendingVariable> {
    let child = Child {
        name: name.to_string(),
        value: ChildValue::Value(value),
        evaluate_name: Some(name.to_string()),
    };
    describe(native, child, thread, depth).await
}

async fn describe(
    native: &dyn NativeDebugger,
    child: Child,
    thread: ThreadId,
    depth: u32,
) -> EngineResult<PendingVariable> {
    let (value, type_name, expand) = match child.value {
        ChildValue::Value(value) => {
            let text = format_remote(native, &value).await?;
            let type_name = display_type_name(&value.type_name);
            let expandable = match value.kind {
                ValueKind::Object | ValueKind::Array => true,
                ValueKind::Boxed => {
                    !matches!(native.unbox(&value).await?.kind, ValueKind::Primitive(_))
                }
                _ => false,
            };
            let expand = expandable.then(|| VariablesReference {
                kind: ReferenceKind::StackVariable,
                value: Some(value),
                ty: None,
                thread,
                depth,
                evaluate_name: child.evaluate_name.clone().unwrap_or_default(),
            });
            (text, type_name, expand)
        }
        ChildValue::Failed { text, type_name } => (text, type_name, None),
        ChildValue::Statics(ty) => {
            let expand = VariablesReference {
                kind: ReferenceKind::StaticClassPseudoScope,
                value: None,
                ty: Some(ty),
                thread,
                depth,
                evaluate_name: String::new(),
            };
            (String::new(), String::new(), Some(expand))
        }
    };
    Ok(PendingVariable {
        variable: Variable {
            name: child.name,
            value,
            type_name,
            variables_reference: 0,
            evaluate_name: child.evaluate_name,
        },
        expand,
    })
}

async fn frame_children(
    ctx: &VariablesContext<'_>,
    thread: ThreadId,
    depth: u32,
) -> EngineResult<Vec<Child>> {
    let native = ctx.native();
    let frames = native.frames(thread).await?;
    let Some((method, offset)) = frames
        .get(depth as usize)
        .and_then(|f| f.method.map(|m| (m, f.offset)))
    else {
        return Ok(Vec::new());
    };

    let mut children: Vec<Child> = native
        .arguments(thread, depth)
        .await?
        .into_iter()
        .map(|arg| Child {
            evaluate_name: Some(arg.name.clone()),
            name: arg.name,
            value: ChildValue::Value(arg.value),
        })
        .collect();

    let values = native.locals(thread, depth).await?;
    for local in ctx.symbols.local_names(method, offset) {
        if let Some(v) = values.iter().find(|v| v.slot == local.slot) {
            children.push(Child {
                evaluate_name: Some(local.name.clone()),
                name: local.name,
                value: ChildValue::Value(v.value.clone()),
            });
        }
    }
    Ok(children)
}

async fn value_children(
    ctx: &VariablesContext<'_>,
    reference: &VariablesReference,
    value: &RemoteValue,
    start: usize,
    count: usize,
) -> EngineResult<Vec<Child>> {
    let native = ctx.native();
    match value.kind {
        ValueKind::Array => {
            array_children(ctx, value, &reference.evaluate_name, start, count).await
        }
        ValueKind::Boxed => {
            let inner = native.unbox(value).await?;
            if matches!(inner.kind, ValueKind::Primitive(_)) {
                return Ok(Vec::new());
            }
            object_children(ctx, reference.thread, &inner, &reference.evaluate_name).await
        }
        ValueKind::Object => {
            object_children(ctx, reference.thread, value, &reference.evaluate_name).await
        }
        _ => Ok(Vec::new()),
    }
}

async fn array_children(
    ctx: &VariablesContext<'_>,
    array: &RemoteValue,
    parent: &str,
    start: usize,
    count: usize,
) -> EngineResult<Vec<Child>> {
    let native = ctx.native();
    let dims = native.array_dimensions(array).await?;
    let total: usize = dims.iter().map(|d| *d as usize).product();
    let limit = ctx.config.max_array_children;
    let count = if count == 0 { limit } else { count.min(limit) };
    let end = total.min(start.saturating_add(count));

    let mut children = Vec::with_capacity(end.saturating_sub(start));
    for flat in start..end {
        let indices = unflatten(flat, &dims);
        let label = indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let element = native.array_element(array, &indices).await?;
        children.push(Child {
            name: format!("[{}]", label),
            value: ChildValue::Value(element),
            evaluate_name: (!parent.is_empty()).then(|| format!("{}[{}]", parent, label)),
        });
    }
    Ok(children)
}

/// Row-major indices of element `flat`.
fn unflatten(mut flat: usize, dims: &[u32]) -> Vec<u32> {
    let mut indices = vec![0; dims.len()];
    for (slot, dim) in indices.iter_mut().zip(dims).rev() {
        let dim = (*dim as usize).max(1);
        *slot = (flat % dim) as u32;
        flat /= dim;
    }
    indices
}

fn member_name(parent: &str, name: &str) -> Option<String> {
    (!parent.is_empty()).then(|| format!("{}.{}", parent, name))
}

async fn getter_child(
    ctx: &VariablesContext<'_>,
    thread: ThreadId,
    name: &str,
    type_name: &str,
    getter: crate::types::MethodRef,
    receiver: Option<&RemoteValue>,
    evaluate_name: Option<String>,
) -> Child {
    let args: Vec<RemoteValue> = receiver.into_iter().cloned().collect();
    let value = match ctx.caller.call(thread, getter, &[], &args).await {
        Ok(Some(value)) => ChildValue::Value(value),
        Ok(None) => ChildValue::Failed {
            text: "null".to_string(),
            type_name: display_type_name(type_name),
        },
        Err(EvalError::RemoteFault(exception)) => ChildValue::Failed {
            text: format!("{{{}}}", display_type_name(&exception.type_name)),
            type_name: display_type_name(type_name),
        },
        Err(e) => {
            debug!("Getter {} failed: {}", name, e);
            ChildValue::Failed {
                text: format!("<error: {}>", e),
                type_name: display_type_name(type_name),
            }
        }
    };
    Child {
        name: name.to_string(),
        value,
        evaluate_name,
    }
}

/// Instance members of the runtime type, a "Static members" node when it has
/// any, then the members inherited from each base type.
async fn object_children(
    ctx: &VariablesContext<'_>,
    thread: ThreadId,
    object: &RemoteValue,
    parent: &str,
) -> EngineResult<Vec<Child>> {
    let native = ctx.native();
    let mut children = Vec::new();
    let mut seen = HashSet::new();
    let mut ty = Some(native.type_of(object).await?);
    let mut level = 0;

    while let Some(current) = ty {
        if level >= MAX_TYPE_DEPTH
            || current.name == "System.Object"
            || current.name == "System.ValueType"
        {
            break;
        }
        let info = native.type_info(&current).await?;

        for field in info.fields.iter().filter(|f| !f.is_static) {
            // compiler-generated storage
            if field.name.starts_with('<') || !seen.insert(field.name.clone()) {
                continue;
            }
            children.push(Child {
                name: field.name.clone(),
                value: ChildValue::Value(native.field_value(object, field).await?),
                evaluate_name: member_name(parent, &field.name),
            });
        }

        if ctx.config.evaluate_properties {
            for property in info.properties.iter().filter(|p| !p.is_static) {
                let Some(getter) = property.getter else { continue };
                if !seen.insert(property.name.clone()) {
                    continue;
                }
                children.push(
                    getter_child(
                        ctx,
                        thread,
                        &property.name,
                        &property.type_name,
                        getter,
                        Some(object),
                        member_name(parent, &property.name),
                    )
                    .await,
                );
            }
        }

        if level == 0 && has_statics(&info) {
            children.push(Child {
                name: STATIC_MEMBERS.to_string(),
                value: ChildValue::Statics(info.ty.clone()),
                evaluate_name: None,
            });
        }

        level += 1;
        ty = info.base;
    }
    Ok(children)
}

fn has_statics(info: &crate::native::TypeInfo) -> bool {
    info.fields.iter().any(|f| f.is_static) || info.properties.iter().any(|p| p.is_static)
}

async fn static_children(
    ctx: &VariablesContext<'_>,
    thread: ThreadId,
    ty: &TypeRef,
) -> EngineResult<Vec<Child>> {
    let native = ctx.native();
    let info = native.type_info(ty).await?;
    let owner = display_type_name(&ty.name);
    let mut children = Vec::new();

    for field in info.fields.iter().filter(|f| f.is_static && !f.name.starts_with('<')) {
        children.push(Child {
            name: field.name.clone(),
            value: ChildValue::Value(native.static_field_value(thread, ty, field).await?),
            evaluate_name: member_name(&owner, &field.name),
        });
    }
    if ctx.config.evaluate_properties {
        for property in info.properties.iter().filter(|p| p.is_static) {
            if let Some(getter) = property.getter {
                children.push(
                    getter_child(
                        ctx,
                        thread,
                        &property.name,
                        &property.type_name,
                        getter,
                        None,
                        member_name(&owner, &property.name),
                    )
                    .await,
                );
            }
        }
    }
    Ok(children)
}
