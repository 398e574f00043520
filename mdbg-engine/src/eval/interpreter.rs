// Stack-machine interpreter
//
// Executes a compiled program against one stopped frame. Identifiers stay
// unresolved chains of segments until an operator needs their value, so
// `Ns.Type.Field` and `local.Field` share one resolution path. Anything the
// frame cannot answer locally goes through a remote call.

use crate::error::{EvalError, EvalResult};
use crate::eval::compiler::{Instruction, OpCode, Piece};
use crate::eval::format::{display_type_name, value_type_name};
use crate::eval::operators::{self, BinaryOp, UnaryOp};
use crate::eval::parser::{Literal, TypeName};
use crate::eval::{EvalValue, Evaluated};
use crate::native::{MethodDesc, NamedValue, NativeDebugger};
use crate::remote_call::RemoteCaller;
use crate::symbols::SymbolAdapter;
use crate::types::{
    ElementType, MethodRef, ModuleId, Primitive, RemoteValue, ThreadId, TypeRef, ValueKind,
};
use tracing::{debug, trace};

// Base chains longer than this are treated as cyclic metadata
const MAX_TYPE_DEPTH: usize = 64;

/// Where an evaluation runs.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub caller: &'a RemoteCaller,
    pub symbols: &'a dyn SymbolAdapter,
    /// Loaded modules, searched in order for type names.
    pub modules: &'a [ModuleId],
    pub thread: ThreadId,
    pub depth: u32,
}

#[derive(Debug, Clone)]
struct Segment {
    name: String,
    type_args: Vec<TypeName>,
}

impl Segment {
    fn metadata_name(&self) -> String {
        if self.type_args.is_empty() {
            self.name.clone()
        } else {
            format!("{}`{}", self.name, self.type_args.len())
        }
    }
}

#[derive(Debug, Clone)]
enum Resolved {
    Value(EvalValue),
    Type(TypeRef),
}

#[derive(Debug, Clone, Default)]
struct StackEntry {
    base: Option<Resolved>,
    /// Member names not bound yet, applied left to right on top of `base`.
    chain: Vec<Segment>,
    /// Set by `?.` on a null target: the rest of the chain yields null.
    prevent_binding: bool,
    literal: bool,
    editable: bool,
}

impl StackEntry {
    fn value(value: EvalValue) -> Self {
        Self {
            base: Some(Resolved::Value(value)),
            ..Default::default()
        }
    }

    fn name(segment: Segment) -> Self {
        Self {
            chain: vec![segment],
            ..Default::default()
        }
    }
}

enum Lookup {
    Found(MethodDesc),
    /// The name exists but no overload accepts the arguments.
    WrongArguments,
    Missing,
}

#[derive(Default)]
struct FrameScope {
    method: Option<MethodDesc>,
    this: Option<RemoteValue>,
    arguments: Vec<NamedValue>,
    locals: Vec<NamedValue>,
    namespaces: Vec<String>,
}

impl FrameScope {
    async fn load(ctx: &EvalContext<'_>) -> EvalResult<Self> {
        let native = ctx.caller.native();
        let frames = native.frames(ctx.thread).await?;
        let Some((method_ref, offset)) = frames
            .get(ctx.depth as usize)
            .and_then(|f| f.method.map(|m| (m, f.offset)))
        else {
            debug!("No managed frame at depth {} on thread {}", ctx.depth, ctx.thread);
            return Ok(Self::default());
        };

        let method = native.method_desc(method_ref).await?;
        let mut arguments = native.arguments(ctx.thread, ctx.depth).await?;
        let this = if !method.is_static && arguments.first().is_some_and(|a| a.name == "this") {
            Some(arguments.remove(0).value)
        } else {
            None
        };

        let values = native.locals(ctx.thread, ctx.depth).await?;
        let locals = ctx
            .symbols
            .local_names(method_ref, offset)
            .into_iter()
            .filter_map(|local| {
                values
                    .iter()
                    .find(|v| v.slot == local.slot)
                    .map(|v| NamedValue {
                        name: local.name,
                        value: v.value.clone(),
                    })
            })
            .collect();

        Ok(Self {
            namespaces: ctx.symbols.imported_namespaces(method_ref),
            method: Some(method),
            this,
            arguments,
            locals,
        })
    }
}

fn null_reference() -> EvalError {
    EvalError::runtime("Object reference not set to an instance of an object.")
}

fn name_not_found(name: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS0103: The name '{}' does not exist in the current context",
        name
    ))
}

fn no_definition(type_name: &str, member: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS1061: '{}' does not contain a definition for '{}'",
        display_type_name(type_name),
        member
    ))
}

fn no_static_definition(type_name: &str, member: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS0117: '{}' does not contain a definition for '{}'",
        display_type_name(type_name),
        member
    ))
}

fn no_overload(name: &str, args: usize) -> EvalError {
    EvalError::resolution(format!(
        "error CS1501: No overload for method '{}' takes {} arguments",
        name, args
    ))
}

fn type_not_found(name: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS0246: The type or namespace name '{}' could not be found",
        name
    ))
}

fn type_not_valid(ty: &TypeRef) -> EvalError {
    EvalError::resolution(format!(
        "error CS0119: '{}' is a type, which is not valid in the given context",
        display_type_name(&ty.name)
    ))
}

fn void_not_allowed() -> EvalError {
    EvalError::resolution("error CS0029: Cannot implicitly convert type 'void' to 'object'")
}

fn not_indexable(type_name: &str) -> EvalError {
    EvalError::resolution(format!(
        "error CS0021: Cannot apply indexing with [] to an expression of type '{}'",
        type_name
    ))
}

fn is_string(value: &EvalValue) -> bool {
    matches!(value, EvalValue::Remote(v) if v.kind == ValueKind::String)
}

pub struct Interpreter<'a> {
    ctx: EvalContext<'a>,
    frame: FrameScope,
    stack: Vec<StackEntry>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: EvalContext<'a>) -> Self {
        Self {
            ctx,
            frame: FrameScope::default(),
            stack: Vec::new(),
        }
    }

    fn native(&self) -> &'a dyn NativeDebugger {
        let caller: &'a RemoteCaller = self.ctx.caller;
        &**caller.native()
    }

    fn thread(&self) -> ThreadId {
        self.ctx.thread
    }

    pub async fn run(mut self, program: &[Instruction]) -> EvalResult<Evaluated> {
        self.frame = FrameScope::load(&self.ctx).await?;
        for instruction in program {
            trace!("exec {:?}", instruction.op);
            self.exec(instruction).await?;
        }
        if self.stack.len() != 1 {
            return Err(EvalError::compilation(format!(
                "error: evaluation left {} values on the stack",
                self.stack.len()
            )));
        }
        let entry = self.pop()?;
        match self.resolve(entry).await? {
            (Resolved::Value(value), editable) => Ok(Evaluated { value, editable }),
            (Resolved::Type(ty), _) => Err(type_not_valid(&ty)),
        }
    }

    fn pop(&mut self) -> EvalResult<StackEntry> {
        self.stack
            .pop()
            .ok_or_else(|| EvalError::compilation("error: evaluation stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> EvalResult<Vec<StackEntry>> {
        if self.stack.len() < n {
            return Err(EvalError::compilation("error: evaluation stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    async fn pop_values(&mut self, n: usize) -> EvalResult<Vec<EvalValue>> {
        let entries = self.pop_n(n)?;
        let mut values = Vec::with_capacity(n);
        for entry in entries {
            values.push(self.resolve_value(entry).await?);
        }
        Ok(values)
    }

    async fn exec(&mut self, instruction: &Instruction) -> EvalResult<()> {
        let checked = instruction.checked;
        match &instruction.op {
            OpCode::Identifier(name) => self.stack.push(StackEntry::name(Segment {
                name: name.clone(),
                type_args: Vec::new(),
            })),
            OpCode::GenericName { name, type_args } => self.stack.push(StackEntry::name(Segment {
                name: name.clone(),
                type_args: type_args.clone(),
            })),
            OpCode::This => {
                let this = self.frame.this.clone().ok_or_else(|| {
                    EvalError::resolution(
                        "error CS0026: Keyword 'this' is not valid in a static property, \
                         static method, or static field initializer",
                    )
                })?;
                self.stack.push(StackEntry::value(EvalValue::Remote(this)));
            }
            OpCode::PredefinedType(name) => {
                let ty = self.find_type(name).await?.ok_or_else(|| type_not_found(name))?;
                self.stack.push(StackEntry {
                    base: Some(Resolved::Type(ty)),
                    ..Default::default()
                });
            }
            OpCode::Literal(literal) => {
                let value = match literal {
                    Literal::Primitive(p) => EvalValue::Primitive(*p),
                    Literal::Null => EvalValue::Null,
                    Literal::String(text) => {
                        EvalValue::Remote(self.ctx.caller.new_string(self.thread(), text).await?)
                    }
                };
                self.stack.push(StackEntry {
                    literal: true,
                    ..StackEntry::value(value)
                });
            }
            OpCode::MemberAccess => {
                let name = self.pop()?;
                let segment = name.chain.into_iter().next().ok_or_else(|| {
                    EvalError::compilation("error CS1001: Identifier expected")
                })?;
                let target = self
                    .stack
                    .last_mut()
                    .ok_or_else(|| EvalError::compilation("error: evaluation stack underflow"))?;
                if !target.prevent_binding {
                    target.chain.push(segment);
                }
            }
            OpCode::ConditionalAccess => {
                let entry = self.pop()?;
                if entry.prevent_binding {
                    self.stack.push(entry);
                    return Ok(());
                }
                let (resolved, editable) = self.resolve(entry).await?;
                let prevent_binding = matches!(&resolved, Resolved::Value(v) if v.is_null());
                self.stack.push(StackEntry {
                    base: Some(if prevent_binding {
                        Resolved::Value(EvalValue::Null)
                    } else {
                        resolved
                    }),
                    prevent_binding,
                    editable,
                    ..Default::default()
                });
            }
            OpCode::ElementAccess { args } => {
                let indices = self.pop_values(*args).await?;
                let target = self.pop()?;
                if target.prevent_binding {
                    self.stack.push(target);
                    return Ok(());
                }
                let target = self.resolve_value(target).await?;
                let (value, editable) = self.element_access(target, indices).await?;
                self.stack.push(StackEntry {
                    editable,
                    ..StackEntry::value(value)
                });
            }
            OpCode::Invocation { args } => {
                let args = self.pop_values(*args).await?;
                let target = self.pop()?;
                if target.prevent_binding {
                    self.stack.push(target);
                    return Ok(());
                }
                let value = self.invoke(target, args).await?;
                self.stack.push(StackEntry::value(value));
            }
            OpCode::Unary(op) => {
                let operand = self.pop()?;
                let operand = self.resolve_value(operand).await?;
                let value = self.unary(*op, operand, checked).await?;
                self.stack.push(StackEntry::value(value));
            }
            OpCode::Binary(op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let lhs = self.resolve_value(lhs).await?;
                let rhs = self.resolve_value(rhs).await?;
                let value = self.binary(*op, lhs, rhs, checked).await?;
                self.stack.push(StackEntry::value(value));
            }
            OpCode::SizeOf(ty) => {
                let size = ElementType::from_type_name(&ty.metadata_name())
                    .map(ElementType::size)
                    .ok_or_else(|| {
                        EvalError::resolution(format!(
                            "error CS0233: '{}' does not have a predefined size, \
                             therefore sizeof can only be used in an unsafe context",
                            display_type_name(&ty.metadata_name())
                        ))
                    })?;
                self.stack
                    .push(StackEntry::value(EvalValue::Primitive(Primitive::I32(size as i32))));
            }
            OpCode::InterpolatedString { pieces } => {
                let holes = pieces.iter().filter(|p| matches!(p, Piece::Value)).count();
                let mut values = self.pop_values(holes).await?.into_iter();
                let mut text = String::new();
                for piece in pieces {
                    match piece {
                        Piece::Text(t) => text.push_str(t),
                        Piece::Value => {
                            if let Some(value) = values.next() {
                                text.push_str(&self.stringify(&value).await?);
                            }
                        }
                    }
                }
                let value = self.ctx.caller.new_string(self.thread(), &text).await?;
                self.stack.push(StackEntry::value(EvalValue::Remote(value)));
            }
        }
        Ok(())
    }

    async fn resolve_value(&mut self, entry: StackEntry) -> EvalResult<EvalValue> {
        match self.resolve(entry).await? {
            (Resolved::Value(value), _) => Ok(value),
            (Resolved::Type(ty), _) => Err(type_not_valid(&ty)),
        }
    }

    /// Bind a pending chain down to a value or a type.
    async fn resolve(&mut self, entry: StackEntry) -> EvalResult<(Resolved, bool)> {
        if entry.prevent_binding {
            return Ok((Resolved::Value(EvalValue::Null), false));
        }
        if entry.literal && !entry.chain.is_empty() {
            if let Some(Resolved::Value(EvalValue::Null)) = &entry.base {
                return Err(EvalError::resolution(
                    "error CS0023: Operator '.' cannot be applied to operand of type '<null>'",
                ));
            }
        }
        let (mut current, consumed, mut editable) = match entry.base {
            Some(base) => (base, 0, entry.editable),
            None => {
                if entry.chain.is_empty() {
                    return Err(EvalError::compilation("error CS1525: Invalid expression term"));
                }
                self.resolve_name(&entry.chain).await?
            }
        };
        for segment in &entry.chain[consumed..] {
            let (next, next_editable) = self.member(current, segment).await?;
            current = next;
            editable = next_editable;
        }
        Ok((current, editable))
    }

    /// Resolve the head of a chain. Returns the binding, how many segments
    /// it consumed and whether it designates storage.
    async fn resolve_name(&mut self, chain: &[Segment]) -> EvalResult<(Resolved, usize, bool)> {
        let first = &chain[0];
        if first.type_args.is_empty() {
            let local = self
                .frame
                .locals
                .iter()
                .chain(self.frame.arguments.iter())
                .find(|v| v.name == first.name)
                .map(|v| v.value.clone());
            if let Some(value) = local {
                return Ok((Resolved::Value(EvalValue::Remote(value)), 1, true));
            }

            if let Some(this) = self.frame.this.clone() {
                if let Some((value, editable)) = self.instance_member(&this, &first.name).await? {
                    return Ok((Resolved::Value(EvalValue::Remote(value)), 1, editable));
                }
            }

            let declaring = self.frame.method.as_ref().map(|m| m.declaring_type.clone());
            if let Some(declaring) = declaring {
                let member = self.static_member(&declaring, &first.name).await?;
                if let Some((value, editable)) = member {
                    return Ok((Resolved::Value(EvalValue::Remote(value)), 1, editable));
                }
            }
        }

        for count in 1..=chain.len() {
            if let Some(ty) = self.lookup_type(&chain[..count]).await? {
                debug!("'{}' resolved to type {}", first.name, ty.name);
                return Ok((Resolved::Type(ty), count, false));
            }
        }
        Err(name_not_found(&first.name))
    }

    /// Type named by a dotted path, tried as written, under each imported
    /// namespace, under the enclosing namespaces and nested in the declaring
    /// type.
    async fn lookup_type(&self, path: &[Segment]) -> EvalResult<Option<TypeRef>> {
        let path = path
            .iter()
            .map(Segment::metadata_name)
            .collect::<Vec<_>>()
            .join(".");

        let mut candidates = vec![path.clone()];
        for ns in &self.frame.namespaces {
            candidates.push(format!("{}.{}", ns, path));
        }
        if let Some(method) = &self.frame.method {
            let mut ns = method.declaring_type.namespace();
            while !ns.is_empty() {
                candidates.push(format!("{}.{}", ns, path));
                ns = match ns.rfind('.') {
                    Some(pos) => &ns[..pos],
                    None => "",
                };
            }
            candidates.push(format!("{}+{}", method.declaring_type.name, path));
        }

        for candidate in candidates {
            if let Some(ty) = self.find_type(&candidate).await? {
                return Ok(Some(ty));
            }
        }
        Ok(None)
    }

    async fn find_type(&self, name: &str) -> EvalResult<Option<TypeRef>> {
        for module in self.ctx.modules {
            if let Some(ty) = self.native().find_type(*module, name).await? {
                return Ok(Some(ty));
            }
        }
        Ok(None)
    }

    async fn resolve_type_args(&self, type_args: &[TypeName]) -> EvalResult<Vec<TypeRef>> {
        let mut resolved = Vec::with_capacity(type_args.len());
        for arg in type_args {
            let name = arg.metadata_name();
            let ty = match self.find_type(&name).await? {
                Some(ty) => ty,
                None => {
                    let path = [Segment {
                        name: name.clone(),
                        type_args: Vec::new(),
                    }];
                    self.lookup_type(&path)
                        .await?
                        .ok_or_else(|| type_not_found(&arg.name))?
                }
            };
            resolved.push(ty);
        }
        Ok(resolved)
    }

    /// Apply one chain segment to an already bound value or type.
    async fn member(
        &mut self,
        current: Resolved,
        segment: &Segment,
    ) -> EvalResult<(Resolved, bool)> {
        let name = segment.name.as_str();
        match current {
            Resolved::Type(ty) => {
                if segment.type_args.is_empty() {
                    if let Some((value, editable)) = self.static_member(&ty, name).await? {
                        return Ok((Resolved::Value(EvalValue::Remote(value)), editable));
                    }
                }
                let nested = format!("{}+{}", ty.name, segment.metadata_name());
                match self.find_type(&nested).await? {
                    Some(inner) => Ok((Resolved::Type(inner), false)),
                    None => Err(no_static_definition(&ty.name, name)),
                }
            }
            Resolved::Value(value) => {
                let target = match value {
                    EvalValue::Null => return Err(null_reference()),
                    EvalValue::Void => return Err(void_not_allowed()),
                    EvalValue::Primitive(p) => {
                        return Err(no_definition(p.element_type().type_name(), name))
                    }
                    EvalValue::Remote(v) if v.is_null() => return Err(null_reference()),
                    EvalValue::Remote(v) => v,
                };

                match (target.kind, name) {
                    (ValueKind::Array, "Length" | "LongLength" | "Rank") => {
                        let dims = self.native().array_dimensions(&target).await?;
                        let total: u64 = dims.iter().map(|d| *d as u64).product();
                        let p = match name {
                            "Length" => Primitive::I32(total as i32),
                            "LongLength" => Primitive::I64(total as i64),
                            _ => Primitive::I32(dims.len() as i32),
                        };
                        return Ok((Resolved::Value(EvalValue::Primitive(p)), false));
                    }
                    (ValueKind::String, "Length") => {
                        let text = self.native().read_string(&target).await?;
                        let length = text.encode_utf16().count() as i32;
                        let length = EvalValue::Primitive(Primitive::I32(length));
                        return Ok((Resolved::Value(length), false));
                    }
                    _ => {}
                }

                match self.instance_member(&target, name).await? {
                    Some((value, editable)) => {
                        Ok((Resolved::Value(EvalValue::Remote(value)), editable))
                    }
                    None => Err(no_definition(&target.type_name, name)),
                }
            }
        }
    }

    /// Instance field or property getter of `object`, searched through the
    /// base chain.
    async fn instance_member(
        &self,
        object: &RemoteValue,
        name: &str,
    ) -> EvalResult<Option<(RemoteValue, bool)>> {
        let native = self.native();
        let mut ty = Some(native.type_of(object).await?);
        let mut depth = 0;
        while let Some(current) = ty {
            let info = native.type_info(&current).await?;
            if let Some(field) = info.fields.iter().find(|f| !f.is_static && f.name == name) {
                return Ok(Some((native.field_value(object, field).await?, true)));
            }
            let property = info.properties.iter().find(|p| !p.is_static && p.name == name);
            if let Some(property) = property {
                if let Some(getter) = property.getter {
                    let value = self.call_getter(getter, Some(object.clone())).await?;
                    return Ok(Some((value, false)));
                }
            }
            depth += 1;
            if depth >= MAX_TYPE_DEPTH {
                break;
            }
            ty = info.base;
        }
        Ok(None)
    }

    async fn static_member(
        &self,
        ty: &TypeRef,
        name: &str,
    ) -> EvalResult<Option<(RemoteValue, bool)>> {
        let native = self.native();
        let mut ty = Some(ty.clone());
        let mut depth = 0;
        while let Some(current) = ty {
            let info = native.type_info(&current).await?;
            if let Some(field) = info.fields.iter().find(|f| f.is_static && f.name == name) {
                let value = native.static_field_value(self.thread(), &info.ty, field).await?;
                return Ok(Some((value, true)));
            }
            if let Some(property) = info.properties.iter().find(|p| p.is_static && p.name == name) {
                if let Some(getter) = property.getter {
                    return Ok(Some((self.call_getter(getter, None).await?, false)));
                }
            }
            depth += 1;
            if depth >= MAX_TYPE_DEPTH {
                break;
            }
            ty = info.base;
        }
        Ok(None)
    }

    async fn call_getter(
        &self,
        getter: MethodRef,
        receiver: Option<RemoteValue>,
    ) -> EvalResult<RemoteValue> {
        let args: Vec<RemoteValue> = receiver.into_iter().collect();
        match self.ctx.caller.call(self.thread(), getter, &[], &args).await? {
            Some(value) => Ok(value),
            None => Ok(self.native().create_null(self.thread()).await?),
        }
    }

    async fn invoke(
        &mut self,
        mut target: StackEntry,
        args: Vec<EvalValue>,
    ) -> EvalResult<EvalValue> {
        let method = target
            .chain
            .pop()
            .ok_or_else(|| EvalError::compilation("error CS0149: Method name expected"))?;
        let type_args = self.resolve_type_args(&method.type_args).await?;
        let generic_arity = method.type_args.len() as u32;
        let name = method.name.as_str();

        // Bare method name: the current instance, then the declaring type
        if target.base.is_none() && target.chain.is_empty() {
            let mut arity_mismatch = false;
            if let Some(this) = self.frame.this.clone() {
                let ty = self.native().type_of(&this).await?;
                match self.find_method(&ty, name, &args, generic_arity, false).await? {
                    Lookup::Found(m) => {
                        return self.call_method(&m, Some(this), &args, &type_args).await
                    }
                    Lookup::WrongArguments => arity_mismatch = true,
                    Lookup::Missing => {}
                }
            }
            let declaring = self.frame.method.as_ref().map(|m| m.declaring_type.clone());
            if let Some(declaring) = declaring {
                match self.find_method(&declaring, name, &args, generic_arity, true).await? {
                    Lookup::Found(m) => return self.call_method(&m, None, &args, &type_args).await,
                    Lookup::WrongArguments => arity_mismatch = true,
                    Lookup::Missing => {}
                }
            }
            return Err(if arity_mismatch {
                no_overload(name, args.len())
            } else {
                name_not_found(name)
            });
        }

        match self.resolve(target).await?.0 {
            Resolved::Type(ty) => match self
                .find_method(&ty, name, &args, generic_arity, true)
                .await?
            {
                Lookup::Found(m) => self.call_method(&m, None, &args, &type_args).await,
                Lookup::WrongArguments => Err(no_overload(name, args.len())),
                Lookup::Missing => Err(no_static_definition(&ty.name, name)),
            },
            Resolved::Value(value) => {
                let receiver = match value {
                    EvalValue::Null => return Err(null_reference()),
                    EvalValue::Void => return Err(void_not_allowed()),
                    EvalValue::Remote(v) if v.is_null() => return Err(null_reference()),
                    EvalValue::Remote(v) => v,
                    EvalValue::Primitive(p) => {
                        self.native().create_primitive(self.thread(), p).await?
                    }
                };
                let ty = self.native().type_of(&receiver).await?;
                match self.find_method(&ty, name, &args, generic_arity, false).await? {
                    Lookup::Found(m) => {
                        self.call_method(&m, Some(receiver), &args, &type_args).await
                    }
                    Lookup::WrongArguments => Err(no_overload(name, args.len())),
                    Lookup::Missing => Err(no_definition(&receiver.type_name, name)),
                }
            }
        }
    }

    /// First method of the base chain matching name, arity, generic arity
    /// and argument types.
    async fn find_method(
        &self,
        ty: &TypeRef,
        name: &str,
        args: &[EvalValue],
        generic_arity: u32,
        is_static: bool,
    ) -> EvalResult<Lookup> {
        let native = self.native();
        let mut seen_name = false;
        let mut ty = Some(ty.clone());
        let mut depth = 0;
        while let Some(current) = ty {
            let info = native.type_info(&current).await?;
            let candidates = info
                .methods
                .iter()
                .filter(|m| m.name == name && m.is_static == is_static);
            for method in candidates {
                seen_name = true;
                if method.parameters.len() != args.len() || method.generic_arity != generic_arity {
                    continue;
                }
                let mut compatible = true;
                for (arg, param) in args.iter().zip(&method.parameters) {
                    if !self.is_compatible(arg, &param.type_name).await? {
                        compatible = false;
                        break;
                    }
                }
                if compatible {
                    trace!("Matched {}.{} ({:?})", info.ty.name, name, method.method);
                    return Ok(Lookup::Found(method.clone()));
                }
            }
            depth += 1;
            if depth >= MAX_TYPE_DEPTH {
                break;
            }
            ty = info.base;
        }
        Ok(if seen_name {
            Lookup::WrongArguments
        } else {
            Lookup::Missing
        })
    }

    async fn is_compatible(&self, arg: &EvalValue, param: &str) -> EvalResult<bool> {
        let param_type = ElementType::from_type_name(param);
        Ok(match arg {
            EvalValue::Primitive(p) => match param_type {
                Some(to) => operators::is_widening(p.element_type(), to),
                None => param == "System.Object" || param == "System.ValueType",
            },
            EvalValue::Null => param_type.is_none(),
            EvalValue::Void => false,
            EvalValue::Remote(v) => match v.kind {
                ValueKind::Primitive(from) => match param_type {
                    Some(to) => operators::is_widening(from, to),
                    None => param == "System.Object" || param == "System.ValueType",
                },
                ValueKind::NullReference => param_type.is_none(),
                _ if param == "System.Object" || param == v.type_name => true,
                _ => self.derives_from(v, param).await?,
            },
        })
    }

    async fn derives_from(&self, value: &RemoteValue, type_name: &str) -> EvalResult<bool> {
        let native = self.native();
        let mut ty = Some(native.type_of(value).await?);
        let mut depth = 0;
        while let Some(current) = ty {
            if current.name == type_name {
                return Ok(true);
            }
            depth += 1;
            if depth >= MAX_TYPE_DEPTH {
                break;
            }
            ty = native.type_info(&current).await?.base;
        }
        Ok(false)
    }

    /// Target-side value for an argument, converted to the parameter type.
    async fn materialize(&self, arg: &EvalValue, param: &str) -> EvalResult<RemoteValue> {
        let native = self.native();
        let param_type = ElementType::from_type_name(param);
        match arg {
            EvalValue::Primitive(p) => {
                let p = param_type.and_then(|t| operators::convert(*p, t)).unwrap_or(*p);
                Ok(native.create_primitive(self.thread(), p).await?)
            }
            EvalValue::Null => Ok(native.create_null(self.thread()).await?),
            EvalValue::Void => Err(void_not_allowed()),
            EvalValue::Remote(v) => match (v.kind, param_type) {
                (ValueKind::Primitive(from), Some(to)) if from != to => {
                    let p = native.read_primitive(v).await?;
                    let p = operators::convert(p, to).unwrap_or(p);
                    Ok(native.create_primitive(self.thread(), p).await?)
                }
                _ => Ok(v.clone()),
            },
        }
    }

    async fn call_method(
        &self,
        method: &MethodDesc,
        receiver: Option<RemoteValue>,
        args: &[EvalValue],
        type_args: &[TypeRef],
    ) -> EvalResult<EvalValue> {
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.extend(receiver);
        for (arg, param) in args.iter().zip(&method.parameters) {
            call_args.push(self.materialize(arg, &param.type_name).await?);
        }
        let result = self
            .ctx
            .caller
            .call(self.thread(), method.method, type_args, &call_args)
            .await?;
        Ok(match result {
            Some(value) => EvalValue::Remote(value),
            None => EvalValue::Void,
        })
    }

    /// Bring primitives (plain or boxed) and nulls over to the engine.
    async fn localize(&self, value: EvalValue) -> EvalResult<EvalValue> {
        let native = self.native();
        let EvalValue::Remote(remote) = value else {
            return Ok(value);
        };
        Ok(match remote.kind {
            ValueKind::NullReference => EvalValue::Null,
            ValueKind::Primitive(_) => EvalValue::Primitive(native.read_primitive(&remote).await?),
            ValueKind::Boxed => {
                let inner = native.unbox(&remote).await?;
                match inner.kind {
                    ValueKind::Primitive(_) => {
                        EvalValue::Primitive(native.read_primitive(&inner).await?)
                    }
                    _ => EvalValue::Remote(remote),
                }
            }
            _ => EvalValue::Remote(remote),
        })
    }

    /// Text of a value as `ToString()` produces it.
    async fn stringify(&self, value: &EvalValue) -> EvalResult<String> {
        let native = self.native();
        match value {
            EvalValue::Primitive(p) => Ok(operators::to_clr_string(*p)),
            EvalValue::Null => Ok(String::new()),
            EvalValue::Void => Err(void_not_allowed()),
            EvalValue::Remote(v) => match v.kind {
                ValueKind::String => Ok(native.read_string(v).await?),
                ValueKind::NullReference => Ok(String::new()),
                ValueKind::Primitive(_) => {
                    Ok(operators::to_clr_string(native.read_primitive(v).await?))
                }
                _ => {
                    let ty = native.type_of(v).await?;
                    let to_string = self.find_method(&ty, "ToString", &[], 0, false).await?;
                    if let Lookup::Found(m) = to_string {
                        let text = self.call_method(&m, Some(v.clone()), &[], &[]).await?;
                        if let EvalValue::Remote(text) = text {
                            if text.kind == ValueKind::String {
                                return Ok(native.read_string(&text).await?);
                            }
                        }
                    }
                    Ok(v.type_name.clone())
                }
            },
        }
    }

    async fn element_access(
        &mut self,
        target: EvalValue,
        indices: Vec<EvalValue>,
    ) -> EvalResult<(EvalValue, bool)> {
        let native = self.native();
        let target = match target {
            EvalValue::Null => return Err(null_reference()),
            EvalValue::Remote(v) if v.is_null() => return Err(null_reference()),
            EvalValue::Remote(v) => v,
            other => return Err(not_indexable(&value_type_name(&other))),
        };

        match target.kind {
            ValueKind::Array => {
                let dims = native.array_dimensions(&target).await?;
                if indices.len() != dims.len() {
                    return Err(EvalError::resolution(format!(
                        "error CS0022: Wrong number of indices inside []; expected {}",
                        dims.len()
                    )));
                }
                let mut position = Vec::with_capacity(dims.len());
                for (index, dim) in indices.into_iter().zip(dims) {
                    let i = self.index_value(index).await?;
                    if i < 0 || i >= dim as i64 {
                        return Err(EvalError::runtime(
                            "Index was outside the bounds of the array.",
                        ));
                    }
                    position.push(i as u32);
                }
                Ok((EvalValue::Remote(native.array_element(&target, &position).await?), true))
            }
            ValueKind::String if indices.len() == 1 => {
                let index = indices.into_iter().next().unwrap_or(EvalValue::Void);
                let i = self.index_value(index).await?;
                let text: Vec<u16> = native.read_string(&target).await?.encode_utf16().collect();
                let c = usize::try_from(i)
                    .ok()
                    .and_then(|i| text.get(i).copied())
                    .ok_or_else(|| {
                        EvalError::runtime("Index was outside the bounds of the array.")
                    })?;
                Ok((EvalValue::Primitive(Primitive::Char(c)), false))
            }
            _ => {
                let ty = native.type_of(&target).await?;
                match self.find_method(&ty, "get_Item", &indices, 0, false).await? {
                    Lookup::Found(m) => {
                        Ok((self.call_method(&m, Some(target), &indices, &[]).await?, false))
                    }
                    _ => Err(not_indexable(&display_type_name(&target.type_name))),
                }
            }
        }
    }

    async fn index_value(&self, index: EvalValue) -> EvalResult<i64> {
        match self.localize(index).await? {
            EvalValue::Primitive(p) => operators::as_index(p).ok_or_else(|| {
                EvalError::resolution(format!(
                    "error CS0029: Cannot implicitly convert type '{}' to 'int'",
                    p.element_type().keyword()
                ))
            }),
            other => Err(EvalError::resolution(format!(
                "error CS0029: Cannot implicitly convert type '{}' to 'int'",
                value_type_name(&other)
            ))),
        }
    }

    async fn unary(
        &mut self,
        op: UnaryOp,
        operand: EvalValue,
        checked: bool,
    ) -> EvalResult<EvalValue> {
        match self.localize(operand).await? {
            EvalValue::Primitive(p) => Ok(EvalValue::Primitive(operators::unary(op, p, checked)?)),
            EvalValue::Null => Ok(EvalValue::Null),
            EvalValue::Void => Err(operators::unary_not_applicable(op, "void")),
            EvalValue::Remote(v) => {
                let args = [EvalValue::Remote(v.clone())];
                let ty = self.native().type_of(&v).await?;
                match self.find_method(&ty, op.method_name(), &args, 0, true).await? {
                    Lookup::Found(m) => {
                        let result = self.call_method(&m, None, &args, &[]).await?;
                        self.localize(result).await
                    }
                    _ => Err(operators::unary_not_applicable(op, &display_type_name(&v.type_name))),
                }
            }
        }
    }

    async fn binary(
        &mut self,
        op: BinaryOp,
        lhs: EvalValue,
        rhs: EvalValue,
        checked: bool,
    ) -> EvalResult<EvalValue> {
        let lhs = self.localize(lhs).await?;
        let rhs = self.localize(rhs).await?;

        if op == BinaryOp::Coalesce {
            return Ok(if lhs.is_null() { rhs } else { lhs });
        }
        if matches!(lhs, EvalValue::Void) || matches!(rhs, EvalValue::Void) {
            return Err(operators::binary_not_applicable(
                op,
                &value_type_name(&lhs),
                &value_type_name(&rhs),
            ));
        }
        if op == BinaryOp::Add && (is_string(&lhs) || is_string(&rhs)) {
            let text = format!("{}{}", self.stringify(&lhs).await?, self.stringify(&rhs).await?);
            let value = self.ctx.caller.new_string(self.thread(), &text).await?;
            return Ok(EvalValue::Remote(value));
        }
        if lhs.is_null() || rhs.is_null() {
            let both = lhs.is_null() && rhs.is_null();
            return Ok(match op {
                BinaryOp::Eq => EvalValue::Primitive(Primitive::Bool(both)),
                BinaryOp::Ne => EvalValue::Primitive(Primitive::Bool(!both)),
                _ if op.is_comparison() => EvalValue::Primitive(Primitive::Bool(false)),
                _ => EvalValue::Null,
            });
        }
        if let (EvalValue::Primitive(a), EvalValue::Primitive(b)) = (&lhs, &rhs) {
            return Ok(EvalValue::Primitive(operators::binary(op, *a, *b, checked)?));
        }
        self.class_operator(op, lhs, rhs).await
    }

    /// User-defined operator of either operand's type, then reference
    /// identity for `==`/`!=`.
    async fn class_operator(
        &mut self,
        op: BinaryOp,
        lhs: EvalValue,
        rhs: EvalValue,
    ) -> EvalResult<EvalValue> {
        let native = self.native();
        let args = [lhs, rhs];
        if let Some(name) = op.method_name() {
            for operand in &args {
                let EvalValue::Remote(v) = operand else {
                    continue;
                };
                let ty = native.type_of(v).await?;
                if let Lookup::Found(m) = self.find_method(&ty, name, &args, 0, true).await? {
                    debug!("Operator {} dispatched to {}.{}", op.symbol(), ty.name, name);
                    let result = self.call_method(&m, None, &args, &[]).await?;
                    return self.localize(result).await;
                }
            }
        }
        let [lhs, rhs] = args;
        if op.is_equality() {
            if let (EvalValue::Remote(a), EvalValue::Remote(b)) = (&lhs, &rhs) {
                let same = native.object_address(a).await? == native.object_address(b).await?;
                return Ok(EvalValue::Primitive(Primitive::Bool(same == (op == BinaryOp::Eq))));
            }
        }
        Err(operators::binary_not_applicable(
            op,
            &value_type_name(&lhs),
            &value_type_name(&rhs),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::evaluate;
    use crate::testing::{program_fixture, EvalHarness};

    async fn eval(harness: &EvalHarness, text: &str) -> EvalResult<EvalValue> {
        harness.eval(text).await.map(|e| e.value)
    }

    #[tokio::test]
    async fn test_numeric_promotion() {
        let harness = EvalHarness::new(program_fixture());
        assert_eq!(
            eval(&harness, "1 + 2.5").await.unwrap(),
            EvalValue::Primitive(Primitive::F64(3.5))
        );
        assert_eq!(
            eval(&harness, "2 << 3").await.unwrap(),
            EvalValue::Primitive(Primitive::I32(16))
        );
        assert_eq!(
            eval(&harness, "count * 2 + 1").await.unwrap(),
            EvalValue::Primitive(Primitive::I32(11))
        );
        assert_eq!(harness.target.eval_count(), 0);
    }

    #[tokio::test]
    async fn test_string_equality_calls_operator_method() {
        let harness = EvalHarness::new(program_fixture());
        assert_eq!(
            eval(&harness, "name == \"mdbg\"").await.unwrap(),
            EvalValue::Primitive(Primitive::Bool(true))
        );
        let calls = harness.target.called_methods();
        assert_eq!(calls, vec!["op_Equality".to_string()]);
    }

    #[tokio::test]
    async fn test_null_conditional_short_circuits() {
        let harness = EvalHarness::new(program_fixture());
        let result = harness.eval("node?.Next.Value").await.unwrap();
        assert!(result.value.is_null());
        assert_eq!(harness.target.eval_count(), 0);

        let err = harness.eval("node.Next").await.unwrap_err();
        assert!(matches!(err, EvalError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_locals_fields_and_statics() {
        let harness = EvalHarness::new(program_fixture());
        let local = harness.eval("x").await.unwrap();
        assert!(local.editable);
        assert_eq!(
            harness.target.read(&local.value),
            Some(Primitive::I32(7))
        );
        let field = harness.eval("this.count").await.unwrap();
        assert_eq!(harness.target.read(&field.value), Some(Primitive::I32(5)));
        let implicit = harness.eval("count").await.unwrap();
        assert_eq!(harness.target.read(&implicit.value), Some(Primitive::I32(5)));
        let fully_qualified = harness.eval("App.Program.Version").await.unwrap();
        assert_eq!(harness.target.read(&fully_qualified.value), Some(Primitive::I32(3)));
        let via_namespace = harness.eval("Program.Version").await.unwrap();
        assert_eq!(harness.target.read(&via_namespace.value), Some(Primitive::I32(3)));
    }

    #[tokio::test]
    async fn test_property_getter_and_invocation() {
        let harness = EvalHarness::new(program_fixture());
        let title = harness.eval("Title").await.unwrap();
        assert!(!title.editable);
        assert_eq!(harness.target.text(&title.value).as_deref(), Some("Program mdbg"));

        let sum = eval(&harness, "Add(2, 3)").await.unwrap();
        assert_eq!(harness.target.read(&sum), Some(Primitive::I32(5)));

        let max = eval(&harness, "Math.Max(4, x)").await.unwrap();
        assert_eq!(harness.target.read(&max), Some(Primitive::I32(7)));

        let err = harness.eval("Add(1)").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "error CS1501: No overload for method 'Add' takes 1 arguments"
        );
    }

    #[tokio::test]
    async fn test_arrays_and_strings() {
        let harness = EvalHarness::new(program_fixture());
        assert_eq!(
            eval(&harness, "arr.Length").await.unwrap(),
            EvalValue::Primitive(Primitive::I32(3))
        );
        let element = harness.eval("arr[1]").await.unwrap();
        assert!(element.editable);
        assert_eq!(harness.target.read(&element.value), Some(Primitive::I32(20)));
        assert_eq!(
            eval(&harness, "name[0]").await.unwrap(),
            EvalValue::Primitive(Primitive::Char('m' as u16))
        );
        let err = harness.eval("arr[3]").await.unwrap_err();
        assert_eq!(err.to_string(), "Index was outside the bounds of the array.");
    }

    #[tokio::test]
    async fn test_string_building() {
        let harness = EvalHarness::new(program_fixture());
        let concat = eval(&harness, "name + x").await.unwrap();
        assert_eq!(harness.target.text(&concat).as_deref(), Some("mdbg7"));
        let interpolated = eval(&harness, "$\"{name}:{count > 3}\"").await.unwrap();
        assert_eq!(harness.target.text(&interpolated).as_deref(), Some("mdbg:True"));
    }

    #[tokio::test]
    async fn test_resolution_failures() {
        let harness = EvalHarness::new(program_fixture());
        struct TestCase {
            expr: &'static str,
            err_text: &'static str,
        }
        let test_cases = vec![
            TestCase {
                expr: "missing",
                err_text: "error CS0103: The name 'missing' does not exist in the current context",
            },
            TestCase {
                expr: "this.missing",
                err_text: "error CS1061: 'App.Program' does not contain a definition for 'missing'",
            },
            TestCase {
                expr: "Program",
                err_text: "error CS0119: 'App.Program' is a type, \
                           which is not valid in the given context",
            },
            TestCase {
                expr: "this + 1",
                err_text: "error CS0019: Operator '+' cannot be applied \
                           to operands of type 'App.Program' and 'int'",
            },
            TestCase {
                expr: "sizeof(string)",
                err_text: "error CS0233: 'string' does not have a predefined size, \
                           therefore sizeof can only be used in an unsafe context",
            },
        ];
        for tc in test_cases {
            let err = harness.eval(tc.expr).await.unwrap_err();
            assert_eq!(err.to_string(), tc.err_text, "{}", tc.expr);
        }
    }

    #[tokio::test]
    async fn test_remote_exception_is_a_fault() {
        let harness = EvalHarness::new(program_fixture());
        match harness.eval("Fail()").await.unwrap_err() {
            EvalError::RemoteFault(exception) => {
                assert_eq!(exception.type_name, "System.InvalidOperationException")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reference_equality_fallback() {
        let harness = EvalHarness::new(program_fixture());
        assert_eq!(
            eval(&harness, "this == this").await.unwrap(),
            EvalValue::Primitive(Primitive::Bool(true))
        );
        assert_eq!(
            eval(&harness, "node ?? this").await.map(|v| v.is_null()).unwrap(),
            false
        );
        let ctx = harness.context();
        let result = evaluate(ctx, "sizeof(long)").await.unwrap();
        assert_eq!(result.value, EvalValue::Primitive(Primitive::I32(8)));
    }
}
