// In-memory native backend for engine tests
//
// FakeTarget is a deterministic stand-in for a stopped process: a heap of
// values, types whose methods are closures over that heap, frames per thread,
// and a log of every request the engine made. Queued evaluations run when the
// engine continues the process, and their completions are delivered on the
// same event channel as every other notification.

use crate::error::{EvalResult, NativeError, NativeResult};
use crate::eval::{evaluate, EvalContext, Evaluated, EvalValue};
use crate::native::*;
use crate::remote_call::{route_events, EvalWaiters, RemoteCaller};
use crate::stepper::{BUILDER_FIELD, IDENTITY_PROPERTY};
use crate::symbols::{
    AsyncSteppingInfo, AwaitBlock, LocalName, MethodSymbols, ModuleSymbols, SequencePoint,
    SymbolTable,
};
use crate::types::*;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const APP: ModuleId = ModuleId(1);
pub const CORELIB: ModuleId = ModuleId(2);

/// Route engine logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A method's result, or the exception it throws.
pub type BehaviorResult = Result<Option<RemoteValue>, RemoteValue>;

pub type Behavior = Arc<dyn Fn(&mut FakeHeap, &[RemoteValue]) -> BehaviorResult + Send + Sync>;

pub fn behavior(
    f: impl Fn(&mut FakeHeap, &[RemoteValue]) -> BehaviorResult + Send + Sync + 'static,
) -> Option<Behavior> {
    Some(Arc::new(f))
}

/// Sequence points for one method, one per `(offset, line)` pair.
pub fn method_symbols(token: MethodToken, document: &str, points: &[(u32, u32)]) -> MethodSymbols {
    MethodSymbols {
        token,
        document: document.to_string(),
        code_size: points.last().map(|(offset, _)| offset + 10).unwrap_or(0),
        sequence_points: points
            .iter()
            .map(|&(offset, line)| SequencePoint {
                offset,
                start_line: line,
                end_line: line,
                start_column: 9,
                end_column: 30,
            })
            .collect(),
        async_info: None,
        locals: Vec::new(),
        imported_namespaces: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub enum FakeObject {
    Primitive(Primitive),
    Str(String),
    Object {
        fields: HashMap<String, RemoteValue>,
        address: u64,
    },
    Array {
        dims: Vec<u32>,
        elements: Vec<RemoteValue>,
    },
    Boxed(RemoteValue),
    Null,
}

#[derive(Default)]
pub struct FakeHeap {
    next: u64,
    values: HashMap<ValueId, FakeObject>,
}

impl FakeHeap {
    fn alloc(&mut self, kind: ValueKind, type_name: &str, object: FakeObject) -> RemoteValue {
        self.next += 1;
        let id = ValueId(self.next);
        self.values.insert(id, object);
        RemoteValue {
            id,
            kind,
            type_name: type_name.to_string(),
        }
    }

    pub fn primitive(&mut self, value: Primitive) -> RemoteValue {
        let et = value.element_type();
        self.alloc(ValueKind::Primitive(et), et.type_name(), FakeObject::Primitive(value))
    }

    pub fn string(&mut self, text: &str) -> RemoteValue {
        self.alloc(ValueKind::String, "System.String", FakeObject::Str(text.to_string()))
    }

    pub fn null(&mut self, type_name: &str) -> RemoteValue {
        self.alloc(ValueKind::NullReference, type_name, FakeObject::Null)
    }

    pub fn object(&mut self, type_name: &str, fields: Vec<(&str, RemoteValue)>) -> RemoteValue {
        let address = 0x1000 + (self.next + 1) * 0x10;
        let fields = fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.alloc(ValueKind::Object, type_name, FakeObject::Object { fields, address })
    }

    pub fn array(&mut self, type_name: &str, elements: Vec<RemoteValue>) -> RemoteValue {
        let dims = vec![elements.len() as u32];
        self.alloc(ValueKind::Array, type_name, FakeObject::Array { dims, elements })
    }

    pub fn boxed(&mut self, value: Primitive) -> RemoteValue {
        let inner = self.primitive(value);
        self.alloc(ValueKind::Boxed, value.element_type().type_name(), FakeObject::Boxed(inner))
    }

    pub fn get(&self, value: &RemoteValue) -> Option<&FakeObject> {
        self.values.get(&value.id)
    }

    pub fn read_primitive(&self, value: &RemoteValue) -> Option<Primitive> {
        match self.get(value)? {
            FakeObject::Primitive(p) => Some(*p),
            _ => None,
        }
    }

    pub fn read_string(&self, value: &RemoteValue) -> Option<String> {
        match self.get(value)? {
            FakeObject::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn field(&self, object: &RemoteValue, name: &str) -> Option<RemoteValue> {
        match self.get(object)? {
            FakeObject::Object { fields, .. } => fields.get(name).cloned(),
            _ => None,
        }
    }

    pub fn set_field(&mut self, object: &RemoteValue, name: &str, value: RemoteValue) {
        if let Some(FakeObject::Object { fields, .. }) = self.values.get_mut(&object.id) {
            fields.insert(name.to_string(), value);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeFrame {
    pub method: MethodRef,
    pub offset: u32,
    pub this: Option<RemoteValue>,
    pub args: Vec<NamedValue>,
    pub locals: Vec<LocalValue>,
}

impl FakeFrame {
    pub fn at(method: MethodRef, offset: u32) -> Self {
        Self {
            method,
            offset,
            this: None,
            args: Vec::new(),
            locals: Vec::new(),
        }
    }
}

enum PendingEval {
    Call(MethodRef, Vec<RemoteValue>),
    NewString(String),
}

#[derive(Default)]
struct FakeState {
    heap: FakeHeap,
    types: HashMap<String, TypeInfo>,
    methods: HashMap<MethodRef, MethodDesc>,
    behaviors: HashMap<MethodRef, Behavior>,
    statics: HashMap<(String, String), RemoteValue>,
    next_token: u32,
    module_symbols: HashMap<ModuleId, ModuleSymbols>,
    threads: Vec<NativeThread>,
    frames: HashMap<ThreadId, Vec<FakeFrame>>,
    breakpoints: HashMap<NativeBreakpointId, (MethodRef, u32, bool)>,
    next_breakpoint: u32,
    next_eval: u64,
    pending: Vec<(ThreadId, EvalId, PendingEval)>,
    steps: Vec<(ThreadId, StepMode)>,
    cancelled_steps: Vec<ThreadId>,
    calls: Vec<String>,
    evals: usize,
    continues: usize,
    stops: usize,
    strong: HashSet<ValueId>,
    released: usize,
}

impl FakeState {
    fn type_ref(&self, name: &str) -> TypeRef {
        match self.types.get(name) {
            Some(info) => info.ty.clone(),
            None => TypeRef {
                module: CORELIB,
                token: 0,
                name: name.to_string(),
            },
        }
    }

    fn frame(&self, thread: ThreadId, depth: u32) -> NativeResult<&FakeFrame> {
        self.frames
            .get(&thread)
            .and_then(|frames| frames.get(depth as usize))
            .ok_or_else(|| {
                NativeError::Protocol(format!("no frame {} on thread {}", depth, thread))
            })
    }

    fn run_eval(&mut self, thread: ThreadId, eval: EvalId, work: PendingEval) -> NativeEvent {
        let outcome = match work {
            PendingEval::NewString(text) => Ok(Some(self.heap.string(&text))),
            PendingEval::Call(method, args) => match self.behaviors.get(&method).cloned() {
                Some(behavior) => behavior(&mut self.heap, &args),
                None => Ok(None),
            },
        };
        match outcome {
            Ok(result) => NativeEvent::EvalComplete { thread, eval, result },
            Err(exception) => NativeEvent::EvalException {
                thread,
                eval,
                exception,
            },
        }
    }
}

pub struct FakeTarget {
    state: Mutex<FakeState>,
    events_tx: mpsc::UnboundedSender<NativeEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NativeEvent>>>,
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTarget {
    /// A target with the core library types every program sees.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let target = Self {
            state: Mutex::new(FakeState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        };

        target.define_type(CORELIB, "System.Object", None);
        target.define_type(CORELIB, "System.ValueType", Some("System.Object"));
        target.define_type(CORELIB, "System.String", Some("System.Object"));
        target.define_type(CORELIB, "System.Array", Some("System.Object"));
        target.define_type(CORELIB, "System.Math", Some("System.Object"));
        target.define_type(CORELIB, "System.InvalidOperationException", Some("System.Object"));
        for tag in 0x02..=0x0d {
            if let Some(et) = ElementType::from_tag(tag) {
                target.define_type(CORELIB, et.type_name(), Some("System.ValueType"));
            }
        }

        target.add_method(
            "System.Object",
            "ToString",
            &[],
            false,
            behavior(|heap, args| {
                let name = args[0].type_name.clone();
                Ok(Some(heap.string(&name)))
            }),
        );
        target.add_method(
            "System.String",
            "op_Equality",
            &["System.String", "System.String"],
            true,
            behavior(|heap, args| {
                let equal = heap.read_string(&args[0]) == heap.read_string(&args[1]);
                Ok(Some(heap.primitive(Primitive::Bool(equal))))
            }),
        );
        target.add_method(
            "System.Math",
            "Max",
            &["System.Int32", "System.Int32"],
            true,
            behavior(|heap, args| {
                let a = heap.read_primitive(&args[0]);
                let b = heap.read_primitive(&args[1]);
                match (a, b) {
                    (Some(Primitive::I32(a)), Some(Primitive::I32(b))) => {
                        Ok(Some(heap.primitive(Primitive::I32(a.max(b)))))
                    }
                    _ => Err(heap.object("System.InvalidOperationException", vec![])),
                }
            }),
        );
        target
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Receiver of every notification the target raises. Can be taken once.
    pub fn take_events(&self) -> mpsc::UnboundedReceiver<NativeEvent> {
        self.events_rx.lock().unwrap().take().expect("events already taken")
    }

    pub async fn emit(&self, event: NativeEvent) {
        self.events_tx.send(event).expect("event receiver dropped");
    }

    pub fn heap<R>(&self, f: impl FnOnce(&mut FakeHeap) -> R) -> R {
        f(&mut self.lock().heap)
    }

    pub fn define_type(&self, module: ModuleId, name: &str, base: Option<&str>) -> TypeRef {
        let mut state = self.lock();
        state.next_token += 1;
        let ty = TypeRef {
            module,
            token: 0x02000000 + state.next_token,
            name: name.to_string(),
        };
        let base = base.map(|b| state.type_ref(b));
        let info = TypeInfo {
            ty: ty.clone(),
            is_value_type: base.as_ref().is_some_and(|b| b.name == "System.ValueType"),
            base,
            fields: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
        };
        state.types.insert(name.to_string(), info);
        ty
    }

    pub fn add_field(&self, type_name: &str, field: &str, field_type: &str, is_static: bool) {
        let mut state = self.lock();
        state.next_token += 1;
        let token = 0x04000000 + state.next_token;
        let info = state.types.get_mut(type_name).expect("unknown type");
        info.fields.push(FieldInfo {
            token,
            name: field.to_string(),
            type_name: field_type.to_string(),
            is_static,
        });
    }

    pub fn set_static(&self, type_name: &str, field: &str, value: RemoteValue) {
        self.lock()
            .statics
            .insert((type_name.to_string(), field.to_string()), value);
    }

    pub fn add_method(
        &self,
        type_name: &str,
        name: &str,
        params: &[&str],
        is_static: bool,
        behavior: Option<Behavior>,
    ) -> MethodRef {
        let mut state = self.lock();
        state.next_token += 1;
        let declaring_type = state.type_ref(type_name);
        let method = MethodRef::new(declaring_type.module, 0x06000000 + state.next_token);
        let desc = MethodDesc {
            method,
            name: name.to_string(),
            declaring_type,
            is_static,
            parameters: params
                .iter()
                .enumerate()
                .map(|(i, ty)| ParamInfo {
                    name: format!("arg{}", i),
                    type_name: ty.to_string(),
                })
                .collect(),
            generic_arity: 0,
            return_type: "System.Object".to_string(),
            non_user_code: false,
        };
        state
            .types
            .get_mut(type_name)
            .expect("unknown type")
            .methods
            .push(desc.clone());
        state.methods.insert(method, desc);
        if let Some(behavior) = behavior {
            state.behaviors.insert(method, behavior);
        }
        method
    }

    pub fn mark_non_user_code(&self, method: MethodRef) {
        let mut state = self.lock();
        if let Some(desc) = state.methods.get_mut(&method) {
            desc.non_user_code = true;
        }
    }

    /// Instance property backed by a `get_<name>` method.
    pub fn add_property(
        &self,
        type_name: &str,
        name: &str,
        property_type: &str,
        behavior: Option<Behavior>,
    ) -> MethodRef {
        let getter = self.add_method(type_name, &format!("get_{}", name), &[], false, behavior);
        let mut state = self.lock();
        state
            .types
            .get_mut(type_name)
            .expect("unknown type")
            .properties
            .push(PropertyInfo {
                name: name.to_string(),
                type_name: property_type.to_string(),
                getter: Some(getter),
                is_static: false,
            });
        getter
    }

    pub fn add_module_symbols(&self, module: ModuleId, symbols: ModuleSymbols) {
        self.lock().module_symbols.insert(module, symbols);
    }

    pub fn symbol_table(&self) -> SymbolTable {
        let table = SymbolTable::new();
        for (module, symbols) in self.lock().module_symbols.iter() {
            table.add_module(*module, symbols.clone());
        }
        table
    }

    /// Replace the call stack of a thread, innermost first.
    pub fn set_frames(&self, thread: ThreadId, frames: Vec<FakeFrame>) {
        let mut state = self.lock();
        if !state.threads.iter().any(|t| t.id == thread) {
            state.threads.push(NativeThread {
                id: thread,
                name: Some(format!("Worker {}", thread)),
            });
        }
        state.frames.insert(thread, frames);
    }

    pub fn breakpoint_active(&self, breakpoint: NativeBreakpointId) -> bool {
        self.lock()
            .breakpoints
            .get(&breakpoint)
            .map(|(_, _, active)| *active)
            .unwrap_or(false)
    }

    /// Active breakpoint at `method`+`offset`, if any.
    pub fn breakpoint_at(&self, method: MethodRef, offset: u32) -> Option<NativeBreakpointId> {
        self.lock()
            .breakpoints
            .iter()
            .find(|(_, (m, o, active))| *m == method && *o == offset && *active)
            .map(|(id, _)| *id)
    }

    pub fn steps(&self) -> Vec<(ThreadId, StepMode)> {
        self.lock().steps.clone()
    }

    pub fn cancelled_steps(&self) -> Vec<ThreadId> {
        self.lock().cancelled_steps.clone()
    }

    /// Names of the methods invoked remotely, in order.
    pub fn called_methods(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Remote evaluations of any kind, string construction included.
    pub fn eval_count(&self) -> usize {
        self.lock().evals
    }

    pub fn continue_count(&self) -> usize {
        self.lock().continues
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stops
    }

    pub fn released_handles(&self) -> usize {
        self.lock().released
    }

    pub fn live_handles(&self) -> usize {
        self.lock().strong.len()
    }

    pub fn read(&self, value: &EvalValue) -> Option<Primitive> {
        match value {
            EvalValue::Primitive(p) => Some(*p),
            EvalValue::Remote(v) => self.lock().heap.read_primitive(v),
            _ => None,
        }
    }

    pub fn text(&self, value: &EvalValue) -> Option<String> {
        match value {
            EvalValue::Remote(v) => self.lock().heap.read_string(v),
            _ => None,
        }
    }
}

#[async_trait]
impl NativeDebugger for FakeTarget {
    async fn launch(&self, _request: &LaunchRequest) -> NativeResult<u32> {
        Ok(4242)
    }

    async fn attach(&self, _pid: u32) -> NativeResult<()> {
        Ok(())
    }

    async fn detach(&self) -> NativeResult<()> {
        Ok(())
    }

    async fn terminate(&self) -> NativeResult<()> {
        Ok(())
    }

    async fn continue_process(&self) -> NativeResult<()> {
        let events: Vec<NativeEvent> = {
            let mut state = self.lock();
            state.continues += 1;
            let pending = std::mem::take(&mut state.pending);
            pending
                .into_iter()
                .map(|(thread, eval, work)| state.run_eval(thread, eval, work))
                .collect()
        };
        for event in events {
            self.events_tx
                .send(event)
                .map_err(|_| NativeError::ConnectionClosed)?;
        }
        Ok(())
    }

    async fn stop_process(&self) -> NativeResult<()> {
        self.lock().stops += 1;
        Ok(())
    }

    async fn create_breakpoint(
        &self,
        method: MethodRef,
        offset: u32,
    ) -> NativeResult<NativeBreakpointId> {
        let mut state = self.lock();
        state.next_breakpoint += 1;
        let id = NativeBreakpointId(state.next_breakpoint);
        state.breakpoints.insert(id, (method, offset, true));
        Ok(id)
    }

    async fn set_breakpoint_active(
        &self,
        breakpoint: NativeBreakpointId,
        active: bool,
    ) -> NativeResult<()> {
        match self.lock().breakpoints.get_mut(&breakpoint) {
            Some(entry) => {
                entry.2 = active;
                Ok(())
            }
            None => Err(NativeError::Protocol(format!("no breakpoint {:?}", breakpoint))),
        }
    }

    async fn step(&self, thread: ThreadId, mode: StepMode) -> NativeResult<()> {
        self.lock().steps.push((thread, mode));
        Ok(())
    }

    async fn cancel_step(&self, thread: ThreadId) -> NativeResult<()> {
        self.lock().cancelled_steps.push(thread);
        Ok(())
    }

    async fn threads(&self) -> NativeResult<Vec<NativeThread>> {
        Ok(self.lock().threads.clone())
    }

    async fn frames(&self, thread: ThreadId) -> NativeResult<Vec<NativeFrame>> {
        let state = self.lock();
        let frames = state
            .frames
            .get(&thread)
            .ok_or_else(|| NativeError::Protocol(format!("no thread {}", thread)))?;
        Ok(frames
            .iter()
            .map(|f| NativeFrame {
                kind: FrameKind::Managed,
                method: Some(f.method),
                offset: f.offset,
            })
            .collect())
    }

    async fn arguments(&self, thread: ThreadId, depth: u32) -> NativeResult<Vec<NamedValue>> {
        let state = self.lock();
        let frame = state.frame(thread, depth)?;
        let mut arguments = Vec::new();
        if let Some(this) = &frame.this {
            arguments.push(NamedValue {
                name: "this".to_string(),
                value: this.clone(),
            });
        }
        arguments.extend(frame.args.iter().cloned());
        Ok(arguments)
    }

    async fn locals(&self, thread: ThreadId, depth: u32) -> NativeResult<Vec<LocalValue>> {
        Ok(self.lock().frame(thread, depth)?.locals.clone())
    }

    async fn method_desc(&self, method: MethodRef) -> NativeResult<MethodDesc> {
        self.lock()
            .methods
            .get(&method)
            .cloned()
            .ok_or_else(|| NativeError::Protocol(format!("unknown method {:?}", method)))
    }

    async fn module_symbols(&self, module: ModuleId) -> NativeResult<Option<ModuleSymbols>> {
        Ok(self.lock().module_symbols.get(&module).cloned())
    }

    async fn read_primitive(&self, value: &RemoteValue) -> NativeResult<Primitive> {
        self.lock()
            .heap
            .read_primitive(value)
            .ok_or_else(|| NativeError::Protocol("not a primitive".to_string()))
    }

    async fn read_string(&self, value: &RemoteValue) -> NativeResult<String> {
        self.lock()
            .heap
            .read_string(value)
            .ok_or_else(|| NativeError::Protocol("not a string".to_string()))
    }

    async fn unbox(&self, value: &RemoteValue) -> NativeResult<RemoteValue> {
        match self.lock().heap.get(value) {
            Some(FakeObject::Boxed(inner)) => Ok(inner.clone()),
            _ => Err(NativeError::Protocol("not a boxed value".to_string())),
        }
    }

    async fn object_address(&self, value: &RemoteValue) -> NativeResult<u64> {
        match self.lock().heap.get(value) {
            Some(FakeObject::Object { address, .. }) => Ok(*address),
            _ => Ok(value.id.0),
        }
    }

    async fn type_of(&self, value: &RemoteValue) -> NativeResult<TypeRef> {
        Ok(self.lock().type_ref(&value.type_name))
    }

    async fn type_info(&self, ty: &TypeRef) -> NativeResult<TypeInfo> {
        let state = self.lock();
        if let Some(info) = state.types.get(&ty.name) {
            return Ok(info.clone());
        }
        if ty.name.ends_with(']') {
            return Ok(TypeInfo {
                ty: ty.clone(),
                base: Some(state.type_ref("System.Array")),
                is_value_type: false,
                fields: Vec::new(),
                properties: Vec::new(),
                methods: Vec::new(),
            });
        }
        Err(NativeError::Protocol(format!("unknown type {}", ty.name)))
    }

    async fn find_type(&self, module: ModuleId, name: &str) -> NativeResult<Option<TypeRef>> {
        Ok(self
            .lock()
            .types
            .get(name)
            .filter(|info| info.ty.module == module)
            .map(|info| info.ty.clone()))
    }

    async fn array_dimensions(&self, array: &RemoteValue) -> NativeResult<Vec<u32>> {
        match self.lock().heap.get(array) {
            Some(FakeObject::Array { dims, .. }) => Ok(dims.clone()),
            _ => Err(NativeError::Protocol("not an array".to_string())),
        }
    }

    async fn array_element(
        &self,
        array: &RemoteValue,
        indices: &[u32],
    ) -> NativeResult<RemoteValue> {
        match self.lock().heap.get(array) {
            Some(FakeObject::Array { dims, elements }) => {
                let flat = indices
                    .iter()
                    .zip(dims)
                    .fold(0usize, |acc, (i, d)| acc * *d as usize + *i as usize);
                elements
                    .get(flat)
                    .cloned()
                    .ok_or_else(|| NativeError::Protocol("index out of range".to_string()))
            }
            _ => Err(NativeError::Protocol("not an array".to_string())),
        }
    }

    async fn field_value(
        &self,
        object: &RemoteValue,
        field: &FieldInfo,
    ) -> NativeResult<RemoteValue> {
        self.lock()
            .heap
            .field(object, &field.name)
            .ok_or_else(|| NativeError::Protocol(format!("no field {}", field.name)))
    }

    async fn static_field_value(
        &self,
        _thread: ThreadId,
        ty: &TypeRef,
        field: &FieldInfo,
    ) -> NativeResult<RemoteValue> {
        self.lock()
            .statics
            .get(&(ty.name.clone(), field.name.clone()))
            .cloned()
            .ok_or_else(|| NativeError::Protocol(format!("no static {}", field.name)))
    }

    async fn create_primitive(
        &self,
        _thread: ThreadId,
        value: Primitive,
    ) -> NativeResult<RemoteValue> {
        Ok(self.lock().heap.primitive(value))
    }

    async fn create_null(&self, _thread: ThreadId) -> NativeResult<RemoteValue> {
        Ok(self.lock().heap.null("System.Object"))
    }

    async fn begin_call(
        &self,
        thread: ThreadId,
        method: MethodRef,
        _type_args: &[TypeRef],
        args: &[RemoteValue],
    ) -> NativeResult<EvalId> {
        let mut state = self.lock();
        let name = state
            .methods
            .get(&method)
            .map(|m| m.name.clone())
            .ok_or_else(|| NativeError::Protocol(format!("unknown method {:?}", method)))?;
        state.calls.push(name);
        state.evals += 1;
        state.next_eval += 1;
        let eval = EvalId(state.next_eval);
        state
            .pending
            .push((thread, eval, PendingEval::Call(method, args.to_vec())));
        Ok(eval)
    }

    async fn begin_new_string(&self, thread: ThreadId, text: &str) -> NativeResult<EvalId> {
        let mut state = self.lock();
        state.evals += 1;
        state.next_eval += 1;
        let eval = EvalId(state.next_eval);
        state
            .pending
            .push((thread, eval, PendingEval::NewString(text.to_string())));
        Ok(eval)
    }

    async fn abort_eval(&self, eval: EvalId) -> NativeResult<()> {
        self.lock().pending.retain(|(_, id, _)| *id != eval);
        Ok(())
    }

    async fn create_strong_handle(&self, value: &RemoteValue) -> NativeResult<RemoteValue> {
        let mut state = self.lock();
        let object = state
            .heap
            .get(value)
            .cloned()
            .ok_or_else(|| NativeError::Protocol("dangling value".to_string()))?;
        let handle = state.heap.alloc(value.kind, &value.type_name, object);
        state.strong.insert(handle.id);
        Ok(handle)
    }

    fn release_handle(&self, handle: &RemoteValue) {
        let mut state = self.lock();
        if state.strong.remove(&handle.id) {
            state.released += 1;
        }
    }
}

/// A target stopped in `App.Program.Run` on thread 1.
///
/// `this` has `count = 5`, `name = "mdbg"`, a `Title` property and the
/// instance methods `Add(int, int)` and `Fail()`; `Program.Version` is a
/// static `3`. Locals: `x = 7`, `arr = {10, 20, 30}`, `node = null`.
pub fn program_fixture() -> FakeTarget {
    let target = FakeTarget::new();
    target.define_type(APP, "App.Node", Some("System.Object"));
    target.add_field("App.Node", "Next", "App.Node", false);
    target.add_field("App.Node", "Value", "System.Int32", false);

    target.define_type(APP, "App.Program", Some("System.Object"));
    target.add_field("App.Program", "count", "System.Int32", false);
    target.add_field("App.Program", "name", "System.String", false);
    target.add_field("App.Program", "Version", "System.Int32", true);
    target.add_property(
        "App.Program",
        "Title",
        "System.String",
        behavior(|heap, args| {
            let name = heap
                .field(&args[0], "name")
                .and_then(|n| heap.read_string(&n))
                .unwrap_or_default();
            Ok(Some(heap.string(&format!("Program {}", name))))
        }),
    );
    target.add_method(
        "App.Program",
        "Add",
        &["System.Int32", "System.Int32"],
        false,
        behavior(|heap, args| {
            match (heap.read_primitive(&args[1]), heap.read_primitive(&args[2])) {
                (Some(Primitive::I32(a)), Some(Primitive::I32(b))) => {
                    Ok(Some(heap.primitive(Primitive::I32(a + b))))
                }
                _ => Err(heap.object("System.InvalidOperationException", vec![])),
            }
        }),
    );
    target.add_method(
        "App.Program",
        "Fail",
        &[],
        false,
        behavior(|heap, _| Err(heap.object("System.InvalidOperationException", vec![]))),
    );
    let run = target.add_method("App.Program", "Run", &[], false, None);

    let (this, version, x, arr, node) = target.heap(|heap| {
        let count = heap.primitive(Primitive::I32(5));
        let name = heap.string("mdbg");
        let this = heap.object("App.Program", vec![("count", count), ("name", name)]);
        let version = heap.primitive(Primitive::I32(3));
        let x = heap.primitive(Primitive::I32(7));
        let elements = [10, 20, 30]
            .into_iter()
            .map(|v| heap.primitive(Primitive::I32(v)))
            .collect();
        let arr = heap.array("System.Int32[]", elements);
        let node = heap.null("App.Node");
        (this, version, x, arr, node)
    });
    target.set_static("App.Program", "Version", version);

    let mut symbols = method_symbols(
        run.token,
        "/src/App/Program.cs",
        &[(0, 20), (8, 21), (16, 22)],
    );
    symbols.locals = ["x", "arr", "node"]
        .iter()
        .enumerate()
        .map(|(slot, name)| LocalName {
            slot: slot as u32,
            name: name.to_string(),
            start_offset: 0,
            end_offset: 26,
        })
        .collect();
    symbols.imported_namespaces = vec!["System".to_string()];
    target.add_module_symbols(
        APP,
        ModuleSymbols {
            methods: vec![symbols],
            entry_point: Some(run.token),
        },
    );

    target.set_frames(
        1,
        vec![FakeFrame {
            method: run,
            offset: 8,
            this: Some(this),
            args: Vec::new(),
            locals: [x, arr, node]
                .into_iter()
                .enumerate()
                .map(|(slot, value)| LocalValue {
                    slot: slot as u32,
                    value,
                })
                .collect(),
        }],
    );
    target
}

const ASYNC_TYPE: &str = "App.Program+<RunAsync>d__0";
const BUILDER_TYPE: &str = "System.Runtime.CompilerServices.AsyncTaskMethodBuilder";

/// `RunAsync` with one await: yield at 0x0c, resume at 0x1e, user code ends
/// at 0x28. Thread 1 sits in `MoveNext` at 0x0a on the first of three state
/// machines; the first and third share one task.
pub fn async_program_fixture() -> (FakeTarget, MethodRef, Vec<RemoteValue>) {
    let target = FakeTarget::new();
    target.define_type(APP, ASYNC_TYPE, Some("System.Object"));
    target.add_field(ASYNC_TYPE, BUILDER_FIELD, BUILDER_TYPE, false);
    target.define_type(APP, BUILDER_TYPE, Some("System.ValueType"));
    target.add_field(BUILDER_TYPE, "task", "System.Object", false);
    target.add_property(
        BUILDER_TYPE,
        IDENTITY_PROPERTY,
        "System.Object",
        behavior(|heap, args| Ok(heap.field(&args[0], "task"))),
    );
    let method = target.add_method(ASYNC_TYPE, "MoveNext", &[], false, None);

    let mut symbols = method_symbols(
        method.token,
        "Program.cs",
        &[(0, 10), (0x0a, 11), (0x1e, 12), (0x28, 13)],
    );
    symbols.async_info = Some(AsyncSteppingInfo {
        awaits: vec![AwaitBlock {
            yield_offset: 0x0c,
            resume_offset: 0x1e,
        }],
        last_user_code_offset: 0x28,
    });
    target.add_module_symbols(
        APP,
        ModuleSymbols {
            methods: vec![symbols],
            entry_point: None,
        },
    );

    let machines: Vec<RemoteValue> = target.heap(|heap| {
        let shared = heap.object("System.Threading.Tasks.Task", vec![]);
        let other = heap.object("System.Threading.Tasks.Task", vec![]);
        [shared.clone(), other, shared]
            .into_iter()
            .map(|task| {
                let builder = heap.object(BUILDER_TYPE, vec![("task", task)]);
                heap.object(ASYNC_TYPE, vec![(BUILDER_FIELD, builder)])
            })
            .collect()
    });
    target.set_frames(
        1,
        vec![FakeFrame {
            this: Some(machines[0].clone()),
            ..FakeFrame::at(method, 0x0a)
        }],
    );
    (target, method, machines)
}

/// Evaluation wired the way a session wires it: a router task between the
/// target's events and the eval waiters.
pub struct EvalHarness {
    pub target: Arc<FakeTarget>,
    pub caller: RemoteCaller,
    pub symbols: SymbolTable,
    pub modules: Vec<ModuleId>,
    _forwarded: mpsc::UnboundedReceiver<NativeEvent>,
    _router: JoinHandle<()>,
}

impl EvalHarness {
    pub fn new(target: FakeTarget) -> Self {
        let target = Arc::new(target);
        let native: Arc<dyn NativeDebugger> = target.clone();
        let waiters = Arc::new(EvalWaiters::new());
        let (forward_tx, forwarded) = mpsc::unbounded_channel();
        let router = tokio::spawn(route_events(
            native.clone(),
            waiters.clone(),
            target.take_events(),
            forward_tx,
        ));
        Self {
            caller: RemoteCaller::new(native, waiters, None),
            symbols: target.symbol_table(),
            modules: vec![APP, CORELIB],
            target,
            _forwarded: forwarded,
            _router: router,
        }
    }

    pub fn context(&self) -> EvalContext<'_> {
        EvalContext {
            caller: &self.caller,
            symbols: &self.symbols,
            modules: &self.modules,
            thread: 1,
            depth: 0,
        }
    }

    pub async fn eval(&self, text: &str) -> EvalResult<Evaluated> {
        evaluate(self.context(), text).await
    }
}
