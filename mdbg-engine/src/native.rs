// Native debugging layer contract
//
// Everything the engine needs from the runtime's debugging interface:
// process control, breakpoints, steppers, inspection of stopped threads,
// metadata, and the evaluation channel. Notifications flow back as
// `NativeEvent`s on a channel owned by the session.

use crate::error::NativeResult;
use crate::symbols::ModuleSymbols;
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Notifications produced by the target process.
#[derive(Debug, Clone)]
pub enum NativeEvent {
    ProcessCreated {
        pid: u32,
    },
    ProcessExited {
        exit_code: i32,
    },
    DomainCreated,
    ThreadCreated {
        thread: ThreadId,
    },
    ThreadExited {
        thread: ThreadId,
    },
    ModuleLoaded {
        module: ModuleInfo,
    },
    ModuleUnloaded {
        module: ModuleId,
    },
    BreakpointHit {
        thread: ThreadId,
        breakpoint: NativeBreakpointId,
    },
    StepComplete {
        thread: ThreadId,
        reason: StepCompleteReason,
    },
    /// User break (`Debugger.Break()`) or an async stop request landing.
    Break {
        thread: ThreadId,
    },
    Exception {
        thread: ThreadId,
        stage: ExceptionStage,
        exception: RemoteValue,
    },
    EvalComplete {
        thread: ThreadId,
        eval: EvalId,
        result: Option<RemoteValue>,
    },
    EvalException {
        thread: ThreadId,
        eval: EvalId,
        exception: RemoteValue,
    },
}

impl NativeEvent {
    /// Thread the notification was raised on, if any.
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Self::ThreadCreated { thread }
            | Self::ThreadExited { thread }
            | Self::BreakpointHit { thread, .. }
            | Self::StepComplete { thread, .. }
            | Self::Break { thread }
            | Self::Exception { thread, .. }
            | Self::EvalComplete { thread, .. }
            | Self::EvalException { thread, .. } => Some(*thread),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepCompleteReason {
    Normal,
    Return,
    /// Stepped into a call.
    Call,
    Exception,
    Intercept,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStage {
    FirstChance,
    UserFirstChance,
    CatchHandlerFound,
    Unhandled,
}

/// What a stepper should do when the target resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Run until the instruction pointer leaves `[start, end)`.
    Range { step_in: bool, start: u32, end: u32 },
    /// Single instruction.
    Instruction { step_in: bool },
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeThread {
    pub id: ThreadId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Managed,
    Native,
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeFrame {
    pub kind: FrameKind,
    pub method: Option<MethodRef>,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedValue {
    pub name: String,
    pub value: RemoteValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalValue {
    pub slot: u32,
    pub value: RemoteValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDesc {
    pub method: MethodRef,
    pub name: String,
    pub declaring_type: TypeRef,
    pub is_static: bool,
    pub parameters: Vec<ParamInfo>,
    pub generic_arity: u32,
    pub return_type: String,
    /// Marked as not user code (`DebuggerHidden`, `DebuggerStepThrough`,
    /// `DebuggerNonUserCode`).
    pub non_user_code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub token: FieldToken,
    pub name: String,
    pub type_name: String,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub name: String,
    pub type_name: String,
    pub getter: Option<MethodRef>,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub ty: TypeRef,
    pub base: Option<TypeRef>,
    pub is_value_type: bool,
    pub fields: Vec<FieldInfo>,
    pub properties: Vec<PropertyInfo>,
    pub methods: Vec<MethodDesc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// The runtime's debugging interface as seen by the engine.
///
/// Inspection calls are only meaningful while the target is stopped. Eval
/// requests (`begin_call`, `begin_new_string`) only queue work: the target
/// runs it after `continue_process`, reports `EvalComplete`/`EvalException`
/// carrying the returned `EvalId`, and is stopped again when that
/// notification is raised.
#[async_trait]
pub trait NativeDebugger: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> NativeResult<u32>;
    async fn attach(&self, pid: u32) -> NativeResult<()>;
    async fn detach(&self) -> NativeResult<()>;
    async fn terminate(&self) -> NativeResult<()>;

    async fn continue_process(&self) -> NativeResult<()>;
    async fn stop_process(&self) -> NativeResult<()>;

    /// Create and activate a breakpoint at `offset` inside `method`.
    async fn create_breakpoint(
        &self,
        method: MethodRef,
        offset: u32,
    ) -> NativeResult<NativeBreakpointId>;
    async fn set_breakpoint_active(
        &self,
        breakpoint: NativeBreakpointId,
        active: bool,
    ) -> NativeResult<()>;

    async fn step(&self, thread: ThreadId, mode: StepMode) -> NativeResult<()>;
    async fn cancel_step(&self, thread: ThreadId) -> NativeResult<()>;

    async fn threads(&self) -> NativeResult<Vec<NativeThread>>;
    /// Frames of a stopped thread, innermost first.
    async fn frames(&self, thread: ThreadId) -> NativeResult<Vec<NativeFrame>>;
    /// Arguments of the frame at `depth`, `this` first for instance methods.
    async fn arguments(&self, thread: ThreadId, depth: u32) -> NativeResult<Vec<NamedValue>>;
    async fn locals(&self, thread: ThreadId, depth: u32) -> NativeResult<Vec<LocalValue>>;
    async fn method_desc(&self, method: MethodRef) -> NativeResult<MethodDesc>;
    /// Symbol data of a loaded module; `None` when it ships without any.
    async fn module_symbols(&self, module: ModuleId) -> NativeResult<Option<ModuleSymbols>>;

    async fn read_primitive(&self, value: &RemoteValue) -> NativeResult<Primitive>;
    async fn read_string(&self, value: &RemoteValue) -> NativeResult<String>;
    async fn unbox(&self, value: &RemoteValue) -> NativeResult<RemoteValue>;
    /// Address of the referenced object, used for identity comparison.
    async fn object_address(&self, value: &RemoteValue) -> NativeResult<u64>;
    async fn type_of(&self, value: &RemoteValue) -> NativeResult<TypeRef>;
    async fn type_info(&self, ty: &TypeRef) -> NativeResult<TypeInfo>;
    async fn find_type(&self, module: ModuleId, name: &str) -> NativeResult<Option<TypeRef>>;
    async fn array_dimensions(&self, array: &RemoteValue) -> NativeResult<Vec<u32>>;
    async fn array_element(&self, array: &RemoteValue, indices: &[u32])
        -> NativeResult<RemoteValue>;
    async fn field_value(&self, object: &RemoteValue, field: &FieldInfo)
        -> NativeResult<RemoteValue>;
    async fn static_field_value(
        &self,
        thread: ThreadId,
        ty: &TypeRef,
        field: &FieldInfo,
    ) -> NativeResult<RemoteValue>;

    async fn create_primitive(&self, thread: ThreadId, value: Primitive)
        -> NativeResult<RemoteValue>;
    async fn create_null(&self, thread: ThreadId) -> NativeResult<RemoteValue>;

    async fn begin_call(
        &self,
        thread: ThreadId,
        method: MethodRef,
        type_args: &[TypeRef],
        args: &[RemoteValue],
    ) -> NativeResult<EvalId>;
    async fn begin_new_string(&self, thread: ThreadId, text: &str) -> NativeResult<EvalId>;
    async fn abort_eval(&self, eval: EvalId) -> NativeResult<()>;

    /// Promote a value to a handle that survives resumes.
    async fn create_strong_handle(&self, value: &RemoteValue) -> NativeResult<RemoteValue>;
    /// Release a strong handle. Fire-and-forget, called from `Drop`.
    fn release_handle(&self, handle: &RemoteValue);
}

/// A strong handle released exactly once, when dropped.
pub struct StrongHandle {
    value: RemoteValue,
    native: Arc<dyn NativeDebugger>,
}

impl StrongHandle {
    pub async fn promote(
        native: Arc<dyn NativeDebugger>,
        value: &RemoteValue,
    ) -> NativeResult<Self> {
        let value = native.create_strong_handle(value).await?;
        Ok(Self { value, native })
    }

    pub fn value(&self) -> &RemoteValue {
        &self.value
    }
}

impl std::fmt::Debug for StrongHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrongHandle")
            .field("value", &self.value)
            .finish()
    }
}

impl Drop for StrongHandle {
    fn drop(&mut self) {
        debug!("Releasing strong handle {:?}", self.value.id);
        self.native.release_handle(&self.value);
    }
}
