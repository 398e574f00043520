// Debug session facade
//
// The single entry point for a front end. Requests run on the caller's task;
// native notifications run on the dispatcher task. Both share one
// `SessionState`, whose parts are locked separately and never across a
// resume of the target.

use crate::breakpoints::{BreakpointInfo, BreakpointRegistry, BreakpointRequest};
use crate::config::SessionConfig;
use crate::dispatcher::{self, SessionEvent, StopReason};
use crate::error::{EngineError, EngineResult, EvalError, EvalResult};
use crate::eval::format::{display_type_name, format_value, value_type_name};
use crate::eval::{self, EvalContext, EvalValue, Evaluated};
use crate::handles::{FrameHandle, HandleTable};
use crate::native::{LaunchRequest, ModuleInfo, NativeDebugger, NativeEvent};
use crate::remote_call::{route_events, EvalWaiters, RemoteCaller};
use crate::stepper::{StepContext, StepController, StepKind};
use crate::symbols::{SourceLocation, SymbolAdapter, SymbolTable};
use crate::types::{ModuleId, NativeBreakpointId, ThreadId};
use crate::variables::{self, Scope, Variable, VariablesContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum RunState {
    #[default]
    NotStarted,
    Running,
    Stopped {
        thread: ThreadId,
    },
    Exited,
}

#[derive(Debug, Default)]
pub(crate) struct ProcessState {
    pub pid: Option<u32>,
    pub status: RunState,
    pub modules: Vec<ModuleInfo>,
    pub threads: BTreeSet<ThreadId>,
    pub configured: bool,
    /// Process creation is waiting for `configuration_done`.
    pub held_at_create: bool,
    pub entry_bp: Option<NativeBreakpointId>,
    pub entry_reached: bool,
}

pub(crate) struct SessionState {
    pub native: Arc<dyn NativeDebugger>,
    pub caller: RemoteCaller,
    pub symbols: SymbolTable,
    pub config: SessionConfig,
    pub breakpoints: Mutex<BreakpointRegistry>,
    pub handles: Mutex<HandleTable>,
    pub stepper: Mutex<StepController>,
    pub process: Mutex<ProcessState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionState {
    pub fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Front end gone, event dropped");
        }
    }

    pub fn step_context(&self) -> StepContext<'_> {
        StepContext {
            caller: &self.caller,
            symbols: &self.symbols,
            just_my_code: self.config.just_my_code,
        }
    }

    pub async fn module_ids(&self) -> Vec<ModuleId> {
        self.process.lock().await.modules.iter().map(|m| m.id).collect()
    }

    pub async fn evaluate_at(
        &self,
        thread: ThreadId,
        depth: u32,
        text: &str,
    ) -> EvalResult<Evaluated> {
        let modules = self.module_ids().await;
        let ctx = EvalContext {
            caller: &self.caller,
            symbols: &self.symbols,
            modules: &modules,
            thread,
            depth,
        };
        eval::evaluate(ctx, text).await
    }

    /// Source position of the innermost frame of `thread`.
    pub async fn top_location(&self, thread: ThreadId) -> Option<SourceLocation> {
        let frames = self.native.frames(thread).await.ok()?;
        let frame = frames.first()?;
        self.symbols.source_location(frame.method?, frame.offset)
    }

    /// The innermost frame of `thread` runs user code with symbols.
    pub async fn in_user_code(&self, thread: ThreadId) -> EngineResult<bool> {
        let frames = self.native.frames(thread).await?;
        let Some(method) = frames.first().and_then(|f| f.method) else {
            return Ok(false);
        };
        if !self.symbols.method_has_symbols(method) {
            return Ok(false);
        }
        if self.config.just_my_code {
            return Ok(!self.native.method_desc(method).await?.non_user_code);
        }
        Ok(true)
    }

    fn variables_context(&self) -> VariablesContext<'_> {
        VariablesContext {
            caller: &self.caller,
            symbols: &self.symbols,
            config: &self.config,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrameInfo {
    pub id: i64,
    pub name: String,
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub end_line: Option<u32>,
    pub end_column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub variables_reference: i64,
    /// The evaluated code threw; `result` describes the exception.
    pub is_exception: bool,
}

/// A debug session bound to one native debugger connection.
pub struct Session {
    state: Arc<SessionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Wire the router and dispatcher tasks to `native_events` and return
    /// the session with its stream of front-end events.
    pub fn start(
        native: Arc<dyn NativeDebugger>,
        native_events: mpsc::UnboundedReceiver<NativeEvent>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();
        let waiters = Arc::new(EvalWaiters::new());

        let state = Arc::new(SessionState {
            caller: RemoteCaller::new(native.clone(), waiters.clone(), config.eval_timeout()),
            native: native.clone(),
            symbols: SymbolTable::new(),
            config,
            breakpoints: Mutex::new(BreakpointRegistry::new()),
            handles: Mutex::new(HandleTable::new()),
            stepper: Mutex::new(StepController::new()),
            process: Mutex::new(ProcessState::default()),
            events: events_tx,
        });

        let router = tokio::spawn(route_events(native, waiters, native_events, forward_tx));
        let dispatcher = tokio::spawn(dispatcher::run(state.clone(), forward_rx));
        info!("Debug session started");

        (
            Self {
                state,
                tasks: vec![router, dispatcher],
            },
            events_rx,
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.state.config
    }

    pub async fn process_id(&self) -> Option<u32> {
        self.state.process.lock().await.pid
    }

    pub async fn launch(&self, request: &LaunchRequest) -> EngineResult<u32> {
        info!("Launching {}", request.program);
        let pid = self.state.native.launch(request).await?;
        let mut process = self.state.process.lock().await;
        process.pid = Some(pid);
        process.status = RunState::Running;
        Ok(pid)
    }

    pub async fn attach(&self, pid: u32) -> EngineResult<()> {
        info!("Attaching to process {}", pid);
        self.state.native.attach(pid).await?;
        let mut process = self.state.process.lock().await;
        process.pid = Some(pid);
        process.status = RunState::Running;
        Ok(())
    }

    /// The front end has sent its initial breakpoints; release a process
    /// held at creation.
    pub async fn configuration_done(&self) -> EngineResult<()> {
        let release = {
            let mut process = self.state.process.lock().await;
            process.configured = true;
            std::mem::take(&mut process.held_at_create)
        };
        if release {
            debug!("Releasing process held at creation");
            self.state.native.continue_process().await?;
        }
        Ok(())
    }

    pub async fn set_breakpoints(
        &self,
        file: &str,
        requests: &[BreakpointRequest],
    ) -> EngineResult<Vec<BreakpointInfo>> {
        let modules = self.state.module_ids().await;
        let infos = self
            .state
            .breakpoints
            .lock()
            .await
            .set_breakpoints(&*self.state.native, &self.state.symbols, &modules, file, requests)
            .await;
        Ok(infos)
    }

    async fn require_process(&self) -> EngineResult<()> {
        match self.state.process.lock().await.status {
            RunState::NotStarted | RunState::Exited => Err(EngineError::NoProcess),
            _ => Ok(()),
        }
    }

    /// Everything handed out for the current stop becomes invalid.
    async fn resume(&self) -> EngineResult<()> {
        self.state.handles.lock().await.clear();
        self.state.process.lock().await.status = RunState::Running;
        self.state.native.continue_process().await?;
        self.state.emit(SessionEvent::Continued);
        Ok(())
    }

    pub async fn continue_(&self) -> EngineResult<()> {
        self.require_process().await?;
        self.resume().await
    }

    pub async fn pause(&self) -> EngineResult<()> {
        self.require_process().await?;
        self.state.native.stop_process().await?;
        self.state.stepper.lock().await.cancel(&*self.state.native).await;

        let threads = self.state.native.threads().await?;
        let thread = threads.first().map(|t| t.id).unwrap_or_default();
        self.state.process.lock().await.status = RunState::Stopped { thread };
        let location = self.state.top_location(thread).await;
        self.state.emit(SessionEvent::Stopped {
            thread,
            reason: StopReason::Pause,
            file: location.as_ref().map(|l| l.file.clone()),
            line: location.as_ref().map(|l| l.line),
            description: None,
            breakpoint: None,
        });
        Ok(())
    }

    async fn step(&self, thread: ThreadId, kind: StepKind) -> EngineResult<()> {
        self.require_process().await?;
        self.state
            .stepper
            .lock()
            .await
            .start(self.state.step_context(), thread, kind)
            .await?;
        self.resume().await
    }

    pub async fn step_into(&self, thread: ThreadId) -> EngineResult<()> {
        self.step(thread, StepKind::In).await
    }

    pub async fn step_over(&self, thread: ThreadId) -> EngineResult<()> {
        self.step(thread, StepKind::Over).await
    }

    pub async fn step_out(&self, thread: ThreadId) -> EngineResult<()> {
        self.step(thread, StepKind::Out).await
    }

    pub async fn threads(&self) -> EngineResult<Vec<ThreadInfo>> {
        Ok(self
            .state
            .native
            .threads()
            .await?
            .into_iter()
            .map(|t| ThreadInfo {
                id: t.id,
                name: t.name.unwrap_or_else(|| format!("Thread #{}", t.id)),
            })
            .collect())
    }

    /// Frames `start..start + levels` of `thread`; `levels == 0` means all.
    pub async fn stack_trace(
        &self,
        thread: ThreadId,
        start: usize,
        levels: usize,
    ) -> EngineResult<Vec<StackFrameInfo>> {
        let native = &self.state.native;
        let frames = native.frames(thread).await?;
        let end = if levels == 0 {
            frames.len()
        } else {
            frames.len().min(start.saturating_add(levels))
        };

        let mut described = Vec::new();
        for (depth, frame) in frames.iter().enumerate().take(end).skip(start) {
            let (name, location) = match frame.method {
                Some(method) => {
                    let desc = native.method_desc(method).await?;
                    let declaring = display_type_name(&desc.declaring_type.name);
                    let name = format!("{}.{}()", declaring, desc.name);
                    (name, self.state.symbols.source_location(method, frame.offset))
                }
                None => ("[Native Frames]".to_string(), None),
            };
            described.push((depth as u32, name, location));
        }

        let mut handles = self.state.handles.lock().await;
        Ok(described
            .into_iter()
            .map(|(depth, name, location)| StackFrameInfo {
                id: handles.alloc_frame(thread, depth),
                name,
                file: location.as_ref().map(|l| l.file.clone()),
                line: location.as_ref().map_or(0, |l| l.line),
                column: location.as_ref().map_or(0, |l| l.column),
                end_line: location.as_ref().map(|l| l.end_line),
                end_column: location.as_ref().map(|l| l.end_column),
            })
            .collect())
    }

    async fn frame(&self, frame_id: i64) -> EngineResult<FrameHandle> {
        self.state
            .handles
            .lock()
            .await
            .frame(frame_id)
            .ok_or(EngineError::InvalidFrame(frame_id))
    }

    pub async fn scopes(&self, frame_id: i64) -> EngineResult<Vec<Scope>> {
        let frame = self.frame(frame_id).await?;
        Ok(variables::scopes(&mut *self.state.handles.lock().await, frame))
    }

    pub async fn variables(
        &self,
        reference: i64,
        start: usize,
        count: usize,
    ) -> EngineResult<Vec<Variable>> {
        let resolved = self
            .state
            .handles
            .lock()
            .await
            .reference(reference)
            .cloned()
            .ok_or(EngineError::InvalidReference(reference))?;
        let context = self.state.variables_context();
        let pending = variables::variables(context, &resolved, start, count).await?;

        let mut handles = self.state.handles.lock().await;
        Ok(pending.into_iter().map(|p| p.register(&mut handles)).collect())
    }

    /// Evaluate `expression` in the frame `frame_id`, or in the innermost
    /// frame of the stopped thread.
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> EngineResult<EvaluateResult> {
        let frame = match frame_id {
            Some(id) => self.frame(id).await?,
            None => match self.state.process.lock().await.status {
                RunState::Stopped { thread } => FrameHandle { thread, depth: 0 },
                _ => return Err(EngineError::NotStopped),
            },
        };
        debug!("Evaluating '{}' on thread {} depth {}", expression, frame.thread, frame.depth);

        let native = &*self.state.native;
        let evaluated = self
            .state
            .evaluate_at(frame.thread, frame.depth, expression)
            .await;
        let (value, is_exception) = match evaluated {
            Ok(evaluated) => (evaluated.value, false),
            Err(EvalError::RemoteFault(exception)) => (EvalValue::Remote(exception), true),
            Err(e) => return Err(e.into()),
        };

        let (result, type_name, expand) = match value {
            EvalValue::Remote(remote) => {
                let pending = variables::describe_value(
                    native,
                    expression,
                    remote,
                    frame.thread,
                    frame.depth,
                )
                .await?;
                let variable = pending.register(&mut *self.state.handles.lock().await);
                (variable.value, variable.type_name, variable.variables_reference)
            }
            other => (format_value(native, &other).await?, value_type_name(&other), 0),
        };
        Ok(EvaluateResult {
            result,
            type_name,
            variables_reference: expand,
            is_exception,
        })
    }

    pub async fn terminate(&self) -> EngineResult<()> {
        self.require_process().await?;
        info!("Terminating debuggee");
        self.state.stepper.lock().await.cancel(&*self.state.native).await;
        self.state.native.terminate().await?;
        Ok(())
    }

    /// End the session, killing the debuggee or leaving it running.
    pub async fn disconnect(&self, terminate_debuggee: bool) -> EngineResult<()> {
        let live = self.require_process().await.is_ok();
        if live {
            self.state.stepper.lock().await.cancel(&*self.state.native).await;
            self.state.handles.lock().await.clear();
            let result = if terminate_debuggee {
                self.state.native.terminate().await
            } else {
                self.state.native.detach().await
            };
            if let Err(e) = result {
                warn!("Disconnect failed: {}", e);
            }
        }
        info!("Debug session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
