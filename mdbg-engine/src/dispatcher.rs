// Event dispatcher
//
// Consumes native notifications one at a time, in arrival order. Each one
// either resumes the target or stops the session and tells the front end
// why. Handling errors are logged and the target is resumed so a single
// failure never leaves the process frozen.

use crate::config::ExceptionBreakMode;
use crate::error::EngineResult;
use crate::eval::{EvalValue, Evaluated};
use crate::native::{ExceptionStage, NativeEvent};
use crate::session::{RunState, SessionState};
use crate::stepper::StepOutcome;
use crate::symbols::SymbolAdapter;
use crate::types::{NativeBreakpointId, Primitive, RemoteValue, ThreadId, ValueKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Breakpoint,
    Step,
    Exception,
    Pause,
    Entry,
}

/// Notifications for the front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Stopped {
        thread: ThreadId,
        reason: StopReason,
        file: Option<String>,
        line: Option<u32>,
        description: Option<String>,
        /// Front-end id of the user breakpoint that caused the stop.
        breakpoint: Option<u32>,
    },
    Continued,
    #[serde(rename_all = "camelCase")]
    Exited { exit_code: i32 },
    Terminated,
    ThreadStarted { thread: ThreadId },
    ThreadExited { thread: ThreadId },
    ModuleLoaded { name: String, path: String },
    BreakpointChanged {
        breakpoint: crate::breakpoints::BreakpointInfo,
    },
}

#[derive(Debug, PartialEq)]
pub(crate) enum Action {
    Resume,
    Stop {
        thread: ThreadId,
        reason: StopReason,
        description: Option<String>,
        breakpoint: Option<u32>,
    },
    /// Leave the target as it is.
    Hold,
}

impl Action {
    fn stop(thread: ThreadId, reason: StopReason) -> Self {
        Self::Stop {
            thread,
            reason,
            description: None,
            breakpoint: None,
        }
    }
}

pub(crate) async fn run(
    state: Arc<SessionState>,
    mut events: mpsc::UnboundedReceiver<NativeEvent>,
) {
    info!("Dispatcher started");
    while let Some(event) = events.recv().await {
        debug!("Dispatching {:?}", event);
        let action = match handle(&state, event).await {
            Ok(action) => action,
            Err(e) => {
                error!("Failed to handle event: {}", e);
                Action::Resume
            }
        };
        apply(&state, action).await;
    }
    info!("Dispatcher stopped");
}

async fn apply(state: &SessionState, action: Action) {
    match action {
        Action::Resume => {
            if let Err(e) = state.native.continue_process().await {
                error!("Failed to resume target: {}", e);
            }
        }
        Action::Stop {
            thread,
            reason,
            description,
            breakpoint,
        } => {
            state.process.lock().await.status = RunState::Stopped { thread };
            let (file, line) = match state.top_location(thread).await {
                Some(location) => (Some(location.file), Some(location.line)),
                None => (None, None),
            };
            info!("Stopped on thread {} ({:?}) at {:?}:{:?}", thread, reason, file, line);
            state.emit(SessionEvent::Stopped {
                thread,
                reason,
                file,
                line,
                description,
                breakpoint,
            });
        }
        Action::Hold => {}
    }
}

pub(crate) async fn handle(state: &SessionState, event: NativeEvent) -> EngineResult<Action> {
    match event {
        NativeEvent::ProcessCreated { pid } => {
            let mut process = state.process.lock().await;
            process.pid = Some(pid);
            process.status = RunState::Running;
            if process.configured {
                Ok(Action::Resume)
            } else {
                debug!("Holding process {} until configuration is done", pid);
                process.held_at_create = true;
                Ok(Action::Hold)
            }
        }
        NativeEvent::ProcessExited { exit_code } => {
            info!("Process exited with code {}", exit_code);
            state.process.lock().await.status = RunState::Exited;
            state.handles.lock().await.clear();
            state.stepper.lock().await.cancel(&*state.native).await;
            state.emit(SessionEvent::Exited { exit_code });
            state.emit(SessionEvent::Terminated);
            Ok(Action::Hold)
        }
        NativeEvent::DomainCreated => Ok(Action::Resume),
        NativeEvent::ThreadCreated { thread } => {
            state.process.lock().await.threads.insert(thread);
            state.emit(SessionEvent::ThreadStarted { thread });
            Ok(Action::Resume)
        }
        NativeEvent::ThreadExited { thread } => {
            state.process.lock().await.threads.remove(&thread);
            state.emit(SessionEvent::ThreadExited { thread });
            Ok(Action::Resume)
        }
        NativeEvent::ModuleLoaded { module } => {
            debug!("Module loaded: {}", module.path);
            if let Some(symbols) = state.native.module_symbols(module.id).await? {
                state.symbols.add_module(module.id, symbols);
            }
            state.process.lock().await.modules.push(module.clone());

            let changed = state
                .breakpoints
                .lock()
                .await
                .on_module_loaded(&*state.native, &state.symbols, module.id)
                .await;

            if state.config.stop_at_entry {
                let mut process = state.process.lock().await;
                if process.entry_bp.is_none() && !process.entry_reached {
                    if let Some(entry) = state.symbols.entry_point(module.id) {
                        info!("Entry point {:?} found in {}", entry, module.name);
                        process.entry_bp = Some(state.native.create_breakpoint(entry, 0).await?);
                    }
                }
            }

            state.emit(SessionEvent::ModuleLoaded {
                name: module.name,
                path: module.path,
            });
            for breakpoint in changed {
                state.emit(SessionEvent::BreakpointChanged { breakpoint });
            }
            Ok(Action::Resume)
        }
        NativeEvent::ModuleUnloaded { module } => {
            state.process.lock().await.modules.retain(|m| m.id != module);
            state.symbols.remove_module(module);
            let changed = state.breakpoints.lock().await.on_module_unloaded(module);
            for breakpoint in changed {
                state.emit(SessionEvent::BreakpointChanged { breakpoint });
            }
            Ok(Action::Resume)
        }
        NativeEvent::BreakpointHit { thread, breakpoint } => {
            on_breakpoint(state, thread, breakpoint).await
        }
        NativeEvent::StepComplete { thread, reason } => {
            let outcome = state
                .stepper
                .lock()
                .await
                .on_step_complete(state.step_context(), thread, reason)
                .await?;
            Ok(match outcome {
                StepOutcome::Stop { thread } => Action::stop(thread, StopReason::Step),
                StepOutcome::Resume => Action::Resume,
            })
        }
        NativeEvent::Break { thread } => {
            state.stepper.lock().await.cancel(&*state.native).await;
            Ok(Action::Stop {
                thread,
                reason: StopReason::Pause,
                description: Some("Paused on Debugger.Break()".to_string()),
                breakpoint: None,
            })
        }
        NativeEvent::Exception {
            thread,
            stage,
            exception,
        } => on_exception(state, thread, stage, exception).await,
        NativeEvent::EvalComplete { eval, .. } | NativeEvent::EvalException { eval, .. } => {
            warn!("Completion of {} reached the dispatcher", eval);
            Ok(Action::Hold)
        }
    }
}

async fn on_breakpoint(
    state: &SessionState,
    thread: ThreadId,
    breakpoint: NativeBreakpointId,
) -> EngineResult<Action> {
    {
        let mut process = state.process.lock().await;
        if process.entry_bp == Some(breakpoint) {
            process.entry_bp = None;
            process.entry_reached = true;
            drop(process);
            state.native.set_breakpoint_active(breakpoint, false).await?;
            return Ok(Action::stop(thread, StopReason::Entry));
        }
    }

    let outcome = state
        .stepper
        .lock()
        .await
        .on_breakpoint(state.step_context(), thread, breakpoint)
        .await?;
    match outcome {
        Some(StepOutcome::Stop { thread }) => return Ok(Action::stop(thread, StopReason::Step)),
        Some(StepOutcome::Resume) => return Ok(Action::Resume),
        None => {}
    }

    let (id, condition) = match state.breakpoints.lock().await.by_native(breakpoint) {
        Some(bp) => (bp.id, bp.condition.clone()),
        None => {
            debug!("Hit of unknown breakpoint {:?} ignored", breakpoint);
            return Ok(Action::Resume);
        }
    };

    if let Some(condition) = condition {
        let met = match state.evaluate_at(thread, 0, &condition).await {
            Ok(result) => is_true(state, &result).await,
            Err(e) => {
                warn!("Condition '{}' of breakpoint {} failed: {}", condition, id, e);
                false
            }
        };
        if !met {
            return Ok(Action::Resume);
        }
    }

    if !state.breakpoints.lock().await.record_hit(id) {
        debug!("Breakpoint {} hit, hit condition not met", id);
        return Ok(Action::Resume);
    }

    // A user breakpoint stop ends any step in flight
    state.stepper.lock().await.cancel(&*state.native).await;
    Ok(Action::Stop {
        thread,
        reason: StopReason::Breakpoint,
        description: None,
        breakpoint: Some(id),
    })
}

async fn is_true(state: &SessionState, result: &Evaluated) -> bool {
    match &result.value {
        EvalValue::Primitive(Primitive::Bool(b)) => *b,
        EvalValue::Remote(value) if matches!(value.kind, ValueKind::Primitive(_)) => matches!(
            state.native.read_primitive(value).await,
            Ok(Primitive::Bool(true))
        ),
        _ => false,
    }
}

async fn on_exception(
    state: &SessionState,
    thread: ThreadId,
    stage: ExceptionStage,
    exception: RemoteValue,
) -> EngineResult<Action> {
    let unhandled = stage == ExceptionStage::Unhandled;
    let stop = match state.config.exception_breaks {
        ExceptionBreakMode::Never => false,
        ExceptionBreakMode::Unhandled => unhandled,
        ExceptionBreakMode::Always => {
            unhandled
                || (matches!(stage, ExceptionStage::FirstChance | ExceptionStage::UserFirstChance)
                    && state.in_user_code(thread).await?)
        }
    };
    if !stop {
        debug!("Exception {} ({:?}) passed through", exception.type_name, stage);
        return Ok(Action::Resume);
    }

    state.stepper.lock().await.cancel(&*state.native).await;
    let description = if unhandled {
        format!("Unhandled exception: '{}'", exception.type_name)
    } else {
        format!("Exception thrown: '{}'", exception.type_name)
    };
    Ok(Action::Stop {
        thread,
        reason: StopReason::Exception,
        description: Some(description),
        breakpoint: None,
    })
}
