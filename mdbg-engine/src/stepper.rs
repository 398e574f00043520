// Step controller
//
// Drives one step request at a time. A plain step is a range step over the
// current sequence point; when it completes somewhere the user should not
// stop (a call prolog, non-user code, a hidden line) the step is re-issued.
//
// Stepping over or into an `await` cannot be done with range steps alone: the method
// returns at the yield point and its continuation may resume on another
// thread. The controller puts a breakpoint on the yield offset, and once it
// is hit swaps it for one on the resume offset, remembering the async
// identity object so that only the continuation of the same invocation stops.

use crate::error::{EngineError, EngineResult, EvalResult};
use crate::native::{NativeDebugger, StepCompleteReason, StepMode, StrongHandle};
use crate::remote_call::RemoteCaller;
use crate::symbols::SymbolAdapter;
use crate::types::{MethodRef, NativeBreakpointId, RemoteValue, ThreadId, ValueKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub(crate) const BUILDER_FIELD: &str = "<>t__builder";
pub(crate) const IDENTITY_PROPERTY: &str = "ObjectIdForDebugger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    In,
    Over,
    Out,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step is finished; report a stop on `thread`.
    Stop { thread: ThreadId },
    /// The step goes on; resume the target.
    Resume,
}

#[derive(Debug)]
enum StepState {
    Idle,
    RangeStepping {
        thread: ThreadId,
        kind: StepKind,
    },
    /// Range step in flight with a breakpoint on the await's yield offset.
    AtYieldPoint {
        thread: ThreadId,
        kind: StepKind,
        method: MethodRef,
        yield_bp: NativeBreakpointId,
        resume_offset: u32,
    },
    /// Waiting for the continuation to reach the resume offset.
    AtResumePoint {
        thread: ThreadId,
        kind: StepKind,
        resume_bp: NativeBreakpointId,
        identity: Option<StrongHandle>,
    },
}

/// What the controller consults while handling a request or event.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub caller: &'a RemoteCaller,
    pub symbols: &'a dyn SymbolAdapter,
    pub just_my_code: bool,
}

impl StepContext<'_> {
    fn native(&self) -> &dyn NativeDebugger {
        &**self.caller.native()
    }
}

#[derive(Debug)]
pub struct StepController {
    state: StepState,
}

impl Default for StepController {
    fn default() -> Self {
        Self::new()
    }
}

impl StepController {
    pub fn new() -> Self {
        Self {
            state: StepState::Idle,
        }
    }

    /// Thread of the step in flight.
    pub fn active_thread(&self) -> Option<ThreadId> {
        match &self.state {
            StepState::Idle => None,
            StepState::RangeStepping { thread, .. }
            | StepState::AtYieldPoint { thread, .. }
            | StepState::AtResumePoint { thread, .. } => Some(*thread),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_thread().is_some()
    }

    pub async fn start(
        &mut self,
        ctx: StepContext<'_>,
        thread: ThreadId,
        kind: StepKind,
    ) -> EngineResult<()> {
        if let Some(active) = self.active_thread() {
            return Err(EngineError::StepInProgress(active));
        }
        let native = ctx.native();

        let frames = native.frames(thread).await?;
        let top = frames.first().and_then(|f| f.method.map(|m| (m, f.offset)));
        let Some((method, offset)) = top else {
            debug!("Thread {} has no managed frame, stepping out", thread);
            native.step(thread, StepMode::Out).await?;
            self.state = StepState::RangeStepping { thread, kind: StepKind::Out };
            return Ok(());
        };

        if kind == StepKind::Out {
            native.step(thread, StepMode::Out).await?;
            self.state = StepState::RangeStepping { thread, kind };
            return Ok(());
        }

        let step_in = kind == StepKind::In;
        let range = ctx
            .symbols
            .sequence_point_range(method, offset)
            .or_else(|| ctx.symbols.method_code_size(method).map(|size| (0, size)));

        if let Some(info) = ctx.symbols.async_stepping_info(method) {
            if offset >= info.last_user_code_offset {
                debug!("Past the last user code of async {:?}, stepping out", method);
                native.step(thread, StepMode::Out).await?;
                self.state = StepState::RangeStepping { thread, kind: StepKind::Out };
                return Ok(());
            }
            let awaited = range.and_then(|(start, end)| {
                info.awaits
                    .iter()
                    .find(|a| start <= a.yield_offset && a.yield_offset < end)
                    .copied()
            });
            if let (Some(block), Some((start, end))) = (awaited, range) {
                let yield_bp = native.create_breakpoint(method, block.yield_offset).await?;
                native.step(thread, StepMode::Range { step_in, start, end }).await?;
                info!(
                    "Async step {:?} on thread {}: yield at {:#x}, resume at {:#x}",
                    kind, thread, block.yield_offset, block.resume_offset
                );
                self.state = StepState::AtYieldPoint {
                    thread,
                    kind,
                    method,
                    yield_bp,
                    resume_offset: block.resume_offset,
                };
                return Ok(());
            }
        }

        let mode = match range {
            Some((start, end)) => StepMode::Range { step_in, start, end },
            None => StepMode::Instruction { step_in },
        };
        debug!("Step {:?} on thread {}: {:?}", kind, thread, mode);
        native.step(thread, mode).await?;
        self.state = StepState::RangeStepping { thread, kind };
        Ok(())
    }

    /// A step finished on `thread`. Either re-issues it or ends it.
    pub async fn on_step_complete(
        &mut self,
        ctx: StepContext<'_>,
        thread: ThreadId,
        reason: StepCompleteReason,
    ) -> EngineResult<StepOutcome> {
        let kind = match &self.state {
            StepState::RangeStepping { thread: t, kind }
            | StepState::AtYieldPoint { thread: t, kind, .. }
                if *t == thread =>
            {
                *kind
            }
            _ => {
                debug!("Unsolicited step completion on thread {}", thread);
                return Ok(StepOutcome::Stop { thread });
            }
        };
        let native = ctx.native();

        // The range ended without reaching the await
        if let StepState::AtYieldPoint { yield_bp, .. } = &self.state {
            deactivate(native, *yield_bp).await;
            self.state = StepState::RangeStepping { thread, kind };
        }

        let frames = native.frames(thread).await?;
        let landing = frames.first().and_then(|f| f.method.map(|m| (m, f.offset)));
        let location = landing.and_then(|(m, o)| ctx.symbols.source_location(m, o));

        if let Some((method, _)) = landing {
            if reason == StepCompleteReason::Call
                && location.is_none()
                && ctx.symbols.method_has_symbols(method)
            {
                debug!("Stepped into the prolog of {:?}, stepping over to user code", method);
                self.step_again(ctx, thread, false).await?;
                self.state = StepState::RangeStepping { thread, kind };
                return Ok(StepOutcome::Resume);
            }
            if ctx.just_my_code && native.method_desc(method).await?.non_user_code {
                debug!("Landed in non-user code {:?}, stepping in again", method);
                self.step_again(ctx, thread, true).await?;
                self.state = StepState::RangeStepping { thread, kind };
                return Ok(StepOutcome::Resume);
            }
        }
        if location.is_none() {
            debug!("No source at landing point on thread {}, stepping over again", thread);
            self.step_again(ctx, thread, false).await?;
            self.state = StepState::RangeStepping { thread, kind };
            return Ok(StepOutcome::Resume);
        }

        self.finish(native).await;
        Ok(StepOutcome::Stop { thread })
    }

    /// Breakpoint hit while a step may be in flight. `None` when the
    /// breakpoint is not one of the controller's own.
    pub async fn on_breakpoint(
        &mut self,
        ctx: StepContext<'_>,
        thread: ThreadId,
        breakpoint: NativeBreakpointId,
    ) -> EngineResult<Option<StepOutcome>> {
        let native = ctx.native();
        match &self.state {
            StepState::AtYieldPoint {
                thread: origin,
                kind,
                method,
                yield_bp,
                resume_offset,
            } if *yield_bp == breakpoint => {
                if *origin != thread {
                    return Ok(Some(StepOutcome::Resume));
                }
                let (kind, method, yield_bp, resume_offset) =
                    (*kind, *method, *yield_bp, *resume_offset);
                native.cancel_step(thread).await?;
                deactivate(native, yield_bp).await;

                let identity = match fetch_identity(ctx, thread).await {
                    Ok(Some(id)) => {
                        let native = ctx.caller.native().clone();
                        match StrongHandle::promote(native, &id).await {
                            Ok(handle) => Some(handle),
                            Err(e) => {
                                warn!("Failed to pin async identity: {}", e);
                                None
                            }
                        }
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Failed to read async identity on thread {}: {}", thread, e);
                        None
                    }
                };
                let resume_bp = native.create_breakpoint(method, resume_offset).await?;
                debug!("Yield point reached on thread {}, waiting for resume", thread);
                self.state = StepState::AtResumePoint {
                    thread,
                    kind,
                    resume_bp,
                    identity,
                };
                Ok(Some(StepOutcome::Resume))
            }
            StepState::AtResumePoint {
                thread: origin,
                kind,
                resume_bp,
                identity,
            } if *resume_bp == breakpoint => {
                let kind = *kind;
                if *origin != thread {
                    if let Some(identity) = identity {
                        let expected = native.object_address(identity.value()).await?;
                        let current = match fetch_identity(ctx, thread).await {
                            Ok(Some(value)) => Some(native.object_address(&value).await?),
                            Ok(None) => None,
                            Err(e) => {
                                warn!("Failed to read async identity on thread {}: {}", thread, e);
                                None
                            }
                        };
                        if current != Some(expected) {
                            debug!("Resume point hit by another invocation on thread {}", thread);
                            return Ok(Some(StepOutcome::Resume));
                        }
                    }
                    info!("Async continuation moved from thread {} to {}", origin, thread);
                }
                self.finish(native).await;

                // The resume offset can sit on a hidden line
                let frames = native.frames(thread).await?;
                let location = frames
                    .first()
                    .and_then(|f| f.method.map(|m| (m, f.offset)))
                    .and_then(|(m, o)| ctx.symbols.source_location(m, o));
                if location.is_none() {
                    self.step_again(ctx, thread, false).await?;
                    self.state = StepState::RangeStepping { thread, kind };
                    return Ok(Some(StepOutcome::Resume));
                }
                Ok(Some(StepOutcome::Stop { thread }))
            }
            _ => Ok(None),
        }
    }

    /// Abandon the step in flight, if any.
    pub async fn cancel(&mut self, native: &dyn NativeDebugger) {
        match &self.state {
            StepState::Idle => return,
            StepState::RangeStepping { thread, .. } | StepState::AtYieldPoint { thread, .. } => {
                if let Err(e) = native.cancel_step(*thread).await {
                    warn!("Failed to cancel step on thread {}: {}", thread, e);
                }
            }
            StepState::AtResumePoint { .. } => {}
        }
        debug!("Step canceled");
        self.finish(native).await;
    }

    /// Remove temporary breakpoints and drop back to idle; the async
    /// identity handle is released with the state.
    async fn finish(&mut self, native: &dyn NativeDebugger) {
        match std::mem::replace(&mut self.state, StepState::Idle) {
            StepState::AtYieldPoint { yield_bp, .. } => deactivate(native, yield_bp).await,
            StepState::AtResumePoint { resume_bp, .. } => deactivate(native, resume_bp).await,
            _ => {}
        }
    }

    /// Re-issue the step from wherever the thread landed. Without a
    /// sequence point a step in goes instruction by instruction and a step
    /// over leaves the method.
    async fn step_again(
        &self,
        ctx: StepContext<'_>,
        thread: ThreadId,
        step_in: bool,
    ) -> EngineResult<()> {
        let native = ctx.native();
        let frames = native.frames(thread).await?;
        let range = frames
            .first()
            .and_then(|f| f.method.map(|m| (m, f.offset)))
            .and_then(|(m, o)| ctx.symbols.sequence_point_range(m, o));
        let mode = match range {
            Some((start, end)) => StepMode::Range { step_in, start, end },
            None if step_in => StepMode::Instruction { step_in },
            None => StepMode::Out,
        };
        native.step(thread, mode).await?;
        Ok(())
    }
}

async fn deactivate(native: &dyn NativeDebugger, breakpoint: NativeBreakpointId) {
    if let Err(e) = native.set_breakpoint_active(breakpoint, false).await {
        warn!("Failed to remove step breakpoint {:?}: {}", breakpoint, e);
    }
}

/// `this.<>t__builder.ObjectIdForDebugger` of the innermost frame.
async fn fetch_identity(ctx: StepContext<'_>, thread: ThreadId) -> EvalResult<Option<RemoteValue>> {
    let native = ctx.native();
    let arguments = native.arguments(thread, 0).await?;
    let Some(this) = arguments.into_iter().find(|a| a.name == "this").map(|a| a.value) else {
        return Ok(None);
    };

    let mut ty = Some(native.type_of(&this).await?);
    let mut builder = None;
    while let Some(current) = ty {
        let info = native.type_info(&current).await?;
        if let Some(field) = info.fields.iter().find(|f| f.name == BUILDER_FIELD) {
            builder = Some(native.field_value(&this, field).await?);
            break;
        }
        ty = info.base;
    }
    let Some(builder) = builder else {
        return Ok(None);
    };

    let mut ty = Some(native.type_of(&builder).await?);
    while let Some(current) = ty {
        let info = native.type_info(&current).await?;
        let getter = info
            .properties
            .iter()
            .find(|p| p.name == IDENTITY_PROPERTY)
            .and_then(|p| p.getter);
        if let Some(getter) = getter {
            let id = ctx.caller.call(thread, getter, &[], &[builder]).await?;
            return Ok(id.filter(|v| v.kind != ValueKind::NullReference));
        }
        ty = info.base;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::ModuleSymbols;
    use crate::testing::{
        async_program_fixture, method_symbols, EvalHarness, FakeFrame, FakeTarget, APP,
    };

    struct AsyncFixture {
        harness: EvalHarness,
        method: MethodRef,
        machines: Vec<RemoteValue>,
    }

    fn async_fixture() -> AsyncFixture {
        let (target, method, machines) = async_program_fixture();
        AsyncFixture {
            harness: EvalHarness::new(target),
            method,
            machines,
        }
    }

    fn frame(method: MethodRef, offset: u32, machines: &[RemoteValue], which: usize) -> FakeFrame {
        FakeFrame {
            this: Some(machines[which].clone()),
            ..FakeFrame::at(method, offset)
        }
    }

    fn ctx(harness: &EvalHarness) -> StepContext<'_> {
        StepContext {
            caller: &harness.caller,
            symbols: &harness.symbols,
            just_my_code: true,
        }
    }

    #[tokio::test]
    async fn test_async_resume_identity_across_threads() {
        let fixture = async_fixture();
        let target = &fixture.harness.target;
        let ctx = ctx(&fixture.harness);
        let mut stepper = StepController::new();

        stepper.start(ctx, 1, StepKind::Over).await.unwrap();
        let yield_bp = target.breakpoint_at(fixture.method, 0x0c).unwrap();
        assert_eq!(
            target.steps(),
            vec![(1, StepMode::Range { step_in: false, start: 0x0a, end: 0x1e })]
        );

        // Yield on thread 1: the range step is dropped, the identity pinned
        target.set_frames(1, vec![frame(fixture.method, 0x0c, &fixture.machines, 0)]);
        let outcome = stepper.on_breakpoint(ctx, 1, yield_bp).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Resume));
        assert_eq!(target.cancelled_steps(), vec![1]);
        assert!(!target.breakpoint_active(yield_bp));
        assert_eq!(target.live_handles(), 1);
        let resume_bp = target.breakpoint_at(fixture.method, 0x1e).unwrap();

        // Another invocation reaches the resume point first
        target.set_frames(2, vec![frame(fixture.method, 0x1e, &fixture.machines, 1)]);
        let outcome = stepper.on_breakpoint(ctx, 2, resume_bp).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Resume));
        assert!(stepper.is_active());

        // The continuation of ours, on a pool thread
        target.set_frames(3, vec![frame(fixture.method, 0x1e, &fixture.machines, 2)]);
        let outcome = stepper.on_breakpoint(ctx, 3, resume_bp).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Stop { thread: 3 }));
        assert!(!stepper.is_active());
        assert!(!target.breakpoint_active(resume_bp));
        assert_eq!(target.released_handles(), 1);
        assert_eq!(target.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_step_in_on_await_line_resumes_in_continuation() {
        let fixture = async_fixture();
        let target = &fixture.harness.target;
        let ctx = ctx(&fixture.harness);
        let mut stepper = StepController::new();

        stepper.start(ctx, 1, StepKind::In).await.unwrap();
        assert_eq!(
            target.steps(),
            vec![(1, StepMode::Range { step_in: true, start: 0x0a, end: 0x1e })]
        );
        let yield_bp = target.breakpoint_at(fixture.method, 0x0c).unwrap();

        target.set_frames(1, vec![frame(fixture.method, 0x0c, &fixture.machines, 0)]);
        let outcome = stepper.on_breakpoint(ctx, 1, yield_bp).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Resume));
        let resume_bp = target.breakpoint_at(fixture.method, 0x1e).unwrap();

        target.set_frames(1, vec![frame(fixture.method, 0x1e, &fixture.machines, 0)]);
        let outcome = stepper.on_breakpoint(ctx, 1, resume_bp).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Stop { thread: 1 }));
        assert!(!target.breakpoint_active(resume_bp));
        assert_eq!(target.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_second_step_is_rejected() {
        let fixture = async_fixture();
        let ctx = ctx(&fixture.harness);
        let mut stepper = StepController::new();
        stepper.start(ctx, 1, StepKind::In).await.unwrap();
        let err = stepper.start(ctx, 1, StepKind::Over).await.unwrap_err();
        assert!(matches!(err, EngineError::StepInProgress(1)));
    }

    #[tokio::test]
    async fn test_step_out_past_last_user_code() {
        let fixture = async_fixture();
        let target = &fixture.harness.target;
        target.set_frames(1, vec![frame(fixture.method, 0x28, &fixture.machines, 0)]);
        let mut stepper = StepController::new();
        stepper.start(ctx(&fixture.harness), 1, StepKind::Over).await.unwrap();
        assert_eq!(target.steps(), vec![(1, StepMode::Out)]);
        assert!(target.breakpoint_at(fixture.method, 0x0c).is_none());
    }

    #[tokio::test]
    async fn test_completion_cascade() {
        let target = FakeTarget::new();
        target.define_type(APP, "App.Lib", Some("System.Object"));
        let user = target.add_method("App.Lib", "Compute", &[], true, None);
        let hidden = target.add_method("App.Lib", "Helper", &[], true, None);
        target.mark_non_user_code(hidden);
        let mut symbols = method_symbols(user.token, "Lib.cs", &[(0, 5), (4, 6), (12, 7)]);
        symbols.sequence_points[0].start_line = crate::symbols::HIDDEN_LINE;
        symbols.sequence_points[0].end_line = crate::symbols::HIDDEN_LINE;
        target.add_module_symbols(
            APP,
            ModuleSymbols {
                methods: vec![symbols],
                entry_point: None,
            },
        );
        target.set_frames(1, vec![FakeFrame::at(user, 4)]);
        let harness = EvalHarness::new(target);
        let target = &harness.target;
        let ctx = ctx(&harness);
        let mut stepper = StepController::new();

        stepper.start(ctx, 1, StepKind::In).await.unwrap();

        // Into the hidden prolog of a method with symbols: step over again
        target.set_frames(1, vec![FakeFrame::at(user, 0)]);
        let outcome = stepper
            .on_step_complete(ctx, 1, StepCompleteReason::Call)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Resume);
        assert_eq!(
            target.steps().last(),
            Some(&(1, StepMode::Range { step_in: false, start: 0, end: 4 }))
        );

        // Non-user code without symbols: keep stepping in, it may call back
        // into user code
        target.set_frames(1, vec![FakeFrame::at(hidden, 0), FakeFrame::at(user, 4)]);
        let outcome = stepper
            .on_step_complete(ctx, 1, StepCompleteReason::Normal)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Resume);
        assert_eq!(
            target.steps().last(),
            Some(&(1, StepMode::Instruction { step_in: true }))
        );

        target.set_frames(1, vec![FakeFrame::at(user, 12)]);
        let outcome = stepper
            .on_step_complete(ctx, 1, StepCompleteReason::Return)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Stop { thread: 1 });
        assert!(!stepper.is_active());
    }

    #[tokio::test]
    async fn test_cancel_removes_step_breakpoints() {
        let fixture = async_fixture();
        let target = &fixture.harness.target;
        let mut stepper = StepController::new();
        stepper
            .start(ctx(&fixture.harness), 1, StepKind::Over)
            .await
            .unwrap();
        let yield_bp = target.breakpoint_at(fixture.method, 0x0c).unwrap();
        stepper.cancel(&**target).await;
        assert!(!stepper.is_active());
        assert!(!target.breakpoint_active(yield_bp));
        assert_eq!(target.cancelled_steps(), vec![1]);
    }
}
