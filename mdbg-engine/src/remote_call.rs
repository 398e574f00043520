// Remote call protocol
//
// Two-phase evaluation: queue a call in the target, resume it, then wait for
// the completion keyed by EvalId. The router task owns the event stream and
// fulfils waiters; everything that is not an eval completion is forwarded to
// the dispatcher in arrival order.

use crate::error::{EvalError, EvalResult, NativeError, NativeResult};
use crate::native::{NativeDebugger, NativeEvent};
use crate::types::{EvalId, MethodRef, RemoteValue, ThreadId, TypeRef};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug)]
pub enum CallOutcome {
    Completed(Option<RemoteValue>),
    Exception(RemoteValue),
}

/// What the router should do with a notification.
#[derive(Debug)]
pub enum Routed {
    /// Delivered to an eval waiter (or stale and dropped).
    Consumed,
    /// Stop on a thread that is running an evaluation; resume it.
    Resume(NativeEvent),
    Forward(NativeEvent),
}

struct Waiter {
    thread: ThreadId,
    tx: oneshot::Sender<CallOutcome>,
}

/// Pending evaluations keyed by their identity.
#[derive(Default)]
pub struct EvalWaiters {
    pending: Mutex<HashMap<EvalId, Waiter>>,
}

impl EvalWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, eval: EvalId, thread: ThreadId) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(eval, Waiter { thread, tx });
        rx
    }

    pub fn cancel(&self, eval: EvalId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&eval);
    }

    fn complete(&self, eval: EvalId, outcome: CallOutcome) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&eval);
        match waiter {
            Some(waiter) => {
                if waiter.tx.send(outcome).is_err() {
                    debug!("Waiter for {} went away", eval);
                }
            }
            None => warn!("Completion for unknown {} ignored", eval),
        }
    }

    pub fn eval_in_flight(&self, thread: ThreadId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|w| w.thread == thread)
    }

    pub fn route(&self, event: NativeEvent) -> Routed {
        match event {
            NativeEvent::EvalComplete { eval, result, .. } => {
                self.complete(eval, CallOutcome::Completed(result));
                Routed::Consumed
            }
            NativeEvent::EvalException { eval, exception, .. } => {
                self.complete(eval, CallOutcome::Exception(exception));
                Routed::Consumed
            }
            NativeEvent::BreakpointHit { thread, .. }
            | NativeEvent::StepComplete { thread, .. }
            | NativeEvent::Break { thread }
            | NativeEvent::Exception { thread, .. }
                if self.eval_in_flight(thread) =>
            {
                Routed::Resume(event)
            }
            other => Routed::Forward(other),
        }
    }
}

/// Router loop: runs until the native event stream ends or the dispatcher
/// side hangs up.
pub async fn route_events(
    native: Arc<dyn NativeDebugger>,
    waiters: Arc<EvalWaiters>,
    mut events: mpsc::UnboundedReceiver<NativeEvent>,
    forward: mpsc::UnboundedSender<NativeEvent>,
) {
    while let Some(event) = events.recv().await {
        match waiters.route(event) {
            Routed::Consumed => {}
            Routed::Resume(event) => {
                debug!("Resuming past {:?} raised during evaluation", event);
                if let Err(e) = native.continue_process().await {
                    error!("Failed to resume during evaluation: {}", e);
                }
            }
            Routed::Forward(event) => {
                if forward.send(event).is_err() {
                    debug!("Dispatcher gone, router exiting");
                    break;
                }
            }
        }
    }
    debug!("Native event stream closed");
}

/// Issues remote calls and waits for their completion.
#[derive(Clone)]
pub struct RemoteCaller {
    native: Arc<dyn NativeDebugger>,
    waiters: Arc<EvalWaiters>,
    timeout: Option<Duration>,
}

impl RemoteCaller {
    pub fn new(
        native: Arc<dyn NativeDebugger>,
        waiters: Arc<EvalWaiters>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            native,
            waiters,
            timeout,
        }
    }

    pub fn native(&self) -> &Arc<dyn NativeDebugger> {
        &self.native
    }

    pub async fn call(
        &self,
        thread: ThreadId,
        method: MethodRef,
        type_args: &[TypeRef],
        args: &[RemoteValue],
    ) -> EvalResult<Option<RemoteValue>> {
        debug!("Remote call {:?} on thread {} ({} args)", method, thread, args.len());
        self.run(
            thread,
            self.native.begin_call(thread, method, type_args, args),
        )
        .await
    }

    pub async fn new_string(&self, thread: ThreadId, text: &str) -> EvalResult<RemoteValue> {
        self.run(thread, self.native.begin_new_string(thread, text))
            .await?
            .ok_or_else(|| {
                EvalError::Native(NativeError::Protocol(
                    "string construction returned no value".to_string(),
                ))
            })
    }

    async fn run(
        &self,
        thread: ThreadId,
        start: impl Future<Output = NativeResult<EvalId>>,
    ) -> EvalResult<Option<RemoteValue>> {
        let eval = start.await?;
        let rx = self.waiters.register(eval, thread);

        if let Err(e) = self.native.continue_process().await {
            self.waiters.cancel(eval);
            return Err(e.into());
        }

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("{} timed out after {:?}, aborting", eval, limit);
                    self.waiters.cancel(eval);
                    if let Err(e) = self.native.abort_eval(eval).await {
                        warn!("Failed to abort {}: {}", eval, e);
                    }
                    return Err(EvalError::Timeout);
                }
            },
            None => rx.await,
        };

        match received {
            Ok(CallOutcome::Completed(value)) => Ok(value),
            Ok(CallOutcome::Exception(exception)) => {
                debug!("{} threw {}", eval, exception.type_name);
                Err(EvalError::RemoteFault(exception))
            }
            Err(_) => Err(NativeError::EvalAborted(eval).into()),
        }
    }
}
