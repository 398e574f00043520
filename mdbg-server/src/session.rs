// Debug session management
//
// Holds the session created by launch or attach. Each session gets a task
// that forwards its events to the output until the session is dropped.

use crate::output::Output;
use mdbg_engine::{
    AgentConnection, NativeDebugger, NativeEvent, NativeResult, Session, SessionConfig,
    SessionEvent,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

pub struct SessionManager {
    current: Mutex<Option<Arc<Session>>>,
    output: Output,
}

impl SessionManager {
    pub fn new(output: Output) -> Self {
        Self {
            current: Mutex::new(None),
            output,
        }
    }

    /// Connect to the debug agent at `host:port` and make the new session
    /// current.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        config: SessionConfig,
    ) -> NativeResult<Arc<Session>> {
        let (connection, native_events) = AgentConnection::connect(host, port).await?;
        Ok(self.install(Arc::new(connection), native_events, config).await)
    }

    async fn install(
        &self,
        native: Arc<dyn NativeDebugger>,
        native_events: mpsc::UnboundedReceiver<NativeEvent>,
        config: SessionConfig,
    ) -> Arc<Session> {
        let (session, events) = Session::start(native, native_events, config);
        let session = Arc::new(session);
        tokio::spawn(forward_events(events, self.output.clone()));

        let previous = self.current.lock().await.replace(session.clone());
        if let Some(previous) = previous {
            warn!("Replacing the active debug session");
            if let Err(e) = previous.disconnect(false).await {
                warn!("Failed to close previous session: {}", e);
            }
        }
        session
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }

    pub async fn remove(&self) -> Option<Arc<Session>> {
        self.current.lock().await.take()
    }
}

async fn forward_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, output: Output) {
    while let Some(event) = events.recv().await {
        if let Err(e) = output.send(&event).await {
            warn!("Failed to write event: {}", e);
            break;
        }
    }
    info!("Debug session ended");
}
