// Line writer shared by responses and session events
//
// Each message is written and flushed whole under one lock, so lines from
// the request loop and the event forwarders never interleave.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone)]
pub struct Output {
    writer: Arc<Mutex<Writer>>,
}

impl Output {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        debug!("Sending: {}", line);
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
