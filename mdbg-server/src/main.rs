// mdbg - debugger front end for managed runtimes
//
// Reads JSON-lines requests on stdin and writes responses and session
// events on stdout. The target is reached through its in-process debug
// agent over TCP.

use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tracing::{debug, error, info};

mod handlers;
mod output;
mod protocol;
mod session;

use handlers::RequestHandler;
use output::Output;
use protocol::*;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("mdbg=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting mdbg...");
    serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
    info!("mdbg shutting down");
    Ok(())
}

async fn serve<R, W>(mut reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let output = Output::new(writer);
    let handler = RequestHandler::new(output.clone());
    info!("Ready, waiting for requests...");

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                debug!("Received: {}", text);
                let response = match serde_json::from_str::<Value>(text) {
                    Ok(value) => match serde_json::from_value::<Request>(value) {
                        Ok(request) => handler.handle_request(request).await,
                        Err(e) => {
                            error!("Invalid request: {}", e);
                            Response::error(
                                Value::Null,
                                ErrorBody::new(INVALID_REQUEST, format!("Invalid request: {}", e)),
                            )
                        }
                    },
                    Err(e) => {
                        error!("Parse error: {}", e);
                        Response::error(Value::Null, ErrorBody::new(PARSE_ERROR, "Parse error"))
                    }
                };
                output.send(&response).await?;
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }
    Ok(())
}
