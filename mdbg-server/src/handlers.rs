// Request handlers
//
// Routes each front-end method to the matching session operation and shapes
// the result into a response body.

use crate::output::Output;
use crate::protocol::*;
use crate::session::SessionManager;
use mdbg_engine::{EngineError, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

type HandlerResult = Result<Value, ErrorBody>;

pub struct RequestHandler {
    session_manager: SessionManager,
}

impl RequestHandler {
    pub fn new(output: Output) -> Self {
        Self {
            session_manager: SessionManager::new(output),
        }
    }

    pub async fn handle_request(&self, request: Request) -> Response {
        debug!("Handling {}", request.method);
        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "launch" => self.handle_launch(request.params).await,
            "attach" => self.handle_attach(request.params).await,
            "configurationDone" => self.handle_configuration_done().await,
            "setBreakpoints" => self.handle_set_breakpoints(request.params).await,
            "continue" => self.handle_continue().await,
            "pause" => self.handle_pause().await,
            "next" => self.handle_next(request.params).await,
            "stepIn" => self.handle_step_in(request.params).await,
            "stepOut" => self.handle_step_out(request.params).await,
            "threads" => self.handle_threads().await,
            "stackTrace" => self.handle_stack_trace(request.params).await,
            "scopes" => self.handle_scopes(request.params).await,
            "variables" => self.handle_variables(request.params).await,
            "evaluate" => self.handle_evaluate(request.params).await,
            "terminate" => self.handle_terminate().await,
            "disconnect" => self.handle_disconnect(request.params).await,
            _ => Err(ErrorBody::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )),
        };

        match result {
            Ok(value) => Response::ok(request.id, value),
            Err(error) => {
                warn!("{} failed: {}", request.method, error.message);
                Response::error(request.id, error)
            }
        }
    }

    async fn session(&self) -> Result<Arc<Session>, ErrorBody> {
        self.session_manager
            .current()
            .await
            .ok_or_else(|| {
                ErrorBody::new(NO_SESSION, "No active debug session. Use launch or attach first.")
            })
    }

    fn handle_initialize(&self) -> HandlerResult {
        to_result(InitializeResult {
            server_info: ServerInfo {
                name: "mdbg".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: Capabilities {
                supports_configuration_done_request: true,
                supports_conditional_breakpoints: true,
                supports_hit_conditional_breakpoints: true,
                supports_terminate_request: true,
            },
        })
    }

    async fn handle_launch(&self, params: Option<Value>) -> HandlerResult {
        let params: LaunchParams = parse_params(params)?;
        let agent = params.agent;
        let session = self
            .session_manager
            .connect(&agent.host, agent.port, agent.config)
            .await
            .map_err(|e| connect_error(&agent.host, agent.port, e))?;

        match session.launch(&params.request).await {
            Ok(pid) => {
                info!("Launched {} as process {}", params.request.program, pid);
                Ok(json!({ "pid": pid }))
            }
            Err(e) => {
                self.session_manager.remove().await;
                Err(engine_error(e))
            }
        }
    }

    async fn handle_attach(&self, params: Option<Value>) -> HandlerResult {
        let params: AttachParams = parse_params(params)?;
        let agent = params.agent;
        let session = self
            .session_manager
            .connect(&agent.host, agent.port, agent.config)
            .await
            .map_err(|e| connect_error(&agent.host, agent.port, e))?;

        match session.attach(params.pid).await {
            Ok(()) => Ok(json!({ "pid": params.pid })),
            Err(e) => {
                self.session_manager.remove().await;
                Err(engine_error(e))
            }
        }
    }

    async fn handle_configuration_done(&self) -> HandlerResult {
        let session = self.session().await?;
        session.configuration_done().await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_set_breakpoints(&self, params: Option<Value>) -> HandlerResult {
        let params: SetBreakpointsParams = parse_params(params)?;
        let session = self.session().await?;
        let breakpoints = session
            .set_breakpoints(&params.source, &params.breakpoints)
            .await
            .map_err(engine_error)?;
        Ok(json!({ "breakpoints": breakpoints }))
    }

    async fn handle_continue(&self) -> HandlerResult {
        let session = self.session().await?;
        session.continue_().await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_pause(&self) -> HandlerResult {
        let session = self.session().await?;
        session.pause().await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_next(&self, params: Option<Value>) -> HandlerResult {
        let params: ThreadParams = parse_params(params)?;
        let session = self.session().await?;
        session.step_over(params.thread).await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_step_in(&self, params: Option<Value>) -> HandlerResult {
        let params: ThreadParams = parse_params(params)?;
        let session = self.session().await?;
        session.step_into(params.thread).await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_step_out(&self, params: Option<Value>) -> HandlerResult {
        let params: ThreadParams = parse_params(params)?;
        let session = self.session().await?;
        session.step_out(params.thread).await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_threads(&self) -> HandlerResult {
        let session = self.session().await?;
        let threads = session.threads().await.map_err(engine_error)?;
        Ok(json!({ "threads": threads }))
    }

    async fn handle_stack_trace(&self, params: Option<Value>) -> HandlerResult {
        let params: StackTraceParams = parse_params(params)?;
        let session = self.session().await?;
        let frames = session
            .stack_trace(params.thread, params.start_frame, params.levels)
            .await
            .map_err(engine_error)?;
        Ok(json!({ "stackFrames": frames }))
    }

    async fn handle_scopes(&self, params: Option<Value>) -> HandlerResult {
        let params: ScopesParams = parse_params(params)?;
        let session = self.session().await?;
        let scopes = session.scopes(params.frame_id).await.map_err(engine_error)?;
        Ok(json!({ "scopes": scopes }))
    }

    async fn handle_variables(&self, params: Option<Value>) -> HandlerResult {
        let params: VariablesParams = parse_params(params)?;
        let session = self.session().await?;
        let variables = session
            .variables(params.variables_reference, params.start, params.count)
            .await
            .map_err(engine_error)?;
        Ok(json!({ "variables": variables }))
    }

    async fn handle_evaluate(&self, params: Option<Value>) -> HandlerResult {
        let params: EvaluateParams = parse_params(params)?;
        let session = self.session().await?;
        let result = session
            .evaluate(&params.expression, params.frame_id)
            .await
            .map_err(engine_error)?;
        to_result(result)
    }

    async fn handle_terminate(&self) -> HandlerResult {
        let session = self.session().await?;
        session.terminate().await.map_err(engine_error)?;
        Ok(json!({}))
    }

    async fn handle_disconnect(&self, params: Option<Value>) -> HandlerResult {
        let params: DisconnectParams = parse_params(params)?;
        let session = self
            .session_manager
            .remove()
            .await
            .ok_or_else(|| ErrorBody::new(NO_SESSION, "No active debug session"))?;
        session
            .disconnect(params.terminate_debuggee)
            .await
            .map_err(engine_error)?;
        Ok(json!({}))
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorBody> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| ErrorBody::new(INVALID_PARAMS, format!("Invalid params: {}", e)))
}

fn to_result<T: Serialize>(value: T) -> HandlerResult {
    serde_json::to_value(value)
        .map_err(|e| ErrorBody::new(ENGINE_ERROR, format!("Failed to encode result: {}", e)))
}

fn engine_error(e: EngineError) -> ErrorBody {
    ErrorBody::new(ENGINE_ERROR, e.to_string())
}

fn connect_error(host: &str, port: u16, e: impl std::fmt::Display) -> ErrorBody {
    ErrorBody::new(
        ENGINE_ERROR,
        format!("Failed to connect to debug agent at {}:{}: {}", host, port, e),
    )
}
