// Front-end wire messages
//
// One JSON object per line in each direction. A request carries an id and
// gets exactly one response with the same id. Session events are pushed as
// they happen and carry an "event" field instead of an id.

use mdbg_engine::{BreakpointRequest, LaunchRequest, SessionConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const NO_SESSION: i32 = -32001;
pub const ENGINE_ERROR: i32 = -32002;

pub const DEFAULT_AGENT_HOST: &str = "127.0.0.1";
pub const DEFAULT_AGENT_PORT: u16 = 4711;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: ErrorBody) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub server_info: ServerInfo,
    pub capabilities: Capabilities,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_hit_conditional_breakpoints: bool,
    pub supports_terminate_request: bool,
}

fn default_host() -> String {
    DEFAULT_AGENT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_AGENT_PORT
}

/// Where the in-target debug agent listens, plus the session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentParams {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchParams {
    #[serde(flatten)]
    pub agent: AgentParams,
    #[serde(flatten)]
    pub request: LaunchRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachParams {
    #[serde(flatten)]
    pub agent: AgentParams,
    pub pid: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetBreakpointsParams {
    pub source: String,
    #[serde(default)]
    pub breakpoints: Vec<BreakpointRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadParams {
    pub thread: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceParams {
    pub thread: u32,
    #[serde(default)]
    pub start_frame: usize,
    /// 0 means all frames.
    #[serde(default)]
    pub levels: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesParams {
    pub frame_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesParams {
    pub variables_reference: i64,
    #[serde(default)]
    pub start: usize,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    pub expression: String,
    #[serde(default)]
    pub frame_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectParams {
    #[serde(default)]
    pub terminate_debuggee: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdbg_engine::ExceptionBreakMode;
    use serde_json::json;

    #[test]
    fn test_launch_params_defaults() {
        let params: LaunchParams = serde_json::from_value(json!({
            "program": "/src/App/bin/App.dll",
            "args": ["--verbose"],
            "config": {"stopAtEntry": true}
        }))
        .unwrap();

        assert_eq!(params.agent.host, "127.0.0.1");
        assert_eq!(params.agent.port, DEFAULT_AGENT_PORT);
        assert!(params.agent.config.stop_at_entry);
        assert_eq!(params.agent.config.exception_breaks, ExceptionBreakMode::Unhandled);
        assert_eq!(params.request.program, "/src/App/bin/App.dll");
        assert_eq!(params.request.args, vec!["--verbose".to_string()]);
    }

    #[test]
    fn test_set_breakpoints_params() {
        let params: SetBreakpointsParams = serde_json::from_value(json!({
            "source": "/src/App/Program.cs",
            "breakpoints": [{"line": 12}, {"line": 20, "condition": "i > 3", "hitCondition": ">=2"}]
        }))
        .unwrap();

        assert_eq!(params.breakpoints.len(), 2);
        assert_eq!(params.breakpoints[1].condition.as_deref(), Some("i > 3"));
        assert_eq!(params.breakpoints[1].hit_condition.as_deref(), Some(">=2"));
    }

    #[test]
    fn test_error_response_omits_result() {
        let response = Response::error(
            json!(7),
            ErrorBody::new(METHOD_NOT_FOUND, "Method not found: foo"),
        );
        let text = serde_json::to_string(&response).unwrap();
        assert_eq!(
            text,
            r#"{"id":7,"error":{"code":-32601,"message":"Method not found: foo"}}"#
        );
    }
}
