// Session configuration
//
// Carried in the launch/attach request arguments; every field has a default so
// front ends only send what they change.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionBreakMode {
    Never,
    #[default]
    Unhandled,
    /// Every first-chance exception raised in user code.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Step through code marked as non-user code instead of stopping in it.
    pub just_my_code: bool,
    pub stop_at_entry: bool,
    pub exception_breaks: ExceptionBreakMode,
    /// Upper bound for one remote call; `None` waits forever.
    pub eval_timeout_ms: Option<u64>,
    /// Call property getters when expanding objects.
    pub evaluate_properties: bool,
    pub max_array_children: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            just_my_code: true,
            stop_at_entry: false,
            exception_breaks: ExceptionBreakMode::Unhandled,
            eval_timeout_ms: None,
            evaluate_properties: true,
            max_array_children: 1000,
        }
    }
}

impl SessionConfig {
    pub fn eval_timeout(&self) -> Option<Duration> {
        self.eval_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"stopAtEntry": true, "exceptionBreaks": "always"}"#).unwrap();
        assert!(config.stop_at_entry);
        assert!(config.just_my_code);
        assert_eq!(config.exception_breaks, ExceptionBreakMode::Always);
        assert_eq!(config.eval_timeout(), None);
    }
}
