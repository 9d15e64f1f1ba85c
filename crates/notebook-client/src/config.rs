//! Client settings, read from the `client` section of the `notebookd` config.

use kernel_gateway::DEFAULT_URI_MARKER;
use serde::{Deserialize, Serialize};

/// Gateway stdout lines kept by a client for diagnostics.
pub const DEFAULT_STDOUT_HISTORY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Substring that starts the gateway URI in its log output.
    pub uri_marker: String,
    /// Kernel to start on the gateway; its default kernel when unset.
    pub kernel_name: Option<String>,
    /// Number of gateway stdout lines kept.
    pub stdout_history: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            uri_marker: DEFAULT_URI_MARKER.to_string(),
            kernel_name: None,
            stdout_history: DEFAULT_STDOUT_HISTORY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"kernel_name": "python3"}"#).unwrap();
        assert_eq!(config.kernel_name.as_deref(), Some("python3"));
        assert_eq!(config.uri_marker, DEFAULT_URI_MARKER);
        assert_eq!(config.stdout_history, DEFAULT_STDOUT_HISTORY);
    }
}
