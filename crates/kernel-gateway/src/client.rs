//! Session negotiation with the kernel gateway REST API.
//!
//! Two sequential calls, then the streaming channel:
//!
//! 1. `GET  /api/kernelspecs` (diagnostics only)
//! 2. `POST /api/kernels`     (start a kernel session)
//! 3. websocket `/api/kernels/{id}/channels`
//!
//! Every stage fails with the same [`ConnectionError`] shape; the stage is
//! carried for logging only.

use std::collections::HashMap;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use url::Url;

use crate::connection::GatewayConnection;
use crate::uri::websocket_uri;
use crate::Connector;

/// Fallback when no readable message can be recovered from a failure.
pub const GENERIC_CONNECTION_FAILURE: &str = "Failed to connect to kernel gateway";

/// Where a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// Parsing the gateway URI.
    Uri,
    /// Listing kernel specifications.
    KernelSpecs,
    /// Starting the kernel session.
    StartKernel,
    /// Opening the streaming channel.
    Channel,
}

impl std::fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectStage::Uri => write!(f, "uri"),
            ConnectStage::KernelSpecs => write!(f, "kernelspecs"),
            ConnectStage::StartKernel => write!(f, "start-kernel"),
            ConnectStage::Channel => write!(f, "channel"),
        }
    }
}

/// A failed connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ConnectionError {
    pub stage: ConnectStage,
    pub message: String,
}

impl ConnectionError {
    fn new(stage: ConnectStage, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            GENERIC_CONNECTION_FAILURE.to_string()
        } else {
            message
        };
        warn!("[gateway] Connection failed at {}: {}", stage, message);
        Self { stage, message }
    }
}

#[derive(Debug, Deserialize)]
struct KernelSpecsResponse {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    kernelspecs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct KernelModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

/// Jupyter servers report failures as `{"message": ..., "reason": ...}`.
#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Parsed gateway base address plus its optional access token.
#[derive(Debug, Clone)]
pub(crate) struct GatewayEndpoint {
    base: Url,
    token: Option<String>,
}

impl GatewayEndpoint {
    pub(crate) fn parse(uri: &str) -> Result<Self, ConnectionError> {
        let mut base = Url::parse(uri.trim()).map_err(|e| {
            ConnectionError::new(ConnectStage::Uri, format!("Invalid gateway URI: {}", e))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConnectionError::new(
                ConnectStage::Uri,
                format!("Unsupported gateway scheme: {}", base.scheme()),
            ));
        }

        let token = base
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned());
        base.set_query(None);
        base.set_fragment(None);
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self { base, token })
    }

    pub(crate) fn api(&self, path: &str) -> String {
        format!("{}api/{}", self.base, path)
    }

    /// Websocket URL of a kernel's channels, with the query encoded.
    pub(crate) fn channels(
        &self,
        kernel_id: &str,
        session_id: &str,
    ) -> Result<Url, ConnectionError> {
        let http = self.api(&format!("kernels/{}/channels", kernel_id));
        let mut url = Url::parse(&websocket_uri(&http)).map_err(|e| {
            ConnectionError::new(ConnectStage::Channel, format!("Invalid channel URL: {}", e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("session_id", session_id);
            if let Some(ref token) = self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }

    pub(crate) fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.header("Authorization", format!("token {}", token)),
            None => request,
        }
    }
}

/// HTTP client for a kernel gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    kernel_name: Option<String>,
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new(None)
    }
}

impl GatewayClient {
    /// Create a client that starts `kernel_name` (or the gateway default).
    pub fn new(kernel_name: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http, kernel_name }
    }

    /// Negotiate a kernel session and open its streaming channel.
    pub async fn connect(&self, uri: &str) -> Result<GatewayConnection, ConnectionError> {
        let endpoint = GatewayEndpoint::parse(uri)?;

        let specs = self.fetch_kernelspecs(&endpoint).await?;
        info!(
            "[gateway] Kernelspecs at {}: default={:?} available={:?}",
            uri,
            specs.default,
            specs.kernelspecs.keys().collect::<Vec<_>>()
        );

        let kernel = self.start_kernel(&endpoint).await?;
        info!(
            "[gateway] Started kernel {} ({})",
            kernel.id,
            kernel.name.as_deref().unwrap_or("default")
        );

        GatewayConnection::open(self.http.clone(), endpoint, kernel.id).await
    }

    async fn fetch_kernelspecs(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<KernelSpecsResponse, ConnectionError> {
        let request = endpoint.authorize(self.http.get(endpoint.api("kernelspecs")));
        let response = send(request, ConnectStage::KernelSpecs).await?;
        response
            .json::<KernelSpecsResponse>()
            .await
            .map_err(|e| ConnectionError::new(ConnectStage::KernelSpecs, e.to_string()))
    }

    async fn start_kernel(
        &self,
        endpoint: &GatewayEndpoint,
    ) -> Result<KernelModel, ConnectionError> {
        let body = match self.kernel_name {
            Some(ref name) => serde_json::json!({ "name": name }),
            None => serde_json::json!({}),
        };
        let request = endpoint.authorize(self.http.post(endpoint.api("kernels")).json(&body));
        let response = send(request, ConnectStage::StartKernel).await?;
        response
            .json::<KernelModel>()
            .await
            .map_err(|e| ConnectionError::new(ConnectStage::StartKernel, e.to_string()))
    }
}

impl Connector for GatewayClient {
    type Connection = GatewayConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection, ConnectionError> {
        GatewayClient::connect(self, uri).await
    }
}

/// Send a request and turn transport or status failures into a readable error.
async fn send(
    request: reqwest::RequestBuilder,
    stage: ConnectStage,
) -> Result<reqwest::Response, ConnectionError> {
    let response = request
        .send()
        .await
        .map_err(|e| ConnectionError::new(stage, describe_transport_error(&e)))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ConnectionError::new(stage, describe_status_error(status, &body)))
}

fn describe_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        return "Kernel gateway did not respond in time".to_string();
    }
    if error.is_connect() {
        return "Kernel gateway refused the connection".to_string();
    }
    error.to_string()
}

/// Prefer the gateway's own message, then its reason, then the status line.
pub(crate) fn describe_status_error(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<GatewayErrorBody>(body) {
        if let Some(message) = parsed.message.filter(|m| !m.trim().is_empty()) {
            return message;
        }
        if let Some(reason) = parsed.reason.filter(|r| !r.trim().is_empty()) {
            return reason;
        }
    }
    match status.canonical_reason() {
        Some(reason) => format!("Kernel gateway returned {} {}", status.as_u16(), reason),
        None => GENERIC_CONNECTION_FAILURE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_endpoint_builds_api_paths() {
        let endpoint = GatewayEndpoint::parse("http://127.0.0.1:8888").unwrap();
        assert_eq!(endpoint.api("kernelspecs"), "http://127.0.0.1:8888/api/kernelspecs");
        assert_eq!(
            endpoint.channels("k1", "s1").unwrap().as_str(),
            "ws://127.0.0.1:8888/api/kernels/k1/channels?session_id=s1"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path_and_extracts_token() {
        let endpoint = GatewayEndpoint::parse("https://gw.local/jupyter?token=secret").unwrap();
        assert_eq!(endpoint.token.as_deref(), Some("secret"));
        assert_eq!(endpoint.api("kernels"), "https://gw.local/jupyter/api/kernels");
        assert_eq!(
            endpoint.channels("k1", "s1").unwrap().as_str(),
            "wss://gw.local/jupyter/api/kernels/k1/channels?session_id=s1&token=secret"
        );
    }

    #[test]
    fn test_channel_url_encodes_token() {
        let uri = "http://127.0.0.1:8888/?token=a%20b%26c%3Dd%2Be%23f";
        let endpoint = GatewayEndpoint::parse(uri).unwrap();
        assert_eq!(endpoint.token.as_deref(), Some("a b&c=d+e#f"));

        let url = endpoint.channels("k1", "s1").unwrap();
        assert_eq!(url.fragment(), None);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("session_id".to_string(), "s1".to_string()),
                ("token".to_string(), "a b&c=d+e#f".to_string()),
            ]
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_uris() {
        let err = GatewayEndpoint::parse("").unwrap_err();
        assert_eq!(err.stage, ConnectStage::Uri);

        let err = GatewayEndpoint::parse("ftp://127.0.0.1:21").unwrap_err();
        assert_eq!(err.stage, ConnectStage::Uri);
        assert!(err.message.contains("ftp"));
    }

    #[test]
    fn test_status_error_prefers_gateway_message() {
        let body = r#"{"message": "No such kernel spec: python9", "reason": "Not Found"}"#;
        assert_eq!(
            describe_status_error(StatusCode::NOT_FOUND, body),
            "No such kernel spec: python9"
        );

        let body = r#"{"reason": "Forbidden"}"#;
        assert_eq!(describe_status_error(StatusCode::FORBIDDEN, body), "Forbidden");

        assert_eq!(
            describe_status_error(StatusCode::INTERNAL_SERVER_ERROR, "<html>"),
            "Kernel gateway returned 500 Internal Server Error"
        );
    }

    #[test]
    fn test_empty_message_falls_back_to_generic() {
        let err = ConnectionError::new(ConnectStage::Channel, "  ");
        assert_eq!(err.message, GENERIC_CONNECTION_FAILURE);
        assert_eq!(err.to_string(), GENERIC_CONNECTION_FAILURE);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_at_kernelspecs() {
        // Bind then drop a listener to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = GatewayClient::default();
        let err = client
            .connect(&format!("http://127.0.0.1:{}", port))
            .await
            .unwrap_err();
        assert_eq!(err.stage, ConnectStage::KernelSpecs);
        assert!(!err.message.is_empty());
    }
}
