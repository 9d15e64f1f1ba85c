//! Streaming kernel channel over the gateway websocket.
//!
//! Messages use the Jupyter websocket JSON encoding: one text frame per
//! message with `header`, `parent_header`, `metadata`, `content` and
//! `channel`. Outputs are routed to the caller by the parent `msg_id` of the
//! execute request that produced them.

use futures::{SinkExt, StreamExt};
use jupyter_protocol::{ExecutionState, JupyterMessageContent};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::client::{ConnectStage, ConnectionError, GatewayEndpoint};
use crate::output::{output_from_content, OutputData};
use crate::KernelConnection;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Jupyter messaging protocol version spoken on the channel.
const PROTOCOL_VERSION: &str = "5.3";

/// iopub message types that affect an execution; everything else is skipped.
const OBSERVED_IOPUB_TYPES: &[&str] = &[
    "status",
    "stream",
    "display_data",
    "execute_result",
    "error",
];

/// Error type for execute requests.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Kernel channel closed")]
    ChannelClosed,

    #[error("Kernel channel error: {0}")]
    Transport(String),

    #[error("Invalid kernel message: {0}")]
    Protocol(String),
}

/// Final status of an execute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

/// Summary returned once an execute request finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    /// The kernel's own execution counter, if reported.
    pub execution_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireHeader {
    #[serde(default)]
    msg_id: String,
    msg_type: String,
}

/// Incoming message; content is parsed later based on `msg_type`.
#[derive(Debug, Deserialize)]
struct WireMessage {
    header: WireHeader,
    #[serde(default)]
    parent_header: Value,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    channel: Option<String>,
}

impl WireMessage {
    fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(|v| v.as_str())
    }
}

/// Build an `execute_request` in websocket JSON encoding.
fn execute_request(session_id: &str, code: &str) -> (String, Value) {
    let msg_id = Uuid::new_v4().to_string();
    let message = json!({
        "header": {
            "msg_id": msg_id,
            "username": "notebook",
            "session": session_id,
            "date": chrono::Utc::now().to_rfc3339(),
            "msg_type": "execute_request",
            "version": PROTOCOL_VERSION,
        },
        "parent_header": {},
        "metadata": {},
        "content": {
            "code": code,
            "silent": false,
            "store_history": true,
            "user_expressions": {},
            "allow_stdin": false,
            "stop_on_error": true,
        },
        "channel": "shell",
        "buffers": [],
    });
    (msg_id, message)
}

/// Tracks one execute request until both `execute_reply` and `status: idle`
/// have been seen; either may arrive first.
#[derive(Debug, Default)]
struct PendingExecution {
    reply: Option<ExecutionSummary>,
    idle: bool,
    saw_error: bool,
}

impl PendingExecution {
    /// Feed one message addressed to this request. Returns the output
    /// fragment it carries, if any.
    fn observe(&mut self, message: WireMessage) -> Result<Option<OutputData>, ExecuteError> {
        if message.header.msg_type == "execute_reply" {
            let status = match message.content.get("status").and_then(|s| s.as_str()) {
                Some("ok") => ExecutionStatus::Ok,
                _ => ExecutionStatus::Error,
            };
            let execution_count = message.content.get("execution_count").and_then(|c| c.as_u64());
            self.reply = Some(ExecutionSummary {
                status,
                execution_count,
            });
            return Ok(None);
        }

        if message.channel.as_deref().is_some_and(|c| c != "iopub") {
            return Ok(None);
        }
        if !OBSERVED_IOPUB_TYPES.contains(&message.header.msg_type.as_str()) {
            return Ok(None);
        }

        let content =
            JupyterMessageContent::from_type_and_content(&message.header.msg_type, message.content)
                .map_err(|e| ExecuteError::Protocol(e.to_string()))?;

        if let JupyterMessageContent::Status(ref status) = content {
            if status.execution_state == ExecutionState::Idle {
                self.idle = true;
            }
            return Ok(None);
        }

        let output = output_from_content(&content);
        if output.as_ref().is_some_and(OutputData::is_error) {
            self.saw_error = true;
        }
        Ok(output)
    }

    fn finished(&self) -> Option<ExecutionSummary> {
        if !self.idle {
            return None;
        }
        self.reply.clone().map(|mut summary| {
            if self.saw_error {
                summary.status = ExecutionStatus::Error;
            }
            summary
        })
    }
}

/// A live kernel session on a gateway.
#[derive(Debug)]
pub struct GatewayConnection {
    http: reqwest::Client,
    endpoint: GatewayEndpoint,
    kernel_id: String,
    session_id: String,
    ws: WsStream,
}

impl GatewayConnection {
    pub(crate) async fn open(
        http: reqwest::Client,
        endpoint: GatewayEndpoint,
        kernel_id: String,
    ) -> Result<Self, ConnectionError> {
        let session_id = Uuid::new_v4().to_string();
        let url = endpoint.channels(&kernel_id, &session_id)?;
        let (ws, _) = connect_async(url.as_str()).await.map_err(|e| ConnectionError {
            stage: ConnectStage::Channel,
            message: e.to_string(),
        })?;
        info!("[gateway] Channel open for kernel {}", kernel_id);

        Ok(Self {
            http,
            endpoint,
            kernel_id,
            session_id,
            ws,
        })
    }

    async fn next_message(&mut self) -> Result<WireMessage, ExecuteError> {
        loop {
            let frame = match self.ws.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ExecuteError::Transport(e.to_string())),
                None => return Err(ExecuteError::ChannelClosed),
            };
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| ExecuteError::Protocol(e.to_string()));
                }
                Message::Close(_) => return Err(ExecuteError::ChannelClosed),
                // Pings are answered by tungstenite; binary frames carry
                // buffers for comm traffic we never request.
                _ => continue,
            }
        }
    }
}

impl KernelConnection for GatewayConnection {
    async fn execute(
        &mut self,
        code: &str,
        on_output: &mut dyn FnMut(OutputData),
    ) -> Result<ExecutionSummary, ExecuteError> {
        let (msg_id, request) = execute_request(&self.session_id, code);
        self.ws
            .send(Message::Text(request.to_string()))
            .await
            .map_err(|e| ExecuteError::Transport(e.to_string()))?;
        debug!("[gateway] Sent execute_request: msg_id={}", msg_id);

        let mut pending = PendingExecution::default();
        loop {
            let message = self.next_message().await?;
            if message.parent_msg_id() != Some(msg_id.as_str()) {
                debug!(
                    "[gateway] Ignoring {} for another request",
                    message.header.msg_type
                );
                continue;
            }
            if let Some(output) = pending.observe(message)? {
                on_output(output);
            }
            if let Some(summary) = pending.finished() {
                return Ok(summary);
            }
        }
    }

    /// Close the channel, then ask the gateway to shut the kernel down.
    async fn close(mut self) {
        if let Err(e) = self.ws.close(None).await {
            warn!("[gateway] Failed to close channel for kernel {}: {}", self.kernel_id, e);
        }
        let path = format!("kernels/{}", self.kernel_id);
        let request = self
            .endpoint
            .authorize(self.http.delete(self.endpoint.api(&path)));
        match request.send().await {
            Ok(_) => info!("[gateway] Closed kernel {}", self.kernel_id),
            Err(e) => warn!("[gateway] Failed to delete kernel {}: {}", self.kernel_id, e),
        }
    }
}
