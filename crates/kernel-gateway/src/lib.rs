//! Connection adapter for a Jupyter kernel gateway.
//!
//! The gateway announces itself on stdout; [`uri::extract_gateway_uri`] turns
//! that log line into a connection URI. [`GatewayClient`] then negotiates a
//! kernel session over HTTP and opens the streaming channel, yielding a
//! [`GatewayConnection`] that executes code and streams outputs.
//!
//! Retry policy is the caller's: every failure here is reported once.

pub mod client;
pub mod connection;
pub mod output;
pub mod uri;

pub use client::{ConnectStage, ConnectionError, GatewayClient};
pub use connection::{ExecuteError, ExecutionStatus, ExecutionSummary, GatewayConnection};
pub use output::OutputData;
pub use uri::{extract_gateway_uri, websocket_uri, DEFAULT_URI_MARKER};

/// Something that executes code on a kernel and streams its outputs.
#[allow(async_fn_in_trait)]
pub trait KernelConnection {
    /// Execute `code`, passing every output fragment to `on_output` in
    /// arrival order. Resolves once the kernel reports the request finished.
    async fn execute(
        &mut self,
        code: &str,
        on_output: &mut dyn FnMut(OutputData),
    ) -> Result<ExecutionSummary, ExecuteError>;

    /// Release the connection and the kernel behind it. Failures are logged.
    async fn close(self);
}

/// Something that turns a gateway URI into a live [`KernelConnection`].
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Connection: KernelConnection;

    async fn connect(&self, uri: &str) -> Result<Self::Connection, ConnectionError>;
}
