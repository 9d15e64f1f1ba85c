//! Payload types for the named channels.
//!
//! Every payload enum carries an `Unknown` catch-all so a peer speaking a newer
//! protocol revision never brings a receiver down: unknown tags decode to
//! `Unknown` and receivers log and drop them.

use serde::{Deserialize, Serialize};

/// Payloads on the `kernel-process` channel.
///
/// The kernel host sends `start`, `end`, `stdout` and `error`; the client sends
/// `ready` once it can receive messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum KernelProcessMessage {
    /// The client is attached and ready to receive messages.
    Ready,
    /// The gateway process started with this pid.
    Start { pid: u32 },
    /// The gateway process exited.
    End,
    /// One line of gateway stdout, verbatim.
    Stdout { message: String },
    /// The gateway could not be spawned.
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl KernelProcessMessage {
    pub fn stdout(message: impl Into<String>) -> Self {
        KernelProcessMessage::Stdout {
            message: message.into(),
        }
    }
}

/// Payloads on the `main-to-kernel` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MainToKernel {
    /// Ask the kernel host to stop its loop and release the gateway process.
    RequestClose,
    #[serde(other)]
    Unknown,
}

/// Payloads on the `login-redirect` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LoginRedirect {
    Success { url: String },
    #[serde(other)]
    Unknown,
}

/// Envelope naming the channel a payload travels on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "payload", rename_all = "kebab-case")]
pub enum ChannelMessage {
    KernelProcess(KernelProcessMessage),
    MainToKernel(MainToKernel),
    LoginRedirect(LoginRedirect),
}

impl ChannelMessage {
    /// Wire name of the channel.
    pub fn channel(&self) -> &'static str {
        match self {
            ChannelMessage::KernelProcess(_) => "kernel-process",
            ChannelMessage::MainToKernel(_) => "main-to-kernel",
            ChannelMessage::LoginRedirect(_) => "login-redirect",
        }
    }
}

impl From<KernelProcessMessage> for ChannelMessage {
    fn from(msg: KernelProcessMessage) -> Self {
        ChannelMessage::KernelProcess(msg)
    }
}

impl From<LoginRedirect> for ChannelMessage {
    fn from(msg: LoginRedirect) -> Self {
        ChannelMessage::LoginRedirect(msg)
    }
}
