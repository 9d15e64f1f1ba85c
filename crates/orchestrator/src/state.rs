//! Relay state between the kernel host and the client.
//!
//! All of it lives in [`OrchestratorState`] and changes only through
//! [`handle_event`], which returns the messages to forward to the client.
//! The async loop in [`crate::relay`] owns the state and does the I/O.

use std::collections::VecDeque;

use kernel_ipc::{ChannelMessage, KernelProcessMessage, LoginRedirect};
use log::{debug, info, warn};

/// One input to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// The client attached and can receive messages.
    ClientReady,
    /// Lifecycle or output from the kernel host.
    Kernel(KernelProcessMessage),
    /// A login redirect arrived from outside (deep link, browser callback).
    LoginRedirect { url: String },
}

#[derive(Debug, Default)]
pub struct OrchestratorState {
    kernel_pid: Option<u32>,
    client_ready: bool,
    /// Stdout lines received while the client was not ready, in arrival order.
    pending: VecDeque<String>,
    /// Last spawn failure; replayed on ready when no gateway is running.
    last_error: Option<String>,
    /// Latest login redirect not yet delivered.
    login_url: Option<String>,
}

impl OrchestratorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel_pid(&self) -> Option<u32> {
        self.kernel_pid
    }

    pub fn is_client_ready(&self) -> bool {
        self.client_ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Mark the client ready and bring it up to date.
    ///
    /// Emits a synthetic `start` for a known pid, then drains the queue. A
    /// repeated ready repeats the synthetic `start` only.
    pub fn report_ready(&mut self) -> Vec<ChannelMessage> {
        let mut out = Vec::new();
        if self.client_ready {
            debug!("[orchestrator] Client reported ready again");
        }
        self.client_ready = true;

        match (self.kernel_pid, &self.last_error) {
            (Some(pid), _) => out.push(KernelProcessMessage::Start { pid }.into()),
            (None, Some(message)) => out.push(
                KernelProcessMessage::Error {
                    message: message.clone(),
                }
                .into(),
            ),
            (None, None) => {}
        }
        self.flush(&mut out);

        if let Some(url) = self.login_url.take() {
            out.push(LoginRedirect::Success { url }.into());
        }
        out
    }

    pub fn report_kernel_event(&mut self, event: KernelProcessMessage) -> Vec<ChannelMessage> {
        let mut out = Vec::new();
        match event {
            KernelProcessMessage::Start { pid } => match self.kernel_pid {
                None => {
                    info!("[orchestrator] Gateway started: pid={}", pid);
                    self.kernel_pid = Some(pid);
                    self.last_error = None;
                    if self.client_ready {
                        out.push(KernelProcessMessage::Start { pid }.into());
                    }
                }
                Some(current) if current == pid => {
                    debug!("[orchestrator] Duplicate start for pid {}", pid);
                }
                Some(current) => {
                    warn!(
                        "[orchestrator] Protocol inconsistency: start for pid {} \
                         while pid {} is live; ignoring",
                        pid, current
                    );
                }
            },
            KernelProcessMessage::End => {
                info!("[orchestrator] Gateway ended: pid={:?}", self.kernel_pid);
                self.kernel_pid = None;
                if !self.pending.is_empty() {
                    debug!(
                        "[orchestrator] Dropping {} queued lines from the ended gateway",
                        self.pending.len()
                    );
                    self.pending.clear();
                }
                // Forwarded even before ready.
                out.push(KernelProcessMessage::End.into());
            }
            KernelProcessMessage::Stdout { message } => {
                if self.client_ready {
                    self.flush(&mut out);
                    out.push(KernelProcessMessage::Stdout { message }.into());
                } else {
                    self.pending.push_back(message);
                }
            }
            KernelProcessMessage::Error { message } => {
                warn!("[orchestrator] Gateway error: {}", message);
                self.last_error = Some(message.clone());
                if self.client_ready {
                    out.push(KernelProcessMessage::Error { message }.into());
                }
            }
            KernelProcessMessage::Ready => {
                warn!("[orchestrator] Ignoring ready from the kernel host");
            }
            KernelProcessMessage::Unknown => {
                warn!("[orchestrator] Ignoring unknown kernel-process message");
            }
        }
        out
    }

    pub fn report_login_redirect(&mut self, url: String) -> Vec<ChannelMessage> {
        if self.client_ready {
            vec![LoginRedirect::Success { url }.into()]
        } else {
            debug!("[orchestrator] Holding login redirect until the client is ready");
            self.login_url = Some(url);
            Vec::new()
        }
    }

    fn flush(&mut self, out: &mut Vec<ChannelMessage>) {
        out.extend(
            self.pending
                .drain(..)
                .map(|message| KernelProcessMessage::Stdout { message }.into()),
        );
    }
}

/// Apply one event and return what the client should receive, in order.
pub fn handle_event(
    state: &mut OrchestratorState,
    event: OrchestratorEvent,
) -> Vec<ChannelMessage> {
    match event {
        OrchestratorEvent::ClientReady => state.report_ready(),
        OrchestratorEvent::Kernel(event) => state.report_kernel_event(event),
        OrchestratorEvent::LoginRedirect { url } => state.report_login_redirect(url),
    }
}

/// Translate a message from the client into a relay event.
///
/// Only `kernel-process: ready` and `login-redirect: success` mean anything
/// coming from that side; everything else is dropped.
pub fn client_event(message: ChannelMessage) -> Option<OrchestratorEvent> {
    match message {
        ChannelMessage::KernelProcess(KernelProcessMessage::Ready) => {
            Some(OrchestratorEvent::ClientReady)
        }
        ChannelMessage::LoginRedirect(LoginRedirect::Success { url }) => {
            Some(OrchestratorEvent::LoginRedirect { url })
        }
        other => {
            warn!(
                "[orchestrator] Ignoring unexpected {} message from client",
                other.channel()
            );
            None
        }
    }
}
