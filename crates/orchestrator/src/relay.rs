//! The orchestrator event loop.
//!
//! Owns the kernel host and the relay state. Every input (host event, client
//! message, login redirect) goes through [`handle_event`]; whatever it returns
//! is sent to the client in order. On shutdown the gateway tree is stopped
//! before the host is closed and joined.

use std::future::Future;

use kernel_host::{HostHandle, KernelHost};
use kernel_ipc::ChannelMessage;
use log::{debug, info};
use tokio::sync::mpsc;

use crate::config::OrchestratorConfig;
use crate::shutdown::{
    terminate_tree, ProcessTree, ShutdownError, SystemProcessTree, TerminationOutcome,
};
use crate::state::{handle_event, OrchestratorEvent, OrchestratorState};

pub struct Orchestrator<T = SystemProcessTree> {
    config: OrchestratorConfig,
    state: OrchestratorState,
    tree: T,
}

impl Orchestrator<SystemProcessTree> {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_process_tree(config, SystemProcessTree)
    }
}

impl<T: ProcessTree> Orchestrator<T> {
    pub fn with_process_tree(config: OrchestratorConfig, tree: T) -> Self {
        Self {
            config,
            state: OrchestratorState::new(),
            tree,
        }
    }

    /// Spawn the gateway and relay until `shutdown` resolves or `inbound`
    /// closes, then tear the gateway down.
    ///
    /// `outbound` is dropped on return, after the final `end` has been sent.
    pub async fn run<F>(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<OrchestratorEvent>,
        outbound: mpsc::UnboundedSender<ChannelMessage>,
        shutdown: F,
    ) -> Result<TerminationOutcome, ShutdownError>
    where
        F: Future<Output = ()>,
    {
        info!(
            "[orchestrator] Starting gateway: {} {}",
            self.config.gateway.command,
            self.config.gateway.args.join(" ")
        );
        let mut host = KernelHost::spawn(self.config.gateway.clone());
        let mut host_running = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[orchestrator] Shutdown requested");
                    break;
                }
                event = host.next_event(), if host_running => match event {
                    Some(event) => self.dispatch(OrchestratorEvent::Kernel(event), &outbound),
                    None => {
                        debug!("[orchestrator] Kernel host finished");
                        host_running = false;
                    }
                },
                event = inbound.recv() => match event {
                    Some(event) => self.dispatch(event, &outbound),
                    None => {
                        info!("[orchestrator] Client disconnected; shutting down");
                        break;
                    }
                },
            }
        }

        self.shutdown(host, &outbound).await
    }

    async fn shutdown(
        &mut self,
        host: HostHandle,
        outbound: &mpsc::UnboundedSender<ChannelMessage>,
    ) -> Result<TerminationOutcome, ShutdownError> {
        let grace = self.config.shutdown_grace();
        let result = match self.state.kernel_pid() {
            Some(pid) => terminate_tree(&self.tree, pid, grace, self.config.shutdown_poll()).await,
            None => Ok(TerminationOutcome::AlreadyExited),
        };

        for event in host.close(grace).await {
            self.dispatch(OrchestratorEvent::Kernel(event), outbound);
        }
        info!("[orchestrator] Shutdown complete: {:?}", result);
        result
    }

    fn dispatch(
        &mut self,
        event: OrchestratorEvent,
        outbound: &mpsc::UnboundedSender<ChannelMessage>,
    ) {
        for message in handle_event(&mut self.state, event) {
            if outbound.send(message).is_err() {
                debug!("[orchestrator] Client channel closed; dropping output");
                break;
            }
        }
    }
}
