//! Async driver pairing a [`NotebookState`] with a live kernel connection.

use kernel_gateway::{
    Connector, ExecuteError, ExecutionSummary, GatewayClient, KernelConnection, OutputData,
};
use kernel_ipc::{ChannelMessage, KernelProcessMessage};
use log::{info, warn};

use crate::config::ClientConfig;
use crate::participant::Participant;
use crate::state::{ConnectionStatus, NotebookError, NotebookState};

pub struct NotebookClient<C: Connector> {
    state: NotebookState,
    connector: C,
    connection: Option<C::Connection>,
}

impl NotebookClient<GatewayClient> {
    /// A client that connects to a real kernel gateway.
    pub fn gateway(me: Participant, config: &ClientConfig) -> Self {
        Self::new(me, config, GatewayClient::new(config.kernel_name.clone()))
    }
}

impl<C: Connector> NotebookClient<C> {
    pub fn new(me: Participant, config: &ClientConfig, connector: C) -> Self {
        Self {
            state: NotebookState::new(me, config),
            connector,
            connection: None,
        }
    }

    pub fn state(&self) -> &NotebookState {
        &self.state
    }

    /// Cell, lock and acknowledgement transitions go straight to the state.
    pub fn state_mut(&mut self) -> &mut NotebookState {
        &mut self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Mark this client ready and build the message announcing it.
    pub fn ready_message(&mut self) -> ChannelMessage {
        self.state.mark_ready();
        ChannelMessage::KernelProcess(KernelProcessMessage::Ready)
    }

    /// Apply a message received from the orchestrator. A connection to a
    /// gateway that has ended is closed here.
    pub async fn handle_channel_message(&mut self, message: ChannelMessage) {
        match message {
            ChannelMessage::KernelProcess(message) => {
                self.state.apply_kernel_message(message);
                if self.state.connection() == ConnectionStatus::Disconnected {
                    if let Some(connection) = self.connection.take() {
                        info!("[notebook] Closing kernel connection to a gone gateway");
                        connection.close().await;
                    }
                }
            }
            ChannelMessage::LoginRedirect(redirect) => self.state.apply_login_redirect(redirect),
            ChannelMessage::MainToKernel(message) => {
                warn!("[notebook] Ignoring main-to-kernel message {:?}", message);
            }
        }
    }

    /// Connect to the gateway at the discovered URI. One attempt; a failure
    /// is recorded on the state and returned.
    pub async fn connect_kernel(&mut self) -> Result<(), NotebookError> {
        let uri = self.state.begin_connect()?;
        info!("[notebook] Connecting to kernel gateway at {}", uri);

        match self.connector.connect(&uri).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state.connect_succeeded();
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.state.connect_failed(message.clone());
                Err(NotebookError::Connection(message))
            }
        }
    }

    /// Run a code cell, storing its outputs under a fresh run index.
    pub async fn execute_cell(&mut self, cell_id: &str) -> Result<ExecutionSummary, NotebookError> {
        let ticket = self.state.begin_execution(cell_id)?;

        let Some(connection) = self.connection.as_mut() else {
            let reason = NotebookError::NotConnected.to_string();
            self.state.abort_execution(&ticket.cell_id, ticket.run_index, reason);
            return Err(NotebookError::NotConnected);
        };

        let state = &mut self.state;
        let mut on_output = |data: OutputData| {
            if let Err(e) = state.record_output(&ticket.cell_id, ticket.run_index, data) {
                warn!("[notebook] Dropping output: {}", e);
            }
        };
        let result = connection.execute(&ticket.code, &mut on_output).await;

        match result {
            Ok(summary) => {
                self.state
                    .finish_execution(&ticket.cell_id, ticket.run_index, summary.status)?;
                Ok(summary)
            }
            Err(err @ (ExecuteError::ChannelClosed | ExecuteError::Transport(_))) => {
                let reason = err.to_string();
                if let Some(connection) = self.connection.take() {
                    connection.close().await;
                }
                self.state.connection_lost(reason.clone());
                Err(NotebookError::Execution(reason))
            }
            Err(err) => {
                let reason = err.to_string();
                self.state
                    .abort_execution(&ticket.cell_id, ticket.run_index, reason.clone());
                Err(NotebookError::Execution(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use kernel_gateway::{ConnectStage, ConnectionError, ExecutionStatus};

    use super::*;
    use crate::cell::{Cell, CellLanguage};
    use crate::state::{Ack, AddCellAck};
    use crate::participant::ParticipantId;

    /// Replays one scripted result per execute call.
    struct FakeConnection {
        runs: VecDeque<Result<Vec<OutputData>, ExecuteError>>,
        closed: Arc<AtomicUsize>,
    }

    impl KernelConnection for FakeConnection {
        async fn execute(
            &mut self,
            _code: &str,
            on_output: &mut dyn FnMut(OutputData),
        ) -> Result<ExecutionSummary, ExecuteError> {
            let outputs = self.runs.pop_front().unwrap_or(Err(ExecuteError::ChannelClosed))?;
            let status = if outputs.iter().any(OutputData::is_error) {
                ExecutionStatus::Error
            } else {
                ExecutionStatus::Ok
            };
            for output in outputs {
                on_output(output);
            }
            Ok(ExecutionSummary {
                status,
                execution_count: None,
            })
        }

        async fn close(self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        refuse: bool,
        runs: Vec<Result<Vec<OutputData>, ExecuteError>>,
        closed: Arc<AtomicUsize>,
    }

    impl Connector for FakeConnector {
        type Connection = FakeConnection;

        async fn connect(&self, _uri: &str) -> Result<FakeConnection, ConnectionError> {
            if self.refuse {
                return Err(ConnectionError {
                    stage: ConnectStage::KernelSpecs,
                    message: "Connection refused".into(),
                });
            }
            let runs = self
                .runs
                .iter()
                .map(|run| match run {
                    Ok(outputs) => Ok(outputs.clone()),
                    Err(_) => Err(ExecuteError::ChannelClosed),
                })
                .collect();
            Ok(FakeConnection {
                runs,
                closed: self.closed.clone(),
            })
        }
    }

    fn text(s: &str) -> OutputData {
        OutputData::Text {
            name: "stdout".into(),
            text: s.into(),
        }
    }

    fn client(connector: FakeConnector) -> NotebookClient<FakeConnector> {
        let me = Participant::named(ParticipantId::new("me"), "me");
        let mut client = NotebookClient::new(me, &ClientConfig::default(), connector);
        client.state_mut().confirm_add_cell(Ack::new(
            ParticipantId::new("other"),
            AddCellAck {
                cell: Cell {
                    content: "print(1)".into(),
                    ..Cell::with_id("a", CellLanguage::Code)
                },
                index: -1,
            },
        ));
        client
    }

    async fn announce_gateway(client: &mut NotebookClient<FakeConnector>) {
        for message in [
            KernelProcessMessage::Start { pid: 42 },
            KernelProcessMessage::stdout("listening at http://127.0.0.1:8888"),
        ] {
            client
                .handle_channel_message(ChannelMessage::KernelProcess(message))
                .await;
        }
    }

    #[tokio::test]
    async fn test_connect_needs_discovered_uri() {
        let mut client = client(FakeConnector::default());
        assert_eq!(
            client.connect_kernel().await,
            Err(NotebookError::NoGatewayUri)
        );

        announce_gateway(&mut client).await;
        client.connect_kernel().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.state().connection(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported_once() {
        let mut client = client(FakeConnector {
            refuse: true,
            ..Default::default()
        });
        announce_gateway(&mut client).await;

        assert_eq!(
            client.connect_kernel().await,
            Err(NotebookError::Connection("Connection refused".into()))
        );
        assert!(!client.is_connected());
        assert_eq!(client.state().last_error(), Some("Connection refused"));
        assert_eq!(client.state().connection(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_execute_streams_outputs_into_run() {
        let mut client = client(FakeConnector {
            refuse: false,
            runs: vec![Ok(vec![text("1\n")]), Ok(vec![text("2\n"), text("3\n")])],
            ..Default::default()
        });
        announce_gateway(&mut client).await;
        client.connect_kernel().await.unwrap();

        client.execute_cell("a").await.unwrap();
        let first = client.state().cell("a").unwrap().run_index;
        client.execute_cell("a").await.unwrap();
        let second = client.state().cell("a").unwrap().run_index;

        assert!(second > first);
        assert_eq!(client.state().outputs_for("a", first), vec![&text("1\n")]);
        assert_eq!(
            client.state().outputs_for("a", second),
            vec![&text("2\n"), &text("3\n")]
        );
        assert!(!client.state().is_running("a"));
    }

    #[tokio::test]
    async fn test_closed_channel_drops_connection() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut client = client(FakeConnector {
            runs: vec![Err(ExecuteError::ChannelClosed)],
            closed: closed.clone(),
            ..Default::default()
        });
        announce_gateway(&mut client).await;
        client.connect_kernel().await.unwrap();

        let err = client.execute_cell("a").await.unwrap_err();
        assert_eq!(err, NotebookError::Execution("Kernel channel closed".into()));
        assert!(!client.is_connected());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(!client.state().is_running("a"));
        assert_eq!(client.state().cell("a").unwrap().run_index, -1);
    }

    #[tokio::test]
    async fn test_gateway_end_closes_connection() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut client = client(FakeConnector {
            closed: closed.clone(),
            ..Default::default()
        });
        announce_gateway(&mut client).await;
        client.connect_kernel().await.unwrap();

        let end = ChannelMessage::KernelProcess(KernelProcessMessage::End);
        client.handle_channel_message(end.clone()).await;
        assert!(!client.is_connected());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // A repeated end finds nothing left to close.
        client.handle_channel_message(end).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(
            client.execute_cell("a").await,
            Err(NotebookError::NotConnected)
        );
    }

    #[test]
    fn test_ready_message_marks_state() {
        let mut client = client(FakeConnector::default());
        assert_eq!(
            client.ready_message(),
            ChannelMessage::KernelProcess(KernelProcessMessage::Ready)
        );
        assert!(client.state().kernel().is_client_ready());
    }
}
