//! The client's view of the gateway process.

use std::collections::VecDeque;

use kernel_gateway::extract_gateway_uri;
use log::info;

#[derive(Debug, Clone)]
pub struct KernelProcessState {
    pid: Option<u32>,
    uri: Option<String>,
    stdout: VecDeque<String>,
    history: usize,
    marker: String,
    last_error: Option<String>,
    client_ready: bool,
}

impl KernelProcessState {
    /// Keeps the last `history` stdout lines and looks for `marker` in them.
    pub fn new(history: usize, marker: impl Into<String>) -> Self {
        Self {
            pid: None,
            uri: None,
            stdout: VecDeque::with_capacity(history.min(1024)),
            history,
            marker: marker.into(),
            last_error: None,
            client_ready: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Gateway URI found in stdout, if any.
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn stdout(&self) -> impl Iterator<Item = &str> {
        self.stdout.iter().map(String::as_str)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_client_ready(&self) -> bool {
        self.client_ready
    }

    /// Readiness only ever goes from false to true.
    pub fn mark_ready(&mut self) {
        self.client_ready = true;
    }

    /// A gateway started. Everything learned about a previous one is dropped;
    /// a repeated start for the same pid changes nothing.
    pub fn on_start(&mut self, pid: u32) {
        if self.pid == Some(pid) {
            return;
        }
        self.pid = Some(pid);
        self.uri = None;
        self.stdout.clear();
        self.last_error = None;
    }

    pub fn on_end(&mut self) {
        self.pid = None;
        self.uri = None;
    }

    /// Record a line. Returns the gateway URI if this line revealed it.
    pub fn on_stdout(&mut self, line: String) -> Option<&str> {
        let discovered = if self.uri.is_none() {
            Some(extract_gateway_uri(&line, &self.marker)).filter(|uri| !uri.is_empty())
        } else {
            None
        };

        if self.history > 0 {
            if self.stdout.len() == self.history {
                self.stdout.pop_front();
            }
            self.stdout.push_back(line);
        }

        let uri = discovered?;
        info!("[notebook] Gateway URI: {}", uri);
        self.uri = Some(uri);
        self.uri.as_deref()
    }

    pub fn on_error(&mut self, message: String) {
        self.last_error = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(history: usize) -> KernelProcessState {
        KernelProcessState::new(history, "http://")
    }

    #[test]
    fn test_history_keeps_last_lines() {
        let mut kernel = state(2);
        for line in ["a", "b", "c"] {
            kernel.on_stdout(line.to_string());
        }
        assert_eq!(kernel.stdout().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_first_uri_wins() {
        let mut kernel = state(10);
        assert_eq!(kernel.on_stdout("booting".into()), None);
        assert_eq!(
            kernel.on_stdout("[KernelGatewayApp] at http://127.0.0.1:8888 ok".into()),
            Some("http://127.0.0.1:8888")
        );
        assert_eq!(kernel.on_stdout("see http://docs.example/help".into()), None);
        assert_eq!(kernel.uri(), Some("http://127.0.0.1:8888"));
    }

    #[test]
    fn test_new_start_replaces_previous_instance() {
        let mut kernel = state(10);
        kernel.on_start(1);
        kernel.on_stdout("http://127.0.0.1:1".into());
        kernel.on_error("boom".into());

        kernel.on_end();
        assert_eq!(kernel.pid(), None);
        assert_eq!(kernel.uri(), None);

        kernel.on_start(2);
        assert_eq!(kernel.pid(), Some(2));
        assert_eq!(kernel.stdout().count(), 0);
        assert_eq!(kernel.last_error(), None);
    }

    #[test]
    fn test_duplicate_start_keeps_state() {
        let mut kernel = state(10);
        kernel.on_start(7);
        kernel.on_stdout("http://127.0.0.1:7".into());
        kernel.on_start(7);
        assert_eq!(kernel.uri(), Some("http://127.0.0.1:7"));
    }

    #[test]
    fn test_ready_is_monotonic() {
        let mut kernel = state(1);
        kernel.mark_ready();
        kernel.on_end();
        kernel.on_start(3);
        assert!(kernel.is_client_ready());
    }
}
