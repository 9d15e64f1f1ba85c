//! Notebook orchestrator.
//!
//! Owns the kernel host, relays its lifecycle and stdout to the notebook
//! client, and tears the gateway process tree down on exit.
//!
//! - [`state`]: pure relay state (readiness gate, stdout queue)
//! - [`relay`]: the async event loop around it
//! - [`shutdown`]: graceful-then-forceful process tree teardown
//! - [`bridge`]: client channels over length-prefixed frames
//! - [`config`]: `notebookd` configuration

pub mod bridge;
pub mod config;
pub mod relay;
pub mod shutdown;
pub mod state;

pub use config::{default_config_path, ConfigError, OrchestratorConfig};
pub use relay::Orchestrator;
pub use shutdown::{
    terminate_tree, ProcessTree, ShutdownError, SignalFailure, StopSignal, SystemProcessTree,
    TerminationOutcome,
};
pub use state::{client_event, handle_event, OrchestratorEvent, OrchestratorState};
