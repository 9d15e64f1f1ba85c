//! Collaborative notebook client.
//!
//! Holds one participant's view of a shared notebook: ordered cells, the
//! cell lock table, the orchestrator-reported gateway process and the
//! per-run execution outputs. Acknowledgements arrive from an external
//! synchronisation layer and are applied by the same reducer for every
//! participant, so all views converge on the same lock holders.
//!
//! [`NotebookClient`] drives the kernel side: it consumes orchestrator
//! channel messages, connects to the discovered gateway and executes cells.

pub mod cell;
pub mod client;
pub mod config;
pub mod kernel_state;
pub mod locks;
pub mod outputs;
pub mod participant;
pub mod state;

pub use cell::{Cell, CellId, CellLanguage, CellPatch, NEVER_RUN};
pub use client::NotebookClient;
pub use config::{ClientConfig, DEFAULT_STDOUT_HISTORY};
pub use kernel_state::KernelProcessState;
pub use locks::{LockConflict, LockState, LockTable};
pub use outputs::{OutputKey, OutputStore};
pub use participant::{Participant, ParticipantId};
pub use state::{
    Ack, AddCellAck, ConnectionStatus, DeleteCellAck, EditCellAck, ExecutionAck,
    ExecutionTicket, Failure, InFlight, Intent, LockAck, NotebookError, NotebookState,
};
