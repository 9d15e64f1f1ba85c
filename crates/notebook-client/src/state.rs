//! Notebook state: cells, locks, kernel status and executions.
//!
//! Local commands (`request_*`) apply optimistically where that is safe and
//! mark an in-flight intent. Authoritative acknowledgements (`confirm_*`,
//! [`NotebookState::fail`]) may originate from any participant: the data change
//! is always applied, but only an acknowledgement originating from the local
//! participant clears the local in-flight flag.
//!
//! Every mutating transition ends with [`NotebookState::enforce_invariants`],
//! which cascades cell removal into the lock table, the outputs and the
//! running markers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use kernel_gateway::{ExecutionStatus, OutputData};
use kernel_ipc::{KernelProcessMessage, LoginRedirect};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellId, CellLanguage, CellPatch};
use crate::config::ClientConfig;
use crate::kernel_state::KernelProcessState;
use crate::locks::{LockConflict, LockState, LockTable};
use crate::outputs::{OutputKey, OutputStore};
use crate::participant::{Participant, ParticipantId};

/// First run index handed out in a fresh notebook.
const FIRST_RUN_INDEX: i64 = 1;

/// Kinds of participant action that wait for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    Lock,
    Unlock,
    AddCell,
    DeleteCell,
    EditCell,
    Execute,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::Lock => "lock",
            Intent::Unlock => "unlock",
            Intent::AddCell => "add-cell",
            Intent::DeleteCell => "delete-cell",
            Intent::EditCell => "edit-cell",
            Intent::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Intents this participant has dispatched and not yet seen acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlight {
    pending: BTreeSet<Intent>,
}

impl InFlight {
    pub fn is_pending(&self, intent: Intent) -> bool {
        self.pending.contains(&intent)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn set(&mut self, intent: Intent) {
        self.pending.insert(intent);
    }

    fn clear(&mut self, intent: Intent) {
        self.pending.remove(&intent);
    }
}

/// An authoritative acknowledgement and the participant whose action it
/// confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack<T> {
    pub origin: ParticipantId,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> Ack<T> {
    pub fn new(origin: ParticipantId, payload: T) -> Self {
        Self { origin, payload }
    }
}

/// Payload of lock and unlock acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAck {
    pub cell_id: CellId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCellAck {
    pub cell: Cell,
    /// Insert position; `-1` or out of range appends.
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCellAck {
    pub cell_id: CellId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditCellAck {
    pub cell_id: CellId,
    pub patch: CellPatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAck {
    pub cell_id: CellId,
    pub run_index: i64,
}

/// The authoritative layer refused an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub origin: ParticipantId,
    pub intent: Intent,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// What to run for a reserved execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTicket {
    pub cell_id: CellId,
    pub run_index: i64,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunningExecution {
    run_index: i64,
    next_message_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotebookError {
    #[error("Already holding or acquiring a lock on cell {0}")]
    LockBusy(CellId),

    #[error("Cell {0} not found")]
    CellNotFound(CellId),

    #[error("Cell {cell_id} is locked by {holder}")]
    CellLocked {
        cell_id: CellId,
        holder: ParticipantId,
    },

    #[error("Cell {0} is not locked by you")]
    NotLockHolder(CellId),

    #[error("A {0} request is already in flight")]
    Pending(Intent),

    #[error("Not connected to a kernel")]
    NotConnected,

    #[error("Cell {0} is not a code cell")]
    NotExecutable(CellId),

    #[error("Cell {0} is already running")]
    AlreadyRunning(CellId),

    #[error("Cell {cell_id} has no running execution {run_index}")]
    NotRunning { cell_id: CellId, run_index: i64 },

    #[error("Kernel gateway address not known yet")]
    NoGatewayUri,

    #[error("Already connecting to the kernel")]
    ConnectPending,

    #[error("Already connected to the kernel")]
    AlreadyConnected,

    #[error("{0}")]
    Connection(String),

    #[error("{0}")]
    Execution(String),
}

pub struct NotebookState {
    me: Participant,
    cells: Vec<Cell>,
    locks: LockTable,
    /// Cell this participant is acquiring or holding; at most one.
    locked_cell_id: Option<CellId>,
    in_flight: InFlight,
    /// Optimistic placeholder awaiting its add acknowledgement.
    pending_add: Option<CellId>,
    outputs: OutputStore,
    running: HashMap<CellId, RunningExecution>,
    next_run_index: i64,
    kernel: KernelProcessState,
    connection: ConnectionStatus,
    last_error: Option<String>,
    login_url: Option<String>,
}

impl NotebookState {
    pub fn new(me: Participant, config: &ClientConfig) -> Self {
        Self::from_cells(me, config, Vec::new())
    }

    /// Start from an existing set of cells (a snapshot from the sync layer).
    pub fn from_cells(me: Participant, config: &ClientConfig, cells: Vec<Cell>) -> Self {
        let next_run_index = cells
            .iter()
            .map(|c| c.run_index + 1)
            .max()
            .unwrap_or(FIRST_RUN_INDEX)
            .max(FIRST_RUN_INDEX);
        Self {
            me,
            cells,
            locks: LockTable::new(),
            locked_cell_id: None,
            in_flight: InFlight::default(),
            pending_add: None,
            outputs: OutputStore::new(),
            running: HashMap::new(),
            next_run_index,
            kernel: KernelProcessState::new(config.stdout_history, config.uri_marker.clone()),
            connection: ConnectionStatus::Disconnected,
            last_error: None,
            login_url: None,
        }
    }

    // ---- queries ----------------------------------------------------------

    pub fn me(&self) -> &Participant {
        &self.me
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id)
    }

    pub fn lock_state(&self, cell_id: &str) -> LockState {
        self.locks.state_for(cell_id, &self.me.id)
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn locked_cell_id(&self) -> Option<&str> {
        self.locked_cell_id.as_deref()
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn outputs_for(&self, cell_id: &str, run_index: i64) -> Vec<&OutputData> {
        self.outputs.for_run(cell_id, run_index)
    }

    pub fn outputs(&self) -> &OutputStore {
        &self.outputs
    }

    pub fn is_running(&self, cell_id: &str) -> bool {
        self.running.contains_key(cell_id)
    }

    pub fn next_run_index(&self) -> i64 {
        self.next_run_index
    }

    pub fn kernel(&self) -> &KernelProcessState {
        &self.kernel
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn login_url(&self) -> Option<&str> {
        self.login_url.as_deref()
    }

    fn is_me(&self, origin: &ParticipantId) -> bool {
        *origin == self.me.id
    }

    fn cell_mut(&mut self, cell_id: &str) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.id == cell_id)
    }

    fn insert_at(&mut self, index: i64, cell: Cell) {
        match usize::try_from(index) {
            Ok(i) if i <= self.cells.len() => self.cells.insert(i, cell),
            _ => self.cells.push(cell),
        }
    }

    // ---- locks ------------------------------------------------------------

    pub fn request_lock(&mut self, cell_id: &str) -> Result<(), NotebookError> {
        if let Some(ref held) = self.locked_cell_id {
            return Err(NotebookError::LockBusy(held.clone()));
        }
        if self.cell(cell_id).is_none() {
            return Err(NotebookError::CellNotFound(cell_id.to_string()));
        }
        if let Some(holder) = self.locks.holder(cell_id) {
            return Err(NotebookError::CellLocked {
                cell_id: cell_id.to_string(),
                holder: holder.clone(),
            });
        }
        self.locked_cell_id = Some(cell_id.to_string());
        self.in_flight.set(Intent::Lock);
        Ok(())
    }

    /// Record an authoritative lock. Acks that would give a participant a
    /// second cell, or give me a cell other than the one I am pursuing, are
    /// protocol inconsistencies: logged, and the table is left unchanged.
    pub fn confirm_lock(&mut self, ack: Ack<LockAck>) {
        let Ack {
            origin,
            payload: LockAck { cell_id },
        } = ack;

        if self.is_me(&origin) {
            if let Some(gate) = self.locked_cell_id.as_deref() {
                if gate != cell_id {
                    warn!(
                        "[notebook] Protocol inconsistency: lock ack for {} while pursuing {}",
                        cell_id, gate
                    );
                    return;
                }
            }
        }

        match self.locks.acquire(&cell_id, &origin) {
            Ok(()) => {
                debug!("[notebook] Cell {} locked by {}", cell_id, origin);
                if self.is_me(&origin) {
                    self.locked_cell_id = Some(cell_id);
                    self.in_flight.clear(Intent::Lock);
                }
            }
            Err(LockConflict::CellHeld { held_by }) => {
                warn!(
                    "[notebook] Protocol inconsistency: lock on {} for {} while held by {}",
                    cell_id, origin, held_by
                );
                if self.is_me(&origin) {
                    if self.locked_cell_id.as_deref() == Some(cell_id.as_str()) {
                        self.locked_cell_id = None;
                    }
                    self.in_flight.clear(Intent::Lock);
                    self.last_error = Some(format!("Cell is locked by {}", held_by));
                }
            }
            Err(LockConflict::HolderBusy { cell_id: held }) => {
                warn!(
                    "[notebook] Protocol inconsistency: lock on {} for {} who holds {}",
                    cell_id, origin, held
                );
            }
        }
        self.enforce_invariants();
    }

    pub fn request_unlock(&mut self, cell_id: &str) -> Result<(), NotebookError> {
        if self.lock_state(cell_id) != LockState::LockedByMe {
            return Err(NotebookError::NotLockHolder(cell_id.to_string()));
        }
        if self.in_flight.is_pending(Intent::Unlock) {
            return Err(NotebookError::Pending(Intent::Unlock));
        }
        self.in_flight.set(Intent::Unlock);
        Ok(())
    }

    pub fn confirm_unlock(&mut self, ack: Ack<LockAck>) {
        let Ack {
            origin,
            payload: LockAck { cell_id },
        } = ack;

        if !self.locks.release(&cell_id, &origin) {
            warn!(
                "[notebook] Ignoring unlock of {} by {}: not the holder",
                cell_id, origin
            );
        }
        if self.is_me(&origin) {
            if self.locked_cell_id.as_deref() == Some(cell_id.as_str()) {
                self.locked_cell_id = None;
            }
            self.in_flight.clear(Intent::Unlock);
        }
        self.enforce_invariants();
    }

    /// A participant disconnected; everything it held is released.
    pub fn participant_left(&mut self, participant: &ParticipantId) {
        if self.is_me(participant) {
            warn!("[notebook] Ignoring participant_left for the local participant");
            return;
        }
        let freed = self.locks.release_all(participant);
        if !freed.is_empty() {
            info!(
                "[notebook] {} left; released locks on {:?}",
                participant, freed
            );
        }
        self.enforce_invariants();
    }

    // ---- cells ------------------------------------------------------------

    /// Insert an empty placeholder at `index` (`-1` appends) and return its id.
    pub fn request_add_cell(
        &mut self,
        index: i64,
        language: CellLanguage,
    ) -> Result<CellId, NotebookError> {
        if self.in_flight.is_pending(Intent::AddCell) {
            return Err(NotebookError::Pending(Intent::AddCell));
        }
        let cell = Cell::new(language);
        let cell_id = cell.id.clone();
        self.insert_at(index, cell);
        self.pending_add = Some(cell_id.clone());
        self.in_flight.set(Intent::AddCell);
        Ok(cell_id)
    }

    pub fn confirm_add_cell(&mut self, ack: Ack<AddCellAck>) {
        let Ack {
            origin,
            payload: AddCellAck { cell, index },
        } = ack;

        let cell_id = cell.id.clone();
        if self.cell(&cell_id).is_some() {
            debug!("[notebook] Cell {} already present", cell_id);
        } else {
            self.insert_at(index, cell);
        }
        if self.is_me(&origin) {
            if self.pending_add.as_deref() == Some(cell_id.as_str()) {
                self.pending_add = None;
            }
            self.in_flight.clear(Intent::AddCell);
        }
        self.enforce_invariants();
    }

    /// Ask for `cell_id` to be deleted. The cell stays until confirmed.
    pub fn request_delete_cell(&mut self, cell_id: &str) -> Result<(), NotebookError> {
        if self.cell(cell_id).is_none() {
            return Err(NotebookError::CellNotFound(cell_id.to_string()));
        }
        if let LockState::LockedByOther { holder } = self.lock_state(cell_id) {
            return Err(NotebookError::CellLocked {
                cell_id: cell_id.to_string(),
                holder,
            });
        }
        if self.in_flight.is_pending(Intent::DeleteCell) {
            return Err(NotebookError::Pending(Intent::DeleteCell));
        }
        self.in_flight.set(Intent::DeleteCell);
        Ok(())
    }

    /// Remove the cell; its lock, outputs and running marker go with it.
    /// Deleting an absent cell changes nothing.
    pub fn confirm_delete_cell(&mut self, ack: Ack<DeleteCellAck>) {
        let Ack {
            origin,
            payload: DeleteCellAck { cell_id },
        } = ack;

        let before = self.cells.len();
        self.cells.retain(|c| c.id != cell_id);
        if self.cells.len() == before {
            debug!("[notebook] Cell {} already deleted", cell_id);
        }
        if self.is_me(&origin) {
            self.in_flight.clear(Intent::DeleteCell);
        }
        self.enforce_invariants();
    }

    /// Merge `patch` into a cell this participant holds the lock on.
    pub fn request_edit_cell(
        &mut self,
        cell_id: &str,
        patch: &CellPatch,
    ) -> Result<(), NotebookError> {
        if self.cell(cell_id).is_none() {
            return Err(NotebookError::CellNotFound(cell_id.to_string()));
        }
        if self.lock_state(cell_id) != LockState::LockedByMe {
            return Err(NotebookError::NotLockHolder(cell_id.to_string()));
        }
        if let Some(cell) = self.cell_mut(cell_id) {
            patch.apply(cell);
        }
        self.in_flight.set(Intent::EditCell);
        Ok(())
    }

    pub fn confirm_edit_cell(&mut self, ack: Ack<EditCellAck>) {
        let Ack {
            origin,
            payload: EditCellAck { cell_id, patch },
        } = ack;

        match self.cell_mut(&cell_id) {
            Some(cell) => patch.apply(cell),
            None => debug!("[notebook] Edit for missing cell {}", cell_id),
        }
        if self.is_me(&origin) {
            self.in_flight.clear(Intent::EditCell);
        }
        self.enforce_invariants();
    }

    /// The authoritative layer refused an action. Only this participant's own
    /// failures change anything: the intent's flag is cleared, the reason
    /// recorded, and an optimistic add rolled back.
    pub fn fail(&mut self, failure: Failure) {
        let Failure {
            origin,
            intent,
            reason,
        } = failure;

        if !self.is_me(&origin) {
            debug!("[notebook] {} failed for {}: {}", intent, origin, reason);
            return;
        }
        warn!("[notebook] {} rejected: {}", intent, reason);
        self.in_flight.clear(intent);

        match intent {
            Intent::Lock => {
                if self.locks.held_by(&self.me.id).is_none() {
                    self.locked_cell_id = None;
                }
            }
            Intent::AddCell => {
                if let Some(placeholder) = self.pending_add.take() {
                    self.cells.retain(|c| c.id != placeholder);
                }
            }
            Intent::Unlock | Intent::DeleteCell | Intent::EditCell | Intent::Execute => {}
        }
        self.last_error = Some(reason);
        self.enforce_invariants();
    }

    // ---- execution --------------------------------------------------------

    /// Reserve the next run index for `cell_id` and mark it running.
    pub fn begin_execution(&mut self, cell_id: &str) -> Result<ExecutionTicket, NotebookError> {
        if self.connection != ConnectionStatus::Connected {
            return Err(NotebookError::NotConnected);
        }
        let cell = self
            .cell(cell_id)
            .ok_or_else(|| NotebookError::CellNotFound(cell_id.to_string()))?;
        if !cell.is_executable() {
            return Err(NotebookError::NotExecutable(cell_id.to_string()));
        }
        if self.running.contains_key(cell_id) {
            return Err(NotebookError::AlreadyRunning(cell_id.to_string()));
        }
        let code = cell.content.clone();

        let run_index = self.next_run_index;
        self.next_run_index += 1;
        self.running.insert(
            cell_id.to_string(),
            RunningExecution {
                run_index,
                next_message_index: 0,
            },
        );
        self.in_flight.set(Intent::Execute);
        debug!("[notebook] Executing {} as run {}", cell_id, run_index);

        Ok(ExecutionTicket {
            cell_id: cell_id.to_string(),
            run_index,
            code,
        })
    }

    /// Append an output of a running execution under the next message index.
    pub fn record_output(
        &mut self,
        cell_id: &str,
        run_index: i64,
        data: OutputData,
    ) -> Result<u64, NotebookError> {
        let running = self
            .running
            .get_mut(cell_id)
            .filter(|r| r.run_index == run_index)
            .ok_or_else(|| NotebookError::NotRunning {
                cell_id: cell_id.to_string(),
                run_index,
            })?;
        let message_index = running.next_message_index;
        running.next_message_index += 1;

        self.apply_output(
            OutputKey {
                cell_id: cell_id.to_string(),
                run_index,
                message_index,
            },
            data,
        );
        Ok(message_index)
    }

    /// Store an output under an explicit key, e.g. one relayed from another
    /// participant's execution. Returns `false` for a duplicate key or an
    /// unknown cell.
    pub fn apply_output(&mut self, key: OutputKey, data: OutputData) -> bool {
        if self.cell(&key.cell_id).is_none() {
            return false;
        }
        self.outputs.append(key, data)
    }

    /// Stamp the reserved run index on the cell and clear its running marker.
    /// The execute flag clears once none of my runs remain.
    pub fn finish_execution(
        &mut self,
        cell_id: &str,
        run_index: i64,
        status: ExecutionStatus,
    ) -> Result<(), NotebookError> {
        self.take_running(cell_id, run_index)?;
        if let Some(cell) = self.cell_mut(cell_id) {
            cell.run_index = run_index;
        }
        if self.running.is_empty() {
            self.in_flight.clear(Intent::Execute);
        }
        info!(
            "[notebook] Run {} of {} finished: {:?}",
            run_index, cell_id, status
        );
        Ok(())
    }

    /// The execution could not complete; the cell keeps its previous stamp.
    pub fn abort_execution(&mut self, cell_id: &str, run_index: i64, reason: String) {
        if self.take_running(cell_id, run_index).is_err() {
            debug!("[notebook] Abort for {} run {}: not running", cell_id, run_index);
        }
        warn!("[notebook] Run {} of {} aborted: {}", run_index, cell_id, reason);
        if self.running.is_empty() {
            self.in_flight.clear(Intent::Execute);
        }
        self.last_error = Some(reason);
    }

    pub fn confirm_execution(&mut self, ack: Ack<ExecutionAck>) {
        let Ack {
            origin,
            payload: ExecutionAck { cell_id, run_index },
        } = ack;

        if let Some(cell) = self.cell_mut(&cell_id) {
            cell.run_index = cell.run_index.max(run_index);
        }
        self.next_run_index = self.next_run_index.max(run_index + 1);
        if self.is_me(&origin) {
            self.in_flight.clear(Intent::Execute);
        }
        self.enforce_invariants();
    }

    fn take_running(&mut self, cell_id: &str, run_index: i64) -> Result<(), NotebookError> {
        match self.running.get(cell_id) {
            Some(r) if r.run_index == run_index => {
                self.running.remove(cell_id);
                Ok(())
            }
            _ => Err(NotebookError::NotRunning {
                cell_id: cell_id.to_string(),
                run_index,
            }),
        }
    }

    // ---- kernel process & connection --------------------------------------

    /// The client told the orchestrator it is ready.
    pub fn mark_ready(&mut self) {
        self.kernel.mark_ready();
    }

    pub fn apply_kernel_message(&mut self, message: KernelProcessMessage) {
        match message {
            KernelProcessMessage::Start { pid } => {
                if self.kernel.pid() != Some(pid) {
                    info!("[notebook] Kernel gateway started: pid={}", pid);
                    self.drop_connection();
                }
                self.kernel.on_start(pid);
            }
            KernelProcessMessage::End => {
                info!("[notebook] Kernel gateway ended");
                self.kernel.on_end();
                self.drop_connection();
            }
            KernelProcessMessage::Stdout { message } => {
                self.kernel.on_stdout(message);
            }
            KernelProcessMessage::Error { message } => {
                warn!("[notebook] Kernel gateway error: {}", message);
                self.kernel.on_error(message.clone());
                self.last_error = Some(message);
            }
            KernelProcessMessage::Ready => {
                debug!("[notebook] Ignoring ready echo");
            }
            KernelProcessMessage::Unknown => {
                warn!("[notebook] Ignoring unknown kernel-process message");
            }
        }
        self.enforce_invariants();
    }

    pub fn apply_login_redirect(&mut self, redirect: LoginRedirect) {
        match redirect {
            LoginRedirect::Success { url } => {
                info!("[notebook] Login redirect received");
                self.login_url = Some(url);
            }
            LoginRedirect::Unknown => warn!("[notebook] Ignoring unknown login-redirect message"),
        }
    }

    /// Move to `Connecting` and return the gateway URI to connect to.
    pub fn begin_connect(&mut self) -> Result<String, NotebookError> {
        match self.connection {
            ConnectionStatus::Connecting => return Err(NotebookError::ConnectPending),
            ConnectionStatus::Connected => return Err(NotebookError::AlreadyConnected),
            ConnectionStatus::Disconnected => {}
        }
        let uri = self
            .kernel
            .uri()
            .ok_or(NotebookError::NoGatewayUri)?
            .to_string();
        self.connection = ConnectionStatus::Connecting;
        Ok(uri)
    }

    pub fn connect_succeeded(&mut self) {
        self.connection = ConnectionStatus::Connected;
        self.last_error = None;
    }

    pub fn connect_failed(&mut self, message: String) {
        self.connection = ConnectionStatus::Disconnected;
        self.last_error = Some(message);
    }

    /// The kernel channel broke; running executions cannot finish.
    pub fn connection_lost(&mut self, reason: String) {
        self.drop_connection();
        self.last_error = Some(reason);
    }

    fn drop_connection(&mut self) {
        if self.connection != ConnectionStatus::Disconnected {
            info!("[notebook] Kernel connection dropped");
        }
        self.connection = ConnectionStatus::Disconnected;
        self.running.clear();
        self.in_flight.clear(Intent::Execute);
    }

    // ---- invariants -------------------------------------------------------

    /// Post-condition pass run after every mutating transition.
    ///
    /// - locks, outputs and running markers only refer to existing cells
    /// - a cell I hold is the cell the lock gate points at
    /// - the lock gate points at a cell being acquired or held by me
    /// - the execute flag is set only while one of my runs is in progress
    fn enforce_invariants(&mut self) {
        let ids: HashSet<&str> = self.cells.iter().map(|c| c.id.as_str()).collect();

        self.locks.retain_cells(|cell| ids.contains(cell));
        self.outputs.retain_cells(|cell| ids.contains(cell));
        self.running.retain(|cell, _| ids.contains(cell.as_str()));
        if self.running.is_empty() {
            self.in_flight.clear(Intent::Execute);
        }

        if let Some(held) = self.locks.held_by(&self.me.id) {
            if self.locked_cell_id.as_ref() != Some(held) {
                warn!("[notebook] Lock gate out of step; pointing it at held cell {}", held);
                self.locked_cell_id = Some(held.clone());
            }
        }

        if let Some(ref gate) = self.locked_cell_id {
            let exists = ids.contains(gate.as_str());
            let holding = self.locks.holder(gate) == Some(&self.me.id);
            let acquiring = self.in_flight.is_pending(Intent::Lock);
            if !exists || !(holding || acquiring) {
                debug!("[notebook] Releasing lock gate on {}", gate);
                self.locked_cell_id = None;
            }
        }
    }
}
