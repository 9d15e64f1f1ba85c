//! Cell lock table.
//!
//! At most one holder per cell id and at most one cell per holder. The table
//! is a projection of outcomes decided elsewhere; it never arbitrates, it only
//! refuses to record a second holder or a second cell.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cell::CellId;
use crate::participant::ParticipantId;

/// A cell's lock as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    LockedByMe,
    LockedByOther { holder: ParticipantId },
}

/// Why a lock could not be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockConflict {
    /// Someone else holds the cell.
    CellHeld { held_by: ParticipantId },
    /// The would-be holder already holds another cell.
    HolderBusy { cell_id: CellId },
}

#[derive(Debug, Clone, Default)]
pub struct LockTable {
    holders: HashMap<CellId, ParticipantId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, cell_id: &str) -> Option<&ParticipantId> {
        self.holders.get(cell_id)
    }

    pub fn state_for(&self, cell_id: &str, me: &ParticipantId) -> LockState {
        match self.holders.get(cell_id) {
            None => LockState::Unlocked,
            Some(holder) if holder == me => LockState::LockedByMe,
            Some(holder) => LockState::LockedByOther {
                holder: holder.clone(),
            },
        }
    }

    /// Record `holder` on `cell_id`. Re-recording the same holder is a no-op.
    pub fn acquire(&mut self, cell_id: &str, holder: &ParticipantId) -> Result<(), LockConflict> {
        match self.holders.get(cell_id) {
            Some(current) if current != holder => Err(LockConflict::CellHeld {
                held_by: current.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                if let Some(other) = self.held_by(holder) {
                    return Err(LockConflict::HolderBusy {
                        cell_id: other.clone(),
                    });
                }
                self.holders.insert(cell_id.to_string(), holder.clone());
                Ok(())
            }
        }
    }

    /// Remove the lock on `cell_id` if `holder` holds it.
    pub fn release(&mut self, cell_id: &str, holder: &ParticipantId) -> bool {
        if self.holders.get(cell_id) == Some(holder) {
            self.holders.remove(cell_id);
            true
        } else {
            false
        }
    }

    /// Remove every lock held by `holder`, returning the freed cells.
    pub fn release_all(&mut self, holder: &ParticipantId) -> Vec<CellId> {
        let freed: Vec<CellId> = self
            .holders
            .iter()
            .filter(|(_, h)| *h == holder)
            .map(|(cell, _)| cell.clone())
            .collect();
        for cell in &freed {
            self.holders.remove(cell);
        }
        freed
    }

    /// Drop locks on cells for which `keep` returns false.
    pub fn retain_cells(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.holders.retain(|cell, _| keep(cell));
    }

    /// The cell `holder` holds, if any.
    pub fn held_by(&self, holder: &ParticipantId) -> Option<&CellId> {
        self.holders
            .iter()
            .find(|(_, h)| *h == holder)
            .map(|(cell, _)| cell)
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}
