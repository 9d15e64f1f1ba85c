//! Append-only execution output store.

use std::collections::BTreeMap;

use kernel_gateway::OutputData;

/// Outputs are keyed by cell, then run, then arrival order within the run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutputKey {
    pub cell_id: String,
    pub run_index: i64,
    pub message_index: u64,
}

#[derive(Debug, Clone, Default)]
pub struct OutputStore {
    entries: BTreeMap<OutputKey, OutputData>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one fragment. A key that is already present is left untouched
    /// and `false` is returned.
    pub fn append(&mut self, key: OutputKey, data: OutputData) -> bool {
        match self.entries.entry(key) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(data);
                true
            }
        }
    }

    /// Outputs of exactly one run, in message order.
    pub fn for_run(&self, cell_id: &str, run_index: i64) -> Vec<&OutputData> {
        let start = OutputKey {
            cell_id: cell_id.to_string(),
            run_index,
            message_index: 0,
        };
        self.entries
            .range(start..)
            .take_while(|(key, _)| key.cell_id == cell_id && key.run_index == run_index)
            .map(|(_, data)| data)
            .collect()
    }

    pub fn retain_cells(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|key, _| keep(&key.cell_id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
