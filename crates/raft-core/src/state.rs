//! # state
//!
//! why: name the exact subset of node state that must survive a crash
//! relations: captured from and restored into node.rs, encoded by raft-storage
//! what: PersistentState and its integrity check

use serde::{Deserialize, Serialize};

use crate::log::RaftLog;

/// {current_term, voted_for, log}: everything a node must have durably
/// stored before it answers a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: RaftLog,
}

impl PersistentState {
    /// reject state that no correct node could have written
    ///
    /// indices must run 1..=n, terms must never decrease along the log and
    /// no entry may carry a term newer than `current_term`
    pub fn check_integrity(&self) -> Result<(), String> {
        let mut prev_term = 0;
        for (pos, entry) in self.log.iter().enumerate() {
            let expected = pos as u64 + 1;
            if entry.index != expected {
                return Err(format!("entry at position {pos} has index {} (expected {expected})", entry.index));
            }
            if entry.term < prev_term {
                return Err(format!("term decreases at index {}: {} after {prev_term}", entry.index, entry.term));
            }
            if entry.term > self.current_term {
                return Err(format!(
                    "entry {} has term {} above current term {}",
                    entry.index, entry.term, self.current_term
                ));
            }
            prev_term = entry.term;
        }
        Ok(())
    }
}
