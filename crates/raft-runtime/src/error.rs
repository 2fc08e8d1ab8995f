//! # error
//!
//! why: one error type for every fallible call on a running node
//! relations: wraps raft-core's ConfigError and raft-storage's StorageError
//! what: RaftError

use raft_core::ConfigError;
use raft_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    /// proposals are only accepted by the leader; the hint is the last
    /// leader this node heard from in its current term, if any
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },

    #[error("raft node has been shut down")]
    Shutdown,

    #[error("node {0} is not part of the peer set")]
    NotAMember(u64),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// persisted state decoded but contradicts the peer set
    #[error("persisted state is inconsistent: {0}")]
    CorruptState(String),
}
