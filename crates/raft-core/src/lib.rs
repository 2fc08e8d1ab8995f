//! # raft-core
//!
//! why: implement the raft consensus rules as a pure, synchronous state machine
//! relations: driven by raft-runtime (timers, locking, network), persisted via raft-storage
//! what: configuration, log, rpc messages, node state machine, persistent state

pub mod config;
pub mod log;
pub mod message;
pub mod node;
pub mod state;

pub use config::{ConfigError, RaftConfig};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, ConflictHint, RaftRequest, RaftResponse, RequestVoteArgs,
    RequestVoteReply,
};
pub use node::{AppendSummary, NodeState, RaftNode};
pub use state::PersistentState;
