//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;
use raft_core::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use thiserror::Error;

/// Outbound half of the peer connections of one node.
///
/// A call may fail, or never finish; the node bounds every call with its
/// rpc timeout and treats both outcomes as "no reply".
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(&self, target: u64, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(&self, target: u64, args: AppendEntriesArgs) -> Result<AppendEntriesReply, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// no route to the target, or the target is not running
    #[error("node {0} is unreachable")]
    Unreachable(u64),

    #[error("rpc timed out")]
    Timeout,

    /// the request or its reply was lost in transit
    #[error("message dropped")]
    Dropped,
}
