//! # raft-runtime
//!
//! why: run raft-core nodes as live peers with timers, durable state and rpc
//! relations: drives raft-core, persists through raft-storage, sends through a Transport
//! what: Raft handle, Transport trait, RaftError, simulated Network for tests

pub mod error;
pub mod network;
pub mod raft;
pub mod transport;

pub use error::RaftError;
pub use network::{Network, NetworkEnd};
pub use raft::{ApplyMsg, Proposal, Raft, RaftStatus};
pub use transport::{Transport, TransportError};
