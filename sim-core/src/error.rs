//! Error taxonomy for the simulation substrate.
//!
//! Mirrors the classification in the design doc: protocol errors are surfaced
//! back to the sender as packets and never abort anything; transaction and
//! resource failures are returned as `Ok(false)`/`Err` to the caller that
//! issued the operation; link/config/checkpoint failures can be fatal at the
//! process boundary, where `anyhow` takes over.

use thiserror::Error;

use crate::types::AgentId;

/// Malformed packet, unknown destination, unauthorized market mutation.
/// Never fatal: the network answers the sender with an `ERROR` packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("no agent registered for id {0:?}")]
    UnknownDestination(AgentId),
    #[error("{0} is not permitted to mutate this listing")]
    Unauthorized(AgentId),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("snoop registration must come from the statistics observer")]
    SnoopNotAuthorized,
}

/// A transactional protocol either failed, timed out, or was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("counterpart refused the request")]
    Refused,
    #[error("transaction {0} timed out before an ack arrived")]
    TimedOut(uuid::Uuid),
    #[error("link closed while awaiting ack")]
    LinkClosed,
    #[error("agent is shutting down")]
    ShuttingDown,
}

/// Insufficient balance, inventory, land, or ticks for a requested operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("balance {have} is less than required {need}")]
    InsufficientBalance { have: i64, need: i64 },
    #[error("inventory of {item} has {have} but {need} were requested")]
    InsufficientInventory { item: String, have: f64, need: f64 },
    #[error("unallocated hectares of {allocation} has {have} but {need} were requested")]
    InsufficientLand { allocation: String, have: f64, need: f64 },
    #[error("ticks remaining {have} is less than required {need}")]
    InsufficientTicks { have: u32, need: u32 },
}

/// Raised by a `recv` on a link that has been closed from either side.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("link closed")]
pub struct LinkClosed;

/// Configuration document failed to parse or validate.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A statistics tracker failed to flush its CSV output (§6). Non-fatal: the
/// run logs it at `WARNING` and keeps going, per §7's "statistics continue
/// to flush up to the last completed step".
#[derive(Debug, Error)]
pub enum StatisticsError {
    #[error("failed to write statistics output: {0}")]
    Write(String),
}

/// Checkpoint save/load failures. Load-time format mismatches are fatal.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize checkpoint: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("checkpoint version {found} is incompatible with the running version {expected}")]
    VersionMismatch { found: u32, expected: u32 },
}
