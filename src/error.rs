//! Error taxonomy for the MAC engine.
//!
//! Only conditions that abort an operation surface as `Err` values. Degraded
//! but survivable situations (a node missing from a round, a stale response,
//! arrival jitter) are logged and counted in the gateway statistics instead.

use thiserror::Error;

use crate::modem::ModemError;
use crate::packet::NodeAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MacError {
    /// The underlying modem refused the operation.
    #[error("modem transport failure: {0}")]
    Transport(#[from] ModemError),

    /// Ranging or scheduling was invoked with no candidate nodes, or every
    /// candidate was evicted.
    #[error("topology contains no nodes")]
    TopologyEmpty,

    /// A topology member has no time-of-flight measurement; ranging and
    /// scheduling ran out of order.
    #[error("no time-of-flight measurement for node {0}")]
    MissingMeasurement(NodeAddress),

    /// A topology member has no slot delay; scheduling and distribution ran
    /// out of order.
    #[error("no slot delay assigned for node {0}")]
    NotScheduled(NodeAddress),
}
