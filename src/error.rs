//! Errors surfaced by the codec and the receive/transmit pipelines.

use thiserror::Error;

/// Every failure mode the crate exposes to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// A packet could not be decoded: too short, or otherwise malformed.
    #[error("malformed sACN packet")]
    MalformedPacket,

    /// A caller tried to set a priority above the protocol's 200 ceiling.
    #[error("priority must be in 0..=200")]
    InvalidPriority,

    /// No valid packet arrived on `universe` within the 2500 ms deadline.
    #[error("timeout on universe {universe}")]
    Timeout { universe: u16 },

    /// Two or more sources are tied at the highest priority on `universe`.
    #[error("multiple sources at the same priority on universe {universe}")]
    SourcesExceeded { universe: u16 },

    /// A destination or bind address string could not be resolved.
    #[error("failed to resolve address: {0}")]
    ResolveAddress(String),

    /// The UDP socket could not be bound.
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    /// `activate` was called for a universe that is already active.
    #[error("universe {universe} is already active")]
    AlreadyActive { universe: u16 },

    /// An operation was attempted on a universe that isn't active.
    #[error("universe {universe} is not active")]
    NotActive { universe: u16 },

    /// A read or write on an already-open socket failed for a reason
    /// other than the 2500 ms deadline expiring.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
