//! Error types

use thiserror::Error;

/// Babel link stack error type.
///
/// Transport-internal faults (bad checksum, unknown pid, full queues) are
/// handled in place by dropping frames and counting; only the API boundary
/// surfaces errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot codec error: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("frame pool exhausted")]
    PoolExhausted,

    #[error("data length {len} exceeds frame capacity {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("no link attached on netIf {netif}")]
    NoSuchNetIf { netif: u8 },

    #[error("netIf {netif} already attached")]
    NetIfInUse { netif: u8 },

    #[error("bad exchange name: {0}")]
    BadExchangeName(String),

    #[error("outgoing queue full ({capacity})")]
    OutgoingFull { capacity: usize },

    #[error("link closed")]
    LinkClosed,

    #[error("fetch timed out")]
    FetchTimeout,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
