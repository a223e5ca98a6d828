use thiserror::Error;

use crate::ping::Sample;

/// Failures of the echo transport. Any of these ends a correlator run and
/// hands the address back to the supervisor for a restart.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {0:?}")]
    Unresolved(String),

    #[error("icmp socket unavailable: {0}")]
    Socket(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("could not prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("malformed sample {0:?}")]
    MalformedSample(Sample),
}

/// Process-level failure reported by `main`.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("state tracker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("there is nothing to monitor")]
    NoHosts,
}
