//! Continuous reachability monitoring.
//!
//! Every monitored address gets a [`correlator::Correlator`] that pings it
//! and emits one [`ping::Sample`] per probe. All samples flow through one
//! bounded queue into the [`tracker::Tracker`], which keeps the open
//! online/offline interval of each address and persists the history through
//! a [`store::EventStore`]. The [`supervisor::Fleet`] restarts correlators
//! whose transport fails.

pub mod config;
pub mod correlator;
pub mod error;
pub mod ping;
pub mod store;
pub mod supervisor;
pub mod tracker;
pub mod transport;

pub use config::{AppConfig, Cadence};
pub use error::{Error, StoreError, TrackerError, TransportError};
pub use ping::{Event, Reachability, Sample};
pub use store::{EventStore, SqliteStore};
pub use supervisor::Fleet;
pub use tracker::{Tracker, Transition};
pub use transport::{EchoLink, IcmpTransport, Transport};
