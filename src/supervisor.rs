use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Cadence;
use crate::correlator::Correlator;
use crate::error::TransportError;
use crate::ping::Sample;
use crate::transport::Transport;

struct Prober {
    generation: u64,
    cancel: CancellationToken,
}

struct Shared<T> {
    transport: T,
    cadence: Cadence,
    outcomes: mpsc::Sender<Sample>,
    probers: Mutex<HashMap<String, Prober>>,
    generations: AtomicU64,
}

impl<T: Transport> Shared<T> {
    /// One correlator run: open a link and probe until cancelled or failed.
    async fn probe(&self, address: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        let link = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            link = self.transport.open(address) => link?,
        };
        Correlator::new(address, link, self.cadence, self.outcomes.clone())
            .run(cancel.clone())
            .await
    }

    /// Deregisters `address` unless it was removed and re-added meanwhile.
    fn forget(&self, address: &str, generation: u64) {
        let mut probers = self.probers.lock();
        if probers.get(address).is_some_and(|p| p.generation == generation) {
            probers.remove(address);
        }
    }
}

async fn supervise<T: Transport>(
    shared: Arc<Shared<T>>,
    address: String,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        match shared.probe(&address, &cancel).await {
            Ok(()) => {
                log::info!("monitor for {address:?} finished");
                break;
            }
            Err(e) => {
                log::warn!("monitoring for {address:?} failed with error: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = time::sleep(shared.cadence.restart_backoff) => {}
                }
                log::info!("resurrect monitoring for {address:?}");
            }
        }
    }
    shared.forget(&address, generation);
}

/// The set of monitored addresses.
pub struct Fleet<T> {
    shared: Arc<Shared<T>>,
    root: CancellationToken,
    tasks: TaskTracker,
}

impl<T: Transport> Fleet<T> {
    /// Correlators run under child scopes of `root`; cancelling it stops
    /// the whole fleet.
    pub fn new(
        transport: T,
        cadence: Cadence,
        outcomes: mpsc::Sender<Sample>,
        root: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                cadence,
                outcomes,
                probers: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
            root,
            tasks: TaskTracker::new(),
        }
    }

    /// Starts monitoring `address`. Returns false if it is already monitored
    /// or the fleet is shutting down.
    pub fn add_host(&self, address: &str) -> bool {
        if self.root.is_cancelled() || self.tasks.is_closed() {
            log::warn!("not adding {address}: shutting down");
            return false;
        }
        let mut probers = self.shared.probers.lock();
        if probers.contains_key(address) {
            log::warn!("host {address} is already under monitoring");
            return false;
        }
        let cancel = self.root.child_token();
        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed);
        probers.insert(
            address.to_string(),
            Prober {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(probers);

        self.tasks.spawn(supervise(
            Arc::clone(&self.shared),
            address.to_string(),
            generation,
            cancel,
        ));
        log::info!("added host {address}");
        true
    }

    /// Stops monitoring `address`. Returns false if it was not monitored.
    pub fn remove_host(&self, address: &str) -> bool {
        match self.shared.probers.lock().remove(address) {
            Some(prober) => {
                log::info!("remove host {address}");
                prober.cancel.cancel();
                true
            }
            None => {
                log::warn!("host {address} is not found");
                false
            }
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.shared.probers.lock().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Refuses further additions, cancels every correlator and waits until
    /// all of them have stopped.
    pub async fn shutdown(self) {
        self.tasks.close();
        self.root.cancel();
        log::info!("waiting for {} monitors to stop", self.tasks.len());
        self.tasks.wait().await;
        log::info!("all monitors stopped");
    }
}
