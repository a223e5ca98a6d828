use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TrackerError;
use crate::ping::{Event, Sample};
use crate::store::EventStore;

/// What a sample did to the tracked state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// First sample for the address; a new interval was opened.
    Opened,
    /// The sample confirmed the open interval and extended it.
    Extended,
    /// The state flipped: `closed` was finalized and a new interval opened.
    Switched { closed: Event },
    /// The sample describes a moment before what is already confirmed.
    Stale,
}

/// Sole owner of the open interval of every address.
pub struct Tracker<S> {
    store: S,
    open: HashMap<String, Event>,
}

impl<S: EventStore> Tracker<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            open: HashMap::new(),
        }
    }

    pub fn process(&mut self, sample: Sample) -> Result<Transition, TrackerError> {
        if !sample.is_well_formed() {
            return Err(TrackerError::MalformedSample(sample));
        }

        let Some(event) = self.open.get_mut(&sample.address) else {
            let event = Event::starting_at(&sample);
            if let Err(e) = self.store.open_event(&event) {
                log::warn!("open_event({event}) failed: {e}");
            }
            log::info!("{} is {}", sample.address, event.state());
            self.open.insert(sample.address, event);
            return Ok(Transition::Opened);
        };

        let elapsed = sample.at - event.started_at;
        if elapsed < event.duration {
            return Ok(Transition::Stale);
        }

        event.duration = elapsed;
        if sample.is_online() == event.online {
            if let Err(e) = self.store.update_event(event) {
                log::warn!("update_event({event}) failed: {e}");
            }
            return Ok(Transition::Extended);
        }

        let next = Event::starting_at(&sample);
        let closed = std::mem::replace(event, next.clone());
        if let Err(e) = self.store.close_event(&closed) {
            log::warn!("close_event({closed}) failed: {e}");
        }
        if let Err(e) = self.store.open_event(&next) {
            log::warn!("open_event({next}) failed: {e}");
        }
        log::info!("{closed}; {}", next.state().switched_phrase());
        Ok(Transition::Switched { closed })
    }

    /// Consumes samples until cancelled or until every producer is gone.
    /// Each sample is archived, then folded into the interval state; a
    /// malformed one stops the loop before anything is written.
    pub async fn run(
        mut self,
        mut samples: mpsc::Receiver<Sample>,
        cancel: CancellationToken,
    ) -> Result<Self, TrackerError> {
        log::info!("state tracker started");
        loop {
            let sample = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = samples.recv() => match next {
                    Some(sample) => sample,
                    None => break,
                },
            };
            log::trace!("{sample}");
            if !sample.is_well_formed() {
                return Err(TrackerError::MalformedSample(sample));
            }
            if let Err(e) = self.store.append_raw_sample(&sample) {
                log::warn!("append_raw_sample({sample}) failed: {e}");
            }
            self.process(sample)?;
        }
        log::info!("state tracker finished");
        Ok(self)
    }

    /// Open intervals ordered by address.
    pub fn open_events(&self) -> Vec<&Event> {
        let mut events: Vec<&Event> = self.open.values().collect();
        events.sort_by(|a, b| a.address.cmp(&b.address));
        events
    }

    pub fn open_event(&self, address: &str) -> Option<&Event> {
        self.open.get(address)
    }

    pub fn log_status(&self) {
        log::info!("--- status ---");
        for event in self.open_events() {
            log::info!("{event}");
        }
        log::info!("---- end ----");
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}
