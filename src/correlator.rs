//! Per-address probe loop: sends echo requests on a jittered cadence, pairs
//! replies with their requests by sequence number and turns unanswered
//! requests into timeout samples.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Cadence;
use crate::error::TransportError;
use crate::ping::Sample;
use crate::transport::EchoLink;

/// Probes that were sent but neither answered nor reaped yet.
#[derive(Debug)]
pub struct InFlight {
    address: String,
    pending: HashMap<u16, DateTime<Utc>>,
}

impl InFlight {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            pending: HashMap::new(),
        }
    }

    /// Records a probe sent at `now`. If `seq` is still pending from an
    /// earlier probe (the sequence wrapped), that probe is resolved as a
    /// timeout and returned.
    pub fn on_send(&mut self, seq: u16, now: DateTime<Utc>) -> Option<Sample> {
        self.pending
            .insert(seq, now)
            .map(|sent_at| Sample::timeout(self.address.as_str(), sent_at))
    }

    /// Resolves a reply. Replies for unknown sequence numbers (duplicates or
    /// already reaped probes) are ignored.
    pub fn on_reply(&mut self, seq: u16, rtt: Duration) -> Option<Sample> {
        self.pending
            .remove(&seq)
            .map(|sent_at| Sample::reply(self.address.as_str(), sent_at, rtt))
    }

    /// Evicts every probe older than `timeout`, oldest first.
    pub fn reap(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<Sample> {
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        let mut expired: Vec<(u16, DateTime<Utc>)> = self
            .pending
            .iter()
            .filter(|(_, sent_at)| now - **sent_at > timeout)
            .map(|(seq, sent_at)| (*seq, *sent_at))
            .collect();
        expired.sort_by_key(|(_, sent_at)| *sent_at);
        expired
            .into_iter()
            .map(|(seq, sent_at)| {
                self.pending.remove(&seq);
                Sample::timeout(self.address.as_str(), sent_at)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Wall-clock time derived from the monotonic clock, anchored once.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl WallClock {
    pub fn anchored_now() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.mono.elapsed()).unwrap_or(TimeDelta::zero());
        self.wall + elapsed
    }
}

/// Drives the probe cycle for one address.
pub struct Correlator<L> {
    address: String,
    link: L,
    cadence: Cadence,
    outcomes: mpsc::Sender<Sample>,
    clock: WallClock,
}

impl<L: EchoLink> Correlator<L> {
    pub fn new(address: impl Into<String>, link: L, cadence: Cadence, outcomes: mpsc::Sender<Sample>) -> Self {
        Self {
            address: address.into(),
            link,
            cadence,
            outcomes,
            clock: WallClock::anchored_now(),
        }
    }

    /// Probes until `cancel` fires (`Ok`) or the link fails (`Err`).
    /// Pending replies are abandoned on return.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TransportError> {
        let mut table = InFlight::new(self.address.as_str());
        let mut replies: JoinSet<(u16, Result<Option<Duration>, TransportError>)> = JoinSet::new();
        let mut seq: u16 = 0;

        let mut probes = time::interval(self.cadence.jittered_interval());
        probes.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reap_every = self.cadence.reap_interval;
        let mut reaper = time::interval_at(Instant::now() + reap_every, reap_every);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::debug!("probing {} every {:?}", self.address, probes.period());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!("probing {} cancelled with {} probes in flight", self.address, table.len());
                    return Ok(());
                }
                Some(joined) = replies.join_next() => match joined {
                    Ok((seq, Ok(Some(rtt)))) => {
                        if let Some(sample) = table.on_reply(seq, rtt) {
                            self.emit(sample);
                        }
                    }
                    // unanswered, the reaper accounts for it
                    Ok((_, Ok(None))) => {}
                    Ok((_, Err(e))) => return Err(e),
                    Err(e) => log::warn!("echo task for {} died: {e}", self.address),
                },
                _ = reaper.tick() => {
                    for sample in table.reap(self.clock.now(), self.cadence.probe_timeout) {
                        self.emit(sample);
                    }
                }
                _ = probes.tick() => {
                    if let Some(stale) = table.on_send(seq, self.clock.now()) {
                        log::debug!("sequence {seq} reused for {} before it resolved", self.address);
                        self.emit(stale);
                    }
                    let echo = self.link.echo(seq);
                    replies.spawn(async move { (seq, echo.await) });
                    seq = seq.wrapping_add(1);
                }
            }
        }
    }

    fn emit(&self, sample: Sample) {
        match self.outcomes.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(sample)) => log::debug!("outcome queue full, dropped {sample}"),
            Err(TrySendError::Closed(sample)) => log::debug!("outcome queue closed, dropped {sample}"),
        }
    }
}
