use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Reachability of an address over an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reachability {
    Online,
    Offline,
}

impl Reachability {
    pub fn as_str(self) -> &'static str {
        match self {
            Reachability::Online => "ONLINE",
            Reachability::Offline => "OFFLINE",
        }
    }

    pub fn switched_phrase(self) -> &'static str {
        match self {
            Reachability::Online => "switched to ONLINE",
            Reachability::Offline => "switched to OFFLINE",
        }
    }
}

impl From<bool> for Reachability {
    fn from(online: bool) -> Self {
        if online {
            Reachability::Online
        } else {
            Reachability::Offline
        }
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single probe.
///
/// `at` is the moment the probe was sent. A `round_trip_ms` of zero means the
/// probe was never answered; a measured round trip is always at least 1 ms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub address: String,
    pub at: DateTime<Utc>,
    pub round_trip_ms: u64,
}

impl Sample {
    pub fn reply(address: impl Into<String>, at: DateTime<Utc>, rtt: Duration) -> Self {
        // 0 is reserved for "no reply", so a sub-millisecond answer counts as 1 ms
        let ms = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX).max(1);
        Self {
            address: address.into(),
            at,
            round_trip_ms: ms,
        }
    }

    pub fn timeout(address: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            at,
            round_trip_ms: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.round_trip_ms > 0
    }

    pub fn reachability(&self) -> Reachability {
        self.is_online().into()
    }

    /// A sample without an address or stamped at/before the epoch can only
    /// come from a broken producer.
    pub fn is_well_formed(&self) -> bool {
        !self.address.is_empty() && self.at > DateTime::<Utc>::UNIX_EPOCH
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.at.format(STAMP_FORMAT);
        if self.is_online() {
            write!(f, "{at} {} RTT={} ms", self.address, self.round_trip_ms)
        } else {
            write!(f, "{at} {} TIMEOUT", self.address)
        }
    }
}

/// One contiguous online or offline interval of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub address: String,
    pub started_at: DateTime<Utc>,
    pub duration: TimeDelta,
    pub online: bool,
}

impl Event {
    /// A zero-length interval starting at the given sample.
    pub fn starting_at(sample: &Sample) -> Self {
        Self {
            address: sample.address.clone(),
            started_at: sample.at,
            duration: TimeDelta::zero(),
            online: sample.is_online(),
        }
    }

    pub fn state(&self) -> Reachability {
        self.online.into()
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.num_milliseconds()).unwrap_or(0)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} is {} for {} ms",
            self.started_at.format(STAMP_FORMAT),
            self.address,
            self.state(),
            self.duration_ms()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn zero_millisecond_reply_is_reported_as_one() {
        // deliberate precision loss: 0 would read as a timeout
        let sample = Sample::reply("10.0.0.1", t0(), Duration::from_micros(400));
        assert_eq!(sample.round_trip_ms, 1);
        assert!(sample.is_online());
    }

    #[test]
    fn reply_keeps_whole_milliseconds() {
        let sample = Sample::reply("10.0.0.1", t0(), Duration::from_micros(23_900));
        assert_eq!(sample.round_trip_ms, 23);
    }

    #[test]
    fn timeout_is_offline() {
        let sample = Sample::timeout("10.0.0.1", t0());
        assert!(!sample.is_online());
        assert_eq!(sample.reachability(), Reachability::Offline);
        assert_eq!(sample.to_string(), "2024-05-01T12:00:00 10.0.0.1 TIMEOUT");
    }

    #[test]
    fn malformed_samples_are_detected() {
        assert!(Sample::timeout("10.0.0.1", t0()).is_well_formed());
        assert!(!Sample::timeout("", t0()).is_well_formed());
        assert!(!Sample::timeout("10.0.0.1", DateTime::<Utc>::UNIX_EPOCH).is_well_formed());
    }

    #[test]
    fn event_display() {
        let mut event = Event::starting_at(&Sample::reply("host", t0(), Duration::from_millis(5)));
        event.duration = TimeDelta::milliseconds(2500);
        assert_eq!(event.to_string(), "2024-05-01T12:00:00: host is ONLINE for 2500 ms");
        assert_eq!(event.state().switched_phrase(), "switched to ONLINE");
    }
}
