use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::StoreError;
use crate::ping::{Event, Reachability, Sample};

/// Persistence gateway used by the state tracker.
///
/// Events are keyed by `(address, started_at, state)`; update and close
/// rewrite the row created by open and never touch a closed row.
pub trait EventStore {
    /// Archives a raw sample. A second sample with the same address and
    /// timestamp is ignored.
    fn append_raw_sample(&mut self, sample: &Sample) -> Result<(), StoreError>;

    fn open_event(&mut self, event: &Event) -> Result<(), StoreError>;

    fn update_event(&mut self, event: &Event) -> Result<(), StoreError>;

    fn close_event(&mut self, event: &Event) -> Result<(), StoreError>;

    fn list_addresses(&self) -> Result<Vec<String>, StoreError>;

    /// Raw samples of `address` with `from <= at < to`, oldest first.
    fn query_interval(
        &self,
        address: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError>;

    /// Drops raw samples and closed events of `address` older than `before`.
    /// Returns the number of removed rows.
    fn prune(&mut self, address: &str, before: DateTime<Utc>) -> Result<usize, StoreError>;

    fn close(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    address  TEXT    NOT NULL,
    at       INTEGER NOT NULL,
    rtt      INTEGER NOT NULL,
    PRIMARY KEY (address, at)
);
CREATE TABLE IF NOT EXISTS events (
    address  TEXT    NOT NULL,
    at       INTEGER NOT NULL,
    duration INTEGER NOT NULL DEFAULT 0,
    state    TEXT    NOT NULL,
    closed   INTEGER NOT NULL DEFAULT 0,
    message  TEXT,
    PRIMARY KEY (address, at, state)
);";

/// SQLite-backed store. Timestamps are unix microseconds, durations are
/// milliseconds.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Stored copy of the interval starting at `started_at` in `state`, with
    /// its closed flag.
    pub fn load_event(
        &self,
        address: &str,
        started_at: DateTime<Utc>,
        state: Reachability,
    ) -> Result<Option<(Event, bool)>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT duration, closed FROM events WHERE address = ?1 AND at = ?2 AND state = ?3",
                params![address, started_at.timestamp_micros(), state.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(duration_ms, closed)| {
            let event = Event {
                address: address.to_string(),
                started_at,
                duration: chrono::TimeDelta::milliseconds(duration_ms),
                online: state == Reachability::Online,
            };
            (event, closed)
        }))
    }

    fn set_duration(&self, event: &Event, closed: bool) -> Result<usize, StoreError> {
        let message = closed.then(|| {
            format!(
                "{} :: {} WAS {} FOR {} sec",
                event.started_at.format("%Y-%m-%d %H:%M:%S"),
                event.address,
                event.state(),
                event.duration_ms() / 1000
            )
        });
        let changed = self.conn.execute(
            "UPDATE events
                SET duration = ?1, closed = ?2, message = COALESCE(?3, message)
              WHERE address = ?4
                AND at = ?5
                AND state = ?6
                AND closed = 0",
            params![
                event.duration_ms(),
                closed,
                message,
                event.address,
                event.started_at.timestamp_micros(),
                event.state().as_str()
            ],
        )?;
        Ok(changed)
    }
}

fn from_micros(micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, micros))
}

impl EventStore for SqliteStore {
    fn append_raw_sample(&mut self, sample: &Sample) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO samples(address, at, rtt) VALUES (?1, ?2, ?3)",
            params![sample.address, sample.at.timestamp_micros(), sample.round_trip_ms],
        )?;
        Ok(())
    }

    fn open_event(&mut self, event: &Event) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO events(address, at, duration, state, closed)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                event.address,
                event.started_at.timestamp_micros(),
                event.duration_ms(),
                event.state().as_str()
            ],
        )?;
        Ok(())
    }

    fn update_event(&mut self, event: &Event) -> Result<(), StoreError> {
        if self.set_duration(event, false)? == 0 {
            // the opening write was lost, recreate the row
            self.open_event(event)?;
        }
        Ok(())
    }

    fn close_event(&mut self, event: &Event) -> Result<(), StoreError> {
        if self.set_duration(event, true)? == 0 {
            self.open_event(event)?;
            self.set_duration(event, true)?;
        }
        Ok(())
    }

    fn list_addresses(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT address FROM samples
             UNION
             SELECT address FROM events
             ORDER BY address",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_interval(
        &self,
        address: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Sample>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT at, rtt FROM samples
              WHERE address = ?1 AND at >= ?2 AND at < ?3
              ORDER BY at",
        )?;
        let rows = stmt.query_map(
            params![address, from.timestamp_micros(), to.timestamp_micros()],
            |row| {
                Ok(Sample {
                    address: address.to_string(),
                    at: from_micros(row.get(0)?)?,
                    round_trip_ms: row.get(1)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn prune(&mut self, address: &str, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = before.timestamp_micros();
        let tx = self.conn.transaction()?;
        let samples = tx.execute(
            "DELETE FROM samples WHERE address = ?1 AND at < ?2",
            params![address, cutoff],
        )?;
        let events = tx.execute(
            "DELETE FROM events WHERE address = ?1 AND at < ?2 AND closed = 1",
            params![address, cutoff],
        )?;
        tx.commit()?;
        Ok(samples + events)
    }

    fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn event(started_at: DateTime<Utc>, duration_s: i64, online: bool) -> Event {
        Event {
            address: "a".into(),
            started_at,
            duration: TimeDelta::seconds(duration_s),
            online,
        }
    }

    #[test]
    fn duplicate_raw_samples_are_ignored() {
        let mut store = SqliteStore::in_memory().unwrap();
        let sample = Sample::reply("a", t0(), Duration::from_millis(7));
        store.append_raw_sample(&sample).unwrap();
        store.append_raw_sample(&Sample::timeout("a", t0())).unwrap();

        let stored = store.query_interval("a", t0(), t0() + TimeDelta::seconds(1)).unwrap();
        assert_eq!(stored, vec![sample]);
    }

    #[test]
    fn open_update_close_share_one_row() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.open_event(&event(t0(), 0, true)).unwrap();
        store.update_event(&event(t0(), 4, true)).unwrap();

        let (stored, closed) = store.load_event("a", t0(), Reachability::Online).unwrap().unwrap();
        assert_eq!(stored, event(t0(), 4, true));
        assert!(!closed);

        store.close_event(&event(t0(), 6, true)).unwrap();
        let (stored, closed) = store.load_event("a", t0(), Reachability::Online).unwrap().unwrap();
        assert_eq!(stored.duration, TimeDelta::seconds(6));
        assert!(closed);

        let message: String = store
            .conn
            .query_row("SELECT message FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(message, "2024-05-01 12:00:00 :: a WAS ONLINE FOR 6 sec");
    }

    #[test]
    fn close_without_open_still_records_the_interval() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.close_event(&event(t0(), 3, false)).unwrap();
        let (stored, closed) = store.load_event("a", t0(), Reachability::Offline).unwrap().unwrap();
        assert_eq!(stored, event(t0(), 3, false));
        assert!(closed);
    }

    #[test]
    fn zero_length_interval_keeps_its_closed_row() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.open_event(&event(t0(), 0, true)).unwrap();
        store.close_event(&event(t0(), 0, true)).unwrap();
        store.open_event(&event(t0(), 0, false)).unwrap();
        store.update_event(&event(t0(), 2, false)).unwrap();
        // a repeated open of the closed interval leaves it alone
        store.open_event(&event(t0(), 0, true)).unwrap();

        let (online, closed) = store.load_event("a", t0(), Reachability::Online).unwrap().unwrap();
        assert_eq!(online, event(t0(), 0, true));
        assert!(closed);
        let (offline, closed) = store.load_event("a", t0(), Reachability::Offline).unwrap().unwrap();
        assert_eq!(offline, event(t0(), 2, false));
        assert!(!closed);
    }

    #[test]
    fn query_is_half_open_and_ordered() {
        let mut store = SqliteStore::in_memory().unwrap();
        for n in [3, 1, 2, 0] {
            store
                .append_raw_sample(&Sample::timeout("a", t0() + TimeDelta::seconds(n)))
                .unwrap();
        }
        store.append_raw_sample(&Sample::timeout("b", t0())).unwrap();

        let stamps: Vec<_> = store
            .query_interval("a", t0() + TimeDelta::seconds(1), t0() + TimeDelta::seconds(3))
            .unwrap()
            .into_iter()
            .map(|s| s.at)
            .collect();
        assert_eq!(stamps, vec![t0() + TimeDelta::seconds(1), t0() + TimeDelta::seconds(2)]);
        assert_eq!(store.list_addresses().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn prune_keeps_open_events_and_recent_rows() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.append_raw_sample(&Sample::timeout("a", t0())).unwrap();
        store
            .append_raw_sample(&Sample::timeout("a", t0() + TimeDelta::seconds(20)))
            .unwrap();
        store.close_event(&event(t0(), 5, true)).unwrap();
        store.open_event(&event(t0() + TimeDelta::seconds(5), 0, false)).unwrap();

        let removed = store.prune("a", t0() + TimeDelta::seconds(10)).unwrap();
        assert_eq!(removed, 2);
        assert!(store.load_event("a", t0(), Reachability::Online).unwrap().is_none());
        assert!(
            store
                .load_event("a", t0() + TimeDelta::seconds(5), Reachability::Offline)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.sqlite");

        let mut store = SqliteStore::open(&path).unwrap();
        store.open_event(&event(t0(), 0, false)).unwrap();
        store.close().unwrap();

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_addresses().unwrap(), vec!["a".to_string()]);
    }
}
