//! Sqlite-backed durable state.
//!
//! One file holds the event log, consumer-group offsets, the policy engine's
//! counters, and the equity curve. Everything the pipeline must not lose
//! across a restart goes through here.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::bus::Event;

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn new(path: &str) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS events (
                stream TEXT NOT NULL,
                seq INTEGER NOT NULL,
                id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                payload TEXT NOT NULL,
                source TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (stream, seq)
            );
            CREATE TABLE IF NOT EXISTS offsets (
                stream TEXT NOT NULL,
                grp TEXT NOT NULL,
                next_seq INTEGER NOT NULL,
                PRIMARY KEY (stream, grp)
            );
            CREATE TABLE IF NOT EXISTS policy_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS equity_curve (
                ts INTEGER NOT NULL,
                balance REAL NOT NULL,
                realized REAL NOT NULL,
                unrealized REAL NOT NULL,
                drawdown REAL NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Append one event, assigning the next per-stream sequence number, and
    /// evict the oldest rows past `maxlen` in the same transaction.
    pub fn append_event(
        &self,
        stream: &str,
        event_type: &str,
        payload: &str,
        source: &str,
        ts_ms: u64,
        maxlen: u64,
    ) -> Result<Event> {
        let mut conn = self.conn.lock().expect("store lock");
        let tx = conn.transaction()?;
        let seq: u64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE stream = ?1",
                params![stream],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u64)?;
        let id = format!("{}-{}", seq, ts_ms);
        tx.execute(
            "INSERT INTO events (stream, seq, id, event_type, ts_ms, payload, source, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![stream, seq as i64, id, event_type, ts_ms as i64, payload, source],
        )?;
        if maxlen > 0 {
            tx.execute(
                "DELETE FROM events WHERE stream = ?1
                 AND seq <= (SELECT MAX(seq) FROM events WHERE stream = ?1) - ?2",
                params![stream, maxlen as i64],
            )?;
        }
        tx.commit()?;
        Ok(Event {
            id,
            stream: stream.to_string(),
            event_type: event_type.to_string(),
            ts_ms,
            payload: payload.to_string(),
            source: source.to_string(),
            version: 1,
            seq,
        })
    }

    /// Events with seq strictly greater than `after`, oldest first.
    pub fn read_after(&self, stream: &str, after: u64, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn.prepare(
            "SELECT seq, id, event_type, ts_ms, payload, source, version
             FROM events WHERE stream = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![stream, after as i64, limit as i64], |row| {
            Ok(Event {
                seq: row.get::<_, i64>(0)? as u64,
                id: row.get(1)?,
                event_type: row.get(2)?,
                ts_ms: row.get::<_, i64>(3)? as u64,
                payload: row.get(4)?,
                source: row.get(5)?,
                version: row.get::<_, i64>(6)? as u32,
                stream: stream.to_string(),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn commit_offset(&self, stream: &str, group: &str, next_seq: u64) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO offsets (stream, grp, next_seq) VALUES (?1, ?2, ?3)
             ON CONFLICT (stream, grp) DO UPDATE SET next_seq = MAX(next_seq, excluded.next_seq)",
            params![stream, group, next_seq as i64],
        )?;
        Ok(())
    }

    pub fn get_offset(&self, stream: &str, group: &str) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock");
        let v: Option<i64> = conn
            .query_row(
                "SELECT next_seq FROM offsets WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v.unwrap_or(0) as u64)
    }

    pub fn stream_bounds(&self, stream: &str) -> Result<(u64, u64, u64)> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT COUNT(*), COALESCE(MIN(seq), 0), COALESCE(MAX(seq), 0)
             FROM events WHERE stream = ?1",
            params![stream],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .map_err(Into::into)
    }

    pub fn groups_for(&self, stream: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt =
            conn.prepare("SELECT grp, next_seq FROM offsets WHERE stream = ?1 ORDER BY grp")?;
        let rows = stmt.query_map(params![stream], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Drop oldest events beyond `maxlen`. Returns the number evicted.
    pub fn trim(&self, stream: &str, maxlen: u64) -> Result<usize> {
        let conn = self.conn.lock().expect("store lock");
        let n = conn.execute(
            "DELETE FROM events WHERE stream = ?1
             AND seq <= (SELECT COALESCE(MAX(seq), 0) FROM events WHERE stream = ?1) - ?2",
            params![stream, maxlen as i64],
        )?;
        Ok(n)
    }

    pub fn put_kv(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO policy_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row(
            "SELECT value FROM policy_kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn persist_equity_snapshot(
        &self,
        ts: u64,
        balance: f64,
        realized: f64,
        unrealized: f64,
        drawdown: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO equity_curve (ts, balance, realized, unrealized, drawdown)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ts as i64, balance, realized, unrealized, drawdown],
        )?;
        Ok(())
    }

    pub fn equity_snapshot_count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("store lock");
        conn.query_row("SELECT COUNT(*) FROM equity_curve", [], |row| {
            row.get::<_, i64>(0).map(|v| v as u64)
        })
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let store = StateStore::new(":memory:").unwrap();
        let a = store.append_event("ticks", "tick", "{}", "test", 1, 0).unwrap();
        let b = store.append_event("ticks", "tick", "{}", "test", 2, 0).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_read_after_returns_tail() {
        let store = StateStore::new(":memory:").unwrap();
        for i in 0..5 {
            store.append_event("s", "e", "{}", "test", i, 0).unwrap();
        }
        let tail = store.read_after("s", 3, 10).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
        assert_eq!(tail[1].seq, 5);
    }

    #[test]
    fn test_maxlen_evicts_oldest() {
        let store = StateStore::new(":memory:").unwrap();
        for i in 0..10 {
            store.append_event("s", "e", "{}", "test", i, 4).unwrap();
        }
        let (len, first, last) = store.stream_bounds("s").unwrap();
        assert_eq!(len, 4);
        assert_eq!(first, 7);
        assert_eq!(last, 10);
    }

    #[test]
    fn test_offsets_never_move_backwards() {
        let store = StateStore::new(":memory:").unwrap();
        store.commit_offset("s", "g", 5).unwrap();
        store.commit_offset("s", "g", 3).unwrap();
        assert_eq!(store.get_offset("s", "g").unwrap(), 5);
        assert_eq!(store.get_offset("s", "other").unwrap(), 0);
    }

    #[test]
    fn test_kv_round_trip() {
        let store = StateStore::new(":memory:").unwrap();
        assert!(store.get_kv("policy_state").unwrap().is_none());
        store.put_kv("policy_state", "{\"daily_trades\":3}").unwrap();
        store.put_kv("policy_state", "{\"daily_trades\":4}").unwrap();
        assert_eq!(
            store.get_kv("policy_state").unwrap().unwrap(),
            "{\"daily_trades\":4}"
        );
    }
}
