//! Durable append-only pub/sub log with consumer groups and a dead-letter
//! stream.
//!
//! Events live in the sqlite store (per-stream sequence order, ring
//! retention); `tokio::sync::Notify` wakes blocked readers on publish. A
//! consumer group is nothing more than a persisted read offset, so delivery
//! is at-least-once and a restarted consumer resumes where it acked.
//! Downstream handlers treat `event.id` as the idempotency key.

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout, Duration};

use crate::logging::{error_log, json_log, obj, v_num, v_str};
use crate::retry::{retry_async, RetryConfig};
use crate::state::now_ms;
use crate::storage::StateStore;

pub const DEAD_LETTER_STREAM: &str = "dead_letter";

/// One published record. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub stream: String,
    pub event_type: String,
    pub ts_ms: u64,
    pub payload: String,
    pub source: String,
    pub version: u32,
    pub seq: u64,
}

impl Event {
    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub lag: u64,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub length: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub groups: Vec<GroupInfo>,
}

pub struct EventBus {
    store: Arc<StateStore>,
    maxlen: u64,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl EventBus {
    pub fn new(store: Arc<StateStore>, maxlen: u64) -> Self {
        Self {
            store,
            maxlen,
            notifiers: Mutex::new(HashMap::new()),
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        let mut map = self.notifiers.lock().expect("notifier lock");
        map.entry(stream.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Append to the stream and wake blocked readers. Never waits on
    /// consumers; retention is a bounded ring (oldest evicted past maxlen).
    pub fn publish(
        &self,
        stream: &str,
        event_type: &str,
        payload: &Value,
        source: &str,
    ) -> Result<String> {
        let event = self.store.append_event(
            stream,
            event_type,
            &payload.to_string(),
            source,
            now_ms(),
            self.maxlen,
        )?;
        self.notifier(stream).notify_waiters();
        json_log(
            "bus.publish",
            obj(&[
                ("stream", v_str(stream)),
                ("event_type", v_str(event_type)),
                ("event_id", v_str(&event.id)),
                ("source", v_str(source)),
            ]),
        );
        Ok(event.id)
    }

    /// A named consumer-group cursor over one stream. Restartable: the
    /// committed offset lives in the store, not in this handle.
    pub fn subscribe(self: &Arc<Self>, stream: &str, group: &str) -> Subscription {
        Subscription {
            store: self.store.clone(),
            notify: self.notifier(stream),
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    /// Route a failed event to the dead-letter stream.
    pub fn dead_letter(&self, event: &Event, error: &str) -> Result<String> {
        let payload = json!({
            "original_id": event.id,
            "stream": event.stream,
            "payload": event.payload,
            "error": error,
            "ts": now_ms(),
        });
        self.publish(DEAD_LETTER_STREAM, "dead_letter", &payload, &event.stream)
    }

    pub fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        let (length, first_seq, last_seq) = self.store.stream_bounds(stream)?;
        let groups = self
            .store
            .groups_for(stream)?
            .into_iter()
            .map(|(name, next_seq)| GroupInfo {
                name,
                lag: last_seq.saturating_sub(next_seq),
            })
            .collect();
        Ok(StreamInfo {
            length,
            first_seq,
            last_seq,
            groups,
        })
    }

    pub fn trim(&self, stream: &str, maxlen: u64) -> Result<usize> {
        self.store.trim(stream, maxlen)
    }

    /// Drive one consumer group until shutdown. At-least-once: an event is
    /// acked only after the handler returns Ok; a handler error routes it to
    /// the dead-letter stream and processing continues with the next event
    /// (no poison-pill stall). Store failures back off and retry.
    pub async fn run_consumer<F>(
        self: &Arc<Self>,
        stream: &str,
        group: &str,
        block_timeout: Duration,
        batch_size: usize,
        mut shutdown: watch::Receiver<bool>,
        mut handler: F,
    ) -> Result<()>
    where
        F: FnMut(&Event) -> Result<()>,
    {
        let sub = self.subscribe(stream, group);
        let retry_cfg = RetryConfig::default();
        let mut consecutive_read_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let batch = tokio::select! {
                res = sub.next_batch(block_timeout, batch_size) => res,
                _ = shutdown.changed() => continue,
            };
            let batch = match batch {
                Ok(batch) => {
                    consecutive_read_errors = 0;
                    batch
                }
                Err(err) => {
                    consecutive_read_errors += 1;
                    error_log(
                        "bus.read_error",
                        obj(&[
                            ("stream", v_str(stream)),
                            ("group", v_str(group)),
                            ("error", v_str(&err.to_string())),
                            ("attempt", v_num(consecutive_read_errors as f64)),
                        ]),
                    );
                    sleep(Duration::from_millis(
                        100u64.saturating_mul(1u64 << consecutive_read_errors.min(6)),
                    ))
                    .await;
                    continue;
                }
            };

            for event in &batch {
                if let Err(err) = handler(event) {
                    let msg = err.to_string();
                    error_log(
                        "bus.handler_error",
                        obj(&[
                            ("stream", v_str(stream)),
                            ("group", v_str(group)),
                            ("event_id", v_str(&event.id)),
                            ("error", v_str(&msg)),
                        ]),
                    );
                    retry_async(&retry_cfg, "bus.dead_letter", || async {
                        self.dead_letter(event, &msg).map(|_| ())
                    })
                    .await?;
                }
                retry_async(&retry_cfg, "bus.ack", || async { sub.ack(event) }).await?;
            }
        }
    }
}

pub struct Subscription {
    store: Arc<StateStore>,
    notify: Arc<Notify>,
    stream: String,
    group: String,
}

impl Subscription {
    /// Up to `batch_size` events past the group's committed offset, waiting
    /// up to `block_timeout` when the stream tail is empty. An empty batch on
    /// timeout keeps idle consumers live and shutdown observable.
    pub async fn next_batch(&self, block_timeout: Duration, batch_size: usize) -> Result<Vec<Event>> {
        let after = self.store.get_offset(&self.stream, &self.group)?;
        let events = self.store.read_after(&self.stream, after, batch_size)?;
        if !events.is_empty() {
            return Ok(events);
        }
        // Re-check after the wait: a publish between the read and the wait
        // still lands within one block_timeout.
        let _ = timeout(block_timeout, self.notify.notified()).await;
        let after = self.store.get_offset(&self.stream, &self.group)?;
        self.store.read_after(&self.stream, after, batch_size)
    }

    /// Commit the offset past this event. Unacked events are redelivered.
    pub fn ack(&self, event: &Event) -> Result<()> {
        self.store.commit_offset(&self.stream, &self.group, event.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn make_bus() -> Arc<EventBus> {
        let store = Arc::new(StateStore::new(":memory:").unwrap());
        Arc::new(EventBus::new(store, 1000))
    }

    #[tokio::test]
    async fn test_publish_subscribe_ack() {
        let bus = make_bus();
        let id = bus
            .publish("ticks", "tick", &json!({"price": 100.0}), "test")
            .unwrap();
        let sub = bus.subscribe("ticks", "g1");

        let batch = sub.next_batch(Duration::from_millis(50), 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].event_type, "tick");

        // Unacked: redelivered.
        let again = sub.next_batch(Duration::from_millis(50), 10).await.unwrap();
        assert_eq!(again.len(), 1);

        sub.ack(&batch[0]).unwrap();
        let empty = sub.next_batch(Duration::from_millis(20), 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_groups_are_independent() {
        let bus = make_bus();
        bus.publish("s", "e", &json!({}), "test").unwrap();
        let g1 = bus.subscribe("s", "g1");
        let g2 = bus.subscribe("s", "g2");

        let b1 = g1.next_batch(Duration::from_millis(20), 10).await.unwrap();
        g1.ack(&b1[0]).unwrap();

        // g2 still sees the event after g1 acked it.
        let b2 = g2.next_batch(Duration::from_millis(20), 10).await.unwrap();
        assert_eq!(b2.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_reader_wakes_on_publish() {
        let bus = make_bus();
        let sub = bus.subscribe("s", "g");
        let bus2 = bus.clone();
        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            bus2.publish("s", "e", &json!({"n": 1}), "test").unwrap();
        });
        let batch = sub.next_batch(Duration::from_secs(2), 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_routes_to_dlq_and_continues() {
        let bus = make_bus();
        for i in 0..3 {
            bus.publish("s", "e", &json!({"n": i}), "test").unwrap();
        }
        let poison_id = {
            let sub = bus.subscribe("s", "peek");
            let batch = sub.next_batch(Duration::from_millis(20), 10).await.unwrap();
            batch[1].id.clone()
        };

        let (tx, rx) = watch::channel(false);
        let processed = Arc::new(Mutex::new(Vec::new()));
        let processed2 = processed.clone();
        let poison = poison_id.clone();
        let bus2 = bus.clone();
        let consumer = tokio::spawn(async move {
            bus2.run_consumer(
                "s",
                "workers",
                Duration::from_millis(10),
                10,
                rx,
                move |event| {
                    if event.id == poison {
                        return Err(anyhow!("boom"));
                    }
                    processed2.lock().unwrap().push(event.id.clone());
                    Ok(())
                },
            )
            .await
        });

        sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();

        // The two healthy events were handled despite the poison pill.
        assert_eq!(processed.lock().unwrap().len(), 2);

        // And the DLQ entry references the failed event's id.
        let dlq = bus.subscribe(DEAD_LETTER_STREAM, "audit");
        let entries = dlq.next_batch(Duration::from_millis(20), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let payload = entries[0].payload_json().unwrap();
        assert_eq!(payload["original_id"], json!(poison_id));
        assert_eq!(payload["error"], json!("boom"));
    }

    #[tokio::test]
    async fn test_stream_info_reports_lag() {
        let bus = make_bus();
        for _ in 0..5 {
            bus.publish("s", "e", &json!({}), "test").unwrap();
        }
        let sub = bus.subscribe("s", "g");
        let batch = sub.next_batch(Duration::from_millis(20), 2).await.unwrap();
        for event in &batch {
            sub.ack(event).unwrap();
        }

        let info = bus.stream_info("s").unwrap();
        assert_eq!(info.length, 5);
        assert_eq!(info.last_seq, 5);
        assert_eq!(info.groups.len(), 1);
        assert_eq!(info.groups[0].name, "g");
        assert_eq!(info.groups[0].lag, 3);
    }

    #[tokio::test]
    async fn test_trim_bounds_retention() {
        let bus = make_bus();
        for _ in 0..10 {
            bus.publish("s", "e", &json!({}), "test").unwrap();
        }
        let evicted = bus.trim("s", 3).unwrap();
        assert_eq!(evicted, 7);
        let info = bus.stream_info("s").unwrap();
        assert_eq!(info.length, 3);
        assert_eq!(info.first_seq, 8);
    }
}
