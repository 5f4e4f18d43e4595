use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use dr_audit::AuditStore;
use dr_core::config::OverlayConfig;
use dr_core::events::{MetaKind, MetaRecord, OverlayEvent, StreamKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("overlay topic closed: {0}")]
    TopicClosed(String),
    #[error("audit store error: {0}")]
    Store(#[from] dr_audit::AuditError),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

/// Sequence used for the out-of-band slow-consumer disconnect marker.
/// It is not part of the canonical per-task sequence.
pub const OUT_OF_BAND_SEQ: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Where a subscriber wants to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeFrom {
    /// From the tail: only events published after the subscription.
    Live,
    /// From a specific sequence number, replaying history as needed.
    Seq(u64),
}

/// A live handle onto one task's overlay stream. Events arrive in strict
/// sequence order; the channel closes when the topic closes or the
/// subscriber is disconnected for falling behind.
pub struct Subscription {
    pub task_id: String,
    pub id: Uuid,
    rx: flume::Receiver<OverlayEvent>,
}

impl Subscription {
    pub async fn recv(&self) -> Option<OverlayEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<OverlayEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<OverlayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

// ---------------------------------------------------------------------------
// OverlayBroker
// ---------------------------------------------------------------------------

struct SubscriberSlot {
    id: Uuid,
    /// Unbounded channel, length-policed against the configured backlog.
    tx: flume::Sender<OverlayEvent>,
    /// Deliver only events with `seq >= from_seq`.
    from_seq: u64,
    /// Events replayed at attach time; the slow-consumer bound allows for
    /// them still sitting undrained.
    backlog_grace: usize,
}

#[derive(Default)]
struct Topic {
    next_seq: u64,
    live: VecDeque<OverlayEvent>,
    subscribers: Vec<SubscriberSlot>,
    closed: bool,
    saw_process_exit: bool,
}

/// Publishes byte-chunked PTY events on per-task topics, fanning out to
/// any number of subscribers without ever blocking the producer.
///
/// Every published event is persisted to the audit overlay stream before
/// it can be dropped from the bounded live window, so a late subscriber
/// replays the full history with no gaps and no duplicates.
pub struct OverlayBroker {
    store: Arc<AuditStore>,
    cfg: OverlayConfig,
    topics: Mutex<HashMap<String, Topic>>,
}

impl OverlayBroker {
    pub fn new(store: Arc<AuditStore>, cfg: OverlayConfig) -> Self {
        Self {
            store,
            cfg,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish one chunk. Returns the assigned sequence number.
    pub fn publish(
        &self,
        task_id: &str,
        stream: StreamKind,
        payload: Vec<u8>,
    ) -> Result<u64> {
        let mut topics = self.topics.lock().expect("topic map poisoned");
        let topic = topics.entry(task_id.to_string()).or_default();
        if topic.closed {
            return Err(OverlayError::TopicClosed(task_id.to_string()));
        }

        let event = OverlayEvent {
            task_id: task_id.to_string(),
            seq: topic.next_seq,
            ts_ns: OverlayEvent::now_ts_ns(),
            stream,
            payload,
        };
        topic.next_seq += 1;

        if stream == StreamKind::Meta {
            if let Some(record) = MetaRecord::from_bytes(&event.payload) {
                if record.kind == MetaKind::ProcessExit {
                    topic.saw_process_exit = true;
                }
            }
        }

        // Persist first; the live window is only a replay accelerator and
        // may drop the oldest event once it is durable.
        if let Err(e) = self.store.append_overlay(&event) {
            warn!(task_id, seq = event.seq, error = %e, "overlay persistence failed");
        }
        topic.live.push_back(event.clone());
        while topic.live.len() > self.cfg.live_window {
            topic.live.pop_front();
        }

        // Fan out. A subscriber whose backlog is full gets an out-of-band
        // slow_consumer marker and is dropped; it never slows anyone else.
        let backlog = self.cfg.subscriber_backlog;
        topic.subscribers.retain(|sub| {
            if event.seq < sub.from_seq {
                return true;
            }
            if sub.tx.len() >= backlog + sub.backlog_grace {
                warn!(task_id, subscriber = %sub.id, "slow consumer disconnected");
                let marker = OverlayEvent {
                    task_id: event.task_id.clone(),
                    seq: OUT_OF_BAND_SEQ,
                    ts_ns: OverlayEvent::now_ts_ns(),
                    stream: StreamKind::Meta,
                    payload: MetaRecord::new(MetaKind::SlowConsumer, "subscriber backlog full")
                        .to_bytes(),
                };
                let _ = sub.tx.send(marker);
                return false;
            }
            sub.tx.send(event.clone()).is_ok()
        });

        Ok(event.seq)
    }

    /// Publish a structured record on the META stream.
    pub fn publish_meta(&self, task_id: &str, record: MetaRecord) -> Result<u64> {
        self.publish(task_id, StreamKind::Meta, record.to_bytes())
    }

    /// Attach a subscriber.
    ///
    /// With `Seq(n)`, events `n..` are replayed from the persisted stream
    /// under the topic lock, then the subscription joins the live feed —
    /// no gap, no duplicate. `n` beyond the tail simply waits. With
    /// `Live`, only events published after this call are delivered.
    pub fn subscribe(&self, task_id: &str, from: SubscribeFrom) -> Result<Subscription> {
        let mut topics = self.topics.lock().expect("topic map poisoned");
        let topic = topics.entry(task_id.to_string()).or_default();
        let (tx, rx) = flume::unbounded();
        let id = Uuid::new_v4();

        let mut backlog_grace = 0;
        let from_seq = match from {
            SubscribeFrom::Live => topic.next_seq,
            SubscribeFrom::Seq(n) => {
                let mut next = n;
                if n < topic.next_seq {
                    // History exists; the persisted stream has all of it
                    // because persistence happens on publish.
                    for event in self.store.scan_overlay(task_id, n)? {
                        next = event.seq + 1;
                        backlog_grace += 1;
                        let _ = tx.send(event);
                    }
                }
                next
            }
        };

        if topic.closed {
            // Replay-only subscription: history has been delivered, close
            // the channel by dropping the sender.
            debug!(task_id, subscriber = %id, "subscription to closed topic served from history");
            drop(tx);
        } else {
            topic.subscribers.push(SubscriberSlot {
                id,
                tx,
                from_seq,
                backlog_grace,
            });
        }

        Ok(Subscription {
            task_id: task_id.to_string(),
            id,
            rx,
        })
    }

    /// Close a topic: synthesize META(process_exit) if the stream lacks
    /// one, disconnect subscribers after the final event, and seal the
    /// persisted stream. Idempotent.
    pub fn close(&self, task_id: &str) -> Result<()> {
        let mut topics = self.topics.lock().expect("topic map poisoned");
        let topic = topics.entry(task_id.to_string()).or_default();
        if topic.closed {
            return Ok(());
        }

        if !topic.saw_process_exit {
            let event = OverlayEvent {
                task_id: task_id.to_string(),
                seq: topic.next_seq,
                ts_ns: OverlayEvent::now_ts_ns(),
                stream: StreamKind::Meta,
                payload: MetaRecord::new(MetaKind::ProcessExit, "topic closed").to_bytes(),
            };
            topic.next_seq += 1;
            if let Err(e) = self.store.append_overlay(&event) {
                warn!(task_id, error = %e, "overlay persistence failed at close");
            }
            topic.live.push_back(event.clone());
            for sub in &topic.subscribers {
                if event.seq >= sub.from_seq {
                    let _ = sub.tx.send(event.clone());
                }
            }
        }

        topic.closed = true;
        topic.subscribers.clear();
        self.store.seal_overlay(task_id)?;
        info!(task_id, events = topic.next_seq, "overlay topic closed");
        Ok(())
    }

    /// Whether a topic has been closed.
    pub fn is_closed(&self, task_id: &str) -> bool {
        let topics = self.topics.lock().expect("topic map poisoned");
        topics.get(task_id).map(|t| t.closed).unwrap_or(false)
    }

    /// Number of events published so far for a task.
    pub fn tail_seq(&self, task_id: &str) -> u64 {
        let topics = self.topics.lock().expect("topic map poisoned");
        topics.get(task_id).map(|t| t.next_seq).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
