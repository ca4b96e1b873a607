//! Priority message bus.
//!
//! Four inbound sub-queues (URGENT > HIGH > NORMAL > LOW) with content-hash
//! deduplication, bounded retries that demote priority, a dead-letter queue,
//! optional per-message JSON persistence, and a single outbound FIFO.
//!
//! The bus is the only component allowed to touch its queues; everything
//! else goes through `enqueue` / `dequeue` / `mark_*` / `publish_outbound` /
//! `consume_outbound`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use countbot_core::types::{InboundMessage, MessagePriority, OutboundMessage, QueuedMessage};

/// Monitoring snapshot returned by [`MessageBus::metrics`].
#[derive(Debug, Clone, Serialize)]
pub struct BusMetrics {
    pub total_received: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_duplicates: u64,
    /// Per-priority inbound depth, keyed by priority name.
    pub queue_sizes: HashMap<String, usize>,
    pub dead_letter_size: usize,
}

#[derive(Default)]
struct Counters {
    received: u64,
    processed: u64,
    failed: u64,
    duplicates: u64,
}

struct InboundState {
    /// Indexed by `MessagePriority as usize`.
    queues: [VecDeque<QueuedMessage>; 4],
    /// fingerprint -> enqueue unix timestamp (seconds).
    fingerprints: HashMap<String, f64>,
    dead_letters: VecDeque<(QueuedMessage, String)>,
    counters: Counters,
}

pub struct MessageBus {
    inbound: Mutex<InboundState>,
    inbound_notify: Notify,
    outbound: Mutex<VecDeque<OutboundMessage>>,
    outbound_notify: Notify,
    dedup_enabled: bool,
    dedup_window_secs: f64,
    persist_dir: Option<PathBuf>,
}

impl MessageBus {
    pub fn new(
        persist_dir: Option<PathBuf>,
        enable_persistence: bool,
        dedup_window_secs: u64,
    ) -> Self {
        let persist_dir = if enable_persistence {
            if let Some(ref dir) = persist_dir {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    error!(dir = %dir.display(), "failed to create persist dir: {e}");
                }
            }
            persist_dir
        } else {
            None
        };

        Self {
            inbound: Mutex::new(InboundState {
                queues: Default::default(),
                fingerprints: HashMap::new(),
                dead_letters: VecDeque::new(),
                counters: Counters::default(),
            }),
            inbound_notify: Notify::new(),
            outbound: Mutex::new(VecDeque::new()),
            outbound_notify: Notify::new(),
            dedup_enabled: true,
            dedup_window_secs: dedup_window_secs as f64,
            persist_dir,
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Enqueue an inbound message. Returns `false` when the message was
    /// dropped as a duplicate within the dedup window.
    pub fn enqueue(&self, message: InboundMessage, priority: MessagePriority) -> bool {
        let queued = {
            let mut state = self.inbound.lock().unwrap();

            if self.dedup_enabled {
                let fp = fingerprint(&message);
                if is_duplicate(&mut state.fingerprints, &fp, self.dedup_window_secs) {
                    state.counters.duplicates += 1;
                    warn!(
                        hash = %&fp[..8],
                        channel = %message.channel,
                        sender = %message.sender_id,
                        "duplicate message dropped"
                    );
                    return false;
                }
                state.fingerprints.insert(fp, now_secs());
            }

            let queued = QueuedMessage::new(message, priority);
            state.queues[priority as usize].push_back(queued.clone());
            state.counters.received += 1;
            queued
        };

        self.persist(&queued);
        debug!(id = %&queued.id[..8], priority = priority.name(), "message enqueued");
        self.inbound_notify.notify_one();
        true
    }

    /// Dequeue the highest-priority pending message, suspending while all
    /// sub-queues are empty. When several queues fill during one wait, the
    /// re-scan keeps strict URGENT-first ordering.
    pub async fn dequeue(&self) -> QueuedMessage {
        loop {
            {
                let mut state = self.inbound.lock().unwrap();
                for priority in MessagePriority::ORDERED {
                    if let Some(msg) = state.queues[priority as usize].pop_front() {
                        debug!(id = %&msg.id[..8], priority = priority.name(), "message dequeued");
                        return msg;
                    }
                }
            }
            self.inbound_notify.notified().await;
        }
    }

    /// Record successful processing and drop the persistence file.
    pub fn mark_success(&self, msg: &QueuedMessage) {
        self.inbound.lock().unwrap().counters.processed += 1;
        self.delete_persisted(&msg.id);
    }

    /// Record a failure. Below the retry ceiling the message is re-enqueued
    /// one priority lower; at the ceiling it moves to the dead-letter queue
    /// (its persistence file is kept for inspection).
    pub fn mark_failed(&self, mut msg: QueuedMessage, error: &str) {
        msg.retry_count += 1;
        let mut state = self.inbound.lock().unwrap();

        if msg.retry_count < msg.max_retries {
            let lower = msg.priority.demoted();
            msg.priority = lower;
            warn!(
                id = %&msg.id[..8],
                retry = msg.retry_count,
                max = msg.max_retries,
                "message retry"
            );
            state.queues[lower as usize].push_back(msg);
            drop(state);
            self.inbound_notify.notify_one();
        } else {
            error!(id = %&msg.id[..8], error, "message moved to DLQ");
            state.dead_letters.push_back((msg, error.to_string()));
            state.counters.failed += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub fn publish_outbound(&self, message: OutboundMessage) {
        debug!(channel = %message.channel, chat = %message.chat_id, "outbound published");
        self.outbound.lock().unwrap().push_back(message);
        self.outbound_notify.notify_one();
    }

    /// Pop the next outbound message, suspending while the queue is empty.
    pub async fn consume_outbound(&self) -> OutboundMessage {
        loop {
            if let Some(msg) = self.outbound.lock().unwrap().pop_front() {
                return msg;
            }
            self.outbound_notify.notified().await;
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn metrics(&self) -> BusMetrics {
        let state = self.inbound.lock().unwrap();
        let queue_sizes = MessagePriority::ORDERED
            .iter()
            .map(|p| (p.name().to_string(), state.queues[*p as usize].len()))
            .collect();
        BusMetrics {
            total_received: state.counters.received,
            total_processed: state.counters.processed,
            total_failed: state.counters.failed,
            total_duplicates: state.counters.duplicates,
            queue_sizes,
            dead_letter_size: state.dead_letters.len(),
        }
    }

    pub fn inbound_size(&self) -> usize {
        let state = self.inbound.lock().unwrap();
        state.queues.iter().map(|q| q.len()).sum()
    }

    pub fn outbound_size(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    pub fn dead_letter_size(&self) -> usize {
        self.inbound.lock().unwrap().dead_letters.len()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist(&self, msg: &QueuedMessage) {
        let Some(ref dir) = self.persist_dir else {
            return;
        };
        let path = dir.join(format!("{}.json", msg.id));
        match serde_json::to_string_pretty(msg) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    error!(path = %path.display(), "failed to persist message: {e}");
                }
            }
            Err(e) => error!("failed to serialise queued message: {e}"),
        }
    }

    fn delete_persisted(&self, id: &str) {
        let Some(ref dir) = self.persist_dir else {
            return;
        };
        let path = dir.join(format!("{id}.json"));
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                error!(path = %path.display(), "failed to delete persisted message: {e}");
            }
        }
    }
}

/// md5 over `channel:chat_id:sender_id:content`, hex encoded.
fn fingerprint(msg: &InboundMessage) -> String {
    let mut hasher = Md5::new();
    hasher.update(
        format!(
            "{}:{}:{}:{}",
            msg.channel, msg.chat_id, msg.sender_id, msg.content
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Window check with lazy expiry: a fingerprint older than the window is
/// forgotten and the message treated as new.
fn is_duplicate(fingerprints: &mut HashMap<String, f64>, fp: &str, window_secs: f64) -> bool {
    match fingerprints.get(fp) {
        None => false,
        Some(&ts) => {
            if now_secs() - ts > window_secs {
                fingerprints.remove(fp);
                false
            } else {
                true
            }
        }
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
