//! Queue service contract and an in-memory implementation.
//!
//! The poll dispatcher only talks to queues through [`QueueService`], so any
//! backend with SQS-like receive/delete semantics can be plugged in.
//! [`InMemoryQueueService`] keeps everything in process and is what the tests
//! and the example binary use.

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Longest visibility timeout a queue applies, as on SQS.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// A message as returned by a queue backend.
///
/// Every field is optional because backends are not trusted to fill them in;
/// translation rejects a batch containing a message without an id, receipt
/// handle or body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// Identifier assigned on send.
    pub message_id: Option<String>,
    /// Handle that deletes this particular receive.
    pub receipt_handle: Option<String>,
    /// Message body.
    pub body: Option<String>,
    /// Hex SHA-256 digest of the body, computed during translation when absent.
    pub body_checksum: Option<String>,
    /// System attributes.
    pub attributes: Option<HashMap<String, String>>,
    /// User-defined attributes.
    pub message_attributes: Option<HashMap<String, String>>,
}

/// The queue operations the poll dispatcher relies on.
#[async_trait]
pub trait QueueService: Send + Sync + 'static {
    /// Creates a queue, or returns the URL of an existing queue with this name.
    async fn create_queue(&self, name: &str) -> QueueResult<String>;

    /// Resolves a queue name to its URL.
    async fn get_queue_url(&self, name: &str) -> QueueResult<String>;

    /// Appends a message and returns its id.
    async fn send_message(&self, queue_url: &str, body: &str) -> QueueResult<String>;

    /// Receives up to `max_messages` messages, waiting at most `wait` for the
    /// first one to arrive. Returns an empty batch if none arrived in time.
    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: u32,
        wait: Duration,
    ) -> QueueResult<Vec<RawMessage>>;

    /// Acknowledges a received message so it is never delivered again.
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> QueueResult<()>;

    /// How long a received message stays hidden before it is delivered again.
    async fn visibility_timeout(&self, queue_url: &str) -> QueueResult<Duration>;
}

/// Hex SHA-256 digest of a message body.
pub fn body_checksum(body: &str) -> String {
    Sha256::digest(body.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    message_id: String,
    body: String,
    checksum: String,
    sent_at: DateTime<Utc>,
    receive_count: u32,
    first_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
    notify: Arc<Notify>,
}

impl QueueState {
    /// Moves in-flight messages whose visibility timeout elapsed back to the
    /// visible queue, in their original send order.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                self.visible.push_back(entry.message);
            }
        }
        self.visible
            .make_contiguous()
            .sort_by_key(|message| message.sequence);
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.visible_at).min()
    }

    fn take(&mut self, max_messages: usize, visibility_timeout: Duration) -> Vec<RawMessage> {
        let now = Utc::now();
        let visible_at = Instant::now() + visibility_timeout;
        let count = max_messages.min(self.visible.len());

        self.visible
            .drain(..count)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|mut message| {
                message.receive_count += 1;
                let first_received_at = *message.first_received_at.get_or_insert(now);
                let receipt_handle = Uuid::new_v4().to_string();

                let attributes = HashMap::from([
                    (
                        "ApproximateReceiveCount".to_string(),
                        message.receive_count.to_string(),
                    ),
                    (
                        "SentTimestamp".to_string(),
                        message.sent_at.timestamp_millis().to_string(),
                    ),
                    (
                        "ApproximateFirstReceiveTimestamp".to_string(),
                        first_received_at.timestamp_millis().to_string(),
                    ),
                ]);

                let raw = RawMessage {
                    message_id: Some(message.message_id.clone()),
                    receipt_handle: Some(receipt_handle.clone()),
                    body: Some(message.body.clone()),
                    body_checksum: Some(message.checksum.clone()),
                    attributes: Some(attributes),
                    message_attributes: Some(HashMap::new()),
                };

                self.in_flight.insert(
                    receipt_handle,
                    InFlight {
                        message,
                        visible_at,
                    },
                );
                raw
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Queues {
    by_url: HashMap<String, QueueState>,
    next_sequence: u64,
}

/// Process-local queue service with SQS-like visibility semantics.
///
/// Received messages stay in flight until deleted. If they are not deleted
/// within the visibility timeout they become visible again and are delivered
/// with a new receipt handle, giving at-least-once delivery.
#[derive(Debug)]
pub struct InMemoryQueueService {
    config: QueueConfig,
    queues: Mutex<Queues>,
}

impl Default for InMemoryQueueService {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryQueueService {
    /// Creates an empty service.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(Queues::default()),
        }
    }

    /// Creates an empty service wrapped in an `Arc`.
    pub fn new_shared(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    fn effective_visibility(&self) -> Duration {
        self.config.visibility_timeout.min(MAX_VISIBILITY_TIMEOUT)
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), name)
    }

    /// Messages currently available for receipt, including in-flight
    /// messages whose visibility timeout has elapsed.
    pub fn visible_count(&self, queue_url: &str) -> usize {
        let mut queues = self.queues.lock();
        queues.by_url.get_mut(queue_url).map_or(0, |queue| {
            queue.requeue_expired(Instant::now());
            queue.visible.len()
        })
    }

    /// Messages received but neither deleted nor returned to the queue yet.
    pub fn in_flight_count(&self, queue_url: &str) -> usize {
        let mut queues = self.queues.lock();
        queues.by_url.get_mut(queue_url).map_or(0, |queue| {
            queue.requeue_expired(Instant::now());
            queue.in_flight.len()
        })
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn create_queue(&self, name: &str) -> QueueResult<String> {
        if name.trim().is_empty() {
            return Err(QueueError::Unavailable("queue name is empty".to_string()));
        }

        let url = self.url_for(name);
        let mut queues = self.queues.lock();
        if !queues.by_url.contains_key(&url) {
            queues.by_url.insert(url.clone(), QueueState::default());
            tracing::debug!(queue = %name, url = %url, "Created queue");
        }
        Ok(url)
    }

    async fn get_queue_url(&self, name: &str) -> QueueResult<String> {
        let url = self.url_for(name);
        if self.queues.lock().by_url.contains_key(&url) {
            Ok(url)
        } else {
            Err(QueueError::QueueNotFound(name.to_string()))
        }
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> QueueResult<String> {
        let mut queues = self.queues.lock();
        let sequence = queues.next_sequence;
        let queue = queues
            .by_url
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::QueueNotFound(queue_url.to_string()))?;

        let message_id = Uuid::new_v4().to_string();
        queue.visible.push_back(StoredMessage {
            sequence,
            message_id: message_id.clone(),
            body: body.to_string(),
            checksum: body_checksum(body),
            sent_at: Utc::now(),
            receive_count: 0,
            first_received_at: None,
        });
        queue.notify.notify_one();
        queues.next_sequence += 1;

        Ok(message_id)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: u32,
        wait: Duration,
    ) -> QueueResult<Vec<RawMessage>> {
        let max_messages = max_messages.max(1) as usize;
        let deadline = Instant::now() + wait;

        loop {
            let (notify, next_expiry) = {
                let mut queues = self.queues.lock();
                let queue = queues
                    .by_url
                    .get_mut(queue_url)
                    .ok_or_else(|| QueueError::QueueNotFound(queue_url.to_string()))?;

                queue.requeue_expired(Instant::now());
                if !queue.visible.is_empty() {
                    return Ok(queue.take(max_messages, self.effective_visibility()));
                }
                (queue.notify.clone(), queue.next_expiry())
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> QueueResult<()> {
        let mut queues = self.queues.lock();
        let queue = queues
            .by_url
            .get_mut(queue_url)
            .ok_or_else(|| QueueError::QueueNotFound(queue_url.to_string()))?;

        queue
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| QueueError::ReceiptHandleInvalid(receipt_handle.to_string()))
    }

    async fn visibility_timeout(&self, queue_url: &str) -> QueueResult<Duration> {
        if self.queues.lock().by_url.contains_key(queue_url) {
            Ok(self.effective_visibility())
        } else {
            Err(QueueError::QueueNotFound(queue_url.to_string()))
        }
    }
}
