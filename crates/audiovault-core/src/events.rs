//! Topic-based event bus with a worker pool and delivery retries
//!
//! Publishers post JSON payloads to named topics; subscribers register
//! handlers and receive events on pool threads, never on the publishing
//! thread. A failed handler is retried with exponential backoff up to a
//! fixed attempt limit, then the delivery is counted as failed.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);
const QUEUE_CAPACITY: usize = 1024;

/// One published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

pub type Handler = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;

/// Proof of subscription; pass back to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

struct Subscription {
    id: u64,
    handler: Arc<Handler>,
}

struct DeliveryJob {
    event: Arc<Event>,
    handler: Arc<Handler>,
    attempt: u32,
    not_before: Instant,
}

/// Cumulative delivery counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusStats {
    pub events_published: u64,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

/// Shared bus; clone-free, hold behind an `Arc`
pub struct EventBus {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
    sender: Sender<DeliveryJob>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl EventBus {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = bounded::<DeliveryJob>(QUEUE_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let retry_sender = sender.clone();
            let running = Arc::clone(&running);
            let counters = Arc::clone(&counters);
            workers.push(std::thread::spawn(move || {
                worker_loop(receiver, retry_sender, running, counters);
            }));
        }

        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender,
            running,
            workers: Mutex::new(workers),
            counters,
        }
    }

    fn lock_subs(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handler for a topic prefix.
    ///
    /// A subscription to `"device."` receives `"device.connected"`,
    /// `"device.disconnected"`, and so on; an exact topic works as a
    /// prefix of itself.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_subs()
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        tracing::debug!(topic, subscription_id = id, "Subscriber registered");
        SubscriptionHandle {
            id,
            topic: topic.to_string(),
        }
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subs = self.lock_subs();
        let Some(list) = subs.get_mut(&handle.topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != handle.id);
        let removed = list.len() < before;
        if list.is_empty() {
            subs.remove(&handle.topic);
        }
        removed
    }

    /// Publish an event; deliveries happen asynchronously on the pool
    pub fn publish(&self, topic: &str, payload: Value, source: &str) -> Event {
        let event = Arc::new(Event {
            id: Uuid::new_v4().simple().to_string(),
            topic: topic.to_string(),
            payload,
            source: source.to_string(),
            timestamp: Utc::now(),
        });
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<Arc<Handler>> = self
            .lock_subs()
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .flat_map(|(_, list)| list.iter().map(|s| Arc::clone(&s.handler)))
            .collect();

        for handler in handlers {
            let job = DeliveryJob {
                event: Arc::clone(&event),
                handler,
                attempt: 1,
                not_before: Instant::now(),
            };
            if self.sender.send(job).is_err() {
                tracing::error!(topic, "Event queue closed, delivery dropped");
            }
        }

        tracing::trace!(topic, event_id = %event.id, "Event published");
        Event::clone(&event)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock_subs().get(topic).map_or(0, |list| list.len())
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.counters.published.load(Ordering::Relaxed),
            deliveries_ok: self.counters.ok.load(Ordering::Relaxed),
            deliveries_failed: self.counters.failed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker pool; pending deliveries are abandoned
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("Event worker panicked");
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    receiver: Receiver<DeliveryJob>,
    retry_sender: Sender<DeliveryJob>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    loop {
        let job = match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if running.load(Ordering::SeqCst) {
                    continue;
                }
                return;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let now = Instant::now();
        if job.not_before > now {
            std::thread::sleep(job.not_before - now);
        }

        match (job.handler)(&job.event) {
            Ok(()) => {
                counters.ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if job.attempt < MAX_ATTEMPTS => {
                counters.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    topic = %job.event.topic,
                    event_id = %job.event.id,
                    attempt = job.attempt,
                    error = %err,
                    "Delivery failed, retrying"
                );
                let backoff = RETRY_BASE * 2u32.saturating_pow(job.attempt - 1);
                let retry = DeliveryJob {
                    event: Arc::clone(&job.event),
                    handler: Arc::clone(&job.handler),
                    attempt: job.attempt + 1,
                    not_before: Instant::now() + backoff,
                };
                if retry_sender.send(retry).is_err() {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    topic = %job.event.topic,
                    event_id = %job.event.id,
                    attempts = job.attempt,
                    error = %err,
                    "Delivery abandoned"
                );
            }
        }
    }
}
