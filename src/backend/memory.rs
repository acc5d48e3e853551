//! Reference in-memory backend for tests. No durability: state is lost
//! when the process exits, and there's only ever one "connection". Mirrors
//! the original `StdQueue` implementation, generalized to support blocking
//! pop with a timeout and scheduled (deferred) entries, both of which the
//! reference implementation punted on.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{PersistentData, QueueBackend};
use crate::error::Result;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    /// Keyed by `(score, insertion_sequence)` so entries sharing a score
    /// preserve push order when migrated to the ready list.
    scheduled: BTreeMap<(i64, u64), String>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    persistent: Mutex<HashMap<String, PersistentData>>,
    expirations: Mutex<HashMap<String, i64>>,
    sequence: std::sync::atomic::AtomicU64,
    notify: Notify,
}

/// In-memory queue backend. Cheap to construct, safe to share via `Arc`
/// across multiple worker loops within a single process.
#[derive(Clone)]
pub struct MemoryBackend(std::sync::Arc<Inner>);

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend(std::sync::Arc::new(Inner {
            queues: Mutex::new(HashMap::new()),
            persistent: Mutex::new(HashMap::new()),
            expirations: Mutex::new(HashMap::new()),
            sequence: std::sync::atomic::AtomicU64::new(0),
            notify: Notify::new(),
        }))
    }

    fn now_unixt() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Move any scheduled entries whose score is `<= now` into the ready
    /// list of `queue`, in score order (ties by insertion order).
    fn migrate_scheduled(&self, queue: &mut QueueState, now: i64) {
        let ready_keys: Vec<(i64, u64)> = queue
            .scheduled
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();

        for key in ready_keys {
            if let Some(value) = queue.scheduled.remove(&key) {
                queue.ready.push_back(value);
            }
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, queue: &str, key: &str) -> Result<()> {
        let mut queues = self.0.queues.lock().unwrap();
        queues.entry(queue.to_string()).or_default().ready.push_back(key.to_string());
        self.0.notify.notify_waiters();
        Ok(())
    }

    async fn push_to_later(&self, queue: &str, key: &str, when: i64) -> Result<()> {
        let seq = self.0.sequence.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut queues = self.0.queues.lock().unwrap();
        queues
            .entry(queue.to_string())
            .or_default()
            .scheduled
            .insert((when, seq), key.to_string());
        self.0.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout_secs: u64) -> Result<Option<String>> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);

        loop {
            {
                let mut queues = self.0.queues.lock().unwrap();
                let state = queues.entry(queue.to_string()).or_default();
                self.migrate_scheduled(state, Self::now_unixt());
                if let Some(item) = state.ready.pop_front() {
                    return Ok(Some(item));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let remaining = deadline - now;
            let notified = self.0.notify.notified();
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn get_full_queue(&self, queue: &str) -> Result<Vec<String>> {
        let queues = self.0.queues.lock().unwrap();
        Ok(queues
            .get(queue)
            .map(|s| s.ready.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_persistent_data(&self, key: &str) -> Result<PersistentData> {
        let persistent = self.0.persistent.lock().unwrap();
        Ok(persistent.get(key).cloned().unwrap_or_default())
    }

    async fn get_persistent_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let persistent = self.0.persistent.lock().unwrap();
        Ok(persistent.get(key).and_then(|m| m.get(field).cloned()))
    }

    async fn set_persistent_data(&self, key: &str, data: &PersistentData) -> Result<()> {
        let mut persistent = self.0.persistent.lock().unwrap();
        let entry = persistent.entry(key.to_string()).or_default();
        for (field, value) in data {
            entry.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn del_persistent_data(&self, key: &str) -> Result<()> {
        self.0.persistent.lock().unwrap().remove(key);
        self.0.expirations.lock().unwrap().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        self.0
            .expirations
            .lock()
            .unwrap()
            .insert(key.to_string(), Self::now_unixt() + seconds);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let expirations = self.0.expirations.lock().unwrap();
        Ok(expirations
            .get(key)
            .map(|exp| exp - Self::now_unixt())
            .unwrap_or(-1))
    }
}
