//! Queue backend abstraction: push / deferred-push / blocking-pop /
//! persistent-kv, implemented by an in-memory reference backend and a
//! durable Redis backend.

pub mod memory;
pub mod redis_backend;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;

/// A persistent job record's field-level key/value view, as stored under
/// `job_instance:<uuid>`. Kept as a plain string map (mirroring a Redis
/// hash) rather than a typed struct so `SetPersistentData`'s merge
/// semantics - only the mentioned fields are touched - fall out naturally.
pub type PersistentData = HashMap<String, String>;

/// Abstract queue backend. Every operation may fail with a transient I/O
/// error (`Error::BackendUnavailable` or `Error::RedisError`), which
/// propagates to the caller unchanged.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append `key` at the tail of `queue`'s ready list.
    async fn push(&self, queue: &str, key: &str) -> Result<()>;

    /// Insert `key` into `queue`'s scheduled set with score `when` (unix
    /// seconds). Becomes eligible for `pop` no earlier than `when`.
    async fn push_to_later(&self, queue: &str, key: &str, when: i64) -> Result<()>;

    /// Atomically migrate any scheduled entries whose score is `<= now`
    /// into the ready list, then block-pop the head of the ready list for
    /// up to `timeout_secs`. Returns `None` on timeout.
    ///
    /// Because the scheduled set is only consulted after the blocking pop
    /// either returns a ready-list item or times out, a scheduled entry
    /// whose deadline has already passed is not guaranteed to be
    /// delivered until the next `pop` cycle completes - the worker's
    /// `queueTimeout` therefore bounds the tail latency of deferred jobs.
    async fn pop(&self, queue: &str, timeout_secs: u64) -> Result<Option<String>>;

    /// Snapshot of the ready list, for introspection (not consumed).
    async fn get_full_queue(&self, queue: &str) -> Result<Vec<String>>;

    async fn get_persistent_data(&self, key: &str) -> Result<PersistentData>;

    async fn get_persistent_field(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Upsert fields of a persistent record. Fields not mentioned in
    /// `data` are left untouched (merge, not replace).
    async fn set_persistent_data(&self, key: &str, data: &PersistentData) -> Result<()>;

    async fn del_persistent_data(&self, key: &str) -> Result<()>;

    async fn expire(&self, key: &str, seconds: i64) -> Result<()>;

    async fn ttl(&self, key: &str) -> Result<i64>;
}
