//! The worker: pops a key, rehydrates the job behind it, runs one attempt
//! through the process isolator, and applies the retry/removal policy to
//! the persistent record. Generalized over the backend and registry
//! abstractions instead of being wired directly to one queue client.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{PersistentData, QueueBackend};
use crate::error::{Error, Result};
use crate::observer::{NullObserver, Observer};
use crate::payload;
use crate::process;
use crate::registry::{Job, Registry};

/// The terminal outcome of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    NoError,
    ErrorRetry,
    ErrorRemove,
    ErrExcept,
}

/// Tunables for a `Worker`. Construct with `WorkerConfig::default()` and
/// override individual fields.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Run each attempt in a forked child process (Unix only; ignored
    /// elsewhere, where attempts always run in-process).
    pub fork_to_handle: bool,
    /// Delete a job's record immediately on success instead of retaining
    /// it with a TTL.
    pub clean_successful_jobs_logs: bool,
    /// TTL applied to retained records (successes when
    /// `clean_successful_jobs_logs` is false, and every terminal failure).
    pub job_log_expire_seconds: i64,
    /// Seconds for one blocking-pop attempt.
    pub queue_timeout: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            fork_to_handle: cfg!(unix),
            clean_successful_jobs_logs: false,
            job_log_expire_seconds: 3600,
            queue_timeout: 5,
        }
    }
}

struct Inner {
    queue: String,
    backend: Arc<dyn QueueBackend>,
    registry: Arc<Registry>,
    observer: Arc<dyn Observer>,
    config: WorkerConfig,
    stop: AtomicBool,
}

/// A worker bound to one named queue, backend, registry and observer.
/// Cheap to clone - every clone shares the same stop flag, so stopping one
/// handle stops every clone's `run_loop`.
pub struct Worker(Arc<Inner>);

impl Clone for Worker {
    fn clone(&self) -> Self {
        Worker(self.0.clone())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.0.queue)
            .field("config", &self.0.config)
            .finish()
    }
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        registry: Arc<Registry>,
        config: WorkerConfig,
    ) -> Self {
        Worker(Arc::new(Inner {
            queue: queue.into(),
            backend,
            registry,
            observer: Arc::new(NullObserver),
            config,
            stop: AtomicBool::new(false),
        }))
    }

    /// Attach an observer, replacing the default no-op one.
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        let inner = Arc::get_mut(&mut self.0).expect("with_observer called before sharing the worker");
        inner.observer = observer;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.0.queue
    }

    /// Request that a running `run_loop` stop after its current iteration.
    pub fn request_stop(&self) {
        self.0.stop.store(true, Ordering::Relaxed);
    }

    fn observe(&self, f: impl FnOnce(&dyn Observer)) {
        let observer = self.0.observer.as_ref();
        if std::panic::catch_unwind(AssertUnwindSafe(|| f(observer))).is_err() {
            tracing::error!(queue = %self.0.queue, "observer hook panicked; ignoring");
        }
    }

    /// Encode and enqueue `job`. If `scheduled_at` (unix seconds) is given,
    /// the job becomes eligible no earlier than that instant; otherwise it
    /// is appended to the ready list immediately. Returns the generated
    /// uuid.
    pub async fn push<T>(&self, job: T, scheduled_at: Option<i64>) -> Result<String>
    where
        T: Job,
    {
        let maxtries = job.max_tries();
        let envelope = payload::encode(&job, 0, maxtries);
        let persistent_key = format!("job_instance:{}", envelope.uuid);
        let payload_str = payload::stringify(&envelope)?;

        let mut record = PersistentData::new();
        record.insert("tries".to_string(), "0".to_string());
        record.insert("maxtries".to_string(), maxtries.to_string());
        record.insert("payload".to_string(), payload_str);
        record.insert(
            "created_at_unixt".to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );
        record.insert("className".to_string(), T::NAME.to_string());

        self.0
            .backend
            .set_persistent_data(&persistent_key, &record)
            .await?;

        match scheduled_at {
            Some(when) => {
                self.0
                    .backend
                    .push_to_later(&self.0.queue, &persistent_key, when)
                    .await?
            }
            None => self.0.backend.push(&self.0.queue, &persistent_key).await?,
        }

        self.observe(|o| o.on_job_queued(&self.0.queue, T::NAME, &envelope.uuid));
        Ok(envelope.uuid)
    }

    /// Run one iteration: pop, execute, persist the outcome. Returns
    /// `Ok(false)` when there was nothing to do (pop timed out, or the
    /// backend was transiently unavailable) and `Ok(true)` whenever an
    /// attempt - or a silent drop of a garbage-collected key - occurred.
    pub async fn do_one(&self) -> Result<bool> {
        let key = match self.0.backend.pop(&self.0.queue, self.0.config.queue_timeout).await {
            Ok(Some(key)) => key,
            Ok(None) => return Ok(false),
            Err(Error::BackendUnavailable(reason)) => {
                tracing::warn!(queue = %self.0.queue, reason, "backend unavailable, treating as no work");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut record = self.0.backend.get_persistent_data(&key).await?;
        if record.is_empty() {
            // The record was already reaped (e.g. by a TTL) between pop and
            // this read; drop the key silently, no retry.
            return Ok(true);
        }

        let tries: u32 = record.get("tries").and_then(|s| s.parse().ok()).unwrap_or(0);
        let maxtries: u32 = record
            .get("maxtries")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let envelope = match record
            .get("payload")
            .ok_or_else(|| Error::MalformedPayload("record is missing its payload field".to_string()))
            .and_then(|raw| payload::parse(raw))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                // No className survives a payload we couldn't even parse.
                let uuid = key.strip_prefix("job_instance:").unwrap_or(&key).to_string();
                record.insert("tries".to_string(), (tries + 1).to_string());
                record.insert("LastException".to_string(), e.to_string());
                self.finalize(&key, &mut record, JobStatus::ErrorRemove, "unknown", &uuid, tries + 1)
                    .await?;
                return Ok(true);
            }
        };

        let mut envelope = envelope;
        payload::inject_attempt_counts(&mut envelope.data, tries, maxtries);
        let class_name = envelope.class_name.clone();
        let uuid = envelope.uuid.clone();

        self.observe(|o| o.on_job_started(&self.0.queue, &class_name, &uuid, tries + 1));
        let start_time = Instant::now();

        let (status, stdout, stderr, last_exception) =
            match payload::decode(&self.0.registry, &envelope) {
                Ok(mut job) => {
                    let output = process::run_attempt(job.as_mut(), &uuid, self.0.config.fork_to_handle);
                    let retry_if_error = job.retry_if_error();
                    let status = apply_retry_condition(output.status, retry_if_error, tries, maxtries);
                    (status, output.stdout, output.stderr, output.last_exception)
                }
                Err(e) => {
                    // A class name with no registered factory: retryable,
                    // not terminal - the payload may be transiently
                    // corrupt under a partial write rather than genuinely
                    // unregistered.
                    let status = apply_retry_condition(JobStatus::ErrorRetry, true, tries, maxtries);
                    (status, String::new(), String::new(), Some(e.to_string()))
                }
            };

        record.insert("tries".to_string(), (tries + 1).to_string());
        if !stdout.is_empty() {
            record.insert("JobStdout".to_string(), stdout);
        }
        if !stderr.is_empty() {
            record.insert("JobStderr".to_string(), stderr);
        }
        if let Some(exception) = &last_exception {
            record.insert("LastException".to_string(), exception.clone());
        }

        // onJobCompleted must fire before the result policy re-enqueues or
        // removes the record, so it is always observed ahead of onJobRetry
        // (see the ordering guarantee in `crate::observer`).
        self.observe(|o| o.on_job_completed(&self.0.queue, &class_name, &uuid, &status, start_time, tries + 1));
        self.finalize(&key, &mut record, status, &class_name, &uuid, tries + 1)
            .await?;

        Ok(true)
    }

    /// Apply the result policy (persist/expire/re-enqueue as appropriate)
    /// and fire the matching observer hook.
    async fn finalize(
        &self,
        key: &str,
        record: &mut PersistentData,
        status: JobStatus,
        class_name: &str,
        uuid: &str,
        total_tries: u32,
    ) -> Result<()> {
        match status {
            JobStatus::NoError => {
                if self.0.config.clean_successful_jobs_logs {
                    self.0.backend.del_persistent_data(key).await?;
                } else {
                    self.0.backend.set_persistent_data(key, record).await?;
                    self.0
                        .backend
                        .expire(key, self.0.config.job_log_expire_seconds)
                        .await?;
                }
            }
            JobStatus::ErrorRemove => {
                self.0.backend.set_persistent_data(key, record).await?;
                self.0
                    .backend
                    .expire(key, self.0.config.job_log_expire_seconds)
                    .await?;
                self.observe(|o| o.on_job_removed(&self.0.queue, class_name, uuid, &status, total_tries));
            }
            JobStatus::ErrorRetry | JobStatus::ErrExcept => {
                self.0.backend.set_persistent_data(key, record).await?;

                let retry_after = record
                    .get("retryAfter")
                    .and_then(|s| s.parse::<i64>().ok())
                    .filter(|secs| *secs > 0);

                // Fire onJobRetry before re-enqueuing: the record must not
                // become visible to another worker until this observer
                // call has returned.
                self.observe(|o| {
                    o.on_job_retry(
                        &self.0.queue,
                        class_name,
                        uuid,
                        total_tries,
                        retry_after.unwrap_or(0),
                    )
                });

                match retry_after {
                    Some(secs) => {
                        let when = chrono::Utc::now().timestamp() + secs;
                        self.0.backend.push_to_later(&self.0.queue, key, when).await?;
                    }
                    None => self.0.backend.push(&self.0.queue, key).await?,
                }
            }
        }

        Ok(())
    }

    /// Call `do_one` until `request_stop` has been called. The flag is
    /// only checked between iterations - an in-flight attempt always runs
    /// to completion.
    pub async fn run_loop(&self) -> Result<()> {
        while !self.0.stop.load(Ordering::Relaxed) {
            self.do_one().await?;
        }
        Ok(())
    }

    /// Snapshot of how many ready-list entries belong to each registered
    /// class name. Reads one persistent record per queued key, so cost is
    /// linear in queue depth - meant for introspection/dashboards, not the
    /// hot path.
    pub async fn queue_job_counts(&self) -> Result<HashMap<String, usize>> {
        let keys = self.0.backend.get_full_queue(&self.0.queue).await?;
        let mut counts = HashMap::new();

        for key in keys {
            let class_name = self
                .0
                .backend
                .get_persistent_field(&key, "className")
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            *counts.entry(class_name).or_insert(0) += 1;
        }

        Ok(counts)
    }
}

/// The retry condition function: a non-success outcome is kept as a retry
/// only if the job allows it and there's a try budget left; otherwise
/// it's upgraded to a terminal removal. `ErrExcept` is folded into the
/// same treatment as `ErrorRetry` (see `DESIGN.md`).
fn apply_retry_condition(
    status: JobStatus,
    retry_if_error: bool,
    tries: u32,
    maxtries: u32,
) -> JobStatus {
    match status {
        JobStatus::NoError | JobStatus::ErrorRemove => status,
        JobStatus::ErrorRetry | JobStatus::ErrExcept => {
            let would_retry = retry_if_error && tries + 1 <= maxtries;
            if would_retry {
                status
            } else {
                JobStatus::ErrorRemove
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct Echo;

    impl Job for Echo {
        const NAME: &'static str = "Echo";

        fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }

        fn to_data(&self) -> Value {
            json!({})
        }

        fn from_data(_data: &Value) -> Self {
            Echo
        }
    }

    #[derive(Debug, Default)]
    struct AlwaysFails;

    impl Job for AlwaysFails {
        const NAME: &'static str = "AlwaysFails";
        const DEFAULT_MAX_TRIES: u32 = 3;

        fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("nope".into())
        }

        fn to_data(&self) -> Value {
            json!({})
        }

        fn from_data(_data: &Value) -> Self {
            AlwaysFails
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: StdMutex<Vec<String>>,
    }

    impl Observer for RecordingObserver {
        fn on_job_queued(&self, _queue: &str, class_name: &str, _uuid: &str) {
            self.events.lock().unwrap().push(format!("queued:{}", class_name));
        }

        fn on_job_started(&self, _queue: &str, class_name: &str, _uuid: &str, tries: u32) {
            self.events
                .lock()
                .unwrap()
                .push(format!("started:{}:{}", class_name, tries));
        }

        fn on_job_completed(
            &self,
            _queue: &str,
            class_name: &str,
            _uuid: &str,
            status: &JobStatus,
            _start_time: Instant,
            tries: u32,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("completed:{}:{:?}:{}", class_name, status, tries));
        }

        fn on_job_retry(&self, _queue: &str, class_name: &str, _uuid: &str, tries: u32, _retry_after_secs: i64) {
            self.events
                .lock()
                .unwrap()
                .push(format!("retry:{}:{}", class_name, tries));
        }

        fn on_job_removed(
            &self,
            _queue: &str,
            class_name: &str,
            _uuid: &str,
            _final_status: &JobStatus,
            total_tries: u32,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("removed:{}:{}", class_name, total_tries));
        }
    }

    fn build_worker(config: WorkerConfig) -> (Worker, Arc<RecordingObserver>) {
        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let mut registry = Registry::new();
        registry.register::<Echo>().unwrap();
        registry.register::<AlwaysFails>().unwrap();

        let observer = Arc::new(RecordingObserver::default());
        let worker = Worker::new("q", backend, Arc::new(registry), config)
            .with_observer(observer.clone() as Arc<dyn Observer>);
        (worker, observer)
    }

    #[tokio::test]
    async fn successful_job_is_cleaned_up_when_configured() {
        let (worker, observer) = build_worker(WorkerConfig {
            clean_successful_jobs_logs: true,
            ..Default::default()
        });

        let uuid = worker.push(Echo, None).await.unwrap();
        assert!(worker.do_one().await.unwrap());

        let record = worker
            .0
            .backend
            .get_persistent_data(&format!("job_instance:{}", uuid))
            .await
            .unwrap();
        assert!(record.is_empty());

        let events = observer.events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[
                "queued:Echo".to_string(),
                "started:Echo:1".to_string(),
                "completed:Echo:NoError:1".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failing_job_is_removed_after_exhausting_retries() {
        let (worker, observer) = build_worker(WorkerConfig::default());

        worker.push(AlwaysFails, None).await.unwrap();

        assert!(worker.do_one().await.unwrap());
        assert!(worker.do_one().await.unwrap());
        assert!(worker.do_one().await.unwrap());
        // Fourth attempt: nothing left in the ready list.
        assert!(!worker.do_one().await.unwrap());

        let events = observer.events.lock().unwrap();
        assert!(events.contains(&"removed:AlwaysFails:3".to_string()));
    }

    #[tokio::test]
    async fn job_declining_retry_is_removed_after_one_attempt() {
        #[derive(Debug, Default)]
        struct NoRetry;

        impl Job for NoRetry {
            const NAME: &'static str = "NoRetry";

            fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
                Err("boom".into())
            }

            fn to_data(&self) -> Value {
                json!({})
            }

            fn from_data(_data: &Value) -> Self {
                NoRetry
            }

            fn retry_if_error(&self) -> bool {
                false
            }
        }

        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let mut registry = Registry::new();
        registry.register::<NoRetry>().unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let worker = Worker::new("q", backend, Arc::new(registry), WorkerConfig::default())
            .with_observer(observer.clone() as Arc<dyn Observer>);

        worker.push(NoRetry, None).await.unwrap();
        assert!(worker.do_one().await.unwrap());
        assert!(!worker.do_one().await.unwrap());

        let events = observer.events.lock().unwrap();
        assert!(events.contains(&"removed:NoRetry:1".to_string()));
    }

    #[tokio::test]
    async fn queue_job_counts_reflects_ready_list() {
        let (worker, _observer) = build_worker(WorkerConfig::default());
        worker.push(Echo, None).await.unwrap();
        worker.push(Echo, None).await.unwrap();

        let counts = worker.queue_job_counts().await.unwrap();
        assert_eq!(counts.get("Echo"), Some(&2));
    }

    #[tokio::test]
    async fn zero_max_tries_is_exactly_one_attempt() {
        #[derive(Debug, Default)]
        struct OneShot;

        impl Job for OneShot {
            const NAME: &'static str = "OneShot";

            fn handle(&mut self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
                Err("nope".into())
            }

            fn to_data(&self) -> Value {
                json!({})
            }

            fn from_data(_data: &Value) -> Self {
                OneShot
            }

            fn max_tries(&self) -> u32 {
                0
            }
        }

        let backend: Arc<dyn QueueBackend> = Arc::new(MemoryBackend::new());
        let mut registry = Registry::new();
        registry.register::<OneShot>().unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let worker = Worker::new("q", backend, Arc::new(registry), WorkerConfig::default())
            .with_observer(observer.clone() as Arc<dyn Observer>);

        worker.push(OneShot, None).await.unwrap();
        assert!(worker.do_one().await.unwrap());
        assert!(!worker.do_one().await.unwrap());

        let events = observer.events.lock().unwrap();
        assert!(events.contains(&"removed:OneShot:1".to_string()));
    }

    #[tokio::test]
    async fn retry_after_reschedules_to_the_later_set_not_the_ready_list() {
        let (worker, observer) = build_worker(WorkerConfig::default());
        let uuid = worker.push(AlwaysFails, None).await.unwrap();
        let key = format!("job_instance:{}", uuid);

        let mut record = worker.0.backend.get_persistent_data(&key).await.unwrap();
        record.insert("retryAfter".to_string(), "60".to_string());
        worker.0.backend.set_persistent_data(&key, &record).await.unwrap();

        assert!(worker.do_one().await.unwrap());

        // Rescheduled into the scheduled set, not the ready list: an
        // immediate pop with no wait sees nothing.
        assert!(worker.0.backend.get_full_queue("q").await.unwrap().is_empty());

        let events = observer.events.lock().unwrap();
        assert!(events.iter().any(|e| e.starts_with("retry:AlwaysFails:1")));
    }
}
