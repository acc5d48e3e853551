//! A passive callback surface for queued/started/completed/retry/removed
//! transitions. All hooks are optional (default no-op bodies) and
//! non-failing - an observer that panics would take the worker loop down
//! with it, so the worker wraps every call in `catch_unwind` and
//! logs-and-swallows the result.

use std::time::Instant;

use crate::worker::JobStatus;

/// Implement this to receive lifecycle events from a `Worker`. Every
/// method has a no-op default so implementors only override what they
/// need.
pub trait Observer: Send + Sync {
    fn on_job_queued(&self, _queue: &str, _class_name: &str, _uuid: &str) {}

    fn on_job_started(&self, _queue: &str, _class_name: &str, _uuid: &str, _tries: u32) {}

    #[allow(clippy::too_many_arguments)]
    fn on_job_completed(
        &self,
        _queue: &str,
        _class_name: &str,
        _uuid: &str,
        _status: &JobStatus,
        _start_time: Instant,
        _tries: u32,
    ) {
    }

    fn on_job_retry(
        &self,
        _queue: &str,
        _class_name: &str,
        _uuid: &str,
        _tries: u32,
        _retry_after_secs: i64,
    ) {
    }

    fn on_job_removed(
        &self,
        _queue: &str,
        _class_name: &str,
        _uuid: &str,
        _final_status: &JobStatus,
        _total_tries: u32,
    ) {
    }
}

/// An `Observer` that does nothing - the default when a worker isn't
/// given one explicitly.
#[derive(Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Reference observer that logs every hook through `tracing`. Useful for
/// exercising the interface end-to-end and as a template for real sinks
/// (Prometheus, StatsD, ...).
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_job_queued(&self, queue: &str, class_name: &str, uuid: &str) {
        tracing::info!(queue, class_name, uuid, "job queued");
    }

    fn on_job_started(&self, queue: &str, class_name: &str, uuid: &str, tries: u32) {
        tracing::info!(queue, class_name, uuid, tries, "job started");
    }

    fn on_job_completed(
        &self,
        queue: &str,
        class_name: &str,
        uuid: &str,
        status: &JobStatus,
        start_time: Instant,
        tries: u32,
    ) {
        let elapsed_ms = start_time.elapsed().as_millis();
        tracing::info!(
            queue,
            class_name,
            uuid,
            ?status,
            elapsed_ms,
            tries,
            "job completed"
        );
    }

    fn on_job_retry(&self, queue: &str, class_name: &str, uuid: &str, tries: u32, retry_after_secs: i64) {
        tracing::info!(
            queue,
            class_name,
            uuid,
            tries,
            retry_after_secs,
            "job scheduled for retry"
        );
    }

    fn on_job_removed(
        &self,
        queue: &str,
        class_name: &str,
        uuid: &str,
        final_status: &JobStatus,
        total_tries: u32,
    ) {
        tracing::warn!(
            queue,
            class_name,
            uuid,
            ?final_status,
            total_tries,
            "job permanently removed"
        );
    }
}
