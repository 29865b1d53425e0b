//! Engine: job table, worker pool, retries.
//!
//! [`Engine::start`] spawns a fixed number of named worker threads that pull
//! from the shared [`JobQueue`]. Each worker runs one job at a time:
//!
//! ```text
//! next_job ──► Running ──► cache.get_or_compute(fingerprint)
//!                              │ miss
//!                              ▼
//!                   blob get ─► registry.execute ─► blob put
//!                              │
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//!          Succeeded        Failed          Cancelled
//! ```
//!
//! ## Job records
//!
//! The job table is the only place job state lives. A record is written by
//! the submitter (Queued), then by exactly one worker (Running and the
//! terminal state), or by `cancel` while it is still Queued. Records stay
//! until [`Engine::purge`] removes them.
//!
//! ## Retry
//!
//! Transient failures (an unavailable upscaler with fallback disabled) are
//! retried up to `retry.max_attempts` in total, sleeping
//! `base_backoff_ms * 2^(attempt-1)` between attempts. Anything else fails
//! the job on the first attempt.
//!
//! ## Cancellation
//!
//! A queued job is cancelled on the spot and never reaches a worker. A
//! running job finishes; its result is discarded and it reports Cancelled.

use crate::blob::{BlobError, BlobStore};
use crate::cache::{CacheStats, Fingerprint, ResultCache};
use crate::config::{ConfigError, EngineConfig, RetryConfig, effective_workers};
use crate::error::{CancelError, JobError, ProcessingError, SubmitError};
use crate::imaging::EncodedImage;
use crate::imaging::calculations::backoff_delay_ms;
use crate::queue::{JobId, JobQueue};
use crate::registry::{Operation, OperationOutput, Registry};
use crate::types::{JobStatus, OperationKind, Priority, ResultMetadata, Warning};
use crate::upscale::{HttpUpscaleService, UpscaleService, Upscaler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A request to run one operation on one stored source.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Who asked; the per-submitter concurrency cap is keyed on this.
    pub submitter: String,
    pub source_checksum: String,
    pub operation: Operation,
    pub priority: Priority,
}

/// Reference to a finished job's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    /// Blob checksum of the produced image. `None` for palette jobs.
    pub checksum: Option<String>,
    pub metadata: ResultMetadata,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

/// Point-in-time copy of a job, as returned by [`Engine::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub submitter: String,
    pub kind: OperationKind,
    pub source_checksum: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
}

struct JobRecord {
    snapshot: JobSnapshot,
    operation: Operation,
    cancel_requested: bool,
}

struct Shared {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    /// Signalled whenever a job reaches a terminal state.
    settled: Condvar,
    queue: JobQueue,
    cache: ResultCache<OperationOutput>,
    registry: Registry,
    blobs: Arc<dyn BlobStore>,
    retry: RetryConfig,
    next_id: AtomicU64,
    stopping: AtomicBool,
}

pub struct Engine {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Validate `config`, build the registry, and spawn the worker pool.
    ///
    /// `upscale_service` overrides `config.upscaler.endpoint`; pass `None` to
    /// use the configured HTTP endpoint (or none at all).
    pub fn start(
        config: &EngineConfig,
        blobs: Arc<dyn BlobStore>,
        upscale_service: Option<Arc<dyn UpscaleService>>,
    ) -> Result<Engine, ConfigError> {
        config.validate()?;

        let service = match (upscale_service, &config.upscaler.endpoint) {
            (Some(service), _) => Some(service),
            (None, Some(endpoint)) => {
                let timeout = Duration::from_millis(config.upscaler.timeout_ms);
                let http = HttpUpscaleService::new(endpoint.clone(), timeout)
                    .map_err(|e| ConfigError::Validation(format!("upscaler: {e}")))?;
                Some(Arc::new(http) as Arc<dyn UpscaleService>)
            }
            (None, None) => None,
        };
        let registry = Registry::new(
            config.crop.clone(),
            config.compress.clone(),
            config.palette.clone(),
            config.limits,
            Upscaler::new(service, &config.upscaler, config.limits),
        );

        let shared = Arc::new(Shared {
            jobs: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            queue: JobQueue::new(
                config.workers.max_queue_depth,
                config.workers.max_in_flight_per_submitter,
            ),
            cache: ResultCache::new(config.cache.capacity_bytes),
            registry,
            blobs,
            retry: config.retry.clone(),
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        });

        let count = effective_workers(&config.workers);
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("imagemill-worker-{i}"))
                .spawn(move || shared.worker_loop())?;
            workers.push(handle);
        }
        info!(workers = count, "engine started");
        Ok(Engine { shared, workers })
    }

    /// Validate and enqueue a job. Returns its id immediately.
    pub fn submit(&self, request: JobRequest) -> Result<JobId, SubmitError> {
        request.operation.validate()?;
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(SubmitError::ShutDown);
        }

        let id = JobId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let snapshot = JobSnapshot {
            id,
            submitter: request.submitter.clone(),
            kind: request.operation.kind(),
            source_checksum: request.source_checksum,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            result: None,
            error: None,
        };
        // Record first so a worker that dequeues immediately finds it.
        self.shared.lock_jobs().insert(
            id,
            JobRecord {
                snapshot,
                operation: request.operation,
                cancel_requested: false,
            },
        );
        if let Err(e) = self
            .shared
            .queue
            .push(id, &request.submitter, request.priority)
        {
            self.shared.lock_jobs().remove(&id);
            warn!(submitter = %request.submitter, error = %e, "submission refused");
            return Err(e);
        }
        debug!(job = %id, submitter = %request.submitter, "queued");
        Ok(id)
    }

    pub fn status(&self, id: JobId) -> Option<JobSnapshot> {
        self.shared
            .lock_jobs()
            .get(&id)
            .map(|r| r.snapshot.clone())
    }

    pub fn cancel(&self, id: JobId) -> Result<(), CancelError> {
        let mut jobs = self.shared.lock_jobs();
        let record = jobs.get_mut(&id).ok_or(CancelError::UnknownJob)?;
        match record.snapshot.status {
            JobStatus::Queued => {
                self.shared.queue.remove_queued(id);
                record.snapshot.status = JobStatus::Cancelled;
                record.snapshot.finished_at = Some(Utc::now());
                self.shared.settled.notify_all();
                info!(job = %id, "cancelled before start");
                Ok(())
            }
            JobStatus::Running => {
                record.cancel_requested = true;
                info!(job = %id, "cancel requested, result will be discarded");
                Ok(())
            }
            _ => Err(CancelError::AlreadyTerminal),
        }
    }

    /// Block until the job is terminal or `timeout` passes, then return its
    /// snapshot. `None` for an unknown id.
    pub fn wait(&self, id: JobId, timeout: Duration) -> Option<JobSnapshot> {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.shared.lock_jobs();
        loop {
            let snapshot = jobs.get(&id)?.snapshot.clone();
            let now = Instant::now();
            if snapshot.status.is_terminal() || now >= deadline {
                return Some(snapshot);
            }
            jobs = self
                .shared
                .settled
                .wait_timeout(jobs, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Forget a terminal job. Returns false for unknown or unfinished jobs.
    pub fn purge(&self, id: JobId) -> bool {
        let mut jobs = self.shared.lock_jobs();
        match jobs.get(&id) {
            Some(r) if r.snapshot.status.is_terminal() => {
                jobs.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.depth()
    }

    /// Stop accepting work, cancel whatever is still queued, and join the
    /// workers once their current jobs finish.
    pub fn shutdown(&mut self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) && self.workers.is_empty() {
            return;
        }
        let drained = self.shared.queue.close();
        if !drained.is_empty() {
            let mut jobs = self.shared.lock_jobs();
            for id in &drained {
                if let Some(r) = jobs.get_mut(id) {
                    r.snapshot.status = JobStatus::Cancelled;
                    r.snapshot.finished_at = Some(Utc::now());
                }
            }
            self.shared.settled.notify_all();
            info!(cancelled = drained.len(), "dropped queued jobs on shutdown");
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!(cache = %self.shared.cache.stats(), "engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn worker_loop(&self) {
        while let Some(ticket) = self.queue.next_job() {
            self.run(ticket.id);
            self.queue.finish(&ticket.submitter);
        }
    }

    fn run(&self, id: JobId) {
        let (operation, source_checksum) = {
            let mut jobs = self.lock_jobs();
            let Some(record) = jobs.get_mut(&id) else {
                return;
            };
            // Cancelled (or purged) between dequeue and now.
            if record.snapshot.status != JobStatus::Queued {
                return;
            }
            record.snapshot.status = JobStatus::Running;
            record.snapshot.started_at = Some(Utc::now());
            (
                record.operation.clone(),
                record.snapshot.source_checksum.clone(),
            )
        };
        debug!(job = %id, kind = %operation.kind(), "running");

        let outcome = self.execute_with_retry(id, &operation, &source_checksum);

        let mut jobs = self.lock_jobs();
        let Some(record) = jobs.get_mut(&id) else {
            return;
        };
        let snapshot = &mut record.snapshot;
        snapshot.finished_at = Some(Utc::now());
        if record.cancel_requested {
            snapshot.status = JobStatus::Cancelled;
            info!(job = %id, "cancelled while running, result discarded");
        } else {
            match outcome {
                Ok(result) => {
                    snapshot.status = JobStatus::Succeeded;
                    for w in &result.warnings {
                        warn!(job = %id, "{w}");
                    }
                    info!(job = %id, kind = %snapshot.kind, attempts = snapshot.attempts, "succeeded");
                    snapshot.result = Some(result);
                }
                Err(err) => {
                    snapshot.status = JobStatus::Failed;
                    if matches!(err, ProcessingError::EncodingFailure(_)) {
                        error!(job = %id, source = %source_checksum, error = %err, "encoding failed");
                    } else {
                        warn!(job = %id, code = err.code(), error = %err, "failed");
                    }
                    snapshot.error = Some(JobError::from(&err));
                }
            }
        }
        self.settled.notify_all();
    }

    fn execute_with_retry(
        &self,
        id: JobId,
        operation: &Operation,
        source_checksum: &str,
    ) -> Result<JobResult, ProcessingError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cancelled = {
                let mut jobs = self.lock_jobs();
                match jobs.get_mut(&id) {
                    Some(r) => {
                        r.snapshot.attempts = attempt;
                        r.cancel_requested
                    }
                    None => true,
                }
            };
            if cancelled && attempt > 1 {
                return Err(ProcessingError::Internal("cancelled".into()));
            }

            match self.execute_once(operation, source_checksum) {
                Err(err)
                    if err.is_transient()
                        && attempt < self.retry.max_attempts
                        && !self.stopping.load(Ordering::SeqCst) =>
                {
                    let delay = backoff_delay_ms(self.retry.base_backoff_ms, attempt);
                    warn!(job = %id, attempt, delay_ms = delay, error = %err, "transient failure, retrying");
                    thread::sleep(Duration::from_millis(delay));
                }
                other => return other,
            }
        }
    }

    fn execute_once(
        &self,
        operation: &Operation,
        source_checksum: &str,
    ) -> Result<JobResult, ProcessingError> {
        // Defaults such as the compress format depend on the source, so it is
        // loaded before the fingerprint is taken.
        let bytes = self.blobs.get(source_checksum).map_err(|e| match e {
            BlobError::NotFound(_) => ProcessingError::SourceNotFound(source_checksum.to_string()),
            other => ProcessingError::Storage(other.to_string()),
        })?;
        let source = EncodedImage::detect(bytes)?;
        let canonical = operation.canonical_params(self.registry.compress_settings(), source.format);
        let fingerprint = Fingerprint::derive(source_checksum, operation.kind(), &canonical);

        let output = self.cache.get_or_compute(&fingerprint, || {
            let mut output = self.registry.execute(operation, &source)?;
            if let Some(image) = &output.image {
                let stored = self
                    .blobs
                    .put(&image.bytes)
                    .map_err(|e| ProcessingError::Storage(e.to_string()))?;
                output.metadata.result_checksum = Some(stored);
            }
            Ok(output)
        })?;

        Ok(JobResult {
            checksum: output.metadata.result_checksum.clone(),
            metadata: output.metadata.clone(),
            warnings: output.warnings.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::imaging::Constraint;
    use crate::test_helpers::{bordered, busy_rgba, encode_png};
    use crate::types::ImageFormat;
    use crate::upscale::mock::{Behavior, MockService};

    fn config(workers: usize) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.workers.count = Some(workers);
        config.retry.base_backoff_ms = 1;
        config
    }

    fn engine_with(
        config: &EngineConfig,
        service: Option<Arc<dyn UpscaleService>>,
    ) -> (Engine, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = Engine::start(config, blobs.clone(), service).unwrap();
        (engine, blobs)
    }

    fn request(checksum: &str, operation: Operation) -> JobRequest {
        JobRequest {
            submitter: "tester".into(),
            source_checksum: checksum.into(),
            operation,
            priority: Priority::Interactive,
        }
    }

    const WAIT: Duration = Duration::from_secs(30);

    #[test]
    fn crop_job_succeeds_and_stores_result() {
        let (engine, blobs) = engine_with(&config(2), None);
        let png = encode_png(&bordered(60, 60, [5, 5, 5, 5], [255, 255, 255, 255]));
        let checksum = blobs.put(&png.bytes).unwrap();

        let id = engine.submit(request(&checksum, Operation::Crop)).unwrap();
        let snap = engine.wait(id, WAIT).unwrap();
        assert_eq!(snap.status, JobStatus::Succeeded, "{:?}", snap.error);
        assert!(snap.started_at.is_some() && snap.finished_at.is_some());
        assert_eq!(snap.attempts, 1);

        let result = snap.result.unwrap();
        let stored = result.checksum.unwrap();
        assert!(blobs.contains(&stored));
        assert_eq!(result.metadata.source_checksum, checksum);
        assert_eq!(result.metadata.crop.unwrap().left, 5);
    }

    #[test]
    fn invalid_parameters_never_enter_queue() {
        let (engine, _) = engine_with(&config(1), None);
        let err = engine
            .submit(request("abc", Operation::Upscale { scale_factor: 3 }))
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidInput(_)));
        assert_eq!(engine.queue_depth(), 0);
        assert!(engine.status(JobId(1)).is_none());
    }

    #[test]
    fn missing_source_fails_with_code() {
        let (engine, _) = engine_with(&config(1), None);
        let id = engine
            .submit(request("deadbeef", Operation::Palette { k: 3 }))
            .unwrap();
        let snap = engine.wait(id, WAIT).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.error.unwrap().code, "source_not_found");
    }

    #[test]
    fn identical_jobs_share_cached_result() {
        let (engine, blobs) = engine_with(&config(2), None);
        let checksum = blobs.put(&encode_png(&busy_rgba(32, 32)).bytes).unwrap();

        let a = engine
            .submit(request(&checksum, Operation::Palette { k: 4 }))
            .unwrap();
        let first = engine.wait(a, WAIT).unwrap().result.unwrap();
        let b = engine
            .submit(request(&checksum, Operation::Palette { k: 4 }))
            .unwrap();
        let second = engine.wait(b, WAIT).unwrap().result.unwrap();

        assert_eq!(first, second);
        let stats = engine.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn implicit_compress_format_shares_cache_with_explicit_source_format() {
        let (engine, blobs) = engine_with(&config(1), None);
        let checksum = blobs.put(&encode_png(&busy_rgba(16, 16)).bytes).unwrap();
        let compress = |format| Operation::Compress {
            format,
            constraint: Constraint::Quality(60),
        };

        let a = engine.submit(request(&checksum, compress(None))).unwrap();
        let first = engine.wait(a, WAIT).unwrap().result.unwrap();
        let b = engine
            .submit(request(&checksum, compress(Some(ImageFormat::Png))))
            .unwrap();
        let second = engine.wait(b, WAIT).unwrap().result.unwrap();

        assert_eq!(first.checksum, second.checksum);
        let stats = engine.cache_stats();
        assert_eq!((stats.misses, stats.hits), (1, 1));
    }

    #[test]
    fn transient_failures_are_retried_then_fail() {
        let mut cfg = config(1);
        cfg.upscaler.fallback = false;
        let service = MockService::new(Behavior::Fail);
        let (engine, blobs) = engine_with(&cfg, Some(service.clone()));
        let checksum = blobs.put(&encode_png(&busy_rgba(4, 4)).bytes).unwrap();

        let id = engine
            .submit(request(&checksum, Operation::Upscale { scale_factor: 2 }))
            .unwrap();
        let snap = engine.wait(id, WAIT).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.attempts, 3);
        assert_eq!(service.call_count(), 3);
        assert_eq!(snap.error.unwrap().code, "upscale_service_unavailable");
    }

    #[test]
    fn non_transient_failures_are_not_retried() {
        let (engine, blobs) = engine_with(&config(1), None);
        let checksum = blobs.put(&encode_png(&busy_rgba(4, 4)).bytes).unwrap();
        let op = Operation::Convert {
            target: ImageFormat::Svg,
            raster_width: None,
            background: None,
            quality: None,
        };
        let id = engine.submit(request(&checksum, op)).unwrap();
        let snap = engine.wait(id, WAIT).unwrap();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(snap.attempts, 1);
        assert_eq!(snap.error.unwrap().code, "unsupported_conversion");
    }

    #[test]
    fn cancel_queued_job_skips_execution() {
        let mut cfg = config(1);
        cfg.workers.max_in_flight_per_submitter = 1;
        let service = MockService::new(Behavior::Sleep(Duration::from_millis(300)));
        cfg.upscaler.timeout_ms = 5_000;
        let (engine, blobs) = engine_with(&cfg, Some(service.clone()));
        let checksum = blobs.put(&encode_png(&busy_rgba(4, 4)).bytes).unwrap();

        let running = engine
            .submit(request(&checksum, Operation::Upscale { scale_factor: 2 }))
            .unwrap();
        let queued = engine
            .submit(request(&checksum, Operation::Upscale { scale_factor: 4 }))
            .unwrap();
        engine.cancel(queued).unwrap();

        let snap = engine.wait(queued, WAIT).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(snap.started_at.is_none());
        assert_eq!(engine.cancel(queued), Err(CancelError::AlreadyTerminal));

        engine.wait(running, WAIT).unwrap();
        assert_eq!(*service.calls.lock().unwrap(), vec![2]);
    }

    #[test]
    fn cancel_running_job_discards_result() {
        let mut cfg = config(1);
        cfg.upscaler.timeout_ms = 5_000;
        let service = MockService::new(Behavior::Sleep(Duration::from_millis(300)));
        let (engine, blobs) = engine_with(&cfg, Some(service));
        let checksum = blobs.put(&encode_png(&busy_rgba(4, 4)).bytes).unwrap();

        let id = engine
            .submit(request(&checksum, Operation::Upscale { scale_factor: 2 }))
            .unwrap();
        let deadline = Instant::now() + WAIT;
        while engine.status(id).unwrap().status != JobStatus::Running {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        engine.cancel(id).unwrap();

        let snap = engine.wait(id, WAIT).unwrap();
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert!(snap.result.is_none());
    }

    #[test]
    fn cancel_unknown_job() {
        let (engine, _) = engine_with(&config(1), None);
        assert_eq!(engine.cancel(JobId(999)), Err(CancelError::UnknownJob));
    }

    #[test]
    fn purge_only_terminal_jobs() {
        let (engine, blobs) = engine_with(&config(1), None);
        let checksum = blobs.put(&encode_png(&busy_rgba(8, 8)).bytes).unwrap();
        let op = Operation::Compress {
            format: Some(ImageFormat::Jpeg),
            constraint: Constraint::Quality(70),
        };
        let id = engine.submit(request(&checksum, op)).unwrap();
        engine.wait(id, WAIT).unwrap();
        assert!(engine.purge(id));
        assert!(engine.status(id).is_none());
        assert!(!engine.purge(id));
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let (mut engine, _) = engine_with(&config(1), None);
        engine.shutdown();
        let err = engine
            .submit(request("abc", Operation::Crop))
            .unwrap_err();
        assert_eq!(err, SubmitError::ShutDown);
    }
}
