//! Priority download queue.
//!
//! A single dedicated worker drains a priority-ordered, deduplicated queue
//! of fetch jobs, calling the [`MediaSource`] for each and emitting
//! lifecycle events over a channel. One worker by design: the upstream
//! source is rate-limited and concurrent transfers from the same client
//! identity are counterproductive.
//!
//! Ordering guarantees: strict priority, FIFO within a priority band, and
//! per-job event order (`start` before `progress` before the terminal
//! event). Cancellation is cooperative and best-effort.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::MediaCache;
use crate::error::{Error, FetchError, Result};
use crate::job::{
    normalize_locator, CancelToken, DownloadJob, JobId, JobPriority, JobState,
};
use crate::source::{MediaSource, ProgressCallback, TransferProgress};

/// Default maximum retry attempts for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff, in milliseconds.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// Default cap on progress events per second.
pub const DEFAULT_PROGRESS_EVENTS_PER_SEC: u32 = 4;

/// Configuration for the download queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum retry attempts for a transient failure before the job fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Jitter factor applied to backoff delays (0.0 = none).
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
    /// Maximum progress events emitted per second per job.
    #[serde(default = "default_progress_events_per_sec")]
    pub progress_events_per_sec: u32,
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

const fn default_retry_jitter() -> f64 {
    0.25
}

const fn default_progress_events_per_sec() -> u32 {
    DEFAULT_PROGRESS_EVENTS_PER_SEC
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_jitter: 0.25,
            progress_events_per_sec: DEFAULT_PROGRESS_EVENTS_PER_SEC,
        }
    }
}

impl QueueConfig {
    /// Validate and clamp configuration values to sane ranges.
    pub fn validate(&mut self) {
        self.progress_events_per_sec = self.progress_events_per_sec.clamp(1, 60);
        self.retry_jitter = self.retry_jitter.clamp(0.0, 0.5);
        self.retry_base_delay_ms = self.retry_base_delay_ms.max(1);
    }

    fn progress_interval(&self) -> Duration {
        Duration::from_secs(1) / self.progress_events_per_sec
    }
}

/// Lifecycle events emitted by the queue.
///
/// The queue pushes events into an unbounded channel; the presentation
/// layer drains them on its own scheduling turn. The worker never invokes
/// consumer code directly, so consumers are free to call back into the
/// queue when handling an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QueueEvent {
    /// A new job was created and queued.
    Queued {
        /// The job id.
        id: JobId,
        /// Display label.
        label: String,
    },
    /// The worker picked up a job.
    Start {
        /// The job id.
        id: JobId,
        /// Display label.
        label: String,
    },
    /// Throttled progress report for the active job.
    Progress {
        /// The job id.
        id: JobId,
        /// Completion percentage (0.0 - 100.0).
        percent: f64,
        /// Estimated seconds remaining, if known.
        eta_secs: Option<f64>,
    },
    /// A transient failure; the job was re-queued with a backoff delay.
    Retry {
        /// The job id.
        id: JobId,
        /// Attempt count so far.
        attempt: u32,
        /// Backoff delay before the next attempt, in seconds.
        delay_secs: f64,
    },
    /// The job finished successfully.
    Complete {
        /// The job id.
        id: JobId,
        /// Path of the materialized local file.
        path: PathBuf,
    },
    /// The job failed terminally.
    Error {
        /// The job id.
        id: JobId,
        /// Display label.
        label: String,
        /// Failure detail.
        message: String,
    },
    /// The source demands (re)authentication. Never auto-retried; the
    /// owner decides whether to halt the queue and remediate.
    AuthRequired {
        /// The job id.
        id: JobId,
        /// Display label.
        label: String,
        /// Challenge detail.
        message: String,
    },
    /// The job was cancelled, before or during its fetch.
    Cancelled {
        /// The job id.
        id: JobId,
    },
    /// A terminal outcome left the queue empty.
    Idle,
}

/// Point-in-time view of the queue, for status displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Whether the worker is running.
    pub running: bool,
    /// Number of jobs waiting (queued or retrying).
    pub queued: usize,
    /// Id of the job currently being fetched, if any.
    pub active: Option<JobId>,
    /// Label of the job currently being fetched, if any.
    pub active_label: Option<String>,
}

/// Compute an exponential backoff delay.
///
/// Pure function of its inputs: `base * 2^(attempt-1)`, scaled by a
/// jitter factor drawn deterministically from `seed`. With `jitter` zero
/// the result is exact, which keeps retry timing testable without sleeps.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, jitter: f64, seed: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent);
    if jitter <= 0.0 {
        return delay;
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    delay.mul_f64(1.0 + rng.gen_range(0.0..jitter))
}

/// Time-based throttle for outbound progress notifications.
///
/// Rate-limits to a fixed frequency regardless of how often the source
/// reports; a 100% report always passes so the final state is never lost.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressThrottle {
    /// Create a throttle with the given minimum interval between emissions.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
        }
    }

    /// Whether a report at `percent` should be passed through now.
    pub fn should_emit(&mut self, percent: f64) -> bool {
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.min_interval);
        if due || percent >= 100.0 {
            self.last_emit = Some(now);
            return true;
        }
        false
    }
}

/// A job waiting in the queue, with an optional earliest-start instant
/// set while it waits out a retry backoff.
struct PendingJob {
    job: DownloadJob,
    ready_at: Option<Instant>,
}

/// The job currently held by the worker.
struct ActiveJob {
    id: JobId,
    label: String,
    token: CancelToken,
}

/// Internal queue state. Guarded by one mutex, held only for index and
/// queue mutation, never across a transfer.
struct QueueState {
    /// Jobs waiting to run (queued or retrying).
    pending: Vec<PendingJob>,
    /// Dedupe index: normalized locator -> live job id. Covers queued,
    /// retrying, and active jobs; entries are removed only on a terminal
    /// outcome.
    index: HashMap<String, JobId>,
    /// The job currently being fetched.
    active: Option<ActiveJob>,
    /// Counter for job ids.
    next_id: JobId,
    /// Counter for submission sequence numbers (FIFO tie-break).
    next_seq: u64,
    /// Set by `stop()`; the worker exits after its current job.
    stopping: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            index: HashMap::new(),
            active: None,
            next_id: 0,
            next_seq: 0,
            stopping: false,
        }
    }

    /// Index of the next job to run: highest priority first, oldest first
    /// within a band, skipping jobs still waiting out a backoff delay.
    fn next_ready(&self, now: Instant) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ready_at.is_none_or(|at| at <= now))
            .min_by_key(|(_, p)| (Reverse(p.job.priority), p.job.seq))
            .map(|(i, _)| i)
    }

    /// Earliest instant at which a backoff-delayed job becomes runnable.
    fn earliest_ready_at(&self) -> Option<Instant> {
        self.pending.iter().filter_map(|p| p.ready_at).min()
    }

    fn position_of(&self, id: JobId) -> Option<usize> {
        self.pending.iter().position(|p| p.job.id == id)
    }
}

struct Inner {
    state: Mutex<QueueState>,
    wake: Condvar,
    config: QueueConfig,
    source: Arc<dyn MediaSource>,
    cache: MediaCache,
    event_tx: mpsc::UnboundedSender<QueueEvent>,
    event_rx: Mutex<mpsc::UnboundedReceiver<QueueEvent>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: QueueEvent) {
        // Receiver gone just means nobody is listening.
        let _ = self.event_tx.send(event);
    }

    /// Clear the active slot and drop the dedupe entry after a terminal
    /// outcome.
    fn finish_terminal(&self, normalized: &str) {
        let mut state = self.lock_state();
        state.active = None;
        state.index.remove(normalized);
    }

    /// Emit `Idle` if nothing is queued or in flight.
    fn emit_idle_if_drained(&self) {
        let state = self.lock_state();
        let drained = state.pending.is_empty() && state.active.is_none();
        drop(state);
        if drained {
            self.emit(QueueEvent::Idle);
        }
    }

    /// Run one dequeued job to a terminal outcome or a retry re-queue.
    fn process(&self, mut job: DownloadJob) {
        // A cancel-all can race the dequeue; honor it before starting so a
        // job cancelled while queued never sees a `start` event.
        if job.token.is_cancelled() {
            self.finish_terminal(&job.normalized);
            self.emit(QueueEvent::Cancelled { id: job.id });
            self.emit_idle_if_drained();
            return;
        }

        self.emit(QueueEvent::Start {
            id: job.id,
            label: job.label.clone(),
        });

        // Already materialized: synthesize completion without touching the
        // network.
        if let Some(path) = self.cache.lookup(&job.normalized) {
            debug!("Cache hit for job {}: {}", job.id, path.display());
            self.finish_terminal(&job.normalized);
            self.emit(QueueEvent::Complete { id: job.id, path });
            self.emit_idle_if_drained();
            return;
        }

        let progress = self.progress_callback(job.id);
        let result =
            self.source
                .download_to(&job.locator, self.cache.dest_dir(), Some(progress), &job.token);

        match result {
            Ok(path) => {
                info!("Job {} complete: {}", job.id, path.display());
                job.state = JobState::Done;
                self.finish_terminal(&job.normalized);
                self.emit(QueueEvent::Complete { id: job.id, path });
            }
            Err(FetchError::Cancelled) => {
                info!("Job {} cancelled mid-transfer", job.id);
                job.state = JobState::Cancelled;
                self.finish_terminal(&job.normalized);
                self.emit(QueueEvent::Cancelled { id: job.id });
            }
            Err(FetchError::AuthRequired(message)) => {
                warn!("Job {} requires authentication: {}", job.id, message);
                job.state = JobState::Failed;
                self.finish_terminal(&job.normalized);
                self.emit(QueueEvent::AuthRequired {
                    id: job.id,
                    label: job.label.clone(),
                    message,
                });
            }
            Err(FetchError::Transient(reason)) => {
                job.attempt += 1;
                if job.attempt <= self.config.max_retries {
                    let delay = backoff_delay(
                        job.attempt,
                        Duration::from_millis(self.config.retry_base_delay_ms),
                        self.config.retry_jitter,
                        job.id ^ u64::from(job.attempt),
                    );
                    warn!(
                        "Job {} transient failure (attempt {}): {}; retrying in {:?}",
                        job.id, job.attempt, reason, delay
                    );
                    self.emit(QueueEvent::Retry {
                        id: job.id,
                        attempt: job.attempt,
                        delay_secs: delay.as_secs_f64(),
                    });
                    job.state = JobState::Retrying;
                    let ready_at = Instant::now() + delay;
                    let mut state = self.lock_state();
                    state.active = None;
                    // Dedupe entry stays: the job is still live.
                    state.pending.push(PendingJob {
                        job,
                        ready_at: Some(ready_at),
                    });
                    drop(state);
                    self.wake.notify_all();
                    return;
                }
                error!(
                    "Job {} failed after {} attempts: {}",
                    job.id, job.attempt, reason
                );
                job.state = JobState::Failed;
                self.finish_terminal(&job.normalized);
                self.emit(QueueEvent::Error {
                    id: job.id,
                    label: job.label.clone(),
                    message: reason,
                });
            }
            Err(FetchError::Permanent(reason)) => {
                error!("Job {} failed permanently: {}", job.id, reason);
                job.state = JobState::Failed;
                self.finish_terminal(&job.normalized);
                self.emit(QueueEvent::Error {
                    id: job.id,
                    label: job.label.clone(),
                    message: reason,
                });
            }
        }

        self.emit_idle_if_drained();
    }

    /// Build the throttled progress callback handed to the source.
    fn progress_callback(&self, id: JobId) -> ProgressCallback {
        let throttle = Mutex::new(ProgressThrottle::new(self.config.progress_interval()));
        let tx = self.event_tx.clone();
        Box::new(move |p: TransferProgress| {
            let mut throttle = throttle.lock().unwrap_or_else(PoisonError::into_inner);
            if throttle.should_emit(p.percent) {
                let _ = tx.send(QueueEvent::Progress {
                    id,
                    percent: p.percent,
                    eta_secs: p.eta_secs,
                });
            }
        })
    }

    /// Worker loop: block until a job is ready or stop is requested, pop
    /// the best candidate, run it, repeat.
    fn run_worker(self: &Arc<Self>) {
        info!("Download worker started");
        loop {
            let job = {
                let mut state = self.lock_state();
                loop {
                    if state.stopping {
                        info!("Download worker stopping");
                        return;
                    }
                    let now = Instant::now();
                    if let Some(pos) = state.next_ready(now) {
                        let mut pending = state.pending.swap_remove(pos);
                        pending.job.state = JobState::Active;
                        state.active = Some(ActiveJob {
                            id: pending.job.id,
                            label: pending.job.label.clone(),
                            token: pending.job.token.clone(),
                        });
                        break pending.job;
                    }
                    state = match state.earliest_ready_at() {
                        Some(at) => {
                            let timeout = at.saturating_duration_since(now);
                            self.wake
                                .wait_timeout(state, timeout)
                                .map(|(guard, _)| guard)
                                .unwrap_or_else(|e| e.into_inner().0)
                        }
                        None => self
                            .wake
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner),
                    };
                }
            };
            self.process(job);
        }
    }
}

/// Priority-ordered, deduplicated, cancellable download pipeline executed
/// by exactly one worker thread.
///
/// Explicitly constructed and passed to collaborators; submission,
/// cancellation, and queries never block on network I/O.
pub struct DownloadQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadQueue {
    /// Create a queue with default configuration.
    #[must_use]
    pub fn new(source: Arc<dyn MediaSource>, cache: MediaCache) -> Self {
        Self::with_config(source, cache, QueueConfig::default())
    }

    /// Create a queue with custom configuration.
    #[must_use]
    pub fn with_config(
        source: Arc<dyn MediaSource>,
        cache: MediaCache,
        mut config: QueueConfig,
    ) -> Self {
        config.validate();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::new()),
                wake: Condvar::new(),
                config,
                source,
                cache,
                event_tx,
                event_rx: Mutex::new(event_rx),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Submit a fetch request.
    ///
    /// Dedupes on the normalized locator: if a live job already occupies
    /// it, that job's id is returned, with its priority raised in place
    /// when the new priority is strictly higher (never lowered). A
    /// `Queued` event is emitted only when a new job is actually created.
    ///
    /// # Errors
    ///
    /// Returns an error if the locator is empty.
    pub fn submit(&self, locator: &str, priority: JobPriority, label: &str) -> Result<JobId> {
        if locator.trim().is_empty() {
            return Err(Error::InvalidSubmission(
                "locator must not be empty".to_string(),
            ));
        }

        let normalized = normalize_locator(locator);
        let mut state = self.inner.lock_state();

        if let Some(&existing) = state.index.get(&normalized) {
            if let Some(pos) = state.position_of(existing) {
                let job = &mut state.pending[pos].job;
                if priority > job.priority {
                    debug!(
                        "Raising priority of job {} from {} to {}",
                        existing, job.priority, priority
                    );
                    job.priority = priority;
                    drop(state);
                    self.inner.wake.notify_all();
                    return Ok(existing);
                }
            }
            // Already active, or queued at an equal-or-higher priority;
            // no duplicate work is queued either way.
            debug!("Dedupe hit for '{}': job {}", normalized, existing);
            return Ok(existing);
        }

        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        let job = DownloadJob {
            id,
            locator: locator.to_string(),
            normalized: normalized.clone(),
            priority,
            label: label.to_string(),
            seq,
            attempt: 0,
            state: JobState::Queued,
            token: CancelToken::new(),
        };

        info!("Queued job {}: {} ({})", id, locator, priority);
        state.index.insert(normalized, id);
        state.pending.push(PendingJob {
            job,
            ready_at: None,
        });
        drop(state);

        self.inner.emit(QueueEvent::Queued {
            id,
            label: label.to_string(),
        });
        self.inner.wake.notify_all();
        Ok(id)
    }

    /// Best-effort cancellation of one job.
    ///
    /// A queued job is removed immediately and a `Cancelled` event is
    /// emitted; an active job has its token flagged, to be observed at the
    /// transfer's next cooperative checkpoint. Returns false if the id is
    /// not live.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut state = self.inner.lock_state();

        if let Some(active) = &state.active {
            if active.id == id {
                info!("Flagging active job {} for cancellation", id);
                active.token.cancel();
                return true;
            }
        }

        if let Some(pos) = state.position_of(id) {
            let pending = state.pending.swap_remove(pos);
            state.index.remove(&pending.job.normalized);
            drop(state);
            info!("Cancelled queued job {}", id);
            self.inner.emit(QueueEvent::Cancelled { id });
            return true;
        }

        warn!("Cannot cancel job {} - not found", id);
        false
    }

    /// Cancel everything: queued jobs are dropped with `Cancelled` events,
    /// and the active job's token is flagged.
    pub fn cancel_all(&self) {
        let mut state = self.inner.lock_state();
        let drained: Vec<PendingJob> = state.pending.drain(..).collect();
        for pending in &drained {
            state.index.remove(&pending.job.normalized);
        }
        if let Some(active) = &state.active {
            active.token.cancel();
        }
        drop(state);

        info!("Cancelled all jobs ({} queued)", drained.len());
        for pending in drained {
            self.inner.emit(QueueEvent::Cancelled { id: pending.job.id });
        }
        self.inner.wake.notify_all();
    }

    /// Cancel every job whose label starts with `prefix`; used when a
    /// playlist is deleted. Returns the number of queued jobs removed.
    pub fn cancel_by_label_prefix(&self, prefix: &str) -> usize {
        let mut state = self.inner.lock_state();
        let mut dropped = Vec::new();
        state.pending.retain(|p| {
            if p.job.label.starts_with(prefix) {
                dropped.push((p.job.id, p.job.normalized.clone()));
                false
            } else {
                true
            }
        });
        for (_, normalized) in &dropped {
            state.index.remove(normalized);
        }
        if let Some(active) = &state.active {
            if active.label.starts_with(prefix) {
                active.token.cancel();
            }
        }
        drop(state);

        info!(
            "Cancelled {} queued jobs with label prefix '{}'",
            dropped.len(),
            prefix
        );
        let removed = dropped.len();
        for (id, _) in dropped {
            self.inner.emit(QueueEvent::Cancelled { id });
        }
        self.inner.wake.notify_all();
        removed
    }

    /// Start the worker thread. A second call while the worker is alive
    /// is a no-op.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        self.inner.lock_state().stopping = false;
        let inner = Arc::clone(&self.inner);
        *worker = Some(std::thread::spawn(move || inner.run_worker()));
    }

    /// Signal the worker to finish its current job and exit, then block
    /// until it has.
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock_state();
            state.stopping = true;
        }
        self.inner.wake.notify_all();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Download worker panicked");
            }
        }
    }

    /// Whether a locator currently has a live (queued or active) job.
    #[must_use]
    pub fn is_pending(&self, locator: &str) -> bool {
        let normalized = normalize_locator(locator);
        self.inner.lock_state().index.contains_key(&normalized)
    }

    /// Point-in-time view of the queue.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let running = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        let state = self.inner.lock_state();
        QueueSnapshot {
            running,
            queued: state.pending.len(),
            active: state.active.as_ref().map(|a| a.id),
            active_label: state.active.as_ref().map(|a| a.label.clone()),
        }
    }

    /// Try to receive a queue event without blocking.
    pub fn try_recv_event(&self) -> Option<QueueEvent> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }
}

impl std::fmt::Debug for DownloadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadQueue").finish_non_exhaustive()
    }
}
