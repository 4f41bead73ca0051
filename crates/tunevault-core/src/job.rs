//! Job types shared between the download queue and its callers.
//!
//! A job is one requested fetch of a remote asset, identified for dedupe
//! purposes by its normalized locator (the locator with any trailing
//! disambiguation fragment stripped, since several logical entries such as
//! chapters may map to one physical resource).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Unique identifier for a job, assigned monotonically by the queue.
pub type JobId = u64;

/// Priority band for download jobs.
///
/// Higher bands are serviced first; within a band jobs run in submission
/// order. A resubmission may raise a live job's priority but never lower it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Idle-time refill of the local cache.
    Background = 0,
    /// Speculative fetch ahead of expected playback.
    #[default]
    Prefetch = 1,
    /// The user is waiting on this asset.
    Interactive = 2,
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Background => write!(f, "Background"),
            Self::Prefetch => write!(f, "Prefetch"),
            Self::Interactive => write!(f, "Interactive"),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue.
    Queued,
    /// Currently being fetched by the worker.
    Active,
    /// Failed transiently; waiting out its backoff delay.
    Retrying,
    /// Fetched successfully.
    Done,
    /// Failed terminally.
    Failed,
    /// Cancelled before or during the fetch.
    Cancelled,
}

impl JobState {
    /// Whether this state is terminal. A terminal job is removed from all
    /// queue indexes and its id is never reused.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// One requested fetch operation.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Unique job id.
    pub id: JobId,
    /// The locator as submitted, fragment included.
    pub locator: String,
    /// Dedupe key: locator with any trailing fragment stripped.
    pub normalized: String,
    /// Priority band.
    pub priority: JobPriority,
    /// Human-readable description for the UI (typically the playlist name
    /// plus track title).
    pub label: String,
    /// Submission sequence number; FIFO tie-break within a priority band.
    pub seq: u64,
    /// Retry counter, incremented on each transient failure.
    pub attempt: u32,
    /// Current lifecycle state.
    pub state: JobState,
    /// Per-job cooperative cancellation flag.
    pub token: CancelToken,
}

/// Normalize a locator for dedupe and cache-identity purposes.
///
/// Strips a trailing `#fragment`; entries that share a physical resource
/// but differ only in the fragment (e.g. distinct chapters of one source)
/// normalize to the same key and map to the same cached file.
#[must_use]
pub fn normalize_locator(locator: &str) -> String {
    match locator.split_once('#') {
        Some((base, _)) => base.to_string(),
        None => locator.to_string(),
    }
}

/// Cooperative cancellation flag shared between the queue and an in-flight
/// media source call.
///
/// The flag is polled, never used to forcibly interrupt a thread; a fetch
/// may still complete successfully if the checkpoint is missed narrowly
/// before completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
