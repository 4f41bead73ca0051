//! Core library for Tunevault.
//!
//! Download orchestration and durable playlist storage for a local media
//! player, independent of any UI:
//!
//! - [`queue`] — priority-ordered, deduplicated download queue with one
//!   worker thread, cooperative cancellation, retry with backoff, and a
//!   throttled event stream.
//! - [`store`] — crash-safe playlist persistence (atomic temp + fsync +
//!   rename writes).
//! - [`cache`] — locator-addressed media cache with an explicit two-phase
//!   orphan sweep.
//! - [`source`] — the [`source::MediaSource`] trait the queue drives;
//!   extraction engines plug in behind it.
//! - [`prefetch`] — submits downloads for a playlist's fetchable entries.
//! - [`config`] — JSON application configuration.

pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod prefetch;
pub mod queue;
pub mod source;
pub mod store;

pub use cache::{cache_stem, referenced_locators, MediaCache};
pub use config::{AppConfig, ConfigManager};
pub use error::{Error, FetchError, FetchResult, Result};
pub use job::{normalize_locator, CancelToken, DownloadJob, JobId, JobPriority, JobState};
pub use prefetch::enqueue_playlist;
pub use queue::{DownloadQueue, QueueConfig, QueueEvent, QueueSnapshot};
pub use source::{AssetMetadata, MediaSource, ProgressCallback, Subsegment, TransferProgress};
pub use store::{PlaylistEntry, PlaylistRecord, PlaylistStore};
