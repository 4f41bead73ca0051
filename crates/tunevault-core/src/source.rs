//! Media source abstraction.
//!
//! The extraction and transcoding engines are external collaborators; the
//! core consumes them through this narrow trait and never assumes anything
//! about how a fetch is carried out.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FetchResult;
use crate::job::CancelToken;

/// Descriptive metadata for a remote asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetMetadata {
    /// Asset title.
    pub title: String,
    /// Duration in seconds, if known.
    pub duration_secs: Option<u64>,
    /// Logical sub-segments (chapters) within the asset.
    pub subsegments: Vec<Subsegment>,
}

/// A logical sub-segment of one physical asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subsegment {
    /// Segment title.
    pub title: String,
    /// Start offset in seconds.
    pub start_secs: u64,
    /// End offset in seconds, if bounded.
    pub end_secs: Option<u64>,
}

/// Progress report for an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// Completion percentage (0.0 - 100.0).
    pub percent: f64,
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total bytes, if the source knows it.
    pub total_bytes: Option<u64>,
    /// Estimated seconds remaining, if the source can estimate it.
    pub eta_secs: Option<f64>,
}

/// Progress callback for transfer operations.
pub type ProgressCallback = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Source of remote media assets.
///
/// All operations may fail with the classifications in
/// [`crate::error::FetchError`]. Implementations of [`Self::download_to`]
/// must poll the cancel token cooperatively, at least once per progress
/// report, and return [`crate::error::FetchError::Cancelled`] when it is
/// set; partial output should be discarded on that path.
#[cfg_attr(test, mockall::automock)]
pub trait MediaSource: Send + Sync {
    /// Fetch descriptive metadata for an asset.
    fn fetch_metadata(&self, locator: &str) -> FetchResult<AssetMetadata>;

    /// Resolve a transient, directly playable stream URI for an asset.
    fn fetch_stream_handle(&self, locator: &str) -> FetchResult<String>;

    /// Download an asset into `dest_dir`, reporting progress along the way.
    ///
    /// Returns the path of the materialized local file. The file name must
    /// be derived from the asset's normalized identity so repeated fetches
    /// of the same physical resource land on the same path.
    fn download_to(
        &self,
        locator: &str,
        dest_dir: &Path,
        progress: Option<ProgressCallback>,
        cancel: &CancelToken,
    ) -> FetchResult<PathBuf>;
}
