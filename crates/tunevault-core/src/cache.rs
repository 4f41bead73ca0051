//! Local media cache.
//!
//! Downloaded assets live in one flat directory, named by a digest of
//! their normalized locator. Identity flows from the locator, so chapter
//! entries that share a physical resource share one cached file, and a
//! cache probe never touches the network. The cache is append-only from
//! the queue's point of view; removal happens only through the explicit
//! two-phase orphan sweep.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::job::normalize_locator;
use crate::store::PlaylistStore;

/// Compute the cache file stem for a locator.
///
/// Digest of the normalized locator, so all fragment variants of one
/// resource map to the same stem regardless of the file's extension.
#[must_use]
pub fn cache_stem(locator: &str) -> String {
    let digest = Sha256::digest(normalize_locator(locator).as_bytes());
    digest.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Flat directory of downloaded media, keyed by locator digest.
#[derive(Debug, Clone)]
pub struct MediaCache {
    dir: PathBuf,
}

impl MediaCache {
    /// Open a cache rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::fs(&dir, &e))?;
        Ok(Self { dir })
    }

    /// The directory downloads are materialized into.
    #[must_use]
    pub fn dest_dir(&self) -> &Path {
        &self.dir
    }

    /// Find the cached file for a locator, whatever its extension.
    #[must_use]
    pub fn lookup(&self, locator: &str) -> Option<PathBuf> {
        let stem = cache_stem(locator);
        self.files()
            .find(|p| p.file_stem().is_some_and(|s| s == stem.as_str()))
    }

    /// Cached files whose stem matches none of the referenced locators.
    ///
    /// First phase of the orphan sweep: the caller inspects (or confirms)
    /// the result before passing it to [`Self::remove`]. Nothing is
    /// deleted here.
    #[must_use]
    pub fn find_orphans(&self, referenced: &HashSet<String>) -> Vec<PathBuf> {
        let live: HashSet<String> = referenced.iter().map(|l| cache_stem(l)).collect();
        let orphans: Vec<PathBuf> = self
            .files()
            .filter(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .is_none_or(|stem| !live.contains(stem))
            })
            .collect();
        debug!(
            "Orphan scan: {} cached files unreferenced by any playlist",
            orphans.len()
        );
        orphans
    }

    /// Second phase of the orphan sweep: delete the given files.
    ///
    /// Returns the number actually removed; a file that vanished since
    /// the scan is skipped, any other failure aborts.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn remove(&self, paths: &[PathBuf]) -> Result<usize> {
        let mut removed = 0;
        for path in paths {
            match std::fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Orphan already gone: {}", path.display());
                }
                Err(e) => return Err(Error::fs(path, &e)),
            }
        }
        info!("Removed {removed} orphaned cache files");
        Ok(removed)
    }

    fn files(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            // In-flight temp files are not cache content.
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
    }
}

/// Collect the normalized locators referenced by every stored playlist.
///
/// A corrupt list must never cause its media to be treated as orphaned,
/// so any load failure aborts the sweep instead of narrowing the set.
///
/// # Errors
///
/// Returns the underlying error if any playlist is corrupt.
pub fn referenced_locators(store: &PlaylistStore) -> Result<HashSet<String>> {
    let mut locators = HashSet::new();
    for name in store.list_names() {
        match store.load(&name) {
            Ok(record) => {
                for entry in &record.entries {
                    locators.insert(normalize_locator(&entry.locator));
                }
            }
            Err(e @ Error::PlaylistCorrupt { .. }) => {
                warn!("Aborting orphan sweep, playlist '{name}' is corrupt");
                return Err(e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(locators)
}
