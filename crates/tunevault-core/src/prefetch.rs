//! Playlist prefetch.
//!
//! Bridges the store and the queue: walk a playlist and submit a fetch
//! for every entry worth fetching. Queue-side dedupe means re-running a
//! prefetch while jobs are still live is harmless.

use tracing::{debug, info};

use crate::cache::MediaCache;
use crate::error::Result;
use crate::job::JobPriority;
use crate::queue::DownloadQueue;
use crate::store::PlaylistStore;

/// Submit downloads for every fetchable entry of a playlist.
///
/// Entries marked unplayable are skipped, as are entries whose media is
/// already cached. Returns the number of jobs submitted; dedupe inside
/// the queue may collapse chapter entries onto one job, which still
/// counts once per accepted submission.
///
/// # Errors
///
/// Returns an error if the playlist cannot be loaded.
pub fn enqueue_playlist(
    queue: &DownloadQueue,
    store: &PlaylistStore,
    cache: &MediaCache,
    name: &str,
    priority: JobPriority,
) -> Result<usize> {
    let record = store.load(name)?;
    let mut submitted = 0;

    for entry in &record.entries {
        if !entry.playable {
            debug!("Prefetch skipping unplayable entry: {}", entry.locator);
            continue;
        }
        if cache.lookup(&entry.locator).is_some() {
            debug!("Prefetch skipping cached entry: {}", entry.locator);
            continue;
        }
        let label = format!("{name}: {}", entry.title);
        queue.submit(&entry.locator, priority, &label)?;
        submitted += 1;
    }

    info!(
        "Prefetch for '{name}': submitted {submitted} of {} entries",
        record.entries.len()
    );
    Ok(submitted)
}
