//! Integration tests for Tunevault core workflows.
//!
//! These tests drive the download queue end to end with a scripted fake
//! media source: retry chains, auth challenges, mid-transfer
//! cancellation, chapter-fragment dedupe, and the store/prefetch flow.
//! All fixtures live in temporary directories.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tunevault_core::{
    cache_stem, enqueue_playlist, AssetMetadata, CancelToken, DownloadQueue, FetchError,
    FetchResult, JobPriority, MediaCache, MediaSource, PlaylistEntry, PlaylistRecord,
    PlaylistStore, ProgressCallback, QueueConfig, QueueEvent, TransferProgress,
};

// =============================================================================
// Scripted fake source
// =============================================================================

/// Outcomes a locator can be scripted to produce, consumed in order; once
/// the script runs dry the download succeeds.
enum Step {
    Fail(FetchError),
    HangUntilCancelled,
}

/// A media source whose behavior is scripted per locator.
struct FakeSource {
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn script_failures(&self, locator: &str, failures: Vec<FetchError>) {
        let mut script = self.script.lock().unwrap();
        script
            .entry(locator.to_string())
            .or_default()
            .extend(failures.into_iter().map(Step::Fail));
    }

    fn script_hang(&self, locator: &str) {
        let mut script = self.script.lock().unwrap();
        script
            .entry(locator.to_string())
            .or_default()
            .push_back(Step::HangUntilCancelled);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl MediaSource for FakeSource {
    fn fetch_metadata(&self, locator: &str) -> FetchResult<AssetMetadata> {
        Ok(AssetMetadata {
            title: locator.to_string(),
            duration_secs: Some(180),
            subsegments: vec![],
        })
    }

    fn fetch_stream_handle(&self, locator: &str) -> FetchResult<String> {
        Ok(format!("stream://{locator}"))
    }

    fn download_to(
        &self,
        locator: &str,
        dest_dir: &Path,
        progress: Option<ProgressCallback>,
        cancel: &CancelToken,
    ) -> FetchResult<PathBuf> {
        self.calls.lock().unwrap().push(locator.to_string());

        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(locator)
            .and_then(VecDeque::pop_front);

        match step {
            Some(Step::Fail(e)) => Err(e),
            Some(Step::HangUntilCancelled) => {
                // Simulate a long transfer that only ends via the token.
                for _ in 0..1000 {
                    if cancel.is_cancelled() {
                        return Err(FetchError::Cancelled);
                    }
                    if let Some(cb) = &progress {
                        cb(TransferProgress {
                            percent: 10.0,
                            bytes_downloaded: 1024,
                            total_bytes: Some(10240),
                            eta_secs: Some(30.0),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(FetchError::Transient("hang script expired".to_string()))
            }
            None => {
                if let Some(cb) = &progress {
                    cb(TransferProgress {
                        percent: 100.0,
                        bytes_downloaded: 2048,
                        total_bytes: Some(2048),
                        eta_secs: Some(0.0),
                    });
                }
                let path = dest_dir.join(format!("{}.mp3", cache_stem(locator)));
                std::fs::write(&path, b"fake audio data")
                    .map_err(|e| FetchError::Permanent(e.to_string()))?;
                Ok(path)
            }
        }
    }
}

// =============================================================================
// Fixture and helpers
// =============================================================================

struct TestFixture {
    queue: DownloadQueue,
    source: Arc<FakeSource>,
    cache: MediaCache,
    cache_dir: TempDir,
}

impl TestFixture {
    fn new() -> Self {
        Self::with_config(fast_config())
    }

    fn with_config(config: QueueConfig) -> Self {
        let cache_dir = TempDir::new().expect("temp cache dir");
        let cache = MediaCache::new(cache_dir.path()).expect("cache");
        let source = Arc::new(FakeSource::new());
        let queue = DownloadQueue::with_config(
            Arc::clone(&source) as Arc<dyn MediaSource>,
            cache.clone(),
            config,
        );
        Self {
            queue,
            source,
            cache,
            cache_dir,
        }
    }

    /// Drain events until one matches, panicking on timeout. Returns
    /// everything drained, matching event last.
    fn wait_for(&self, mut pred: impl FnMut(&QueueEvent) -> bool) -> Vec<QueueEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        loop {
            while let Some(ev) = self.queue.try_recv_event() {
                let done = pred(&ev);
                seen.push(ev);
                if done {
                    return seen;
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for event; saw {seen:?}"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for TestFixture {
    fn drop(&mut self) {
        self.queue.stop();
    }
}

/// Tight retry timing so failure scenarios finish quickly and
/// deterministically.
fn fast_config() -> QueueConfig {
    QueueConfig {
        max_retries: 3,
        retry_base_delay_ms: 5,
        retry_jitter: 0.0,
        progress_events_per_sec: 60,
    }
}

fn is_complete(ev: &QueueEvent) -> bool {
    matches!(ev, QueueEvent::Complete { .. })
}

// =============================================================================
// Queue lifecycle
// =============================================================================

#[test]
fn test_download_lifecycle_event_order() {
    let f = TestFixture::new();
    let id = f
        .queue
        .submit("https://example.com/v1", JobPriority::Interactive, "Song")
        .unwrap();
    f.queue.start();

    let events = f.wait_for(is_complete);
    let queued = events
        .iter()
        .position(|e| matches!(e, QueueEvent::Queued { id: i, .. } if *i == id))
        .expect("queued event");
    let start = events
        .iter()
        .position(|e| matches!(e, QueueEvent::Start { id: i, .. } if *i == id))
        .expect("start event");
    let complete = events
        .iter()
        .position(|e| matches!(e, QueueEvent::Complete { id: i, .. } if *i == id))
        .expect("complete event");
    assert!(queued < start && start < complete);

    // The media landed in the cache under its digest stem.
    assert!(f.cache.lookup("https://example.com/v1").is_some());
    assert!(!f.queue.is_pending("https://example.com/v1"));
}

#[test]
fn test_priority_bands_drive_service_order() {
    let f = TestFixture::new();
    // Submit in worst-case order before the worker starts.
    f.queue
        .submit("https://example.com/bg", JobPriority::Background, "bg")
        .unwrap();
    f.queue
        .submit("https://example.com/pf", JobPriority::Prefetch, "pf")
        .unwrap();
    f.queue
        .submit("https://example.com/ia", JobPriority::Interactive, "ia")
        .unwrap();
    f.queue.start();

    let mut completes = 0;
    f.wait_for(|ev| {
        if is_complete(ev) {
            completes += 1;
        }
        completes == 3
    });

    assert_eq!(
        f.source.calls(),
        vec![
            "https://example.com/ia",
            "https://example.com/pf",
            "https://example.com/bg",
        ]
    );
}

#[test]
fn test_idle_event_after_queue_drains() {
    let f = TestFixture::new();
    f.queue
        .submit("https://example.com/v", JobPriority::Prefetch, "x")
        .unwrap();
    f.queue.start();
    f.wait_for(|e| matches!(e, QueueEvent::Idle));
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_transient_failures_retry_then_succeed() {
    let f = TestFixture::new();
    f.source.script_failures(
        "https://example.com/flaky",
        vec![
            FetchError::Transient("rate limited".to_string()),
            FetchError::Transient("timeout".to_string()),
        ],
    );
    f.queue
        .submit("https://example.com/flaky", JobPriority::Prefetch, "flaky")
        .unwrap();
    f.queue.start();

    let events = f.wait_for(is_complete);
    let retries: Vec<(u32, f64)> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::Retry {
                attempt, delay_secs, ..
            } => Some((*attempt, *delay_secs)),
            _ => None,
        })
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].0, 1);
    assert_eq!(retries[1].0, 2);
    // Jitter-free backoff doubles.
    assert!(retries[1].1 > retries[0].1);

    assert_eq!(f.source.calls().len(), 3);
}

#[test]
fn test_retries_exhausted_becomes_error() {
    let f = TestFixture::with_config(QueueConfig {
        max_retries: 2,
        ..fast_config()
    });
    f.source.script_failures(
        "https://example.com/dead",
        vec![
            FetchError::Transient("503".to_string()),
            FetchError::Transient("503".to_string()),
            FetchError::Transient("503".to_string()),
        ],
    );
    f.queue
        .submit("https://example.com/dead", JobPriority::Prefetch, "dead")
        .unwrap();
    f.queue.start();

    let events = f.wait_for(|e| matches!(e, QueueEvent::Error { .. }));
    let retries = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::Retry { .. }))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(f.source.calls().len(), 3);
    assert!(!f.queue.is_pending("https://example.com/dead"));
}

#[test]
fn test_permanent_failure_fails_immediately() {
    let f = TestFixture::new();
    f.source.script_failures(
        "https://example.com/gone",
        vec![FetchError::Permanent("410 gone".to_string())],
    );
    f.queue
        .submit("https://example.com/gone", JobPriority::Prefetch, "gone")
        .unwrap();
    f.queue.start();

    let events = f.wait_for(|e| matches!(e, QueueEvent::Error { .. }));
    assert!(!events.iter().any(|e| matches!(e, QueueEvent::Retry { .. })));
    assert_eq!(f.source.calls().len(), 1);
}

#[test]
fn test_auth_challenge_is_terminal_and_queue_continues() {
    let f = TestFixture::new();
    f.source.script_failures(
        "https://example.com/private",
        vec![FetchError::AuthRequired("sign-in required".to_string())],
    );
    f.queue
        .submit(
            "https://example.com/private",
            JobPriority::Interactive,
            "private",
        )
        .unwrap();
    f.queue
        .submit("https://example.com/public", JobPriority::Prefetch, "public")
        .unwrap();
    f.queue.start();

    // The public job still completes after the challenge.
    let events = f.wait_for(is_complete);
    let auth = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::AuthRequired { .. }))
        .count();
    assert_eq!(auth, 1);
    // Auth challenges are never auto-retried.
    assert!(!events.iter().any(|e| matches!(e, QueueEvent::Retry { .. })));
    assert_eq!(f.source.calls().len(), 2);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_mid_transfer() {
    let f = TestFixture::new();
    f.source.script_hang("https://example.com/slow");
    let id = f
        .queue
        .submit("https://example.com/slow", JobPriority::Interactive, "slow")
        .unwrap();
    f.queue.start();

    f.wait_for(|e| matches!(e, QueueEvent::Start { .. }));
    assert!(f.queue.cancel(id));

    let events = f.wait_for(|e| matches!(e, QueueEvent::Cancelled { id: i } if *i == id));
    assert!(!events.iter().any(is_complete));
    assert!(f.cache.lookup("https://example.com/slow").is_none());
    assert!(!f.queue.is_pending("https://example.com/slow"));
}

#[test]
fn test_cancel_while_queued_never_starts() {
    let f = TestFixture::new();
    f.source.script_hang("https://example.com/first");
    f.queue
        .submit("https://example.com/first", JobPriority::Interactive, "a")
        .unwrap();
    let queued = f
        .queue
        .submit("https://example.com/second", JobPriority::Prefetch, "b")
        .unwrap();
    f.queue.start();
    f.wait_for(|e| matches!(e, QueueEvent::Start { .. }));

    // Cancel the waiting job, then release the hung one.
    assert!(f.queue.cancel(queued));
    f.queue.cancel_all();

    let events = f.wait_for(|e| matches!(e, QueueEvent::Idle));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, QueueEvent::Start { id, .. } if *id == queued)),
        "cancelled job must not start"
    );
}

// =============================================================================
// Dedupe and cache
// =============================================================================

#[test]
fn test_chapter_fragments_collapse_to_one_download() {
    let f = TestFixture::new();
    let a = f
        .queue
        .submit(
            "https://example.com/album#chapter_1",
            JobPriority::Prefetch,
            "ch1",
        )
        .unwrap();
    let b = f
        .queue
        .submit(
            "https://example.com/album#chapter_2",
            JobPriority::Prefetch,
            "ch2",
        )
        .unwrap();
    assert_eq!(a, b);
    f.queue.start();

    f.wait_for(is_complete);
    assert_eq!(f.source.calls().len(), 1);
    // Both chapters resolve to the one cached file.
    assert!(f.cache.lookup("https://example.com/album#chapter_1").is_some());
    assert!(f.cache.lookup("https://example.com/album#chapter_2").is_some());
}

#[test]
fn test_cached_media_completes_without_fetch() {
    let f = TestFixture::new();
    let seeded = f
        .cache_dir
        .path()
        .join(format!("{}.opus", cache_stem("https://example.com/hit")));
    std::fs::write(&seeded, b"already here").unwrap();

    f.queue
        .submit("https://example.com/hit", JobPriority::Interactive, "hit")
        .unwrap();
    f.queue.start();

    let events = f.wait_for(is_complete);
    assert!(f.source.calls().is_empty(), "source must not be called");
    assert!(events
        .iter()
        .any(|e| matches!(e, QueueEvent::Complete { path, .. } if *path == seeded)));
}

// =============================================================================
// Store and prefetch flow
// =============================================================================

#[test]
fn test_unplayable_mark_survives_reopen_and_prefetch_skips() {
    let f = TestFixture::new();
    let store_dir = TempDir::new().unwrap();
    {
        let store = PlaylistStore::new(store_dir.path()).unwrap();
        let mut record = PlaylistRecord::new("mix", "");
        record
            .entries
            .push(PlaylistEntry::new("Good", "https://example.com/good"));
        record
            .entries
            .push(PlaylistEntry::new("Bad", "https://example.com/bad"));
        store.save(&record).unwrap();
        store
            .mark_entry_unplayable("mix", "https://example.com/bad", "removed upstream")
            .unwrap();
    }

    // Fresh store handle over the same directory, as after a restart.
    let store = PlaylistStore::new(store_dir.path()).unwrap();
    let loaded = store.load("mix").unwrap();
    assert!(!loaded.entries[1].playable);
    assert_eq!(
        loaded.entries[1].error_reason.as_deref(),
        Some("removed upstream")
    );

    let submitted =
        enqueue_playlist(&f.queue, &store, &f.cache, "mix", JobPriority::Background).unwrap();
    assert_eq!(submitted, 1);
    f.queue.start();

    f.wait_for(is_complete);
    assert_eq!(f.source.calls(), vec!["https://example.com/good"]);
}

#[test]
fn test_playlist_survives_interrupted_rewrite() {
    // A crash between temp write and rename leaves a stray temp file; the
    // playlist itself must still parse as its previous version.
    let store_dir = TempDir::new().unwrap();
    let store = PlaylistStore::new(store_dir.path()).unwrap();
    let mut record = PlaylistRecord::new("stable", "");
    record
        .entries
        .push(PlaylistEntry::new("Track", "https://example.com/t"));
    store.save(&record).unwrap();

    std::fs::write(store_dir.path().join(".tmpAbC123"), b"torn half-write").unwrap();

    let loaded = store.load("stable").unwrap();
    assert_eq!(loaded, record);
    assert_eq!(store.list_names(), vec!["stable"]);
}
