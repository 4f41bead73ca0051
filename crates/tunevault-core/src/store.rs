//! Playlist persistence.
//!
//! Each playlist is one pretty-printed JSON document in the store
//! directory. Writes go through a temp-file, fsync, atomic-rename
//! sequence so a crash at any point leaves either the old version or the
//! new one on disk, never a torn file. All operations serialize through a
//! store-wide gate.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Current on-disk format version.
pub const PLAYLIST_FORMAT_VERSION: u32 = 1;

const PLAYLIST_EXTENSION: &str = "json";

/// One track in a playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistEntry {
    /// Track title.
    pub title: String,
    /// Artist, if known.
    #[serde(default)]
    pub artist: Option<String>,
    /// Remote asset locator, fragment included for chapter entries.
    pub locator: String,
    /// Playback start offset in seconds, for chapter entries.
    #[serde(default)]
    pub start_secs: Option<u64>,
    /// Playback end offset in seconds, for bounded chapter entries.
    #[serde(default)]
    pub end_secs: Option<u64>,
    /// Whether the entry is playable. Unplayable entries are skipped by
    /// prefetch and flagged in the UI until the user intervenes.
    #[serde(default = "default_playable")]
    pub playable: bool,
    /// Why the entry was marked unplayable, if it was.
    #[serde(default)]
    pub error_reason: Option<String>,
}

const fn default_playable() -> bool {
    true
}

impl PlaylistEntry {
    /// Create a playable entry with just a title and locator.
    #[must_use]
    pub fn new(title: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: None,
            locator: locator.into(),
            start_secs: None,
            end_secs: None,
            playable: true,
            error_reason: None,
        }
    }
}

/// A named, ordered collection of entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistRecord {
    /// On-disk format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Playlist name; doubles as the file stem.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Ordered entries.
    #[serde(default)]
    pub entries: Vec<PlaylistEntry>,
}

const fn default_version() -> u32 {
    PLAYLIST_FORMAT_VERSION
}

impl PlaylistRecord {
    /// Create an empty playlist.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: PLAYLIST_FORMAT_VERSION,
            name: name.into(),
            description: description.into(),
            entries: Vec::new(),
        }
    }
}

/// Durable playlist storage rooted at one directory.
///
/// Explicitly constructed and handed to collaborators. The internal gate
/// makes read-modify-write sequences such as
/// [`Self::mark_entry_unplayable`] atomic with respect to other store
/// calls in this process.
#[derive(Debug)]
pub struct PlaylistStore {
    dir: PathBuf,
    gate: Mutex<()>,
}

impl PlaylistStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::fs(&dir, &e))?;
        Ok(Self {
            dir,
            gate: Mutex::new(()),
        })
    }

    /// The directory playlists are stored in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{PLAYLIST_EXTENSION}"))
    }

    /// Reject names that are empty or would escape the store directory.
    fn validate_name(name: &str) -> Result<()> {
        let reject = |reason: &str| {
            Err(Error::InvalidPlaylistName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };
        if name.trim().is_empty() {
            return reject("name must not be empty");
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return reject("name must not contain path separators");
        }
        if name.starts_with('.') {
            return reject("name must not start with a dot");
        }
        Ok(())
    }

    /// List stored playlist names, sorted.
    #[must_use]
    pub fn list_names(&self) -> Vec<String> {
        let _gate = self.lock_gate();
        let mut names: Vec<String> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext == PLAYLIST_EXTENSION)
            })
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(String::from)
            })
            .collect();
        names.sort();
        names
    }

    /// Whether a playlist with this name exists on disk.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    /// Create an empty playlist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlaylistAlreadyExists`] if the name is taken, or
    /// [`Error::InvalidPlaylistName`] if the name is unusable.
    pub fn create(&self, name: &str, description: &str) -> Result<PlaylistRecord> {
        Self::validate_name(name)?;
        let _gate = self.lock_gate();
        if self.path_for(name).is_file() {
            return Err(Error::PlaylistAlreadyExists(name.to_string()));
        }
        let record = PlaylistRecord::new(name, description);
        self.write_record(&record)?;
        info!("Created playlist '{name}'");
        Ok(record)
    }

    /// Load a playlist from disk.
    ///
    /// A file that exists but fails to parse yields
    /// [`Error::PlaylistCorrupt`]; the file is left untouched so the user
    /// can inspect or recover it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlaylistNotFound`] if no such playlist exists.
    pub fn load(&self, name: &str) -> Result<PlaylistRecord> {
        Self::validate_name(name)?;
        let _gate = self.lock_gate();
        self.read_record(name)
    }

    /// Persist a playlist atomically, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the write fails.
    pub fn save(&self, record: &PlaylistRecord) -> Result<()> {
        Self::validate_name(&record.name)?;
        let _gate = self.lock_gate();
        self.write_record(record)?;
        debug!(
            "Saved playlist '{}' ({} entries)",
            record.name,
            record.entries.len()
        );
        Ok(())
    }

    /// Delete a playlist file.
    ///
    /// Cached media is not touched here; orphan cleanup is a separate,
    /// explicit sweep.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlaylistNotFound`] if no such playlist exists.
    pub fn delete(&self, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        let _gate = self.lock_gate();
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(Error::PlaylistNotFound(name.to_string()));
        }
        std::fs::remove_file(&path).map_err(|e| Error::fs(&path, &e))?;
        info!("Deleted playlist '{name}'");
        Ok(())
    }

    /// Flag an entry as unplayable, recording the reason.
    ///
    /// Read-modify-write under the gate, so a concurrent save cannot be
    /// lost. The entry stays in the list; prefetch skips it until the
    /// flag is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntryNotFound`] if no entry has the locator.
    pub fn mark_entry_unplayable(&self, name: &str, locator: &str, reason: &str) -> Result<()> {
        Self::validate_name(name)?;
        let _gate = self.lock_gate();
        let mut record = self.read_record(name)?;
        let entry = record
            .entries
            .iter_mut()
            .find(|e| e.locator == locator)
            .ok_or_else(|| Error::EntryNotFound {
                playlist: name.to_string(),
                locator: locator.to_string(),
            })?;
        entry.playable = false;
        entry.error_reason = Some(reason.to_string());
        self.write_record(&record)?;
        warn!("Marked entry unplayable in '{name}': {locator} ({reason})");
        Ok(())
    }

    /// Read and parse one playlist file. Caller holds the gate.
    fn read_record(&self, name: &str) -> Result<PlaylistRecord> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(Error::PlaylistNotFound(name.to_string()));
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::fs(&path, &e))?;
        serde_json::from_str(&raw).map_err(|e| Error::PlaylistCorrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write one playlist file atomically. Caller holds the gate.
    ///
    /// Serialize fully before touching disk, write to a sibling temp file,
    /// fsync, then rename over the target.
    fn write_record(&self, record: &PlaylistRecord) -> Result<()> {
        let path = self.path_for(&record.name);
        let json = serde_json::to_string_pretty(record)?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| Error::fs(&self.dir, &e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::fs(tmp.path(), &e))?;
        tmp.persist(&path)
            .map_err(|e| Error::fs(&path, &e.error))?;
        Ok(())
    }
}
