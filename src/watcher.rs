//! The Filesystem Watcher (§4.3): directory-level discovery plus
//! per-archive meta-file watching, throttle, and the lock-file
//! convention.
//!
//! Grounded on `ifile-source::paths_provider::notify::NotifyPathsProvider`
//! for the directory watch (same `notify::RecommendedWatcher` +
//! `EventKind` filtering) and on
//! `ifile-source::file_watcher::notify_watcher::NotifyWatcher` for the
//! per-archive watch (same wrap-a-channel-around-the-callback shape).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};

use crate::config::Config;
use crate::error::DiscoverError;

/// A change relevant to the engine, after filtering out the
/// `notify::EventKind` variants §4.3 doesn't care about (access events,
/// metadata-only changes that aren't growth/rename/removal).
#[derive(Debug, Clone)]
pub enum Change {
    /// A new immediate child appeared under a watched directory; the
    /// engine should rescan for archive base-paths.
    DirectoryChanged(PathBuf),
    /// A watched meta-file grew or was renamed.
    ArchiveChanged(PathBuf),
    /// A watched meta-file (or its directory entry) was removed.
    ArchiveRemoved(PathBuf),
}

fn relevant_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::To))
            | EventKind::Remove(RemoveKind::File | RemoveKind::Any)
    )
}

/// Wraps one `notify::RecommendedWatcher` and turns its callback into a
/// channel, exactly as `NotifyWatcher` does for a single file; here it
/// watches one archive's `.meta` sidecar, which the reference chooses to
/// watch in place of the (frequently rotated) data volume file.
pub struct ArchiveWatcher {
    _inner: RecommendedWatcher,
    rx: std::sync::mpsc::Receiver<Change>,
    meta_path: PathBuf,
}

impl ArchiveWatcher {
    pub fn watch(meta_path: PathBuf) -> Result<Self, DiscoverError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let watched_path = meta_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            if !relevant_kind(&event.kind) {
                return;
            }
            let change = if matches!(event.kind, EventKind::Remove(_)) {
                Change::ArchiveRemoved(watched_path.clone())
            } else {
                Change::ArchiveChanged(watched_path.clone())
            };
            let _ = tx.send(change);
        })
        .map_err(|source| DiscoverError::TransientIo {
            path: meta_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
        })?;
        watcher
            .watch(&meta_path, RecursiveMode::NonRecursive)
            .map_err(|source| DiscoverError::TransientIo {
                path: meta_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
            })?;
        Ok(Self {
            _inner: watcher,
            rx,
            meta_path,
        })
    }

    pub fn try_recv(&self) -> Option<Change> {
        self.rx.try_recv().ok()
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }
}

/// Directory-level watcher: discovers newly-appeared archive base-paths
/// under the configured root. Grounded on `NotifyPathsProvider`'s
/// directory-watch setup, minus the glob-pattern path-template handling
/// that crate supports (the archive root here is always a literal
/// directory, per §6.4).
pub struct DirectoryWatcher {
    _inner: RecommendedWatcher,
    rx: std::sync::mpsc::Receiver<Change>,
}

impl DirectoryWatcher {
    pub fn watch(root: &Path, recursive: bool) -> Result<Self, DiscoverError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            if !relevant_kind(&event.kind) {
                return;
            }
            for path in event.paths {
                let Some(dir) = path.parent() else { continue };
                let _ = tx.send(Change::DirectoryChanged(dir.to_path_buf()));
            }
        })
        .map_err(|source| DiscoverError::TransientIo {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
        })?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(root, mode)
            .map_err(|source| DiscoverError::TransientIo {
                path: root.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, source.to_string()),
            })?;
        Ok(Self { _inner: watcher, rx })
    }

    pub fn try_recv(&self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

/// Per-archive last-callback bookkeeping for the debounce/throttle rule
/// (§4.3): `max(1, monitored_count / MAX_INFLIGHT_MON)` seconds of
/// minimum spacing, plus a hard stop when the downstream in-flight
/// request count is too high.
#[derive(Default)]
pub struct Throttle {
    last_callback: HashMap<PathBuf, SystemTime>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a callback for `path` should proceed now, and
    /// records that it did. `downstream_inflight` is read-only observed
    /// state (§5's "shared resources").
    pub fn allow(
        &mut self,
        path: &Path,
        now: SystemTime,
        monitored_count: u64,
        downstream_inflight: u64,
        config: &Config,
    ) -> bool {
        if downstream_inflight > config.max_inflight_req {
            return false;
        }
        let window = config.throttle_window(monitored_count);
        match self.last_callback.get(path) {
            Some(last) if elapsed(*last, now) < window => false,
            _ => {
                self.last_callback.insert(path.to_path_buf(), now);
                true
            }
        }
    }

    pub fn forget(&mut self, path: &Path) {
        self.last_callback.remove(path);
    }
}

fn elapsed(last: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(last).unwrap_or(Duration::ZERO)
}

/// The per-directory lock-file convention (§4.3, §12): a sibling `lock`
/// file in the same directory as the meta-file signals a mid-commit
/// writer; callbacks for any archive in that directory should return
/// immediately rather than read.
pub fn lock_path_for(meta_path: &Path) -> Option<PathBuf> {
    meta_path.parent().map(|dir| dir.join("lock"))
}

pub fn is_locked(meta_path: &Path) -> bool {
    lock_path_for(meta_path)
        .map(|lock| lock.exists())
        .unwrap_or(false)
}

/// Whether a directory entry name looks like an archive's `.meta`
/// sidecar (§6.4: `<root>/<host>/<timestamp>.meta`).
pub fn is_meta_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("meta")
}

/// Compressed-volume suffixes recognised and ignored for growth (§6.4).
const COMPRESSED_SUFFIXES: &[&str] = &["xz", "gz", "bz2", "zst", "lz4", "Z"];

pub fn is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| COMPRESSED_SUFFIXES.contains(&ext))
        .unwrap_or(false)
}

pub fn now() -> SystemTime {
    SystemTime::now()
}

pub fn unix_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_drops_within_window_and_allows_after() {
        let mut throttle = Throttle::new();
        let config = Config {
            max_inflight_mon: 40,
            ..Default::default()
        };
        let path = PathBuf::from("/root/host1/archiveA");
        let t0 = SystemTime::now();
        assert!(throttle.allow(&path, t0, 80, 0, &config));
        // 80/40 = 2s window; 1s later should be dropped.
        let t1 = t0 + Duration::from_secs(1);
        assert!(!throttle.allow(&path, t1, 80, 0, &config));
        let t2 = t0 + Duration::from_secs(3);
        assert!(throttle.allow(&path, t2, 80, 0, &config));
    }

    #[test]
    fn throttle_blocks_when_downstream_saturated() {
        let mut throttle = Throttle::new();
        let config = Config::default();
        let path = PathBuf::from("/root/host1/archiveA");
        assert!(!throttle.allow(&path, SystemTime::now(), 1, config.max_inflight_req + 1, &config));
    }

    #[test]
    fn meta_and_compressed_suffix_detection() {
        assert!(is_meta_file(Path::new("/x/20260101.meta")));
        assert!(!is_meta_file(Path::new("/x/20260101.0")));
        assert!(is_compressed(Path::new("/x/20260101.0.xz")));
        assert!(!is_compressed(Path::new("/x/20260101.0")));
    }
}
