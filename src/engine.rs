//! The top-level engine handle: wires the Path Registry, Filesystem
//! Watcher, Archive Reader/Stream Reader, and Callback Dispatcher
//! together (§2's control flow, §5's single-threaded cooperative model).
//!
//! Grounded on `ifile-source::file_server::FileServer`'s role as the
//! thing an external runtime drives one tick at a time, generalized from
//! its async/tokio event loop to the plain synchronous `poll`/`handle_*`
//! surface §5 actually calls for: "driven by an external event loop...
//! no in-engine locks are required."

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;

use crate::config::Config;
use crate::dispatch::{Consumer, ConsumerHandle, Dispatcher};
use crate::error::DiscoverError;
use crate::metrics::{DiscoverInternalEvents, Telemetry};
use crate::reader;
use crate::registry::{normalize_base_path, EntryFlags, PathRegistry};
use crate::stream;
use crate::watcher::{self, ArchiveWatcher, Change, DirectoryWatcher, Throttle};

/// The engine handle created at startup and destroyed at teardown (§9
/// Design Notes: "encapsulate in an engine handle... avoid hidden
/// globals by threading this handle explicitly").
pub struct Engine {
    config: Config,
    registry: PathRegistry,
    dispatcher: Dispatcher,
    events: Arc<dyn DiscoverInternalEvents>,
    directory_watcher: Option<DirectoryWatcher>,
    /// Insertion-ordered so draining pending events round-robins across
    /// archives in discovery order, the same fairness motivation as
    /// `ifile-source::file_server::FileServer`'s `IndexMap`-keyed
    /// fingerprint table.
    archive_watchers: IndexMap<PathBuf, ArchiveWatcher>,
    throttle: Throttle,
    /// Read-only observed downstream in-flight count (§5 "shared
    /// resources"); the caller updates it, the engine only reads it.
    downstream_inflight: u64,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self, DiscoverError> {
        Self::with_events(config, Arc::new(Telemetry))
    }

    pub fn with_events(config: Config, events: Arc<dyn DiscoverInternalEvents>) -> Result<Self, DiscoverError> {
        let mut dispatcher = Dispatcher::new();
        let metric_ids: HashSet<u32> = HashSet::new();
        let indom_ids = config.parse_exclude_indoms();
        dispatcher.set_exclusions(metric_ids, indom_ids, config.exclude_metrics.clone());

        let directory_watcher = if config.enabled {
            Some(DirectoryWatcher::watch(&config.path, config.recursive)?)
        } else {
            None
        };

        Ok(Self {
            config,
            registry: PathRegistry::new(),
            dispatcher,
            events,
            directory_watcher,
            archive_watchers: IndexMap::new(),
            throttle: Throttle::new(),
            downstream_inflight: 0,
        })
    }

    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    pub fn register_consumer(&mut self, consumer: Arc<dyn Consumer>) -> ConsumerHandle {
        self.dispatcher.register(consumer)
    }

    pub fn unregister_consumer(&mut self, handle: ConsumerHandle) {
        self.dispatcher.unregister(handle)
    }

    pub fn set_downstream_inflight(&mut self, count: u64) {
        self.downstream_inflight = count;
    }

    /// Drains pending directory-watcher events and runs directory scans
    /// for each (§4.3's directory watcher).
    pub fn poll_directory_changes(&mut self) -> Result<(), DiscoverError> {
        let mut dirs = Vec::new();
        if let Some(w) = &self.directory_watcher {
            while let Some(change) = w.try_recv() {
                if let Change::DirectoryChanged(dir) = change {
                    dirs.push(dir);
                }
            }
        }
        for dir in dirs {
            self.scan_directory(&dir)?;
        }
        Ok(())
    }

    /// Scans one directory non-recursively for archive `.meta` files,
    /// inserting newly-seen base-paths (§2 control flow, §8 scenario 1).
    pub fn scan_directory(&mut self, dir: &Path) -> Result<(), DiscoverError> {
        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(_) => return Ok(()), // directory itself may have been removed
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if !watcher::is_meta_file(&path) {
                continue;
            }
            let base_path = normalize_base_path(&path);
            let already_present = self.registry.lookup(&base_path, |_| ()).is_some();
            self.registry.insert_if_absent(&base_path, None);
            if !already_present {
                self.mark_components(&base_path, dir);
                self.install_watch(&base_path)?;
            }
        }
        Ok(())
    }

    fn mark_components(&mut self, base_path: &Path, dir: &Path) {
        let Ok(read_dir) = fs::read_dir(dir) else { return };
        let mut flags = EntryFlags::NEW | EntryFlags::META;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if normalize_base_path(&path) != base_path {
                continue;
            }
            if watcher::is_meta_file(&path) {
                flags.insert(EntryFlags::META);
            } else if watcher::is_compressed(&path) {
                flags.insert(EntryFlags::COMPRESSED);
            } else if path.extension().and_then(|e| e.to_str()) == Some("index") {
                flags.insert(EntryFlags::INDEX);
            } else {
                flags.insert(EntryFlags::DATAVOL);
            }
        }
        self.registry.lookup_mut(base_path, |e| e.flags = flags);
    }

    fn install_watch(&mut self, base_path: &Path) -> Result<(), DiscoverError> {
        let meta_path = reader::meta_file_path(base_path);
        match ArchiveWatcher::watch(meta_path.clone()) {
            Ok(w) => {
                self.archive_watchers.insert(base_path.to_path_buf(), w);
                self.registry
                    .lookup_mut(base_path, |e| e.flags.insert(EntryFlags::MONITORED));
            }
            Err(e) => {
                self.events.emit_malformed_record(base_path, "watch", &e.to_string());
            }
        }
        self.events.monitored_gauge(self.registry.monitored_count() as u64);
        Ok(())
    }

    /// Drains every archive watcher's pending events and runs the
    /// reader's meta+data steps for each, subject to the throttle and
    /// lock-file convention (§4.3, §4.4).
    pub fn poll_archive_changes(&mut self) {
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        for (base_path, w) in &self.archive_watchers {
            while let Some(change) = w.try_recv() {
                match change {
                    Change::ArchiveChanged(_) => changed.push(base_path.clone()),
                    Change::ArchiveRemoved(_) => removed.push(base_path.clone()),
                    Change::DirectoryChanged(_) => {}
                }
            }
        }
        for base_path in removed {
            self.registry.delete(&base_path);
            self.throttle.forget(&base_path);
        }
        let monitored = self.registry.monitored_count() as u64;
        self.events
            .emit_throttle_window(self.config.throttle_window(monitored).as_secs());
        for base_path in changed {
            let meta_path = reader::meta_file_path(&base_path);
            if watcher::is_locked(&meta_path) {
                continue;
            }
            let now = watcher::now();
            if !self.throttle.allow(&base_path, now, monitored, self.downstream_inflight, &self.config) {
                self.events.emit_throttled_changed_callback(&base_path);
                continue;
            }
            self.events.emit_changed_callback(&base_path);
            self.run_archive(&base_path);
        }
    }

    fn run_archive(&mut self, base_path: &Path) {
        let events = self.events.clone();
        let dispatcher = &self.dispatcher;
        let callback_secs = Utc::now().timestamp();
        let ran = self.registry.lookup_mut(base_path, |entry| {
            entry.last_callback_secs = callback_secs;
            if let Err(e) = reader::run_meta_step(entry, dispatcher, events.as_ref()) {
                events.emit_malformed_record(base_path, "meta-step", &e.to_string());
            }
            if !entry.is_deleted() {
                if let Err(e) = reader::run_data_step(entry, dispatcher, events.as_ref()) {
                    events.emit_malformed_record(base_path, "data-step", &e.to_string());
                }
            }
        });
        if ran.is_none() {
            tracing::warn!(?base_path, "run_archive called for unregistered entry");
        }
    }

    /// Timer-tick entry point (§5's "(b) timer ticks"): purge marked
    /// entries and refresh the `monitored` gauge.
    pub fn tick(&mut self) {
        reader::purge_and_close(&self.registry, &self.dispatcher, self.events.as_ref());
        self.archive_watchers.retain(|base_path, _| {
            self.registry.lookup(base_path, |_| ()).is_some()
        });
        self.events.monitored_gauge(self.registry.monitored_count() as u64);
    }

    /// Stream ingestion entry points (§4.5), for sources that push bytes
    /// instead of being discovered on disk.
    pub fn push_meta(&mut self, base_path: &Path, bytes: &[u8]) -> Result<(), DiscoverError> {
        self.registry.insert_if_absent(base_path, None);
        let dispatcher = &self.dispatcher;
        let events = self.events.clone();
        self.registry
            .lookup_mut(base_path, |entry| stream::push_meta(entry, bytes, dispatcher, events.as_ref()))
            .unwrap_or(Ok(()))
    }

    pub fn push_data(&mut self, base_path: &Path, bytes: &[u8]) -> Result<(), DiscoverError> {
        let dispatcher = &self.dispatcher;
        let events = self.events.clone();
        self.registry
            .lookup_mut(base_path, |entry| stream::push_data(entry, bytes, dispatcher, events.as_ref()))
            .unwrap_or(Err(DiscoverError::NoContext {
                path: base_path.to_path_buf(),
            }))
    }

    pub fn stream_end(&mut self, base_path: &Path) {
        let dispatcher = &self.dispatcher;
        self.registry.lookup_mut(base_path, |entry| stream::stream_end(entry, dispatcher));
        self.registry.delete(base_path);
    }

    /// Teardown: unregister everything and drop the registry, freeing
    /// every entry without dispatching `closed` (§5: explicit teardown
    /// is not an archive-level close).
    pub fn close(mut self) {
        self.archive_watchers.clear();
        self.directory_watcher = None;
    }
}
