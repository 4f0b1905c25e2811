//! The Path Registry (§4.2): a process-wide table from normalised
//! archive base-path to archive entry.
//!
//! Grounded on `file-source-common::checkpointer::Checkpointer`: both hold
//! a `DashMap` keyed by an identity derived from the filesystem, support
//! safe deletion during iteration via a mark phase, and expose a separate
//! purge step that frees marked entries outside the visitor's critical
//! section.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use dashmap::DashMap;

use crate::codec::IndomHistory;

bitflags::bitflags! {
    /// §3's flag set. Multiple bits coexist on one entry.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u32 {
        const NEW              = 0b0000_0000_0001;
        const DELETED          = 0b0000_0000_0010;
        const DIRECTORY        = 0b0000_0000_0100;
        const META             = 0b0000_0000_1000;
        const DATAVOL          = 0b0000_0001_0000;
        const INDEX            = 0b0000_0010_0000;
        const COMPRESSED       = 0b0000_0100_0000;
        const MONITORED        = 0b0000_1000_0000;
        const DATAVOL_READY    = 0b0001_0000_0000;
        const META_IN_PROGRESS = 0b0010_0000_0000;
    }
}

/// A stable handle for an entry, valid for the entry's lifetime
/// (including across a pending `DELETED` mark, up to the purge that frees
/// it). Mirrors the generation-counter pattern the Design Notes call for
/// on top of a hash-table-of-arena-entries design.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EntryId(u64);

/// A source's identity, recomputed whenever a context-label-set arrives
/// (§3, §4.1's label-set record).
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct SourceIdentity {
    pub hash: u64,
    pub hostname: String,
}

/// Per-archive read context bookkeeping. Owned exclusively by the entry
/// (§3 Ownership); closing the entry closes the context.
#[derive(Debug, Default)]
pub struct ReadContext {
    pub meta_position: u64,
    pub data_position: u64,
    pub data_volume_seq: u32,
    pub indom_histories: HashMap<u32, IndomHistory>,
}

/// One tracked archive. `base_path` is the registry key; everything else
/// is mutable entry state (§3).
pub struct ArchiveEntry {
    pub id: EntryId,
    pub base_path: PathBuf,
    pub flags: EntryFlags,
    pub last_modified_secs: i64,
    pub last_callback_secs: i64,
    pub context: Option<ReadContext>,
    pub source: Option<SourceIdentity>,
    /// Owner-module handle + opaque user pointer, per §3. The engine
    /// itself treats this as opaque; only the registering module
    /// interprets it.
    pub owner_handle: Option<u64>,
    pub meta_residue: BytesMut,
    pub data_residue: BytesMut,
}

impl ArchiveEntry {
    fn new(id: EntryId, base_path: PathBuf) -> Self {
        Self {
            id,
            base_path,
            flags: EntryFlags::NEW,
            last_modified_secs: 0,
            last_callback_secs: 0,
            context: None,
            source: None,
            owner_handle: None,
            meta_residue: BytesMut::new(),
            data_residue: BytesMut::new(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(EntryFlags::DELETED)
    }
}

/// Strip a trailing `.meta` or `.N` (data-volume number) suffix so both
/// sibling files of one archive hash to the same registry key.
pub fn normalize_base_path(path: &Path) -> PathBuf {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return path.to_path_buf();
    };
    let stripped = if let Some(stem) = name.strip_suffix(".meta") {
        stem.to_string()
    } else if let Some(dot) = name.rfind('.') {
        let (stem, suffix) = name.split_at(dot);
        if suffix[1..].chars().all(|c| c.is_ascii_digit()) && suffix.len() > 1 {
            stem.to_string()
        } else {
            name.to_string()
        }
    } else {
        name.to_string()
    };
    match path.parent() {
        Some(parent) => parent.join(stripped),
        None => PathBuf::from(stripped),
    }
}

/// The process-wide path registry (§4.2). Single-threaded per §5, but
/// backed by `DashMap` for the same reason `file-source-common`'s
/// `Checkpointer` is: cheap concurrent reads from diagnostics/metrics code
/// without a separate lock, even though all *mutation* happens on the
/// engine's own
/// thread.
pub struct PathRegistry {
    entries: DashMap<PathBuf, ArchiveEntry>,
    next_id: AtomicU64,
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// `lookup(path) → entry?`. Accepts any sibling path (meta or data
    /// volume); normalises before the hash lookup.
    pub fn lookup<R>(&self, path: &Path, f: impl FnOnce(&ArchiveEntry) -> R) -> Option<R> {
        let key = normalize_base_path(path);
        self.entries.get(&key).map(|e| f(&e))
    }

    pub fn lookup_mut<R>(&self, path: &Path, f: impl FnOnce(&mut ArchiveEntry) -> R) -> Option<R> {
        let key = normalize_base_path(path);
        self.entries.get_mut(&key).map(|mut e| f(&mut e))
    }

    /// `insert_if_absent(path, module, user-data) → entry`. Re-inserting
    /// an already-present path returns the existing entry unchanged.
    pub fn insert_if_absent(&self, path: &Path, owner_handle: Option<u64>) -> EntryId {
        let key = normalize_base_path(path);
        if let Some(existing) = self.entries.get(&key) {
            return existing.id;
        }
        let id = EntryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entry = ArchiveEntry::new(id, key.clone());
        entry.owner_handle = owner_handle;
        self.entries.entry(key).or_insert(entry);
        id
    }

    /// `delete(path)`: marks `DELETED`, does not free. Terminal per §3's
    /// invariant — no further reads happen once this bit is set.
    pub fn delete(&self, path: &Path) {
        let key = normalize_base_path(path);
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.flags.insert(EntryFlags::DELETED);
        }
    }

    /// `purge_marked() → count`. Mark-then-free discipline: the expensive
    /// "are you still reachable" decision already happened (the `DELETED`
    /// bit was set under lock at mark time); this pass only removes
    /// entries that carry it, safe to run after any in-flight visitor
    /// has released its reference.
    pub fn purge_marked(&self) -> Vec<ArchiveEntry> {
        let doomed: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|e| e.is_deleted())
            .map(|e| e.base_path.clone())
            .collect();
        let mut freed = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some((_, entry)) = self.entries.remove(&key) {
                freed.push(entry);
            }
        }
        freed
    }

    /// `traverse(flags_mask, visitor)`.
    pub fn traverse(&self, flags_mask: EntryFlags, mut visitor: impl FnMut(&ArchiveEntry)) {
        for entry in self.entries.iter() {
            if entry.flags.intersects(flags_mask) || flags_mask.is_empty() {
                visitor(&entry);
            }
        }
    }

    /// `traverse_with_arg(flags_mask, visitor, arg)`.
    pub fn traverse_with_arg<A>(
        &self,
        flags_mask: EntryFlags,
        mut visitor: impl FnMut(&ArchiveEntry, &mut A),
        arg: &mut A,
    ) {
        for entry in self.entries.iter() {
            if entry.flags.intersects(flags_mask) || flags_mask.is_empty() {
                visitor(&entry, arg);
            }
        }
    }

    pub fn monitored_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.flags.contains(EntryFlags::MONITORED) && !e.is_deleted())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
