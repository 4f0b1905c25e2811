//! The Archive Reader (§4.4): per-archive state machine driven by
//! filesystem change notifications.
//!
//! Grounded on `ifile-source::file_watcher::FileWatcher`'s `read_line`
//! loop: open-on-demand, short-read handling by rewinding the cursor
//! rather than consuming partial data, and an `is_dead`/`reached_eof`
//! pair of flags that this module's `META_IN_PROGRESS`/`DATAVOL_READY`
//! bits play the same role as.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::codec::{self, IndomBody, Probe, RecordType};
use crate::dispatch::{Dispatcher, EventHeader};
use crate::error::DiscoverError;
use crate::metrics::DiscoverInternalEvents;
use crate::registry::{ArchiveEntry, EntryFlags, PathRegistry, ReadContext, SourceIdentity};

/// §4.4's state machine. Most states are derived from `EntryFlags` plus
/// whether a read context exists; this enum is the reader's own view,
/// kept separate from the registry's flag bitmap per the Design Notes
/// ("avoid hidden globals... thread the handle explicitly").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReaderState {
    Untracked,
    Fresh,
    Idle,
    Meta,
    Data,
    Deleted,
}

pub fn state_of(entry: &ArchiveEntry) -> ReaderState {
    if entry.is_deleted() {
        return ReaderState::Deleted;
    }
    if entry.flags.contains(EntryFlags::NEW) {
        return ReaderState::Fresh;
    }
    if entry.flags.contains(EntryFlags::META_IN_PROGRESS) {
        return ReaderState::Meta;
    }
    if entry.flags.contains(EntryFlags::DATAVOL_READY) {
        return ReaderState::Data;
    }
    ReaderState::Idle
}

const SCRATCH_SLACK: usize = 4096;

/// Runs the meta step (§4.4 "Meta step") to completion for one change
/// event: loop reading complete header+body records from the meta-file
/// until a short read, EOF, or deletion is detected.
pub fn run_meta_step(
    entry: &mut ArchiveEntry,
    dispatcher: &Dispatcher,
    events: &dyn DiscoverInternalEvents,
) -> Result<(), DiscoverError> {
    entry.flags.insert(EntryFlags::META_IN_PROGRESS);
    events.emit_metadata_callback(&entry.base_path);

    let meta_path = meta_file_path(&entry.base_path);
    let had_context = entry.context.is_some();
    let mut file = match open_for_read(&meta_path, &mut entry.context) {
        Ok(f) => {
            if !had_context {
                events.emit_logvol_new_context(&entry.base_path);
                // §3: "If a read context exists, the entry's source
                // identity is set." Establish it here so a descriptor-only
                // archive (no context-label-set yet) still gets an
                // `on_source` before its first `on_metric` (§8 scenario 2).
                recompute_source_identity(entry, dispatcher);
            }
            f
        }
        Err(DiscoverError::Deleted { .. }) => {
            entry.flags.insert(EntryFlags::DELETED);
            events.emit_archive_deleted(&entry.base_path);
            entry.flags.remove(EntryFlags::META_IN_PROGRESS);
            return Ok(());
        }
        Err(e @ DiscoverError::TransientIo { .. }) => {
            entry.flags.remove(EntryFlags::META_IN_PROGRESS);
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if let Ok(metadata) = file.metadata() {
        if let Ok(modified) = metadata.modified() {
            entry.last_modified_secs = chrono::DateTime::<chrono::Utc>::from(modified).timestamp();
        }
    }

    // Keep the read cursor in a local rather than holding
    // `entry.context.as_mut()` live across `dispatch_meta_record`, which
    // itself needs `&mut entry` (and so `&mut entry.context`) to record
    // indom history. The local is written back after each record.
    let mut meta_position = entry.context.as_ref().expect("opened above").meta_position;
    file.seek(SeekFrom::Start(meta_position))
        .map_err(|source| DiscoverError::TransientIo {
            path: meta_path.clone(),
            source,
        })?;

    let mut scratch = Vec::new();
    loop {
        events.emit_metadata_loop(&entry.base_path);
        let start = meta_position;
        match read_one_record(&mut file, &mut scratch) {
            Ok(Some((record_type, total_len))) => {
                meta_position = start + total_len as u64;
                entry.context.as_mut().expect("opened above").meta_position = meta_position;
                dispatch_meta_record(entry, record_type, &scratch[8..total_len - 4], dispatcher, events)?;
            }
            Ok(None) => {
                // short read: rewind to where we started this record.
                file.seek(SeekFrom::Start(start)).map_err(|source| {
                    DiscoverError::TransientIo {
                        path: meta_path.clone(),
                        source,
                    }
                })?;
                events.emit_metadata_partial_read(&entry.base_path);
                break;
            }
            Err(e) => {
                events.emit_malformed_record(&entry.base_path, "meta", &e.to_string());
                break;
            }
        }
    }

    entry.flags.remove(EntryFlags::META_IN_PROGRESS);
    if entry.flags.contains(EntryFlags::DATAVOL) {
        entry.flags.insert(EntryFlags::DATAVOL_READY);
    }
    Ok(())
}

/// Runs the data step (§4.4 "Data step"): fetch and dispatch value
/// results until end-of-log, handling volume rotation.
pub fn run_data_step(
    entry: &mut ArchiveEntry,
    dispatcher: &Dispatcher,
    events: &dyn DiscoverInternalEvents,
) -> Result<(), DiscoverError> {
    if entry.flags.contains(EntryFlags::META_IN_PROGRESS) {
        // coalesce: a later callback will run data once meta quiesces.
        return Ok(());
    }
    events.emit_logvol_callback(&entry.base_path);

    let Some(ctx) = entry.context.as_mut() else {
        return Ok(());
    };
    let data_path = data_volume_path(&entry.base_path, ctx.data_volume_seq);
    let mut file = match File::open(&data_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // volume rotated to the next sequence number; try it once.
            ctx.data_volume_seq += 1;
            events.emit_logvol_change_vol(&entry.base_path, ctx.data_volume_seq);
            let next_path = data_volume_path(&entry.base_path, ctx.data_volume_seq);
            match File::open(&next_path) {
                Ok(f) => f,
                Err(_) => {
                    entry.flags.remove(EntryFlags::DATAVOL_READY);
                    return Ok(());
                }
            }
        }
        Err(source) => {
            events.emit_logvol_get_archive_end_failed(&entry.base_path, &source.to_string());
            return Ok(());
        }
    };

    file.seek(SeekFrom::Start(ctx.data_position))
        .map_err(|source| DiscoverError::TransientIo {
            path: data_path.clone(),
            source,
        })?;

    let mut scratch = Vec::new();
    loop {
        events.emit_logvol_loop(&entry.base_path);
        let start = ctx.data_position;
        match read_one_record(&mut file, &mut scratch) {
            Ok(Some((RecordType::Result, total_len))) => {
                ctx.data_position = start + total_len as u64;
                let body = &scratch[8..total_len - 4];
                let result = codec::decode_result(body)?;
                events.emit_logvol_decode_result();
                if result.is_mark {
                    events.emit_logvol_decode_mark_record();
                } else {
                    events.emit_logvol_decode_result_pmids(result.samples.len());
                }
                let header = EventHeader {
                    timestamp: result.timestamp.clone(),
                    source: entry.source.clone().unwrap_or_default(),
                    module_handle: entry.owner_handle.unwrap_or(0),
                };
                dispatcher.dispatch_values(&header, &result);
            }
            Ok(Some((other, total_len))) => {
                // Not expected in a data volume; skip the record body.
                let _ = other;
                ctx.data_position = start + total_len as u64;
            }
            Ok(None) => break,
            Err(e) => {
                events.emit_logvol_decode_result_error(&e.to_string());
                break;
            }
        }
    }
    entry.flags.remove(EntryFlags::DATAVOL_READY);
    Ok(())
}

fn dispatch_meta_record(
    entry: &mut ArchiveEntry,
    record_type: RecordType,
    body: &[u8],
    dispatcher: &Dispatcher,
    events: &dyn DiscoverInternalEvents,
) -> Result<(), DiscoverError> {
    match record_type {
        RecordType::Desc => {
            let descriptor = codec::decode_descriptor(body)?;
            events.emit_metadata_decode_desc();
            let header = header_for(entry);
            dispatcher.dispatch_metric(&header, &descriptor);
        }
        RecordType::Indom | RecordType::IndomV2 | RecordType::IndomDelta => {
            let record = codec::decode_indom(body, record_type)?;
            events.emit_metadata_decode_indom();
            let ctx = entry.context.get_or_insert_with(ReadContext::default);
            match record.body {
                IndomBody::Full { indom_id, instances } => {
                    ctx.indom_histories
                        .entry(indom_id)
                        .or_default()
                        .record_full(record.timestamp.clone(), instances.clone());
                    let header = header_for(entry);
                    dispatcher.dispatch_indom(&header, indom_id, &instances);
                }
                IndomBody::Delta { indom_id, changes } => {
                    let history = ctx.indom_histories.entry(indom_id).or_default();
                    if let Some(full) = codec::undelta_indom(history, &record.timestamp, &changes) {
                        let header = header_for(entry);
                        dispatcher.dispatch_indom(&header, indom_id, &full);
                    }
                    // a botch silently drops the delta; the chain stays
                    // poisoned until the next full indom (§9 Open Q1).
                }
            }
        }
        RecordType::Label | RecordType::LabelV2 => {
            let record = codec::decode_labelset(body)?;
            events.emit_metadata_decode_label();
            let header = header_for(entry);
            // engine retains and frees on `Declined`; dropping `record`
            // below does exactly that since nothing else holds a
            // reference (§3's label-set ownership asymmetry).
            let _outcome = dispatcher.dispatch_labels(
                &header,
                record.target_type,
                record.target_id,
                &record.label_sets,
            );
            if record.target_type == crate::codec::TargetType::Context {
                recompute_source_identity(entry, dispatcher);
            }
        }
        RecordType::Text => {
            let record = codec::decode_text(body)?;
            events.emit_metadata_decode_helptext();
            let header = header_for(entry);
            dispatcher.dispatch_text(&header, record.kind, record.id, &record.text);
        }
        RecordType::Result => {
            // a result record in the meta stream would be unusual but
            // not fatal; the data step is the intended path for these.
        }
    }
    Ok(())
}

fn recompute_source_identity(entry: &mut ArchiveEntry, dispatcher: &Dispatcher) {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    entry.base_path.hash(&mut hasher);
    let hostname = entry
        .base_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    hostname.hash(&mut hasher);
    let new_identity = SourceIdentity {
        hash: hasher.finish(),
        hostname,
    };
    let changed = entry.source.as_ref() != Some(&new_identity);
    entry.source = Some(new_identity);
    if changed {
        let header = header_for(entry);
        dispatcher.dispatch_source(&header);
    }
}

fn header_for(entry: &ArchiveEntry) -> EventHeader {
    EventHeader {
        timestamp: crate::codec::Timestamp { sec: entry.last_modified_secs, nsec: 0 },
        source: entry.source.clone().unwrap_or_default(),
        module_handle: entry.owner_handle.unwrap_or(0),
    }
}

pub(crate) fn meta_file_path(base_path: &Path) -> PathBuf {
    let mut p = base_path.as_os_str().to_owned();
    p.push(".meta");
    PathBuf::from(p)
}

fn data_volume_path(base_path: &Path, seq: u32) -> PathBuf {
    let mut p = base_path.as_os_str().to_owned();
    p.push(format!(".{seq}"));
    PathBuf::from(p)
}

fn open_for_read(path: &Path, context: &mut Option<ReadContext>) -> Result<File, DiscoverError> {
    match File::open(path) {
        Ok(f) => {
            context.get_or_insert_with(ReadContext::default);
            Ok(f)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(DiscoverError::Deleted { path: path.to_path_buf() })
        }
        Err(source) => Err(DiscoverError::TransientIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reads exactly one complete record from `file` at its current
/// position, using `probe` to decide completeness before committing to
/// the read (mirrors the file/stream-shared framing logic, §9).
fn read_one_record(file: &mut File, scratch: &mut Vec<u8>) -> Result<Option<(RecordType, usize)>, DiscoverError> {
    scratch.clear();
    scratch.resize(8, 0);
    let start = file.stream_position().map_err(|source| DiscoverError::TransientIo {
        path: PathBuf::new(),
        source,
    })?;
    let read = read_fill(file, scratch)?;
    if read < 8 {
        file.seek(SeekFrom::Start(start)).ok();
        return Ok(None);
    }
    match codec::probe(scratch) {
        Probe::NeedMore => {
            file.seek(SeekFrom::Start(start)).ok();
            Ok(None)
        }
        Probe::Malformed { reason } => Err(DiscoverError::Malformed {
            kind: "header",
            reason,
        }),
        Probe::NeedMoreBody { total_len } => {
            if scratch.capacity() < total_len {
                scratch.reserve(total_len - scratch.capacity() + SCRATCH_SLACK);
            }
            scratch.resize(total_len, 0);
            let body_read = read_fill(file, &mut scratch[8..])?;
            if body_read < total_len - 8 {
                file.seek(SeekFrom::Start(start)).ok();
                return Ok(None);
            }
            match codec::probe(scratch) {
                Probe::Complete { total_len, record_type } => Ok(Some((record_type, total_len))),
                _ => {
                    file.seek(SeekFrom::Start(start)).ok();
                    Ok(None)
                }
            }
        }
        Probe::Complete { total_len, record_type } => Ok(Some((record_type, total_len))),
    }
}

fn read_fill(file: &mut File, buf: &mut [u8]) -> Result<usize, DiscoverError> {
    let mut total = 0;
    loop {
        match file.read(&mut buf[total..]) {
            Ok(0) => return Ok(total),
            Ok(n) => {
                total += n;
                if total == buf.len() {
                    return Ok(total);
                }
            }
            Err(source) => {
                return Err(DiscoverError::TransientIo {
                    path: PathBuf::new(),
                    source,
                })
            }
        }
    }
}

/// Periodic sweep (§2, §4.4): purge marked entries, dispatch `on_closed`
/// exactly once per archive, after its last `on_values` (§8 property 7 —
/// guaranteed here because the purge only runs between change-event
/// callbacks, never concurrently with `run_data_step`).
pub fn purge_and_close(
    registry: &PathRegistry,
    dispatcher: &Dispatcher,
    events: &dyn DiscoverInternalEvents,
) {
    let freed = registry.purge_marked();
    if freed.is_empty() {
        return;
    }
    events.emit_purged(freed.len() as u64);
    for entry in freed {
        let header = header_for(&entry);
        dispatcher.dispatch_closed(&header);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Consumer;
    use crate::metrics::test_support::CountingEvents;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn descriptor_record(pmid: u32, name: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // metric_id
        body.extend_from_slice(&0u32.to_be_bytes()); // type
        body.extend_from_slice(&0u32.to_be_bytes()); // semantics
        body.extend_from_slice(&0u32.to_be_bytes()); // indom_id
        body.extend_from_slice(&0u32.to_be_bytes()); // units
        body.extend_from_slice(&pmid.to_be_bytes());
        body.extend_from_slice(&1i32.to_be_bytes());
        body.extend_from_slice(&(name.len() as i32).to_be_bytes());
        body.extend_from_slice(name.as_bytes());

        let total_len = 8 + body.len() + 4;
        let mut record = Vec::new();
        record.extend_from_slice(&(total_len as u32).to_be_bytes());
        record.extend_from_slice(&(RecordType::Desc as u32).to_be_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&(total_len as u32).to_be_bytes());
        record
    }

    struct Capture(AtomicUsize);
    impl Consumer for Capture {
        fn on_source(&self, _h: &EventHeader) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
        fn on_metric(&self, _h: &EventHeader, _d: &crate::codec::Descriptor) {
            self.0.fetch_add(1000, Ordering::Relaxed);
        }
    }

    fn entry_for(base_path: PathBuf) -> ArchiveEntry {
        ArchiveEntry {
            id: crate::registry::PathRegistry::new().insert_if_absent(&base_path, None),
            base_path,
            flags: EntryFlags::NEW | EntryFlags::META,
            last_modified_secs: 0,
            last_callback_secs: 0,
            context: None,
            source: None,
            owner_handle: None,
            meta_residue: bytes::BytesMut::new(),
            data_residue: bytes::BytesMut::new(),
        }
    }

    #[test]
    fn first_real_record_dispatches_metric_and_rewinds_on_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("archiveA");
        let meta_path = meta_file_path(&base);
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&meta_path)
            .unwrap();
        f.write_all(&descriptor_record(0x1002003, "acme.foo")).unwrap();
        drop(f);

        let mut entry = entry_for(base);
        let mut dispatcher = Dispatcher::new();
        let captured = Arc::new(Capture(AtomicUsize::new(0)));
        dispatcher.register(captured.clone());
        let events = CountingEvents::default();

        run_meta_step(&mut entry, &dispatcher, &events).unwrap();
        assert_eq!(events.metrics.load(Ordering::Relaxed), 1);
        assert!(!entry.flags.contains(EntryFlags::META_IN_PROGRESS));
        // on_source (+1) fires once for the new context, before on_metric
        // (+1000), even though this archive never sends a context-label.
        assert_eq!(captured.0.load(Ordering::Relaxed), 1001);

        // A second call against the unchanged file reads zero new
        // records but must not re-dispatch or error.
        run_meta_step(&mut entry, &dispatcher, &events).unwrap();
        assert_eq!(events.metrics.load(Ordering::Relaxed), 1);
        assert_eq!(captured.0.load(Ordering::Relaxed), 1001);
    }

    #[test]
    fn vanished_meta_file_marks_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("archiveB");
        let mut entry = entry_for(base);
        let dispatcher = Dispatcher::new();
        let events = CountingEvents::default();

        run_meta_step(&mut entry, &dispatcher, &events).unwrap();
        assert!(entry.is_deleted());
        assert_eq!(events.deleted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn state_of_reflects_flags_in_spec_precedence_order() {
        let mut entry = entry_for(PathBuf::from("/x/a"));
        assert_eq!(state_of(&entry), ReaderState::Fresh);

        entry.flags.remove(EntryFlags::NEW);
        assert_eq!(state_of(&entry), ReaderState::Idle);

        entry.flags.insert(EntryFlags::META_IN_PROGRESS);
        assert_eq!(state_of(&entry), ReaderState::Meta);

        entry.flags.remove(EntryFlags::META_IN_PROGRESS);
        entry.flags.insert(EntryFlags::DATAVOL_READY);
        assert_eq!(state_of(&entry), ReaderState::Data);

        entry.flags.insert(EntryFlags::DELETED);
        assert_eq!(state_of(&entry), ReaderState::Deleted);
    }
}
