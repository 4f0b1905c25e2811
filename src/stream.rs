//! The Stream Reader (§4.5): ingest pushed buffers rather than reading
//! from disk, feeding the same decoder pipeline as the file-based
//! Archive Reader.
//!
//! Grounded on `file-source-common::buffer::read_until_with_max_size`'s
//! framing shape (accumulate into a buffer, parse what's complete,
//! retain the unparsed suffix) even though that buffer is
//! delimiter-framed and this one is length-prefixed — the "retain
//! exactly the unparsed suffix" discipline is the part carried over.

use bytes::BytesMut;

use crate::codec::{self, IndomBody, Probe, RecordType};
use crate::dispatch::{Dispatcher, EventHeader};
use crate::error::DiscoverError;
use crate::metrics::DiscoverInternalEvents;
use crate::registry::{ArchiveEntry, EntryFlags, ReadContext, SourceIdentity};

/// Push bytes into an archive's meta-residue buffer and parse/dispatch
/// every complete record now available (§4.5).
pub fn push_meta(
    entry: &mut ArchiveEntry,
    bytes: &[u8],
    dispatcher: &Dispatcher,
    events: &dyn DiscoverInternalEvents,
) -> Result<(), DiscoverError> {
    if entry.is_deleted() {
        return Err(DiscoverError::Deleted {
            path: entry.base_path.clone(),
        });
    }
    entry.meta_residue.extend_from_slice(bytes);
    events.emit_metadata_streaming(bytes.len());
    entry.context.get_or_insert_with(ReadContext::default);

    loop {
        match codec::probe(&entry.meta_residue) {
            Probe::NeedMore => break,
            Probe::NeedMoreBody { .. } => break,
            Probe::Malformed { reason } => {
                // §4.5: malformed headers are fatal for this stream.
                return Err(DiscoverError::Fatal {
                    path: entry.base_path.clone(),
                    reason,
                });
            }
            Probe::Complete { total_len, record_type } => {
                if total_len as u32 > codec::MAX_RECORD_LEN {
                    return Err(DiscoverError::Fatal {
                        path: entry.base_path.clone(),
                        reason: format!("record length {total_len} exceeds per-push maximum"),
                    });
                }
                let record = entry.meta_residue.split_to(total_len);
                let body = &record[8..total_len - 4];
                if let Err(e) = dispatch_meta_record(entry, record_type, body, dispatcher, events) {
                    events.emit_malformed_record(&entry.base_path, "meta-stream", &e.to_string());
                }
            }
        }
    }
    Ok(())
}

/// Push bytes into an archive's data-residue buffer (§4.5).
pub fn push_data(
    entry: &mut ArchiveEntry,
    bytes: &[u8],
    dispatcher: &Dispatcher,
    events: &dyn DiscoverInternalEvents,
) -> Result<(), DiscoverError> {
    if entry.is_deleted() {
        return Err(DiscoverError::Deleted {
            path: entry.base_path.clone(),
        });
    }
    entry.data_residue.extend_from_slice(bytes);
    events.emit_logvol_streaming(bytes.len());

    loop {
        match codec::probe(&entry.data_residue) {
            Probe::NeedMore | Probe::NeedMoreBody { .. } => break,
            Probe::Malformed { reason } => {
                return Err(DiscoverError::Fatal {
                    path: entry.base_path.clone(),
                    reason,
                });
            }
            Probe::Complete { total_len, record_type } => {
                if total_len as u32 > codec::MAX_RECORD_LEN {
                    return Err(DiscoverError::Fatal {
                        path: entry.base_path.clone(),
                        reason: format!("record length {total_len} exceeds per-push maximum"),
                    });
                }
                let record = entry.data_residue.split_to(total_len);
                if record_type != RecordType::Result {
                    continue;
                }
                let body = &record[8..total_len - 4];
                match codec::decode_result(body) {
                    Ok(result) => {
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
                    Err(e) => events.emit_logvol_decode_result_error(&e.to_string()),
                }
            }
        }
    }
    Ok(())
}

/// `stream_end(path)`: explicit close. The caller is expected to then
/// remove the entry from the registry (mirrors `delete` + `purge` but
/// immediate rather than deferred, since a stream source knows it is
/// done rather than being discovered absent).
pub fn stream_end(entry: &mut ArchiveEntry, dispatcher: &Dispatcher) {
    entry.flags.insert(EntryFlags::DELETED);
    let header = EventHeader {
        timestamp: crate::codec::Timestamp { sec: entry.last_modified_secs, nsec: 0 },
        source: entry.source.clone().unwrap_or_default(),
        module_handle: entry.owner_handle.unwrap_or(0),
    };
    dispatcher.dispatch_closed(&header);
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
                }
            }
        }
        RecordType::Label | RecordType::LabelV2 => {
            let record = codec::decode_labelset(body)?;
            events.emit_metadata_decode_label();
            let header = header_for(entry);
            let outcome = dispatcher.dispatch_labels(
                &header,
                record.target_type,
                record.target_id,
                &record.label_sets,
            );
            let _ = outcome;
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
        RecordType::Result => {}
    }
    Ok(())
}

fn recompute_source_identity(entry: &mut ArchiveEntry, dispatcher: &Dispatcher) {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    entry.base_path.hash(&mut hasher);
    let new_identity = SourceIdentity {
        hash: hasher.finish(),
        hostname: entry.source.as_ref().map(|s| s.hostname.clone()).unwrap_or_default(),
    };
    entry.source = Some(new_identity);
    let header = header_for(entry);
    dispatcher.dispatch_source(&header);
}

fn header_for(entry: &ArchiveEntry) -> EventHeader {
    EventHeader {
        timestamp: crate::codec::Timestamp { sec: entry.last_modified_secs, nsec: 0 },
        source: entry.source.clone().unwrap_or_default(),
        module_handle: entry.owner_handle.unwrap_or(0),
    }
}

/// Current residue length, exposed for the §8 invariant check ("residue
/// length < the largest still-incomplete record header").
pub fn meta_residue_len(entry: &ArchiveEntry) -> usize {
    entry.meta_residue.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Consumer, Dispatcher};
    use crate::metrics::test_support::CountingEvents;
    use crate::registry::{ArchiveEntry, EntryFlags};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fresh_entry() -> ArchiveEntry {
        ArchiveEntry {
            id: crate::registry::PathRegistry::new().insert_if_absent(&PathBuf::from("/x/a"), None),
            base_path: PathBuf::from("/x/a"),
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

    fn descriptor_record() -> Vec<u8> {
        // length(u32) type(u32) metric_id cluster... name_count name
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes()); // metric_id (unused)
        body.extend_from_slice(&0u32.to_be_bytes()); // type
        body.extend_from_slice(&0u32.to_be_bytes()); // semantics
        body.extend_from_slice(&0u32.to_be_bytes()); // indom_id
        body.extend_from_slice(&0u32.to_be_bytes()); // units
        body.extend_from_slice(&0x1002003u32.to_be_bytes()); // pmid
        body.extend_from_slice(&1i32.to_be_bytes()); // name_count
        let name = b"acme.foo";
        body.extend_from_slice(&(name.len() as i32).to_be_bytes());
        body.extend_from_slice(name);

        let total_len = 8 + body.len() + 4;
        let mut record = Vec::new();
        record.extend_from_slice(&(total_len as u32).to_be_bytes());
        record.extend_from_slice(&1u32.to_be_bytes()); // RecordType::Desc
        record.extend_from_slice(&body);
        record.extend_from_slice(&(total_len as u32).to_be_bytes());
        record
    }

    struct Capture(AtomicUsize);
    impl Consumer for Capture {
        fn on_metric(&self, _h: &EventHeader, _d: &crate::codec::Descriptor) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn partial_push_then_completion_dispatches_once() {
        let mut entry = fresh_entry();
        let mut dispatcher = Dispatcher::new();
        let captured = Arc::new(Capture(AtomicUsize::new(0)));
        dispatcher.register(captured.clone());
        let events = CountingEvents::default();

        let full = descriptor_record();
        push_meta(&mut entry, &full[..6], &dispatcher, &events).unwrap();
        assert_eq!(meta_residue_len(&entry), 6);
        assert_eq!(captured.0.load(Ordering::Relaxed), 0);

        push_meta(&mut entry, &full[6..], &dispatcher, &events).unwrap();
        assert_eq!(meta_residue_len(&entry), 0);
        assert_eq!(captured.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn malformed_header_is_fatal_for_stream() {
        let mut entry = fresh_entry();
        let dispatcher = Dispatcher::new();
        let events = CountingEvents::default();
        // length smaller than header+trailer: always malformed.
        let bogus = [0u8, 0, 0, 4, 0, 0, 0, 1];
        let result = push_meta(&mut entry, &bogus, &dispatcher, &events);
        assert!(matches!(result, Err(DiscoverError::Fatal { .. })));
    }
}
