//! Stateless decoders for the archive wire format (§4.1, §6.1).
//!
//! Every function here is pure with respect to the buffer it is given: no
//! I/O, no archive-entry state. The file reader (`reader`) and the stream
//! reader (`stream`) both drive the same `probe`/`decode_*` pair so that
//! "is this record complete?" is answered in exactly one place, per the
//! Design Notes' call to factor that logic out of both callers.

use bytes::{Buf, Bytes};
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::error::{DiscoverError, MalformedSnafu};
use snafu::ensure;

/// Defense against corrupted length fields; enforced at every length read.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

const HEADER_LEN: usize = 8; // u32 length + u32 type
const TRAILER_LEN: usize = 4; // trailing length mirror

/// Stable small integers for the four metadata record kinds plus the two
/// instance-domain variants, carried forward from the reference wire
/// format (§6.1). The retrieval pack did not surface the reference's own
/// numeric `#define`s, so these discriminants are assigned in the same
/// relative order the reference enumerates them; downstream consumers of
/// this crate only ever see the decoded `RecordType`, never the raw tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum RecordType {
    Desc = 1,
    Indom = 2,
    IndomV2 = 3,
    IndomDelta = 4,
    Label = 5,
    LabelV2 = 6,
    Text = 7,
    Result = 8,
}

impl RecordType {
    fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => Self::Desc,
            2 => Self::Indom,
            3 => Self::IndomV2,
            4 => Self::IndomDelta,
            5 => Self::Label,
            6 => Self::LabelV2,
            7 => Self::Text,
            8 => Self::Result,
            _ => return None,
        })
    }
}

/// Result of asking "does `buf` hold one complete record at its front?"
///
/// This is the `probe` operation the Design Notes call for: both the file
/// reader and the stream reader call it before attempting to decode, so
/// the short-read/rewind and residue-retention logic lives in one place.
#[derive(Debug)]
pub enum Probe {
    /// Not enough bytes yet for even the fixed header.
    NeedMore,
    /// Header present but the body hasn't fully arrived.
    NeedMoreBody { total_len: usize },
    /// A full record is available; `total_len` bytes starting at the
    /// front of `buf` form it.
    Complete { total_len: usize, record_type: RecordType },
    /// The header itself is self-inconsistent and can never be completed
    /// by more bytes (i.e. not merely short).
    Malformed { reason: String },
}

/// Probe the front of `buf` for a complete record without consuming it.
pub fn probe(buf: &[u8]) -> Probe {
    if buf.len() < HEADER_LEN {
        return Probe::NeedMore;
    }
    let mut cur = Cursor::new(buf);
    let total_len = cur.read_u32::<BigEndian>().expect("len checked") as usize;
    let tag = cur.read_u32::<BigEndian>().expect("len checked");

    if total_len > MAX_RECORD_LEN as usize {
        return Probe::Malformed {
            reason: format!("record length {total_len} exceeds {MAX_RECORD_LEN} byte maximum"),
        };
    }
    if total_len <= HEADER_LEN + TRAILER_LEN {
        return Probe::Malformed {
            reason: format!("record length {total_len} too small for header+trailer"),
        };
    }
    let Some(record_type) = RecordType::from_tag(tag) else {
        return Probe::Malformed {
            reason: format!("unknown record type tag {tag}"),
        };
    };
    if buf.len() < total_len {
        return Probe::NeedMoreBody { total_len };
    }
    Probe::Complete { total_len, record_type }
}

fn body_of(buf: &[u8], total_len: usize) -> &[u8] {
    &buf[HEADER_LEN..total_len - TRAILER_LEN]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricId {
    pub domain: u32,
    pub cluster: u32,
    pub item: u32,
}

#[derive(Debug, Clone)]
pub struct Descriptor {
    pub pmid: u32,
    pub metric_type: u32,
    pub semantics: u32,
    pub indom_id: u32,
    pub units: u32,
    pub names: Vec<String>,
}

/// `decode-descriptor`: returns `Ok(None)` on short buffer (need-more is
/// handled by `probe` before this is ever called in practice, but callers
/// that hand in a body slice directly still get the same signal).
pub fn decode_descriptor(body: &[u8]) -> Result<Descriptor, DiscoverError> {
    let mut cur = Cursor::new(body);
    let metric_id = read_u32(&mut cur, "descriptor.metric_id")?;
    let metric_type = read_u32(&mut cur, "descriptor.type")?;
    let semantics = read_u32(&mut cur, "descriptor.semantics")?;
    let indom_id = read_u32(&mut cur, "descriptor.indom_id")?;
    let units = read_u32(&mut cur, "descriptor.units")?;
    let pmid = read_u32(&mut cur, "descriptor.pmid")?;
    let name_count = read_i32(&mut cur, "descriptor.name_count")?;
    ensure!(
        name_count > 0,
        MalformedSnafu {
            kind: "descriptor",
            reason: format!("name count {name_count} <= 0"),
        }
    );
    let mut names = Vec::with_capacity(name_count as usize);
    for _ in 0..name_count {
        names.push(read_name(&mut cur, "descriptor.name")?);
    }
    let _ = metric_id; // metric-id is folded into pmid on the wire per §6.1
    Ok(Descriptor {
        pmid,
        metric_type,
        semantics,
        indom_id,
        units,
        names,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub enum IndomBody {
    /// Full membership (v3 or legacy v2, already normalised).
    Full { indom_id: u32, instances: Vec<Instance> },
    /// Additions (`name.is_some()`) and removals (`name.is_none()`).
    Delta { indom_id: u32, changes: Vec<Instance> },
}

#[derive(Debug, Clone)]
pub struct IndomRecord {
    pub timestamp: Timestamp,
    pub body: IndomBody,
}

/// `decode-indom`: `variant` distinguishes v3 full / legacy v2 / delta.
/// The v2 legacy layout decodes onto the same `IndomBody::Full` shape the
/// v3 layout produces (§12 of SPEC_FULL.md).
pub fn decode_indom(body: &[u8], variant: RecordType) -> Result<IndomRecord, DiscoverError> {
    let mut cur = Cursor::new(body);
    let sec = read_u64(&mut cur, "indom.sec")? as i64;
    let nsec = read_u32(&mut cur, "indom.nsec")?;
    let indom_id = read_u32(&mut cur, "indom.id")?;
    let count = read_i32(&mut cur, "indom.count")?;

    match variant {
        RecordType::Indom | RecordType::IndomV2 => {
            ensure!(
                count >= 0,
                MalformedSnafu {
                    kind: "indom",
                    reason: format!("negative instance count {count} in full indom"),
                }
            );
            let mut ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                ids.push(read_u32(&mut cur, "indom.instance_id")?);
            }
            let mut instances = Vec::with_capacity(count as usize);
            for id in ids {
                let name = read_name(&mut cur, "indom.instance_name")?;
                instances.push(Instance { id, name: Some(name) });
            }
            Ok(IndomRecord {
                timestamp: Timestamp { sec, nsec },
                body: IndomBody::Full { indom_id, instances },
            })
        }
        RecordType::IndomDelta => {
            let mut ids = Vec::with_capacity(count.unsigned_abs() as usize);
            for _ in 0..count.unsigned_abs() {
                ids.push(read_u32(&mut cur, "indom.delta.instance_id")?);
            }
            let mut changes = Vec::with_capacity(ids.len());
            for id in ids {
                let name_len = read_i32(&mut cur, "indom.delta.name_len")?;
                if name_len <= 0 {
                    // sentinel: removal of this instance-id
                    changes.push(Instance { id, name: None });
                } else {
                    ensure!(
                        (name_len as u32) <= MAX_RECORD_LEN,
                        MalformedSnafu {
                            kind: "indom",
                            reason: format!("instance name length {name_len} exceeds maximum"),
                        }
                    );
                    let mut buf = vec![0u8; name_len as usize];
                    read_exact(&mut cur, &mut buf, "indom.delta.instance_name")?;
                    let name = String::from_utf8_lossy(&buf).into_owned();
                    changes.push(Instance { id, name: Some(name) });
                }
            }
            Ok(IndomRecord {
                timestamp: Timestamp { sec, nsec },
                body: IndomBody::Delta { indom_id, changes },
            })
        }
        other => MalformedSnafu {
            kind: "indom",
            reason: format!("decode_indom called with non-indom variant {other:?}"),
        }
        .fail(),
    }
}

/// Per-archive, per-indom-id history needed by `undelta_indom`: an
/// ordered map from timestamp to the full membership observed at that
/// timestamp, searched for the nearest entry strictly before a delta's
/// own timestamp (`original_source/.../discover.c`'s `idp->next` — "the
/// one _before_ this (in time)").
#[derive(Debug, Default, Clone)]
pub struct IndomHistory {
    by_timestamp: BTreeMap<Timestamp, Vec<Instance>>,
    /// Set once a delta fails to find its base; cleared when the next
    /// full indom arrives for this id (Open Question 1's decision).
    poisoned: bool,
}

impl IndomHistory {
    pub fn record_full(&mut self, ts: Timestamp, instances: Vec<Instance>) {
        self.poisoned = false;
        self.by_timestamp.insert(ts, instances);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// `undelta-indom`: reconstruct a full membership by applying a delta to
/// the nearest full indom recorded strictly *before* the delta's own
/// timestamp for the same id. On any botch condition this returns `None`
/// (skip) and marks the chain poisoned, rather than guessing or aborting
/// the archive.
pub fn undelta_indom(
    history: &mut IndomHistory,
    ts: &Timestamp,
    changes: &[Instance],
) -> Option<Vec<Instance>> {
    if history.poisoned {
        return None;
    }
    let base = history
        .by_timestamp
        .range(..ts.clone())
        .next_back()
        .map(|(_, instances)| instances.clone());
    let Some(mut result) = base else {
        history.poisoned = true;
        return None;
    };
    for change in changes {
        match &change.name {
            Some(name) => {
                if result.iter().any(|i| i.id == change.id) {
                    // add duplicates a present instance: botch
                    history.poisoned = true;
                    return None;
                }
                result.push(Instance {
                    id: change.id,
                    name: Some(name.clone()),
                });
            }
            None => {
                let before = result.len();
                result.retain(|i| i.id != change.id);
                if result.len() == before {
                    // delete references an absent instance: botch
                    history.poisoned = true;
                    return None;
                }
            }
        }
    }
    history.by_timestamp.insert(ts.clone(), result.clone());
    Some(result)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TargetType {
    Context,
    Domain,
    Cluster,
    Item,
    Indom,
    Instances,
}

impl TargetType {
    fn from_wire(v: u32) -> Result<Self, DiscoverError> {
        Ok(match v {
            0 => Self::Context,
            1 => Self::Domain,
            2 => Self::Cluster,
            3 => Self::Item,
            4 => Self::Indom,
            5 => Self::Instances,
            other => {
                return MalformedSnafu {
                    kind: "labelset",
                    reason: format!("unknown target type {other}"),
                }
                .fail()
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct LabelSetRecord {
    pub timestamp: Timestamp,
    pub target_type: TargetType,
    pub target_id: u32,
    /// Raw JSON payloads, one per label-set; parsing is the consumer's
    /// responsibility (§3 "opaque payloads forwarded downstream").
    pub label_sets: Vec<Bytes>,
}

/// `decode-labelset`.
pub fn decode_labelset(body: &[u8]) -> Result<LabelSetRecord, DiscoverError> {
    let mut cur = Cursor::new(body);
    let sec = read_u64(&mut cur, "labelset.sec")? as i64;
    let nsec = read_u32(&mut cur, "labelset.nsec")?;
    let target_type = TargetType::from_wire(read_u32(&mut cur, "labelset.target_type")?)?;
    let target_id = read_u32(&mut cur, "labelset.target_id")?;
    let set_count = read_i32(&mut cur, "labelset.set_count")?;
    ensure!(
        set_count >= 0,
        MalformedSnafu {
            kind: "labelset",
            reason: format!("negative set count {set_count}"),
        }
    );
    let mut label_sets = Vec::with_capacity(set_count as usize);
    for _ in 0..set_count {
        let json_len = read_i32(&mut cur, "labelset.json_len")?;
        ensure!(
            json_len > 0 && (json_len as u32) <= MAX_RECORD_LEN,
            MalformedSnafu {
                kind: "labelset",
                reason: format!("json length {json_len} out of range"),
            }
        );
        let mut buf = vec![0u8; json_len as usize];
        read_exact(&mut cur, &mut buf, "labelset.json")?;
        label_sets.push(Bytes::from(buf));
    }
    Ok(LabelSetRecord {
        timestamp: Timestamp { sec, nsec },
        target_type,
        target_id,
        label_sets,
    })
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HelpTextKind {
    OneLineMetric,
    FullMetric,
    OneLineIndom,
    FullIndom,
}

#[derive(Debug, Clone)]
pub struct TextRecord {
    pub kind: HelpTextKind,
    pub id: u32,
    pub text: String,
}

/// `decode-text`. The only documented failure mode is OOM on the scratch
/// allocation; a genuinely truncated buffer is a `probe`-level `NeedMore`
/// and never reaches here.
pub fn decode_text(body: &[u8]) -> Result<TextRecord, DiscoverError> {
    let mut cur = Cursor::new(body);
    let kind = match read_u32(&mut cur, "text.type")? {
        0 => HelpTextKind::OneLineMetric,
        1 => HelpTextKind::FullMetric,
        2 => HelpTextKind::OneLineIndom,
        3 => HelpTextKind::FullIndom,
        other => {
            return MalformedSnafu {
                kind: "text",
                reason: format!("unknown help-text type {other}"),
            }
            .fail()
        }
    };
    let id = read_u32(&mut cur, "text.id")?;
    let remaining = &body[cur.position() as usize..];
    let text = remaining
        .split(|&b| b == 0)
        .next()
        .unwrap_or(remaining);
    Ok(TextRecord {
        kind,
        id,
        text: String::from_utf8_lossy(text).into_owned(),
    })
}

#[derive(Debug, Clone)]
pub struct ValueSample {
    pub pmid: u32,
    /// Opaque per-instance values; the core never interprets these
    /// (§1 non-goal: no semantic interpretation of metric values).
    pub raw: Bytes,
}

#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub timestamp: Timestamp,
    pub samples: Vec<ValueSample>,
    /// A zero-`numpmid` result is a legitimate "mark" (gap) record.
    pub is_mark: bool,
}

/// `decode-result`. The opaque per-sample payload is sliced out without
/// interpreting `valfmt`/`numval` beyond what's needed to find its end,
/// matching §1's explicit non-goal on semantic interpretation of values.
pub fn decode_result(body: &[u8]) -> Result<ResultRecord, DiscoverError> {
    let mut cur = Cursor::new(body);
    let _self_len = read_u32(&mut cur, "result.length")?;
    let _type = read_u32(&mut cur, "result.type")?;
    let _from = read_u32(&mut cur, "result.from")?;
    let sec = read_i32(&mut cur, "result.sec")? as i64;
    let usec = read_u32(&mut cur, "result.usec")?;
    let numpmid = read_i32(&mut cur, "result.numpmid")?;
    ensure!(
        numpmid >= 0,
        MalformedSnafu {
            kind: "result",
            reason: format!("negative numpmid {numpmid}"),
        }
    );
    if numpmid == 0 {
        return Ok(ResultRecord {
            // §9 Open Question 3: on-disk sec/usec widens to in-memory
            // sec/nsec with an implicit x1000; precision loss on very
            // old archives is accepted, not compensated.
            timestamp: Timestamp {
                sec,
                nsec: usec.saturating_mul(1000),
            },
            samples: Vec::new(),
            is_mark: true,
        });
    }
    let mut samples = Vec::with_capacity(numpmid as usize);
    for _ in 0..numpmid {
        let pmid = read_u32(&mut cur, "result.pmid")?;
        let numval = read_i32(&mut cur, "result.numval")?;
        let valfmt = read_u32(&mut cur, "result.valfmt")?;
        let numval_abs = numval.max(0) as usize;
        // each (inst, value) pair: inst is u32; value width depends on
        // valfmt, but since values are opaque we only need to skip past
        // them, and the wire always pads to a u32-aligned slot per value.
        let raw_start = cur.position() as usize;
        let per_value = 8usize; // inst(u32) + value(u32-sized slot)
        let consume = numval_abs * per_value;
        ensure!(
            raw_start + consume <= body.len(),
            MalformedSnafu {
                kind: "result",
                reason: "value payload runs past record body".to_string(),
            }
        );
        let raw = Bytes::copy_from_slice(&body[raw_start..raw_start + consume]);
        cur.advance(consume);
        let _ = valfmt;
        samples.push(ValueSample { pmid, raw });
    }
    Ok(ResultRecord {
        timestamp: Timestamp {
            sec,
            nsec: usec.saturating_mul(1000),
        },
        samples,
        is_mark: false,
    })
}

fn read_u32(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<u32, DiscoverError> {
    cur.read_u32::<BigEndian>()
        .map_err(|_| short_read(field))
}

fn read_i32(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<i32, DiscoverError> {
    cur.read_i32::<BigEndian>()
        .map_err(|_| short_read(field))
}

fn read_u64(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<u64, DiscoverError> {
    cur.read_u64::<BigEndian>()
        .map_err(|_| short_read(field))
}

fn read_exact(cur: &mut Cursor<&[u8]>, buf: &mut [u8], field: &'static str) -> Result<(), DiscoverError> {
    std::io::Read::read_exact(cur, buf).map_err(|_| short_read(field))
}

fn read_name(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, DiscoverError> {
    let len = read_i32(cur, field)?;
    if len <= 0 {
        return MalformedSnafu {
            kind: "name",
            reason: format!("{field} length {len} <= 0"),
        }
        .fail();
    }
    ensure!(
        (len as u32) <= MAX_RECORD_LEN,
        MalformedSnafu {
            kind: "name",
            reason: format!("{field} length {len} exceeds maximum"),
        }
    );
    let mut buf = vec![0u8; len as usize];
    read_exact(cur, &mut buf, field)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Malformed wrapper for a field that ran out of buffer mid-read. A
/// genuinely short buffer is meant to be caught by `probe` first; this
/// only fires if a caller decodes a body slice it already miscounted.
fn short_read(field: &'static str) -> DiscoverError {
    DiscoverError::Malformed {
        kind: "field",
        reason: format!("buffer exhausted reading {field}"),
    }
}

/// Convenience used by both readers: given a buffer known (via `probe`)
/// to hold a complete record, split it into `(record_type, body)`.
pub fn split_record(buf: &[u8], total_len: usize, record_type: RecordType) -> (RecordType, &[u8]) {
    (record_type, body_of(buf, total_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn frame(record_type: RecordType, body: &[u8]) -> Vec<u8> {
        let total_len = HEADER_LEN + body.len() + TRAILER_LEN;
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(record_type as u32).to_be_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out
    }

    fn descriptor_body(pmid: u32, indom_id: u32, names: &[&str]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // metric_id (unused folded field)
        body.extend_from_slice(&3u32.to_be_bytes()); // type (e.g. u32)
        body.extend_from_slice(&1u32.to_be_bytes()); // semantics
        body.extend_from_slice(&indom_id.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // units
        body.extend_from_slice(&pmid.to_be_bytes());
        body.extend_from_slice(&(names.len() as i32).to_be_bytes());
        for name in names {
            body.extend_from_slice(&(name.len() as i32).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
        }
        body
    }

    #[test]
    fn probe_reports_need_more_for_short_header_and_short_body() {
        assert!(matches!(probe(&[0u8; 4]), Probe::NeedMore));
        let full = frame(RecordType::Text, b"ignored");
        assert!(matches!(
            probe(&full[..full.len() - 1]),
            Probe::NeedMoreBody { .. }
        ));
        assert!(matches!(probe(&full), Probe::Complete { .. }));
    }

    #[test]
    fn probe_rejects_unknown_type_and_too_small_length() {
        let mut too_small = Vec::new();
        too_small.extend_from_slice(&8u32.to_be_bytes());
        too_small.extend_from_slice(&1u32.to_be_bytes());
        assert!(matches!(probe(&too_small), Probe::Malformed { .. }));

        let mut bad_tag = Vec::new();
        bad_tag.extend_from_slice(&20u32.to_be_bytes());
        bad_tag.extend_from_slice(&999u32.to_be_bytes());
        bad_tag.extend_from_slice(&[0u8; 8]);
        assert!(matches!(probe(&bad_tag), Probe::Malformed { .. }));
    }

    #[test]
    fn probe_accepts_record_exactly_at_max_len_and_rejects_one_more() {
        let at_limit = MAX_RECORD_LEN as usize;
        let mut buf = vec![0u8; at_limit];
        buf[..4].copy_from_slice(&(at_limit as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&(RecordType::Text as u32).to_be_bytes());
        assert!(matches!(probe(&buf), Probe::Complete { .. }));

        let mut over_limit = vec![0u8; 8];
        over_limit[..4].copy_from_slice(&((at_limit + 1) as u32).to_be_bytes());
        over_limit[4..8].copy_from_slice(&(RecordType::Text as u32).to_be_bytes());
        assert!(matches!(probe(&over_limit), Probe::Malformed { .. }));
    }

    #[test]
    fn decode_descriptor_round_trips_names() {
        let body = descriptor_body(0x1002003, 7, &["acme.foo", "acme.bar"]);
        let framed = frame(RecordType::Desc, &body);
        let Probe::Complete { total_len, record_type } = probe(&framed) else {
            panic!("expected complete probe");
        };
        let (_, decoded_body) = split_record(&framed, total_len, record_type);
        let descriptor = decode_descriptor(decoded_body).unwrap();
        assert_eq!(descriptor.pmid, 0x1002003);
        assert_eq!(descriptor.indom_id, 7);
        assert_eq!(descriptor.names, vec!["acme.foo", "acme.bar"]);
    }

    #[test]
    fn decode_descriptor_rejects_non_positive_name_count() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0u8; 20]); // metric_id..units
        body.extend_from_slice(&0u32.to_be_bytes()); // pmid
        body.extend_from_slice(&0i32.to_be_bytes()); // name_count == 0
        let err = decode_descriptor(&body).unwrap_err();
        assert!(matches!(err, DiscoverError::Malformed { .. }));
    }

    fn full_indom_body(sec: u64, nsec: u32, indom_id: u32, instances: &[(u32, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&sec.to_be_bytes());
        body.extend_from_slice(&nsec.to_be_bytes());
        body.extend_from_slice(&indom_id.to_be_bytes());
        body.extend_from_slice(&(instances.len() as i32).to_be_bytes());
        for (id, _) in instances {
            body.extend_from_slice(&id.to_be_bytes());
        }
        for (_, name) in instances {
            body.extend_from_slice(&(name.len() as i32).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
        }
        body
    }

    #[test]
    fn decode_indom_full_round_trips_membership() {
        let body = full_indom_body(1_700_000_000, 0, 60, &[(1, "a"), (2, "b")]);
        let record = decode_indom(&body, RecordType::Indom).unwrap();
        match record.body {
            IndomBody::Full { indom_id, instances } => {
                assert_eq!(indom_id, 60);
                assert_eq!(instances.len(), 2);
                assert_eq!(instances[0].id, 1);
                assert_eq!(instances[0].name.as_deref(), Some("a"));
            }
            _ => panic!("expected full indom"),
        }
    }

    fn delta_indom_body(sec: u64, indom_id: u32, adds: &[(u32, &str)], removes: &[u32]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&sec.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&indom_id.to_be_bytes());
        let count = (adds.len() + removes.len()) as i32;
        body.extend_from_slice(&count.to_be_bytes());
        for (id, _) in adds {
            body.extend_from_slice(&id.to_be_bytes());
        }
        for id in removes {
            body.extend_from_slice(&id.to_be_bytes());
        }
        for (_, name) in adds {
            body.extend_from_slice(&(name.len() as i32).to_be_bytes());
            body.extend_from_slice(name.as_bytes());
        }
        for _ in removes {
            body.extend_from_slice(&0i32.to_be_bytes()); // sentinel: removal
        }
        body
    }

    #[test]
    fn undelta_reconstructs_additions_and_removals() {
        // `undelta_indom` matches its base against the nearest indom
        // recorded strictly *before* the delta's own timestamp, so a
        // full at T0 followed by a delta at a later T1 must still
        // resolve — exactly the §8 scenario-3 shape, T0 != T1.
        let mut history = IndomHistory::default();
        let t0 = Timestamp { sec: 100, nsec: 0 };
        let t1 = Timestamp { sec: 101, nsec: 0 };
        history.record_full(t0, vec![
            Instance { id: 1, name: Some("a".into()) },
            Instance { id: 2, name: Some("b".into()) },
        ]);

        let delta_body = delta_indom_body(101, 60, &[(3, "c")], &[1]);
        let record = decode_indom(&delta_body, RecordType::IndomDelta).unwrap();
        let IndomBody::Delta { changes, .. } = record.body else {
            panic!("expected delta");
        };
        let result = undelta_indom(&mut history, &t1, &changes).unwrap();
        let ids: Vec<u32> = result.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(!history.is_poisoned());
    }

    #[test]
    fn undelta_botches_on_missing_base_and_poisons_chain() {
        let mut history = IndomHistory::default();
        let t0 = Timestamp { sec: 5, nsec: 0 };
        let t1 = Timestamp { sec: 6, nsec: 0 };
        let changes = vec![Instance { id: 1, name: Some("a".into()) }];
        assert!(undelta_indom(&mut history, &t1, &changes).is_none());
        assert!(history.is_poisoned());

        // subsequent deltas stay dropped until the next full indom.
        assert!(undelta_indom(&mut history, &t1, &changes).is_none());
        history.record_full(t0, vec![]);
        assert!(!history.is_poisoned());
    }

    #[test]
    fn undelta_botches_on_delete_of_absent_instance() {
        let mut history = IndomHistory::default();
        let t0 = Timestamp { sec: 5, nsec: 0 };
        let t1 = Timestamp { sec: 6, nsec: 0 };
        history.record_full(t0, vec![Instance { id: 1, name: Some("a".into()) }]);
        let changes = vec![Instance { id: 99, name: None }];
        assert!(undelta_indom(&mut history, &t1, &changes).is_none());
        assert!(history.is_poisoned());
    }

    #[test]
    fn undelta_botches_on_add_of_present_instance() {
        let mut history = IndomHistory::default();
        let t0 = Timestamp { sec: 5, nsec: 0 };
        let t1 = Timestamp { sec: 6, nsec: 0 };
        history.record_full(t0, vec![Instance { id: 1, name: Some("a".into()) }]);
        let changes = vec![Instance { id: 1, name: Some("dup".into()) }];
        assert!(undelta_indom(&mut history, &t1, &changes).is_none());
        assert!(history.is_poisoned());
    }

    #[test]
    fn decode_labelset_round_trips_json_payloads() {
        let mut body = Vec::new();
        body.extend_from_slice(&1_700_000_000u64.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes()); // target_type: Context
        body.extend_from_slice(&42u32.to_be_bytes()); // target_id
        body.extend_from_slice(&1i32.to_be_bytes()); // set_count
        let json = br#"{"host":"x"}"#;
        body.extend_from_slice(&(json.len() as i32).to_be_bytes());
        body.extend_from_slice(json);

        let record = decode_labelset(&body).unwrap();
        assert_eq!(record.target_type, TargetType::Context);
        assert_eq!(record.target_id, 42);
        assert_eq!(record.label_sets.len(), 1);
        assert_eq!(&record.label_sets[0][..], json);
    }

    #[test]
    fn decode_text_stops_at_nul_terminator() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_be_bytes()); // FullMetric
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(b"hello world\0trailing garbage");
        let record = decode_text(&body).unwrap();
        assert_eq!(record.kind, HelpTextKind::FullMetric);
        assert_eq!(record.id, 7);
        assert_eq!(record.text, "hello world");
    }

    fn result_body(sec: i32, usec: u32, samples: &[(u32, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes()); // self length (unused)
        body.extend_from_slice(&0u32.to_be_bytes()); // type
        body.extend_from_slice(&0u32.to_be_bytes()); // from
        body.extend_from_slice(&sec.to_be_bytes());
        body.extend_from_slice(&usec.to_be_bytes());
        body.extend_from_slice(&(samples.len() as i32).to_be_bytes());
        for (pmid, inst) in samples {
            body.extend_from_slice(&pmid.to_be_bytes());
            body.extend_from_slice(&1i32.to_be_bytes()); // numval
            body.extend_from_slice(&0u32.to_be_bytes()); // valfmt
            body.extend_from_slice(&inst.to_be_bytes());
            body.extend_from_slice(&0u32.to_be_bytes()); // opaque value slot
        }
        body
    }

    #[test]
    fn decode_result_round_trips_samples_and_widens_timestamp() {
        let body = result_body(1_700_000_000, 500_000, &[(10, 0), (11, 1)]);
        let record = decode_result(&body).unwrap();
        assert!(!record.is_mark);
        assert_eq!(record.samples.len(), 2);
        assert_eq!(record.samples[0].pmid, 10);
        assert_eq!(record.timestamp.sec, 1_700_000_000);
        assert_eq!(record.timestamp.nsec, 500_000_000);
    }

    #[test]
    fn decode_result_zero_numpmid_is_a_mark_not_an_error() {
        let body = result_body(1_700_000_001, 0, &[]);
        let record = decode_result(&body).unwrap();
        assert!(record.is_mark);
        assert_eq!(record.samples.len(), 0);
    }
}
