//! The error taxonomy from spec §7.
//!
//! Every fallible engine operation returns one of these kinds rather than
//! panicking or bubbling up an opaque `io::Error`. Most are handled locally
//! (see the policy column in §7) and never reach a caller; the ones that do
//! are collected here so callers can match on them.

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DiscoverError {
    /// The codec was handed fewer bytes than a complete record requires.
    /// Recovered locally (rewind or retain residue); never surfaced past
    /// the reader/stream layer.
    #[snafu(display("need {more} more byte(s) to complete record"))]
    NeedMore { more: usize },

    /// A record's declared length or header fields are inconsistent with
    /// the data that follows.
    #[snafu(display("malformed {kind} record: {reason}"))]
    Malformed { kind: &'static str, reason: String },

    /// Transient I/O while the archive is mid-rotation; the next change
    /// event will retry.
    #[snafu(display("transient I/O on {}: {source}", path.display()))]
    TransientIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The meta-file has vanished; the entry should be marked `DELETED`.
    #[snafu(display("archive meta file vanished: {}", path.display()))]
    Deleted { path: PathBuf },

    /// A stream push arrived before the corresponding context/label was
    /// established.
    #[snafu(display("stream push for unlabeled archive: {}", path.display()))]
    NoContext { path: PathBuf },

    /// A record names an excluded metric or instance domain id; dropped
    /// silently by the dispatcher.
    #[snafu(display("excluded id {id}"))]
    Exclusion { id: u32 },

    /// A registered callback returned a negative/error result.
    #[snafu(display("consumer callback failed for handle {handle}"))]
    Consumer { handle: u64 },

    /// Unrecoverable for the affected archive only: OOM growing a scratch
    /// buffer, or a duplicate context created mid stream-label. The archive
    /// is unlinked from the registry; other archives are unaffected.
    #[snafu(display("fatal error for archive {}: {reason}", path.display()))]
    Fatal { path: PathBuf, reason: String },
}

pub type Result<T, E = DiscoverError> = std::result::Result<T, E>;
