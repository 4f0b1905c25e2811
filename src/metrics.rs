//! Observability counters and gauges (§6.5), fronted by a trait so tests
//! can substitute a stub the way `file-source-common`'s test module
//! provides a `NoErrors` implementation of `FileSourceInternalEvents`.

use std::path::Path;

use metrics::{counter, gauge};

/// One method per loggable/countable event in §6.5, mirroring
/// `file-source`'s `FileSourceInternalEvents` shape. The default
/// implementation (`Telemetry`) logs via `tracing` and records via
/// `metrics`; anything implementing this trait can be substituted,
/// e.g. in tests.
pub trait DiscoverInternalEvents: Send + Sync + 'static {
    fn monitored_gauge(&self, count: u64);
    fn emit_purged(&self, count: u64);
    fn emit_throttle_window(&self, secs: u64);
    fn emit_throttled_changed_callback(&self, path: &Path);
    fn emit_changed_callback(&self, path: &Path);

    fn emit_metadata_callback(&self, path: &Path);
    fn emit_metadata_loop(&self, path: &Path);
    fn emit_metadata_partial_read(&self, path: &Path);
    fn emit_metadata_decode_desc(&self);
    fn emit_metadata_decode_indom(&self);
    fn emit_metadata_decode_label(&self);
    fn emit_metadata_decode_helptext(&self);
    fn emit_metadata_streaming(&self, bytes: usize);

    fn emit_logvol_callback(&self, path: &Path);
    fn emit_logvol_loop(&self, path: &Path);
    fn emit_logvol_change_vol(&self, path: &Path, new_seq: u32);
    fn emit_logvol_new_context(&self, path: &Path);
    fn emit_logvol_get_archive_end_failed(&self, path: &Path, error: &str);
    fn emit_logvol_decode_result(&self);
    fn emit_logvol_decode_result_pmids(&self, count: usize);
    fn emit_logvol_decode_mark_record(&self);
    fn emit_logvol_decode_result_error(&self, error: &str);
    fn emit_logvol_streaming(&self, bytes: usize);

    fn emit_malformed_record(&self, path: &Path, kind: &str, reason: &str);
    fn emit_archive_deleted(&self, path: &Path);
    fn emit_consumer_error(&self, handle: u64);
}

/// Default sink: `tracing` for logs, `metrics` for counters/gauges, the
/// same pairing `ifile-source`'s `file_server.rs`/`file_watcher` use.
#[derive(Debug, Default, Clone, Copy)]
pub struct Telemetry;

impl DiscoverInternalEvents for Telemetry {
    fn monitored_gauge(&self, count: u64) {
        gauge!("monitored").set(count as f64);
    }

    fn emit_purged(&self, count: u64) {
        counter!("purged").increment(count);
    }

    fn emit_throttle_window(&self, secs: u64) {
        gauge!("throttle").set(secs as f64);
    }

    fn emit_throttled_changed_callback(&self, path: &Path) {
        tracing::debug!(?path, "change callback throttled");
        counter!("throttled_changed_callbacks").increment(1);
    }

    fn emit_changed_callback(&self, path: &Path) {
        tracing::trace!(?path, "change callback");
        counter!("changed_callbacks").increment(1);
    }

    fn emit_metadata_callback(&self, path: &Path) {
        tracing::trace!(?path, "metadata callback");
        counter!("metadata.callbacks").increment(1);
    }

    fn emit_metadata_loop(&self, path: &Path) {
        counter!("metadata.loops").increment(1);
        let _ = path;
    }

    fn emit_metadata_partial_read(&self, path: &Path) {
        tracing::debug!(?path, "metadata short read, rewinding");
        counter!("metadata.partial_reads").increment(1);
    }

    fn emit_metadata_decode_desc(&self) {
        counter!("metadata.decode.desc").increment(1);
    }

    fn emit_metadata_decode_indom(&self) {
        counter!("metadata.decode.indom").increment(1);
    }

    fn emit_metadata_decode_label(&self) {
        counter!("metadata.decode.label").increment(1);
    }

    fn emit_metadata_decode_helptext(&self) {
        counter!("metadata.decode.helptext").increment(1);
    }

    fn emit_metadata_streaming(&self, bytes: usize) {
        counter!("metadata.streaming").increment(bytes as u64);
    }

    fn emit_logvol_callback(&self, path: &Path) {
        tracing::trace!(?path, "logvol callback");
        counter!("logvol.callbacks").increment(1);
    }

    fn emit_logvol_loop(&self, path: &Path) {
        counter!("logvol.loops").increment(1);
        let _ = path;
    }

    fn emit_logvol_change_vol(&self, path: &Path, new_seq: u32) {
        tracing::debug!(?path, new_seq, "switching to next data volume");
        counter!("logvol.change_vol").increment(1);
    }

    fn emit_logvol_new_context(&self, path: &Path) {
        tracing::debug!(?path, "new read context established");
        counter!("logvol.new_contexts").increment(1);
    }

    fn emit_logvol_get_archive_end_failed(&self, path: &Path, error: &str) {
        tracing::warn!(?path, %error, "failed to determine archive end");
        counter!("logvol.get_archive_end_failed").increment(1);
    }

    fn emit_logvol_decode_result(&self) {
        counter!("logvol.decode.result").increment(1);
    }

    fn emit_logvol_decode_result_pmids(&self, count: usize) {
        counter!("logvol.decode.result_pmids").increment(count as u64);
    }

    fn emit_logvol_decode_mark_record(&self) {
        counter!("logvol.decode.mark_record").increment(1);
    }

    fn emit_logvol_decode_result_error(&self, error: &str) {
        tracing::warn!(%error, "result decode error");
        counter!("logvol.decode.result_errors").increment(1);
    }

    fn emit_logvol_streaming(&self, bytes: usize) {
        counter!("logvol.streaming").increment(bytes as u64);
    }

    fn emit_malformed_record(&self, path: &Path, kind: &str, reason: &str) {
        tracing::warn!(?path, kind, reason, "malformed record, skipping");
    }

    fn emit_archive_deleted(&self, path: &Path) {
        tracing::info!(?path, "archive meta file vanished, marking deleted");
    }

    fn emit_consumer_error(&self, handle: u64) {
        tracing::warn!(handle, "consumer callback returned an error");
        counter!("consumer_errors").increment(1);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts only the events tests assert on; everything else is a
    /// no-op, matching the shape of `file-source-common`'s `NoErrors`
    /// stub (it documents intent by what it overrides, not by
    /// implementing every method meaningfully).
    #[derive(Debug, Default)]
    pub struct CountingEvents {
        pub metrics: AtomicU64,
        pub indoms: AtomicU64,
        pub malformed: AtomicU64,
        pub deleted: AtomicU64,
        pub purged: AtomicU64,
        pub throttled: AtomicU64,
    }

    impl DiscoverInternalEvents for CountingEvents {
        fn monitored_gauge(&self, _count: u64) {}
        fn emit_purged(&self, count: u64) {
            self.purged.fetch_add(count, Ordering::Relaxed);
        }
        fn emit_throttle_window(&self, _secs: u64) {}
        fn emit_throttled_changed_callback(&self, _path: &Path) {
            self.throttled.fetch_add(1, Ordering::Relaxed);
        }
        fn emit_changed_callback(&self, _path: &Path) {}
        fn emit_metadata_callback(&self, _path: &Path) {}
        fn emit_metadata_loop(&self, _path: &Path) {}
        fn emit_metadata_partial_read(&self, _path: &Path) {}
        fn emit_metadata_decode_desc(&self) {
            self.metrics.fetch_add(1, Ordering::Relaxed);
        }
        fn emit_metadata_decode_indom(&self) {
            self.indoms.fetch_add(1, Ordering::Relaxed);
        }
        fn emit_metadata_decode_label(&self) {}
        fn emit_metadata_decode_helptext(&self) {}
        fn emit_metadata_streaming(&self, _bytes: usize) {}
        fn emit_logvol_callback(&self, _path: &Path) {}
        fn emit_logvol_loop(&self, _path: &Path) {}
        fn emit_logvol_change_vol(&self, _path: &Path, _new_seq: u32) {}
        fn emit_logvol_new_context(&self, _path: &Path) {}
        fn emit_logvol_get_archive_end_failed(&self, _path: &Path, _error: &str) {}
        fn emit_logvol_decode_result(&self) {}
        fn emit_logvol_decode_result_pmids(&self, _count: usize) {}
        fn emit_logvol_decode_mark_record(&self) {}
        fn emit_logvol_decode_result_error(&self, _error: &str) {}
        fn emit_logvol_streaming(&self, _bytes: usize) {}
        fn emit_malformed_record(&self, _path: &Path, _kind: &str, _reason: &str) {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        }
        fn emit_archive_deleted(&self, _path: &Path) {
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
        fn emit_consumer_error(&self, _handle: u64) {}
    }
}
