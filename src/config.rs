//! Configuration keys the engine consumes (§6.3).
//!
//! The ini-style parsing itself is out of scope (§1); the CLI/daemon
//! bootstrap is expected to hand the engine an already-populated `Config`,
//! the same division of labour `ifile-source`'s `ReadFromConfig` shows:
//! a plain `serde`-derived value constructed by something outside this
//! crate and handed in.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The reference throttle constant: `max(1, monitored_count / MAX_INFLIGHT_MON)`
/// (§4.3, §12 of SPEC_FULL.md).
pub const MAX_INFLIGHT_MON: u64 = 40;

/// Downstream in-flight request ceiling above which callbacks are
/// throttled regardless of per-archive spacing (§4.3, §12).
pub const MAX_INFLIGHT_REQ: u64 = 1_000_000;

pub const DEFAULT_ARCHIVE_ROOT: &str = "/var/log/pcp/pmlogger";

/// `discover.*` configuration (§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `discover.enabled`: if `false` the engine disables itself.
    pub enabled: bool,

    /// `discover.path`: archive directory root.
    pub path: PathBuf,

    /// `discover.exclude.metrics`: comma-separated metric-name glob
    /// patterns, excluded at dispatch.
    pub exclude_metrics: Vec<String>,

    /// `discover.exclude.indoms`: comma-separated `domain.serial` indom
    /// ids, excluded at dispatch.
    pub exclude_indoms: Vec<String>,

    /// Reference value `MAX_INFLIGHT_MON`, overridable.
    pub max_inflight_mon: u64,

    /// Reference value `MAX_INFLIGHT_REQ`, overridable.
    pub max_inflight_req: u64,

    /// Whether the directory watcher recurses into subdirectories (§4.3).
    pub recursive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(DEFAULT_ARCHIVE_ROOT),
            exclude_metrics: Vec::new(),
            exclude_indoms: Vec::new(),
            max_inflight_mon: MAX_INFLIGHT_MON,
            max_inflight_req: MAX_INFLIGHT_REQ,
            recursive: true,
        }
    }
}

impl Config {
    /// Parse `discover.exclude.metrics`/`discover.exclude.indoms` from
    /// their comma-separated ini form. The ini parser itself is out of
    /// scope; this only covers the one sub-parse the engine must own
    /// since the glob patterns feed straight into the exclusion cache.
    pub fn parse_exclude_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Parses `discover.exclude.indoms`' `domain.serial` entries into the
    /// wire-form indom id via the reference's `pmInDom_build(domain,
    /// serial)`: domain in the high 10 bits, serial in the low 22.
    /// Entries that don't parse as `%u.%u` are skipped, matching
    /// `discover.c`'s own silent-skip on a failed `sscanf`.
    pub fn parse_exclude_indoms(&self) -> HashSet<u32> {
        self.exclude_indoms
            .iter()
            .filter_map(|entry| {
                let (domain, serial) = entry.split_once('.')?;
                let domain: u32 = domain.trim().parse().ok()?;
                let serial: u32 = serial.trim().parse().ok()?;
                Some(build_indom_id(domain, serial))
            })
            .collect()
    }

    pub fn throttle_window(&self, monitored_count: u64) -> Duration {
        let divisor = self.max_inflight_mon.max(1);
        let secs = (monitored_count / divisor).max(1);
        Duration::from_secs(secs)
    }
}

/// `pmInDom_build(domain, serial)`: domain occupies the top 10 bits,
/// serial the low 22, matching the reference macro used by
/// `discover.c`'s own `exclude.indoms` parser.
pub fn build_indom_id(domain: u32, serial: u32) -> u32 {
    (domain << 22) | (serial & 0x3f_ffff)
}
