//! The Callback Dispatcher (§4.6): fan-out to registered consumers, plus
//! the exclusion policy.
//!
//! Grounded on the Design Notes' call to replace a raw function-pointer
//! table with `void *` user-data by "a list of trait-object consumers...
//! each declaring which of the seven event hooks it implements" — the
//! same shape as `file-source`'s `FileSourceInternalEvents` trait object,
//! except here each method has a default no-op so a consumer only
//! overrides the hooks it cares about.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use glob::Pattern;

use crate::codec::{Descriptor, HelpTextKind, Instance, ResultRecord, TargetType, Timestamp};
use crate::registry::SourceIdentity;

/// Common header every callback receives (§6.2).
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: Timestamp,
    pub source: SourceIdentity,
    pub module_handle: u64,
}

/// Whether a label-set callback took ownership. Encodes the asymmetric
/// contract from §3/§9: a successful `on_labels` owns the memory; a
/// failing one leaves it with the engine to free.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LabelsOutcome {
    Taken,
    Declined,
}

/// One registered consumer's optional hooks (§4.6). Default
/// implementations are no-ops so a consumer only overrides what it
/// needs, the same "declares which of the seven event hooks it
/// implements" shape the Design Notes ask for.
pub trait Consumer: Send + Sync {
    fn on_source(&self, _header: &EventHeader) {}
    fn on_metric(&self, _header: &EventHeader, _descriptor: &Descriptor) {}
    fn on_indom(&self, _header: &EventHeader, _indom_id: u32, _instances: &[Instance]) {}
    fn on_labels(&self, _header: &EventHeader, _target: TargetType, _target_id: u32, _label_sets: &[bytes::Bytes]) -> LabelsOutcome {
        LabelsOutcome::Declined
    }
    fn on_text(&self, _header: &EventHeader, _kind: HelpTextKind, _id: u32, _text: &str) {}
    fn on_values(&self, _header: &EventHeader, _result: &ResultRecord) {}
    fn on_closed(&self, _header: &EventHeader) {}
}

/// A stable handle into the dispatcher's slot table, returned by
/// `register` and required by `unregister`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConsumerHandle(u64);

#[derive(Default, Clone)]
struct Exclusion {
    metrics: HashSet<u32>,
    indoms: HashSet<u32>,
    patterns: Vec<Pattern>,
    /// Memoised metric ids that matched a glob pattern, for O(1) future
    /// checks (§4.6).
    matched_cache: Arc<DashMap<u32, bool>>,
}

impl Exclusion {
    fn is_metric_excluded(&self, pmid: u32, indom_id: u32, names: &[String]) -> bool {
        if self.is_metric_id_excluded(pmid) || self.is_indom_excluded(indom_id) {
            return true;
        }
        let matched = names
            .iter()
            .any(|name| self.patterns.iter().any(|p| p.matches(name)));
        self.matched_cache.insert(pmid, matched);
        matched
    }

    /// Id-only exclusion check, for records (help-text, label-sets) that
    /// carry a metric id but not its name list. Consults the explicit id
    /// set and the glob-match cache memoised by `is_metric_excluded`;
    /// a pmid never checked against the glob patterns (no descriptor
    /// seen yet) is not treated as excluded by name (§4.6).
    fn is_metric_id_excluded(&self, pmid: u32) -> bool {
        self.metrics.contains(&pmid) || self.matched_cache.get(&pmid).map(|m| *m).unwrap_or(false)
    }

    fn is_indom_excluded(&self, indom_id: u32) -> bool {
        self.indoms.contains(&indom_id)
    }
}

/// Growable slot table of registered consumers (§4.6). Slots are reused
/// on the next `register` after an `unregister` zeroes them, matching
/// §9 Open Question 2's "zero callbacks per slot still returns a handle"
/// note without deciding double-registration dedup (left unspecified, as
/// the reference leaves it).
pub struct Dispatcher {
    slots: Vec<Option<Arc<dyn Consumer>>>,
    free_slots: Vec<usize>,
    exclusion: Exclusion,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            exclusion: Exclusion::default(),
        }
    }

    pub fn register(&mut self, consumer: Arc<dyn Consumer>) -> ConsumerHandle {
        if let Some(slot) = self.free_slots.pop() {
            self.slots[slot] = Some(consumer);
            return ConsumerHandle(slot as u64);
        }
        self.slots.push(Some(consumer));
        ConsumerHandle((self.slots.len() - 1) as u64)
    }

    pub fn unregister(&mut self, handle: ConsumerHandle) {
        let idx = handle.0 as usize;
        if idx < self.slots.len() && self.slots[idx].is_some() {
            self.slots[idx] = None;
            self.free_slots.push(idx);
        }
    }

    /// Configure the excluded metric-id / indom-id sets and the glob
    /// pattern list (`discover.exclude.metrics`/`.indoms`, §6.3).
    pub fn set_exclusions(
        &mut self,
        metrics: HashSet<u32>,
        indoms: HashSet<u32>,
        name_patterns: impl IntoIterator<Item = String>,
    ) {
        let patterns = name_patterns
            .into_iter()
            .filter_map(|p| Pattern::new(&p).ok())
            .collect();
        self.exclusion = Exclusion {
            metrics,
            indoms,
            patterns,
            matched_cache: Arc::new(DashMap::new()),
        };
    }

    fn consumers(&self) -> impl Iterator<Item = &Arc<dyn Consumer>> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn dispatch_source(&self, header: &EventHeader) {
        for c in self.consumers() {
            c.on_source(header);
        }
    }

    /// Dispatches `on_metric`, honouring the exclusion filter. Returns
    /// whether the metric was excluded (callers must then also suppress
    /// labels/text dispatch for the same id per §4.6).
    pub fn dispatch_metric(&self, header: &EventHeader, descriptor: &Descriptor) -> bool {
        if self
            .exclusion
            .is_metric_excluded(descriptor.pmid, descriptor.indom_id, &descriptor.names)
        {
            return true;
        }
        for c in self.consumers() {
            c.on_metric(header, descriptor);
        }
        false
    }

    pub fn dispatch_indom(&self, header: &EventHeader, indom_id: u32, instances: &[Instance]) {
        if self.exclusion.is_indom_excluded(indom_id) {
            return;
        }
        for c in self.consumers() {
            c.on_indom(header, indom_id, instances);
        }
    }

    /// Whether a label-set/text record targeting `target`/`id` should be
    /// dropped under the §4.6 exclusion policy: "skip all downstream
    /// dispatch (metric, labels-for-metric, text-for-metric)" for an
    /// excluded metric or indom. Context/domain/cluster targets are
    /// never excluded — the policy only names metric ids and indom ids.
    fn is_target_excluded(&self, target: TargetType, target_id: u32) -> bool {
        match target {
            TargetType::Item => self.exclusion.is_metric_id_excluded(target_id),
            TargetType::Indom | TargetType::Instances => self.exclusion.is_indom_excluded(target_id),
            TargetType::Context | TargetType::Domain | TargetType::Cluster => false,
        }
    }

    /// Dispatches `on_labels`, honouring the exclusion filter, and
    /// returns whether *any* consumer took ownership. The caller
    /// (reader/stream) frees the payload itself when this returns
    /// `Declined` (including when excluded), preserving the §3 asymmetry.
    pub fn dispatch_labels(
        &self,
        header: &EventHeader,
        target: TargetType,
        target_id: u32,
        label_sets: &[bytes::Bytes],
    ) -> LabelsOutcome {
        if self.is_target_excluded(target, target_id) {
            return LabelsOutcome::Declined;
        }
        let mut taken = false;
        for c in self.consumers() {
            if c.on_labels(header, target, target_id, label_sets) == LabelsOutcome::Taken {
                taken = true;
            }
        }
        if taken {
            LabelsOutcome::Taken
        } else {
            LabelsOutcome::Declined
        }
    }

    /// Dispatches `on_text`, honouring the exclusion filter: a help-text
    /// record naming an excluded metric or indom id is dropped silently
    /// (§4.6, §7 `Exclusion`).
    pub fn dispatch_text(&self, header: &EventHeader, kind: HelpTextKind, id: u32, text: &str) {
        let target = match kind {
            HelpTextKind::OneLineMetric | HelpTextKind::FullMetric => TargetType::Item,
            HelpTextKind::OneLineIndom | HelpTextKind::FullIndom => TargetType::Indom,
        };
        if self.is_target_excluded(target, id) {
            return;
        }
        for c in self.consumers() {
            c.on_text(header, kind, id, text);
        }
    }

    pub fn dispatch_values(&self, header: &EventHeader, result: &ResultRecord) {
        for c in self.consumers() {
            c.on_values(header, result);
        }
    }

    pub fn dispatch_closed(&self, header: &EventHeader) {
        for c in self.consumers() {
            c.on_closed(header);
        }
    }
}
