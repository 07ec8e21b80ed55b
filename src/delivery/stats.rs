use rustc_hash::FxHashMap;

use crate::report::ReportKind;

/// Delivery counters for a single report kind
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct KindStats {
    /// reports handed to the transport for the first time
    pub sent: u64,
    /// retry attempts of in-flight reports
    pub resent: u64,
    pub acked: u64,
    pub cached: u64,
    pub cache_resent: u64,
    /// reports given up on: not cacheable, or the cache was full
    pub dropped: u64,
    /// reports refused at submission
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    per_kind: FxHashMap<ReportKind, KindStats>,
}

impl DeliveryStats {
    pub fn get(&self, kind: ReportKind) -> KindStats {
        self.per_kind.get(&kind)
            .copied()
            .unwrap_or_default()
    }

    pub fn get_mut(&mut self, kind: ReportKind) -> &mut KindStats {
        self.per_kind.entry(kind).or_default()
    }

    pub fn total(&self) -> KindStats {
        self.per_kind.values().fold(KindStats::default(), |acc, s| KindStats {
            sent: acc.sent + s.sent,
            resent: acc.resent + s.resent,
            acked: acc.acked + s.acked,
            cached: acc.cached + s.cached,
            cache_resent: acc.cache_resent + s.cache_resent,
            dropped: acc.dropped + s.dropped,
            rejected: acc.rejected + s.rejected,
        })
    }

    pub fn reset(&mut self) {
        self.per_kind.clear();
    }
}
