use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DeliveryConfig;
use crate::report::{ContentHash, ReportKind, ReportTags, Severity};

/// A report that ran out of retry budget, kept for delivery at a later time. Its timestamp is
///  wall clock time since it survives restarts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheEntry {
    pub hash: ContentHash,
    pub severity: Severity,
    pub kind: ReportKind,
    pub payload: Bytes,
    pub enqueued_at_secs: u64,
    pub tags: Option<ReportTags>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheInsert {
    Inserted,
    /// an entry with the same content is cached already
    Duplicate,
    /// the cache is at capacity - nothing was inserted or evicted
    Full,
    /// the severity is too high for caching
    NotCacheable,
}

#[derive(Debug, Default)]
pub struct DrainBatch {
    /// entries to be sent again, oldest first
    pub resend: Vec<CacheEntry>,
    pub num_discarded: usize,
    /// a mutation while draining made a snapshot flush due
    pub flush_due: bool,
}

/// Durable overflow storage for reports that could not be delivered in time, keyed by content
///  hash.
///
/// Entries are sent again in batches. Each such resend gets a fresh sequence number, and the
///  mapping from that sequence number to the content hash lets an acknowledgment remove the entry.
///  These mappings are pruned once their sequence number falls too far behind the current one,
///  making the entry eligible for another resend.
///
/// Every mutation counts towards a monotonic change counter which drives the snapshot flush
///  policy.
pub struct OverflowCache {
    config: Arc<DeliveryConfig>,
    entries: FxHashMap<ContentHash, CacheEntry>,
    sent: BTreeMap<u32, ContentHash>,
    change_counter: u64,
    last_flush: Option<Instant>,
    dirty: bool,
}

impl OverflowCache {
    pub fn new(config: Arc<DeliveryConfig>) -> OverflowCache {
        OverflowCache {
            config,
            entries: Default::default(),
            sent: Default::default(),
            change_counter: 0,
            last_flush: None,
            dirty: false,
        }
    }

    /// Initializes the cache from a persisted snapshot. Entries beyond capacity are ignored,
    ///  loading does not count as a change.
    pub fn load(&mut self, snapshot: Vec<CacheEntry>) {
        for entry in snapshot {
            if self.entries.len() >= self.config.cache_capacity {
                debug!("snapshot exceeds cache capacity - ignoring remaining entries");
                break;
            }
            self.entries.insert(entry.hash, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: ContentHash) -> bool {
        self.entries.contains_key(&hash)
    }

    pub fn change_counter(&self) -> u64 {
        self.change_counter
    }

    /// `true` while there are cache resends that may still be acknowledged
    pub fn has_outstanding(&self) -> bool {
        !self.sent.is_empty()
    }

    pub fn insert(&mut self, entry: CacheEntry, now: Instant) -> (CacheInsert, bool) {
        if !entry.severity.is_cacheable() {
            return (CacheInsert::NotCacheable, false);
        }
        if self.entries.contains_key(&entry.hash) {
            return (CacheInsert::Duplicate, false);
        }
        if self.entries.len() >= self.config.cache_capacity {
            return (CacheInsert::Full, false);
        }

        trace!("caching report {:?}", entry.hash);
        self.entries.insert(entry.hash, entry);
        (CacheInsert::Inserted, self.on_changed(now))
    }

    /// Reads up to one batch of entries that have no resend outstanding, oldest first. Entries
    ///  in the batch that are expired, empty or not cacheable are removed rather than returned.
    pub fn drain_batch(&mut self, now_unix_secs: u64, now: Instant) -> DrainBatch {
        let outstanding = self.sent.values().copied().collect::<FxHashSet<_>>();

        let mut candidates = self.entries.values()
            .filter(|e| !outstanding.contains(&e.hash))
            .map(|e| (e.enqueued_at_secs, e.hash))
            .collect::<Vec<_>>();
        candidates.sort();
        candidates.truncate(self.config.cache_drain_batch);

        let expiry_secs = self.config.cache_expiry.as_secs();
        let mut result = DrainBatch::default();
        for (_, hash) in candidates {
            let Some(entry) = self.entries.get(&hash) else { continue };

            let expired = now_unix_secs.saturating_sub(entry.enqueued_at_secs) > expiry_secs;
            if expired || entry.payload.is_empty() || !entry.severity.is_cacheable() {
                trace!("discarding cached report {:?}", hash);
                self.entries.remove(&hash);
                result.num_discarded += 1;
                result.flush_due |= self.on_changed(now);
            }
            else {
                result.resend.push(entry.clone());
            }
        }
        result
    }

    /// Remembers that an entry was sent with a given sequence number
    pub fn record_sent(&mut self, sequence: u32, hash: ContentHash) {
        self.sent.insert(sequence, hash);
    }

    /// Removes the entry that was sent with this sequence number, if any. Returns the removed
    ///  entry and whether a flush is due.
    pub fn on_ack(&mut self, sequence: u32, now: Instant) -> (Option<CacheEntry>, bool) {
        let Some(hash) = self.sent.remove(&sequence) else {
            return (None, false);
        };
        // other resends of the same content are obsolete as well
        self.sent.retain(|_, h| *h != hash);

        match self.entries.remove(&hash) {
            Some(entry) => {
                let flush_due = self.on_changed(now);
                (Some(entry), flush_due)
            }
            None => (None, false),
        }
    }

    /// Forgets resends whose sequence number is more than `window` behind `current_sequence`.
    ///  Sequence numbers wrap, so distance is measured modulo 2^32.
    pub fn prune_sent(&mut self, current_sequence: u32, window: u32) {
        let before = self.sent.len();
        self.sent.retain(|&seq, _| current_sequence.wrapping_sub(seq) <= window);
        if self.sent.len() < before {
            debug!("{} cache resends were not acknowledged in time", before - self.sent.len());
        }
    }

    /// All entries, sorted by content hash
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut result = self.entries.values().cloned().collect::<Vec<_>>();
        result.sort_by_key(|e| e.hash);
        result
    }

    fn on_changed(&mut self, now: Instant) -> bool {
        self.change_counter += 1;
        self.dirty = true;
        self.is_flush_due(now)
    }

    /// A flush is due at the first threshold of changes, at every multiple of the regular flush
    ///  interval, and when the cache became empty - but never sooner than the minimum flush
    ///  interval after the previous flush.
    pub fn is_flush_due(&self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }

        let counter_due = self.change_counter == self.config.flush_first_threshold
            || self.change_counter % self.config.flush_every == 0
            || self.entries.is_empty();
        if !counter_due {
            return false;
        }

        match self.last_flush {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.config.flush_min_interval,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = Some(now);
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::SocketAddr;
    use std::time::Duration;

    const NOW_SECS: u64 = 1_700_000_000;

    fn config() -> DeliveryConfig {
        DeliveryConfig::new(vec![SocketAddr::from(([1, 2, 3, 4], 9700))])
    }

    fn entry(payload: &'static [u8], severity: Severity, enqueued_at_secs: u64) -> CacheEntry {
        CacheEntry {
            hash: ContentHash::new(ReportKind::Event, payload),
            severity,
            kind: ReportKind::Event,
            payload: Bytes::from_static(payload),
            enqueued_at_secs,
            tags: None,
        }
    }

    fn numbered_entry(n: u32, enqueued_at_secs: u64) -> CacheEntry {
        let payload = Bytes::from(n.to_be_bytes().to_vec());
        CacheEntry {
            hash: ContentHash::new(ReportKind::Counter, &payload),
            severity: Severity::Normal,
            kind: ReportKind::Counter,
            payload,
            enqueued_at_secs,
            tags: None,
        }
    }

    #[rstest]
    #[case::low(Severity::Low, CacheInsert::Inserted)]
    #[case::normal(Severity::Normal, CacheInsert::Inserted)]
    #[case::high(Severity::High, CacheInsert::NotCacheable)]
    #[case::critical(Severity::Critical, CacheInsert::NotCacheable)]
    fn test_insert_severity_gate(#[case] severity: Severity, #[case] expected: CacheInsert) {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let (result, _) = cache.insert(entry(b"a", severity, NOW_SECS), Instant::now());
        assert_eq!(result, expected);
        assert_eq!(cache.len(), if expected == CacheInsert::Inserted { 1 } else { 0 });
    }

    #[test]
    fn test_insert_duplicate_and_full() {
        let mut config = config();
        config.cache_capacity = 2;
        let mut cache = OverflowCache::new(Arc::new(config));
        let now = Instant::now();

        assert_eq!(cache.insert(entry(b"a", Severity::Low, NOW_SECS), now).0, CacheInsert::Inserted);
        assert_eq!(cache.insert(entry(b"a", Severity::Low, NOW_SECS + 5), now).0, CacheInsert::Duplicate);
        assert_eq!(cache.insert(entry(b"b", Severity::Low, NOW_SECS), now).0, CacheInsert::Inserted);
        assert_eq!(cache.insert(entry(b"c", Severity::Low, NOW_SECS), now).0, CacheInsert::Full);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(ContentHash::new(ReportKind::Event, b"c")));
        assert_eq!(cache.change_counter(), 2);
    }

    #[test]
    fn test_drain_batch_oldest_first() {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let now = Instant::now();
        for n in 0..15 {
            let _ = cache.insert(numbered_entry(n, NOW_SECS - 100 + (14 - n) as u64), now);
        }

        let batch = cache.drain_batch(NOW_SECS, now);
        assert_eq!(batch.num_discarded, 0);
        assert_eq!(batch.resend.len(), 10);
        let expected = (5..15).rev().map(|n| numbered_entry(n, 0).hash).collect::<Vec<_>>();
        assert_eq!(batch.resend.iter().map(|e| e.hash).collect::<Vec<_>>(), expected);
        assert_eq!(cache.len(), 15);
    }

    #[test]
    fn test_drain_batch_skips_outstanding() {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let now = Instant::now();
        let _ = cache.insert(entry(b"a", Severity::Low, NOW_SECS - 10), now);
        let _ = cache.insert(entry(b"b", Severity::Low, NOW_SECS - 5), now);

        cache.record_sent(17, ContentHash::new(ReportKind::Event, b"a"));
        assert!(cache.has_outstanding());

        let batch = cache.drain_batch(NOW_SECS, now);
        assert_eq!(batch.resend, vec![entry(b"b", Severity::Low, NOW_SECS - 5)]);
    }

    #[test]
    fn test_drain_batch_discards_invalid() {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let now = Instant::now();
        let week = 7 * 24 * 3600;

        // snapshot loading bypasses the insertion checks
        cache.load(vec![
            entry(b"expired", Severity::Low, NOW_SECS - week - 1),
            entry(b"", Severity::Low, NOW_SECS),
            entry(b"high", Severity::High, NOW_SECS),
            entry(b"just in time", Severity::Normal, NOW_SECS - week),
        ]);
        assert_eq!(cache.len(), 4);

        let batch = cache.drain_batch(NOW_SECS, now);
        assert_eq!(batch.num_discarded, 3);
        assert_eq!(batch.resend, vec![entry(b"just in time", Severity::Normal, NOW_SECS - week)]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.change_counter(), 3);
        assert!(cache.is_dirty());
    }

    #[test]
    fn test_ack_removes_entry_once() {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let now = Instant::now();
        let e = entry(b"a", Severity::Low, NOW_SECS);
        let _ = cache.insert(e.clone(), now);
        cache.record_sent(5, e.hash);
        cache.record_sent(9, e.hash);

        let (removed, _) = cache.on_ack(5, now);
        assert_eq!(removed, Some(e));
        assert!(cache.is_empty());
        assert!(!cache.has_outstanding());

        assert_eq!(cache.on_ack(5, now), (None, false));
        assert_eq!(cache.on_ack(9, now), (None, false));
        assert_eq!(cache.change_counter(), 2);
    }

    #[rstest]
    #[case::recent(200, 150, true)]
    #[case::at_window(200, 90, true)]
    #[case::behind_window(200, 89, false)]
    #[case::wrapped_recent(5, u32::MAX - 10, true)]
    #[case::wrapped_behind(5, u32::MAX - 200, false)]
    fn test_prune_sent(#[case] current: u32, #[case] sent: u32, #[case] expected_kept: bool) {
        let mut cache = OverflowCache::new(Arc::new(config()));
        cache.record_sent(sent, ContentHash(1));
        cache.prune_sent(current, 110);
        assert_eq!(cache.has_outstanding(), expected_kept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_policy() {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let now = Instant::now();
        assert!(!cache.is_flush_due(now));

        for n in 0..19 {
            let (_, flush_due) = cache.insert(numbered_entry(n, NOW_SECS), now);
            assert!(!flush_due);
        }
        let (_, flush_due) = cache.insert(numbered_entry(19, NOW_SECS), now);
        assert!(flush_due);
        cache.mark_flushed(now);
        assert!(!cache.is_flush_due(now));

        // the 300th change is due, but throttled since the last flush was just now
        for n in 20..299 {
            let (_, flush_due) = cache.insert(numbered_entry(n, NOW_SECS), now);
            assert!(!flush_due);
        }
        let (_, flush_due) = cache.insert(numbered_entry(299, NOW_SECS), now);
        assert!(!flush_due);

        let later = now + Duration::from_secs(10);
        assert!(cache.is_flush_due(later));
        let (_, flush_due) = cache.insert(numbered_entry(300, NOW_SECS), later);
        assert!(!flush_due);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_when_emptied() {
        let mut cache = OverflowCache::new(Arc::new(config()));
        let now = Instant::now();
        let e = entry(b"a", Severity::Low, NOW_SECS);

        let (_, flush_due) = cache.insert(e.clone(), now);
        assert!(!flush_due);
        cache.mark_flushed(now);

        cache.record_sent(1, e.hash);
        let (_, flush_due) = cache.on_ack(1, now + Duration::from_secs(3));
        assert!(!flush_due);
        assert!(cache.is_flush_due(now + Duration::from_secs(10)));
    }
}
