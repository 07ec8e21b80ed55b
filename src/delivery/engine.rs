use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::collab::{CacheStore, DiscoveryClient, LocalSendError, Resolver, Transport};
use crate::config::DeliveryConfig;
use crate::delivery::overflow_cache::{CacheEntry, CacheInsert, OverflowCache};
use crate::delivery::refresh::{EndpointRefresh, RefreshJob, RefreshResult};
use crate::delivery::retry_queue::{InFlightReport, RetryQueue};
use crate::delivery::stats::{DeliveryStats, KindStats};
use crate::delivery::{unix_time_secs, HostEvent, NetworkInfo, ReportRequest};
use crate::endpoint::endpoint::Outcome;
use crate::endpoint::selector::EndpointSelector;
use crate::endpoint::{EndpointSource, FamilyFilter, TransportVariant};
use crate::report::header::ReportHeader;
use crate::report::{ContentHash, ReportKind, ReportTags, Severity};

/// The delivery engine's state and logic. It is owned by a single worker task which calls its
///  methods one at a time (see [crate::delivery::driver::run_delivery]), so there is no locking.
///
/// Timers are represented as optional deadlines which the worker waits for. The engine starts
///  and stops them:
/// * the retry timer runs while there are reports in flight
/// * the cache drain timer is started by a send and runs while cache resends are outstanding
/// * the DNS retry timer runs after a failed DNS lookup while retries remain
pub struct DeliveryEngine {
    config: Arc<DeliveryConfig>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CacheStore>,
    selector: EndpointSelector,
    retry_queue: RetryQueue,
    cache: OverflowCache,
    refresh: EndpointRefresh,
    stats: DeliveryStats,
    network: NetworkInfo,
    variant: TransportVariant,
    /// the endpoint all sends go to until it is acknowledged, fails or times out - with the time
    ///  it was selected
    current_endpoint: Option<(SocketAddr, Instant)>,
    last_sequence: u32,
    retry_deadline: Option<Instant>,
    cache_deadline: Option<Instant>,
}

impl DeliveryEngine {
    pub fn new(
        config: Arc<DeliveryConfig>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CacheStore>,
        resolver: Arc<dyn Resolver>,
        discovery: Option<Arc<dyn DiscoveryClient>>,
    ) -> DeliveryEngine {
        DeliveryEngine {
            selector: EndpointSelector::new(config.clone()),
            retry_queue: RetryQueue::new(config.max_in_flight),
            cache: OverflowCache::new(config.clone()),
            refresh: EndpointRefresh::new(config.clone(), resolver, discovery),
            stats: Default::default(),
            network: NetworkInfo::unknown(),
            variant: config.transport_variant,
            current_endpoint: None,
            last_sequence: 0,
            retry_deadline: None,
            cache_deadline: None,
            config,
            transport,
            store,
        }
    }

    /// Loads the persisted overflow cache and seeds the endpoint population. Lookups are only
    ///  prepared here, the worker picks them up via [DeliveryEngine::take_refresh_jobs].
    pub async fn start(&mut self) {
        match self.store.load_snapshot().await {
            Ok(entries) => {
                info!("loaded {} cached reports", entries.len());
                self.cache.load(entries);
            }
            Err(e) => warn!("error loading overflow cache snapshot - starting with an empty cache: {}", e),
        }
        self.seed_endpoints();
    }

    fn seed_endpoints(&mut self) {
        self.selector.admit(&self.config.hardcoded_endpoints, self.variant, EndpointSource::Hardcoded);
        self.refresh.restart();
    }

    pub fn take_refresh_jobs(&mut self) -> Vec<RefreshJob> {
        self.refresh.take_jobs()
    }

    pub fn on_refresh_result(&mut self, result: RefreshResult) {
        let source = match &result {
            RefreshResult::Dns { .. } => EndpointSource::Dns,
            RefreshResult::Discovery { .. } => EndpointSource::Discovery,
        };
        if let Some(addrs) = self.refresh.on_result(result) {
            self.selector.admit(&addrs, self.variant, source);
        }
    }

    pub fn on_dns_retry_timer(&mut self) {
        self.refresh.on_dns_retry_timer();
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_deadline
    }

    pub fn cache_deadline(&self) -> Option<Instant> {
        self.cache_deadline
    }

    pub fn dns_retry_deadline(&self) -> Option<Instant> {
        self.refresh.dns_retry_deadline()
    }

    /// Sends a report, returning its sequence number. The report is tracked for retry if it has
    ///  a retry budget and there is room in the in-flight map.
    ///
    /// Failing to reach an endpoint is not an error - tracked reports are retried, and the caller
    ///  has no way of doing better anyway. Errors are for reports that are refused outright.
    pub async fn send(&mut self, request: ReportRequest) -> anyhow::Result<u32> {
        let ReportRequest { payload, severity, kind, mut retry_budget, tags } = request;

        if payload.is_empty() {
            self.stats.get_mut(kind).rejected += 1;
            bail!("empty report payload");
        }
        if self.network.is_low_bandwidth() {
            if severity < Severity::Normal {
                self.stats.get_mut(kind).rejected += 1;
                bail!("{:?} severity reports are not sent over a low bandwidth network", severity);
            }
            retry_budget = 0;
        }

        let now = Instant::now();
        let tracked = retry_budget > 0 && self.retry_queue.has_room();
        if retry_budget > 0 && !tracked {
            debug!("{} reports in flight - sending without retry", self.retry_queue.len());
        }

        let hash = ContentHash::new(kind, &payload);
        let sequence = self.next_sequence();
        let packet = match self.frame(kind, severity, tracked, sequence, tags, &payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.get_mut(kind).rejected += 1;
                return Err(e);
            }
        };

        if tracked {
            let inserted = self.retry_queue.insert(InFlightReport {
                sequence,
                retry_budget,
                severity,
                kind,
                payload,
                hash,
                tags,
                enqueued_at: now,
                last_attempt: now,
            });
            if !inserted {
                warn!("sequence number {} is in flight already - sending without retry", sequence);
            }
        }

        if self.transmit(&packet, kind, hash, sequence).await {
            self.stats.get_mut(kind).sent += 1;
        }

        if !self.retry_queue.is_empty() && self.retry_deadline.is_none() {
            self.retry_deadline = Some(now + self.config.retry_tick_interval);
        }
        if self.cache_deadline.is_none() {
            self.cache_deadline = Some(now + self.config.cache_drain_interval);
            self.drain_cache().await;
        }

        Ok(sequence)
    }

    fn next_sequence(&mut self) -> u32 {
        self.last_sequence = self.last_sequence.wrapping_add(1);
        self.last_sequence
    }

    fn frame(&self, kind: ReportKind, severity: Severity, ack_requested: bool, sequence: u32, tags: Option<ReportTags>, payload: &[u8]) -> anyhow::Result<BytesMut> {
        let header = ReportHeader {
            packet_type: kind.into(),
            qos: ReportHeader::qos_for(severity, ack_requested),
            sequence,
            sent_timestamp_secs: unix_time_secs() as u32,
            vendor_id: tags.map(|t| t.vendor_id).unwrap_or(self.config.vendor_id),
            channel_id: tags.map(|t| t.channel_id).unwrap_or(0),
        };
        header.frame(self.config.wire_variant, payload)
    }

    /// Families in order of preference, based on what the current network supports
    fn family_preference(&self) -> &'static [FamilyFilter] {
        match (self.network.has_ipv4, self.network.has_ipv6) {
            (true, true) => &[FamilyFilter::V4, FamilyFilter::V6Combined],
            (true, false) => &[FamilyFilter::V4],
            (false, true) => &[FamilyFilter::V6Combined],
            (false, false) => &[FamilyFilter::Any],
        }
    }

    fn acquire_endpoint(&mut self) -> Option<SocketAddr> {
        for addr in self.selector.sweep_timed_out(self.config.endpoint_response_timeout) {
            if self.current_endpoint.map(|(a, _)| a) == Some(addr) {
                self.current_endpoint = None;
            }
        }

        if let Some((addr, _)) = self.current_endpoint {
            return Some(addr);
        }

        for &family in self.family_preference() {
            if let Some(addr) = self.selector.select(family, self.variant) {
                self.current_endpoint = Some((addr, Instant::now()));
                return Some(addr);
            }
        }
        None
    }

    /// Hands a packet to the transport, returning `true` if that succeeded
    async fn transmit(&mut self, packet: &[u8], kind: ReportKind, hash: ContentHash, sequence: u32) -> bool {
        let Some(addr) = self.acquire_endpoint() else {
            debug!("no eligible endpoint for report {}", sequence);
            return false;
        };

        match self.transport.send(addr, self.variant, packet, kind, hash, sequence).await {
            Ok(0) => {
                warn!("transport refused report {} for {:?} via {:?} - backing off the endpoint", sequence, addr, self.variant);
                self.selector.report_outcome(addr, Outcome::Failed);
                self.current_endpoint = None;
                false
            }
            Ok(len) => {
                trace!("sent report {} to {:?} ({} bytes)", sequence, addr, len);
                true
            }
            Err(e) if e.downcast_ref::<LocalSendError>().is_some() => {
                // not the endpoint's fault, but it is unreachable from here until connectivity changes
                warn!("{} - disabling the endpoint", e);
                self.selector.disable(addr, self.variant);
                self.current_endpoint = None;
                false
            }
            Err(e) => {
                warn!("error sending report {} to {:?}: {}", sequence, addr, e);
                self.selector.report_outcome(addr, Outcome::Failed);
                self.current_endpoint = None;
                false
            }
        }
    }

    /// Handles an acknowledgment: it vouches for the endpoint it came from, and settles either an
    ///  in-flight report or a cache resend. Unknown and repeated acknowledgments have no effect
    ///  beyond the endpoint.
    pub async fn on_acknowledgment(&mut self, from: SocketAddr, sequence: u32) {
        if self.selector.report_outcome(from, Outcome::Success) {
            trace!("endpoint {:?} acknowledged", from);
        }
        if self.current_endpoint.map(|(a, _)| a) == Some(from) {
            self.current_endpoint = None;
        }

        if let Some(report) = self.retry_queue.remove(sequence) {
            trace!("report {} acknowledged", sequence);
            self.stats.get_mut(report.kind).acked += 1;
            if self.retry_queue.is_empty() {
                self.retry_deadline = None;
            }
            return;
        }

        let (entry, flush_due) = self.cache.on_ack(sequence, Instant::now());
        match entry {
            Some(entry) => {
                trace!("cached report {} acknowledged", sequence);
                self.stats.get_mut(entry.kind).acked += 1;
            }
            None => trace!("acknowledgment for unknown sequence number {} - ignoring", sequence),
        }
        if flush_due {
            self.flush_cache().await;
        }
    }

    pub async fn on_retry_tick(&mut self) {
        let now = Instant::now();
        let tick = self.retry_queue.tick(now, self.config.retry_resend_interval, self.config.max_in_flight_age);

        if !tick.resend.is_empty() {
            // reports went unacknowledged on the current endpoint
            if let Some((addr, since)) = self.current_endpoint {
                if now.saturating_duration_since(since) >= self.config.retry_resend_interval {
                    debug!("no acknowledgment from {:?} - switching endpoints", addr);
                    self.selector.report_outcome(addr, Outcome::Failed);
                    self.current_endpoint = None;
                }
            }
        }

        for sequence in tick.resend {
            let Some(report) = self.retry_queue.get(sequence) else { continue };
            let (kind, hash) = (report.kind, report.hash);
            let packet = match self.frame(report.kind, report.severity, true, sequence, report.tags, &report.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    error!("error framing report {} for resend: {}", sequence, e);
                    continue;
                }
            };
            if self.transmit(&packet, kind, hash, sequence).await {
                self.stats.get_mut(kind).resent += 1;
            }
        }

        let mut flush_due = false;
        for report in tick.expired {
            flush_due |= self.spill_to_cache(report, now);
        }
        if flush_due {
            self.flush_cache().await;
        }

        if self.retry_queue.is_empty() {
            debug!("no reports in flight - stopping retry timer");
            self.retry_deadline = None;
        }
        else {
            self.retry_deadline = Some(now + self.config.retry_tick_interval);
        }
    }

    /// Returns `true` if a snapshot flush is due
    fn spill_to_cache(&mut self, report: InFlightReport, now: Instant) -> bool {
        let age = now.saturating_duration_since(report.enqueued_at);
        let entry = CacheEntry {
            hash: report.hash,
            severity: report.severity,
            kind: report.kind,
            payload: report.payload,
            enqueued_at_secs: unix_time_secs().saturating_sub(age.as_secs()),
            tags: report.tags,
        };

        let (outcome, flush_due) = self.cache.insert(entry, now);
        match outcome {
            CacheInsert::Inserted => {
                debug!("report {} was not acknowledged - moved to overflow cache", report.sequence);
                self.stats.get_mut(report.kind).cached += 1;
            }
            CacheInsert::Duplicate => {
                trace!("report {} is cached already", report.sequence);
            }
            CacheInsert::Full => {
                warn!("overflow cache is full - dropping report {}", report.sequence);
                self.stats.get_mut(report.kind).dropped += 1;
            }
            CacheInsert::NotCacheable => {
                debug!("dropping unacknowledged report {} of severity {:?}", report.sequence, report.severity);
                self.stats.get_mut(report.kind).dropped += 1;
            }
        }
        flush_due
    }

    pub async fn on_cache_tick(&mut self) {
        self.drain_cache().await;

        if self.cache.has_outstanding() {
            self.cache_deadline = Some(Instant::now() + self.config.cache_drain_interval);
        }
        else {
            debug!("no cache resends outstanding - stopping cache drain timer");
            self.cache_deadline = None;
        }
    }

    async fn drain_cache(&mut self) {
        let batch = self.cache.drain_batch(unix_time_secs(), Instant::now());
        if batch.num_discarded > 0 {
            debug!("discarded {} stale cache entries", batch.num_discarded);
        }

        for entry in batch.resend {
            let sequence = self.next_sequence();
            let packet = match self.frame(entry.kind, entry.severity, true, sequence, entry.tags, &entry.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    error!("error framing cached report: {}", e);
                    continue;
                }
            };
            if !self.transmit(&packet, entry.kind, entry.hash, sequence).await {
                break;
            }
            self.cache.record_sent(sequence, entry.hash);
            self.stats.get_mut(entry.kind).cache_resent += 1;
        }

        self.cache.prune_sent(self.last_sequence, self.config.cache_sent_window);

        if batch.flush_due {
            self.flush_cache().await;
        }
    }

    async fn flush_cache(&mut self) {
        let snapshot = self.cache.snapshot();
        let result = match self.store.save_snapshot(&snapshot).await {
            Ok(()) => self.store.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("persisted {} cached reports", snapshot.len());
                self.cache.mark_flushed(Instant::now());
            }
            Err(e) => error!("error persisting overflow cache: {}", e),
        }
    }

    pub fn on_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::NetworkChanged(network) => {
                info!("network changed to {:?} - refreshing endpoints", network);
                self.network = network;
                self.selector.clear_by_variant(None);
                self.current_endpoint = None;
                self.seed_endpoints();
            }
            HostEvent::TransportVariantChanged(variant) => {
                if variant == self.variant {
                    return;
                }
                info!("transport variant changed from {:?} to {:?} - refreshing endpoints", self.variant, variant);
                self.selector.clear_by_variant(Some(self.variant));
                self.variant = variant;
                self.current_endpoint = None;
                self.seed_endpoints();
            }
            HostEvent::ConnectivityRestored => {
                debug!("connectivity restored - resetting endpoint backoff");
                self.selector.reset_all();
                self.current_endpoint = None;
            }
        }
    }

    /// Host events were missed - refresh everything based on the last known network
    pub fn on_host_events_lagged(&mut self) {
        self.on_host_event(HostEvent::NetworkChanged(self.network));
    }

    /// Persists the overflow cache if it changed since the last flush, regardless of throttling
    pub async fn shutdown(&mut self) {
        if self.cache.is_dirty() {
            self.flush_cache().await;
        }
        info!("delivery engine stopped with {} reports in flight and {} cached", self.retry_queue.len(), self.cache.len());
    }

    pub fn stats(&self, kind: ReportKind) -> KindStats {
        self.stats.get(kind)
    }

    pub fn total_stats(&self) -> KindStats {
        self.stats.total()
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn network(&self) -> NetworkInfo {
        self.network
    }

    pub fn transport_variant(&self) -> TransportVariant {
        self.variant
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    pub fn endpoints_by_source(&self) -> BTreeMap<EndpointSource, Vec<SocketAddr>> {
        self.selector.endpoints_by_source()
    }

    pub fn num_in_flight(&self) -> usize {
        self.retry_queue.len()
    }

    pub fn num_cached(&self) -> usize {
        self.cache.len()
    }
}
