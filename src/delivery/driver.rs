use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::collab::{AckHandler, CacheStore, DiscoveryClient, Resolver, Transport};
use crate::config::DeliveryConfig;
use crate::delivery::engine::DeliveryEngine;
use crate::delivery::stats::KindStats;
use crate::delivery::{HostEvent, ReportRequest};
use crate::endpoint::EndpointSource;
use crate::report::ReportKind;

pub enum DeliveryCommand {
    Send {
        request: ReportRequest,
        reply: oneshot::Sender<anyhow::Result<u32>>,
    },
    Acknowledge {
        from: SocketAddr,
        sequence: u32,
    },
    Stats {
        /// `None` for the total over all kinds
        kind: Option<ReportKind>,
        reply: oneshot::Sender<KindStats>,
    },
    ResetStats,
    Endpoints {
        reply: oneshot::Sender<BTreeMap<EndpointSource, Vec<SocketAddr>>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The application's entry point to a running delivery engine. Calls are handed over to the
///  engine's worker task and processed in order.
#[derive(Clone, Debug)]
pub struct DeliveryHandle {
    commands: mpsc::Sender<DeliveryCommand>,
}

impl DeliveryHandle {
    async fn submit(&self, command: DeliveryCommand) -> anyhow::Result<()> {
        self.commands.send(command).await
            .map_err(|_| anyhow!("delivery engine is shut down"))
    }

    /// Submits a report and returns its sequence number once the worker accepted it. This does
    ///  not wait for the report to be acknowledged.
    pub async fn send(&self, request: ReportRequest) -> anyhow::Result<u32> {
        let (reply, result) = oneshot::channel();
        self.submit(DeliveryCommand::Send { request, reply }).await?;
        result.await?
    }

    pub async fn stats(&self, kind: ReportKind) -> anyhow::Result<KindStats> {
        let (reply, result) = oneshot::channel();
        self.submit(DeliveryCommand::Stats { kind: Some(kind), reply }).await?;
        Ok(result.await?)
    }

    pub async fn total_stats(&self) -> anyhow::Result<KindStats> {
        let (reply, result) = oneshot::channel();
        self.submit(DeliveryCommand::Stats { kind: None, reply }).await?;
        Ok(result.await?)
    }

    pub async fn reset_stats(&self) -> anyhow::Result<()> {
        self.submit(DeliveryCommand::ResetStats).await
    }

    pub async fn endpoints(&self) -> anyhow::Result<BTreeMap<EndpointSource, Vec<SocketAddr>>> {
        let (reply, result) = oneshot::channel();
        self.submit(DeliveryCommand::Endpoints { reply }).await?;
        Ok(result.await?)
    }

    /// Stops the worker after persisting the overflow cache
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let (reply, result) = oneshot::channel();
        self.submit(DeliveryCommand::Shutdown { reply }).await?;
        Ok(result.await?)
    }
}

#[async_trait]
impl AckHandler for DeliveryHandle {
    async fn on_receive_accounting(&self, from: SocketAddr, sequence: u32) {
        if self.submit(DeliveryCommand::Acknowledge { from, sequence }).await.is_err() {
            debug!("acknowledgment {} from {:?} arrived after shutdown", sequence, from);
        }
    }
}

/// Validates the configuration and spawns the delivery engine's worker task
pub fn start_delivery(
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CacheStore>,
    resolver: Arc<dyn Resolver>,
    discovery: Option<Arc<dyn DiscoveryClient>>,
    host_events: broadcast::Receiver<HostEvent>,
) -> anyhow::Result<(DeliveryHandle, JoinHandle<()>)> {
    config.validate()?;
    let config = Arc::new(config);

    let (commands, command_receiver) = mpsc::channel(config.command_channel_size);
    let engine = DeliveryEngine::new(config, transport, store, resolver, discovery);
    let join_handle = tokio::spawn(run_delivery(engine, command_receiver, host_events));

    Ok((DeliveryHandle { commands }, join_handle))
}

/// The engine's worker loop. All engine state is touched from here only: commands, host events,
///  timers and the results of background lookups are processed one at a time.
///
/// The loop terminates on a shutdown command or when all handles are dropped.
pub async fn run_delivery(mut engine: DeliveryEngine, mut commands: mpsc::Receiver<DeliveryCommand>, mut host_events: broadcast::Receiver<HostEvent>) {
    engine.start().await;
    info!("delivery engine started");

    let mut lookups = JoinSet::new();
    let mut host_events_open = true;

    loop {
        for job in engine.take_refresh_jobs() {
            lookups.spawn(job);
        }

        let retry_deadline = engine.retry_deadline();
        let cache_deadline = engine.cache_deadline();
        let dns_retry_deadline = engine.dns_retry_deadline();

        select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        if !on_command(&mut engine, cmd).await {
                            break;
                        }
                    }
                    None => {
                        debug!("all delivery handles were dropped - shutting down");
                        engine.shutdown().await;
                        break;
                    }
                }
            }
            evt = host_events.recv(), if host_events_open => {
                match evt {
                    Ok(evt) => engine.on_host_event(evt),
                    Err(RecvError::Lagged(n)) => {
                        warn!("missed {} host events - refreshing endpoints", n);
                        engine.on_host_events_lagged();
                    }
                    Err(RecvError::Closed) => {
                        debug!("host event channel closed");
                        host_events_open = false;
                    }
                }
            }
            Some(result) = lookups.join_next(), if !lookups.is_empty() => {
                match result {
                    Ok(result) => engine.on_refresh_result(result),
                    Err(e) => error!("endpoint lookup task failed: {}", e),
                }
            }
            _ = sleep_until_deadline(retry_deadline) => engine.on_retry_tick().await,
            _ = sleep_until_deadline(cache_deadline) => engine.on_cache_tick().await,
            _ = sleep_until_deadline(dns_retry_deadline) => engine.on_dns_retry_timer(),
        }
    }

    lookups.abort_all();
    info!("delivery engine shut down");
}

/// returns `false` if the worker should terminate
async fn on_command(engine: &mut DeliveryEngine, cmd: DeliveryCommand) -> bool {
    match cmd {
        DeliveryCommand::Send { request, reply } => {
            let result = engine.send(request).await;
            let _ = reply.send(result);
        }
        DeliveryCommand::Acknowledge { from, sequence } => {
            engine.on_acknowledgment(from, sequence).await;
        }
        DeliveryCommand::Stats { kind, reply } => {
            let stats = match kind {
                Some(kind) => engine.stats(kind),
                None => engine.total_stats(),
            };
            let _ = reply.send(stats);
        }
        DeliveryCommand::ResetStats => {
            engine.reset_stats();
        }
        DeliveryCommand::Endpoints { reply } => {
            let _ = reply.send(engine.endpoints_by_source());
        }
        DeliveryCommand::Shutdown { reply } => {
            engine.shutdown().await;
            let _ = reply.send(());
            return false;
        }
    }
    true
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::NoopCacheStore;
    use crate::delivery::{NetworkInfo, NetworkKind};
    use crate::report::Severity;
    use crate::test_util::store::InMemoryCacheStore;
    use crate::test_util::transport::TrackingTransport;
    use crate::test_util::{StaticDiscovery, StaticResolver};
    use std::net::IpAddr;
    use std::str::FromStr;
    use std::time::Duration;

    const A: &str = "1.1.1.1:9700";

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    struct Fixture {
        handle: DeliveryHandle,
        join_handle: JoinHandle<()>,
        transport: Arc<TrackingTransport>,
        store: Arc<InMemoryCacheStore>,
        host_events: broadcast::Sender<HostEvent>,
    }

    fn start(config: DeliveryConfig, resolver: StaticResolver, discovery: Option<Arc<dyn DiscoveryClient>>) -> Fixture {
        let transport = Arc::new(TrackingTransport::new());
        let store = Arc::new(InMemoryCacheStore::new());
        let (host_events, host_event_receiver) = broadcast::channel(16);
        let (handle, join_handle) = start_delivery(config, transport.clone(), store.clone(), Arc::new(resolver), discovery, host_event_receiver).unwrap();
        Fixture { handle, join_handle, transport, store, host_events }
    }

    fn default_fixture() -> Fixture {
        start(DeliveryConfig::new(vec![addr(A)]), StaticResolver::new(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_ack() {
        let f = default_fixture();

        let sequence = f.handle.send(ReportRequest::new("abc", Severity::Normal, ReportKind::Counter, 3)).await.unwrap();
        assert_eq!(sequence, 1);
        assert_eq!(f.transport.sent_sequences().await, vec![1]);

        f.handle.on_receive_accounting(addr(A), sequence).await;
        let stats = f.handle.stats(ReportKind::Counter).await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.acked, 1);

        // no resend after the acknowledgment
        time::sleep(Duration::from_secs(30)).await;
        assert!(f.transport.sent_sequences().await.is_empty());

        f.handle.reset_stats().await.unwrap();
        assert_eq!(f.handle.total_stats().await.unwrap(), KindStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_report_is_retried_and_cached() {
        let f = default_fixture();

        f.handle.send(ReportRequest::new("x", Severity::Low, ReportKind::Event, 1)).await.unwrap();
        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.transport.sent_sequences().await, vec![1, 1]);

        time::sleep(Duration::from_secs(5)).await;
        let stats = f.handle.stats(ReportKind::Event).await.unwrap();
        assert_eq!(stats.resent, 1);
        assert_eq!(stats.cached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_and_discovery_on_start() {
        let mut config = DeliveryConfig::new(vec![addr(A)]);
        config.dns_hostnames = vec!["ingest.example.com".to_string()];
        let resolver = StaticResolver::new()
            .with_host("ingest.example.com", vec![IpAddr::from_str("2001:db8::7").unwrap()]);
        let discovery = StaticDiscovery { endpoints: vec![addr("10.9.9.9:9800")] };

        let f = start(config, resolver, Some(Arc::new(discovery)));
        time::sleep(Duration::from_millis(1)).await;

        let endpoints = f.handle.endpoints().await.unwrap();
        assert_eq!(endpoints.get(&EndpointSource::Dns), Some(&vec![addr("[2001:db8::7]:9700")]));
        assert_eq!(endpoints.get(&EndpointSource::Discovery), Some(&vec![addr("10.9.9.9:9800"), addr("[::ffff:10.9.9.9]:9800")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_retry_timer() {
        let mut config = DeliveryConfig::new(vec![addr(A)]);
        config.dns_hostnames = vec!["ingest.example.com".to_string()];

        let f = start(config, StaticResolver::new(), None);
        time::sleep(Duration::from_secs(60)).await;

        // only hardcoded endpoints, and the worker is still alive after giving up on DNS
        let endpoints = f.handle.endpoints().await.unwrap();
        assert_eq!(endpoints.keys().copied().collect::<Vec<_>>(), vec![EndpointSource::Hardcoded]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_change_event() {
        let f = start(DeliveryConfig::new(vec![addr(A)]), StaticResolver::new(), Some(Arc::new(StaticDiscovery { endpoints: vec![addr("10.9.9.9:9800")] })));
        time::sleep(Duration::from_millis(1)).await;
        assert!(f.handle.endpoints().await.unwrap().contains_key(&EndpointSource::Discovery));

        f.host_events.send(HostEvent::NetworkChanged(NetworkInfo {
            kind: NetworkKind::Cellular4G,
            has_ipv4: true,
            has_ipv6: true,
        })).unwrap();
        time::sleep(Duration::from_millis(1)).await;

        // endpoints are cleared and rebuilt, discovery is queried again for the new network
        let endpoints = f.handle.endpoints().await.unwrap();
        assert_eq!(endpoints.keys().copied().collect::<Vec<_>>(), vec![EndpointSource::Hardcoded, EndpointSource::Discovery]);
        assert_eq!(endpoints.get(&EndpointSource::Discovery), Some(&vec![addr("10.9.9.9:9800"), addr("[::ffff:10.9.9.9]:9800")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_persists_cache() {
        let f = default_fixture();

        f.handle.send(ReportRequest::new("x", Severity::Normal, ReportKind::Event, 1)).await.unwrap();
        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(f.handle.stats(ReportKind::Event).await.unwrap().cached, 1);

        f.handle.shutdown().await.unwrap();
        f.join_handle.await.unwrap();

        assert_eq!(f.store.snapshot().await.len(), 1);
        assert!(f.handle.send(ReportRequest::new("y", Severity::Normal, ReportKind::Event, 1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_when_handles_are_dropped() {
        let f = default_fixture();
        drop(f.handle);
        f.join_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let (_, host_event_receiver) = broadcast::channel(1);
        let result = start_delivery(
            DeliveryConfig::new(vec![]),
            Arc::new(TrackingTransport::new()),
            Arc::new(NoopCacheStore),
            Arc::new(StaticResolver::new()),
            None,
            host_event_receiver,
        );
        assert!(result.is_err());
    }
}
