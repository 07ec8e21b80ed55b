use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collab::{DiscoveryClient, Resolver};
use crate::config::DeliveryConfig;

/// The outcome of a background endpoint lookup, delivered back to the engine's worker. The
///  generation ties it to the network state it was started for.
#[derive(Debug)]
pub enum RefreshResult {
    Dns {
        generation: u64,
        elapsed: Duration,
        result: anyhow::Result<Vec<SocketAddr>>,
    },
    Discovery {
        generation: u64,
        result: anyhow::Result<Vec<SocketAddr>>,
    },
}

pub type RefreshJob = Pin<Box<dyn Future<Output = RefreshResult> + Send + 'static>>;

/// Keeps track of endpoint lookups: DNS with a limited number of timed retries, and discovery
///  which is queried once per network state and not retried.
///
/// Lookups run outside the engine's worker. This struct only creates the jobs and interprets
///  their results, jobs are collected by the caller via [EndpointRefresh::take_jobs].
pub struct EndpointRefresh {
    config: Arc<DeliveryConfig>,
    resolver: Arc<dyn Resolver>,
    discovery: Option<Arc<dyn DiscoveryClient>>,
    /// discovery delivered endpoints for the current generation - it is not consulted again
    ///  until the next restart
    discovery_done: bool,
    generation: u64,
    dns_retries: u32,
    dns_retry_deadline: Option<Instant>,
    pending_jobs: Vec<RefreshJob>,
}

impl EndpointRefresh {
    pub fn new(config: Arc<DeliveryConfig>, resolver: Arc<dyn Resolver>, discovery: Option<Arc<dyn DiscoveryClient>>) -> EndpointRefresh {
        EndpointRefresh {
            config,
            resolver,
            discovery,
            discovery_done: false,
            generation: 0,
            dns_retries: 0,
            dns_retry_deadline: None,
            pending_jobs: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_discovery_done(&self) -> bool {
        self.discovery_done
    }

    pub fn dns_retry_deadline(&self) -> Option<Instant> {
        self.dns_retry_deadline
    }

    /// Starts a new round of lookups, invalidating results of lookups still running
    pub fn restart(&mut self) {
        self.generation += 1;
        self.dns_retries = 0;
        self.dns_retry_deadline = None;
        self.discovery_done = false;

        self.start_dns();
        if let Some(discovery) = &self.discovery {
            let discovery = discovery.clone();
            let generation = self.generation;
            self.pending_jobs.push(Box::pin(async move {
                RefreshResult::Discovery {
                    generation,
                    result: discovery.discover().await,
                }
            }));
        }
    }

    pub fn on_dns_retry_timer(&mut self) {
        self.dns_retry_deadline = None;
        self.start_dns();
    }

    fn start_dns(&mut self) {
        if self.config.dns_hostnames.is_empty() {
            return;
        }

        let resolver = self.resolver.clone();
        let hostnames = self.config.dns_hostnames.clone();
        let port = self.config.dns_port;
        let generation = self.generation;
        self.pending_jobs.push(Box::pin(async move {
            let started = Instant::now();
            let result = resolve_all(resolver.as_ref(), &hostnames, port).await;
            RefreshResult::Dns {
                generation,
                elapsed: started.elapsed(),
                result,
            }
        }));
    }

    pub fn take_jobs(&mut self) -> Vec<RefreshJob> {
        std::mem::take(&mut self.pending_jobs)
    }

    /// Interprets a lookup result, returning the addresses to admit. Stale results and failures
    ///  yield `None`, failed DNS lookups schedule a retry while retries remain.
    pub fn on_result(&mut self, result: RefreshResult) -> Option<Vec<SocketAddr>> {
        match result {
            RefreshResult::Dns { generation, elapsed, result } => {
                if generation != self.generation {
                    debug!("ignoring DNS result of a previous network state");
                    return None;
                }
                match result {
                    Ok(addrs) if !addrs.is_empty() => {
                        debug!("DNS lookup returned {} addresses after {:?}", addrs.len(), elapsed);
                        self.dns_retry_deadline = None;
                        Some(addrs)
                    }
                    other => {
                        match other {
                            Err(e) => warn!("DNS lookup failed after {:?}: {}", elapsed, e),
                            Ok(_) => warn!("DNS lookup returned no addresses after {:?}", elapsed),
                        }
                        if self.dns_retries < self.config.dns_max_retries {
                            self.dns_retries += 1;
                            self.dns_retry_deadline = Some(Instant::now() + self.config.dns_retry_interval);
                            debug!("retrying DNS lookup in {:?} ({} of {})", self.config.dns_retry_interval, self.dns_retries, self.config.dns_max_retries);
                        }
                        else {
                            warn!("giving up on DNS lookup until the next network change");
                        }
                        None
                    }
                }
            }
            RefreshResult::Discovery { generation, result } => {
                if generation != self.generation || self.discovery_done {
                    debug!("ignoring discovery result of a previous network state");
                    return None;
                }
                match result {
                    Ok(addrs) if !addrs.is_empty() => {
                        info!("discovered {} endpoints - no further discovery until the network changes", addrs.len());
                        self.discovery_done = true;
                        Some(addrs)
                    }
                    Ok(_) => {
                        debug!("discovery returned no endpoints");
                        None
                    }
                    Err(e) => {
                        warn!("discovery failed: {}", e);
                        None
                    }
                }
            }
        }
    }
}

/// Resolves all host names, failing only if every one of them fails
async fn resolve_all(resolver: &dyn Resolver, hostnames: &[String], port: u16) -> anyhow::Result<Vec<SocketAddr>> {
    let mut addrs = Vec::new();
    let mut last_error = None;
    for host in hostnames {
        match resolver.resolve(host).await {
            Ok(ips) => {
                for ip in ips {
                    let addr = SocketAddr::new(ip, port);
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
            }
            Err(e) => {
                debug!("error resolving {}: {}", host, e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if addrs.is_empty() => Err(e),
        _ => Ok(addrs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crate::collab::{MockDiscoveryClient, MockResolver};
    use std::net::IpAddr;
    use std::str::FromStr;
    use tokio::time;

    fn config(hosts: &[&str]) -> Arc<DeliveryConfig> {
        let mut config = DeliveryConfig::new(vec![]);
        config.dns_hostnames = hosts.iter().map(|h| h.to_string()).collect();
        Arc::new(config)
    }

    fn ip(s: &str) -> IpAddr {
        IpAddr::from_str(s).unwrap()
    }

    async fn run_jobs(refresh: &mut EndpointRefresh) -> Vec<Option<Vec<SocketAddr>>> {
        let mut result = Vec::new();
        for job in refresh.take_jobs() {
            let r = job.await;
            result.push(refresh.on_result(r));
        }
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_merges_hosts() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve()
            .returning(|host| match host {
                "a.example.com" => Ok(vec![ip("10.0.0.1"), ip("10.0.0.2")]),
                "b.example.com" => Ok(vec![ip("10.0.0.2"), ip("2001:db8::1")]),
                _ => Err(anyhow!("unknown host")),
            });

        let mut refresh = EndpointRefresh::new(config(&["a.example.com", "b.example.com", "c.example.com"]), Arc::new(resolver), None);
        refresh.restart();

        let results = run_jobs(&mut refresh).await;
        assert_eq!(results, vec![Some(vec![
            SocketAddr::new(ip("10.0.0.1"), 9700),
            SocketAddr::new(ip("10.0.0.2"), 9700),
            SocketAddr::new(ip("2001:db8::1"), 9700),
        ])]);
        assert!(refresh.dns_retry_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_retries_are_limited() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve()
            .times(4)
            .returning(|_| Err(anyhow!("timeout")));

        let mut refresh = EndpointRefresh::new(config(&["a.example.com"]), Arc::new(resolver), None);
        refresh.restart();

        for _ in 0..3 {
            assert_eq!(run_jobs(&mut refresh).await, vec![None]);
            let deadline = refresh.dns_retry_deadline().unwrap();
            assert_eq!(deadline, Instant::now() + Duration::from_secs(15));

            time::advance(Duration::from_secs(15)).await;
            refresh.on_dns_retry_timer();
        }

        assert_eq!(run_jobs(&mut refresh).await, vec![None]);
        assert!(refresh.dns_retry_deadline().is_none());
        assert!(refresh.take_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_dns_without_host_names() {
        let resolver = MockResolver::new();
        let mut refresh = EndpointRefresh::new(config(&[]), Arc::new(resolver), None);
        refresh.restart();
        assert!(refresh.take_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_results_are_ignored() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve()
            .returning(|_| Ok(vec![ip("10.0.0.1")]));

        let mut refresh = EndpointRefresh::new(config(&["a.example.com"]), Arc::new(resolver), None);
        assert_eq!(refresh.generation(), 0);
        refresh.restart();
        let stale = refresh.take_jobs();
        refresh.restart();
        assert_eq!(refresh.generation(), 2);

        for job in stale {
            let r = job.await;
            assert!(refresh.on_result(r).is_none());
        }
        assert_eq!(run_jobs(&mut refresh).await, vec![Some(vec![SocketAddr::new(ip("10.0.0.1"), 9700)])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_once_per_network_state() {
        let mut discovery = MockDiscoveryClient::new();
        let mut num_calls = 0;
        discovery.expect_discover()
            .times(3)
            .returning(move || {
                num_calls += 1;
                if num_calls == 1 {
                    Ok(vec![])
                }
                else {
                    Ok(vec![SocketAddr::from(([10, 1, 1, 1], 9800))])
                }
            });

        let mut refresh = EndpointRefresh::new(config(&[]), Arc::new(MockResolver::new()), Some(Arc::new(discovery)));

        // an empty result is not retried within the same network state
        refresh.restart();
        assert_eq!(run_jobs(&mut refresh).await, vec![None]);
        assert!(!refresh.is_discovery_done());
        assert!(refresh.take_jobs().is_empty());
        assert!(refresh.dns_retry_deadline().is_none());

        refresh.restart();
        assert_eq!(run_jobs(&mut refresh).await, vec![Some(vec![SocketAddr::from(([10, 1, 1, 1], 9800))])]);
        assert!(refresh.is_discovery_done());

        // a network change queries discovery again
        refresh.restart();
        assert!(!refresh.is_discovery_done());
        assert_eq!(run_jobs(&mut refresh).await, vec![Some(vec![SocketAddr::from(([10, 1, 1, 1], 9800))])]);
        assert!(refresh.is_discovery_done());
    }
}
