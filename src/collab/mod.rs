//! The seams between the delivery engine and its environment: sending packets, resolving host
//!  names, discovering endpoints and persisting the overflow cache.

pub mod dns;
pub mod file_store;
pub mod udp;

use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::delivery::overflow_cache::CacheEntry;
use crate::endpoint::TransportVariant;
use crate::report::{ContentHash, ReportKind};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hands a framed packet to the network. Returns the number of bytes sent, with 0 meaning
    ///  the transport does not support `variant`.
    async fn send(&self, to: SocketAddr, variant: TransportVariant, packet: &[u8], kind: ReportKind, hash: ContentHash, sequence: u32) -> anyhow::Result<usize>;
}

/// A send failed for reasons on this host, e.g. there is no socket for the address family. The
///  endpoint is not implicated, so it is set aside rather than backed off.
///
/// Transports return this wrapped in an `anyhow::Error`, the engine recognizes it by downcasting.
#[derive(Debug)]
pub struct LocalSendError {
    pub to: SocketAddr,
    pub reason: &'static str,
}

impl Display for LocalSendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot send to {:?}: {}", self.to, self.reason)
    }
}

impl std::error::Error for LocalSendError {}

/// Receives acknowledgments - implemented by the delivery engine's handle, called by the
///  transport
#[async_trait]
pub trait AckHandler: Send + Sync + 'static {
    async fn on_receive_accounting(&self, from: SocketAddr, sequence: u32);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, host: &str) -> anyhow::Result<Vec<IpAddr>>;
}

/// A one-shot source of additional endpoints, e.g. a service directory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync + 'static {
    async fn discover(&self) -> anyhow::Result<Vec<SocketAddr>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn load_snapshot(&self) -> anyhow::Result<Vec<CacheEntry>>;
    async fn save_snapshot(&self, entries: &[CacheEntry]) -> anyhow::Result<()>;
    async fn flush(&self) -> anyhow::Result<()>;
}

/// A store for deployments without persistence: nothing is loaded, nothing is kept
pub struct NoopCacheStore;

#[async_trait]
impl CacheStore for NoopCacheStore {
    async fn load_snapshot(&self) -> anyhow::Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }

    async fn save_snapshot(&self, _entries: &[CacheEntry]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_cache_store() {
        let store = NoopCacheStore;
        store.save_snapshot(&[]).await.unwrap();
        store.flush().await.unwrap();
        assert!(store.load_snapshot().await.unwrap().is_empty());
    }

    #[test]
    fn test_local_send_error_survives_anyhow() {
        let to = SocketAddr::from(([0u16, 0, 0, 0, 0, 0, 0, 1], 9700));
        let err: anyhow::Error = LocalSendError { to, reason: "no IPv6 socket" }.into();
        assert_eq!(err.downcast_ref::<LocalSendError>().map(|e| e.to), Some(to));
        assert_eq!(err.to_string(), "cannot send to [::1]:9700: no IPv6 socket");
    }
}
