use std::net::IpAddr;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::lookup_host;
use tokio::time::timeout;

use crate::collab::Resolver;

/// Resolves host names with the operating system's resolver
pub struct TokioResolver {
    pub timeout: Duration,
}

impl Default for TokioResolver {
    fn default() -> Self {
        TokioResolver {
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        let addrs = timeout(self.timeout, lookup_host((host, 0))).await
            .map_err(|_| anyhow!("resolving {} timed out after {:?}", host, self.timeout))??;

        let mut result = Vec::new();
        for addr in addrs {
            if !result.contains(&addr.ip()) {
                result.push(addr.ip());
            }
        }
        Ok(result)
    }
}
