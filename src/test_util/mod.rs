//! Fakes for the delivery engine's collaborators. They are used for testing the engine itself,
//!  but they are also exported for application testing, which is why they are part of the
//!  crate's regular (non-#[cfg(test)]) code.

pub mod store;
pub mod transport;

use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::collab::{DiscoveryClient, Resolver};

/// Resolves host names from a fixed table, failing for unknown names
#[derive(Default)]
pub struct StaticResolver {
    hosts: FxHashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> StaticResolver {
        Default::default()
    }

    pub fn with_host(mut self, host: &str, ips: Vec<IpAddr>) -> StaticResolver {
        self.hosts.insert(host.to_string(), ips);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        self.hosts.get(host)
            .cloned()
            .ok_or_else(|| anyhow!("unknown host {}", host))
    }
}

/// Always discovers the same endpoints
pub struct StaticDiscovery {
    pub endpoints: Vec<SocketAddr>,
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<SocketAddr>> {
        Ok(self.endpoints.clone())
    }
}
