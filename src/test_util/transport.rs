use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashSet;
use tokio::sync::RwLock;

use crate::collab::{LocalSendError, Transport};
use crate::endpoint::TransportVariant;
use crate::report::{ContentHash, ReportKind};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SentPacket {
    pub to: SocketAddr,
    pub variant: TransportVariant,
    pub packet: Vec<u8>,
    pub kind: ReportKind,
    pub hash: ContentHash,
    pub sequence: u32,
}

/// Records every packet it is asked to send. Sends to addresses registered as failing return an
///  error, sends to addresses registered as locally unreachable return a [LocalSendError], and
///  sends to addresses registered as unsupported return 0 bytes - none of these is recorded.
#[derive(Debug, Default)]
pub struct TrackingTransport {
    tracker: Arc<RwLock<Vec<SentPacket>>>,
    failing: RwLock<FxHashSet<SocketAddr>>,
    locally_unreachable: RwLock<FxHashSet<SocketAddr>>,
    unsupported: RwLock<FxHashSet<SocketAddr>>,
}

impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        Default::default()
    }

    /// returns sent packets, clearing the internal buffer
    pub async fn sent_packets(&self) -> Vec<SentPacket> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }

    /// returns the sequence numbers of sent packets, clearing the internal buffer
    pub async fn sent_sequences(&self) -> Vec<u32> {
        self.sent_packets().await
            .into_iter()
            .map(|p| p.sequence)
            .collect()
    }

    pub async fn set_failing(&self, addr: SocketAddr, failing: bool) {
        Self::set_membership(&self.failing, addr, failing).await;
    }

    pub async fn set_locally_unreachable(&self, addr: SocketAddr, unreachable: bool) {
        Self::set_membership(&self.locally_unreachable, addr, unreachable).await;
    }

    pub async fn set_unsupported(&self, addr: SocketAddr, unsupported: bool) {
        Self::set_membership(&self.unsupported, addr, unsupported).await;
    }

    async fn set_membership(set: &RwLock<FxHashSet<SocketAddr>>, addr: SocketAddr, member: bool) {
        let mut lock = set.write().await;
        if member {
            lock.insert(addr);
        }
        else {
            lock.remove(&addr);
        }
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn send(&self, to: SocketAddr, variant: TransportVariant, packet: &[u8], kind: ReportKind, hash: ContentHash, sequence: u32) -> anyhow::Result<usize> {
        if self.failing.read().await.contains(&to) {
            return Err(anyhow!("network unreachable"));
        }
        if self.locally_unreachable.read().await.contains(&to) {
            return Err(LocalSendError { to, reason: "no socket for the address family" }.into());
        }
        if self.unsupported.read().await.contains(&to) {
            return Ok(0);
        }

        self.tracker.write().await.push(SentPacket {
            to,
            variant,
            packet: packet.to_vec(),
            kind,
            hash,
            sequence,
        });
        Ok(packet.len())
    }
}
