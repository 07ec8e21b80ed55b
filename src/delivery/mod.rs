pub mod driver;
pub mod engine;
pub mod overflow_cache;
pub mod refresh;
pub mod retry_queue;
pub mod stats;

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::endpoint::TransportVariant;
use crate::report::{ReportKind, ReportTags, Severity};

/// A report as submitted by a caller
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub payload: Bytes,
    pub severity: Severity,
    pub kind: ReportKind,
    /// number of resend attempts if the report is not acknowledged; 0 means fire-and-forget
    pub retry_budget: u32,
    pub tags: Option<ReportTags>,
}

impl ReportRequest {
    pub fn new(payload: impl Into<Bytes>, severity: Severity, kind: ReportKind, retry_budget: u32) -> ReportRequest {
        ReportRequest {
            payload: payload.into(),
            severity,
            kind,
            retry_budget,
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: ReportTags) -> ReportRequest {
        self.tags = Some(tags);
        self
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetworkKind {
    Unknown,
    None,
    Ethernet,
    Wifi,
    Cellular2G,
    Cellular3G,
    Cellular4G,
    Cellular5G,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NetworkInfo {
    pub kind: NetworkKind,
    pub has_ipv4: bool,
    pub has_ipv6: bool,
}

impl NetworkInfo {
    pub fn unknown() -> NetworkInfo {
        NetworkInfo {
            kind: NetworkKind::Unknown,
            has_ipv4: true,
            has_ipv6: true,
        }
    }

    pub fn is_low_bandwidth(&self) -> bool {
        self.kind == NetworkKind::Cellular2G
    }
}

/// Notifications from the host environment, delivered to the engine via a broadcast channel
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HostEvent {
    NetworkChanged(NetworkInfo),
    TransportVariantChanged(TransportVariant),
    /// connectivity came back after an outage - backoff accumulated during the outage is moot
    ConnectivityRestored,
}

pub(crate) fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
