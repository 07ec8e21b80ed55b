use std::cmp::min;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::endpoint::{EndpointSource, IpFamily, TransportVariant};

/// Stable arena index of an [Endpoint]. Ids are never reused for the lifetime of a selector, so
///  a stale id simply fails to resolve after the arena was cleared.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EndpointId(pub(crate) u32);

impl Debug for EndpointId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The result of using an endpoint, as reported back to the selector
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// the endpoint acknowledged a report
    Success,
    /// the endpoint is handed back without evidence either way, e.g. after a response timeout.
    ///  This does not count as a failure.
    Recycled,
    /// the endpoint itself is implicated in a failure
    Failed,
}

#[derive(Clone, Debug)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub family: IpFamily,
    pub variant: TransportVariant,
    pub source: EndpointSource,
    /// `None` means immediately eligible. While the endpoint is in use, this holds the time it
    ///  was handed out.
    pub next_eligible_time: Option<Instant>,
    pub backoff: Duration,
    pub has_ever_succeeded: bool,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, variant: TransportVariant, source: EndpointSource) -> Endpoint {
        Endpoint {
            addr,
            family: IpFamily::of(&addr),
            variant,
            source,
            next_eligible_time: None,
            backoff: Duration::ZERO,
            has_ever_succeeded: false,
        }
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.next_eligible_time {
            None => true,
            Some(t) => t <= now,
        }
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = Duration::ZERO;
        self.next_eligible_time = None;
    }

    /// First failure, or any failure of an endpoint that never succeeded, starts at the initial
    ///  backoff. Subsequent failures double the previous backoff up to the maximum.
    pub fn apply_failure(&mut self, now: Instant, initial: Duration, max: Duration) {
        self.backoff = if self.backoff.is_zero() || !self.has_ever_succeeded {
            initial
        }
        else {
            min(self.backoff.saturating_mul(2), max)
        };
        self.next_eligible_time = Some(now + self.backoff);
    }
}
