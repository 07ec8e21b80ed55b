use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::DeliveryConfig;
use crate::endpoint::endpoint::{Endpoint, EndpointId, Outcome};
use crate::endpoint::{synthesized_twin, EndpointSource, FamilyFilter, TransportVariant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndpointState {
    Available,
    InUse,
    Disabled,
}

/// The selector owns the population of known ingestion endpoints and hands them out for sending.
///
/// Endpoints live in an arena keyed by [EndpointId], and each id is in exactly one of three lists:
/// * `available`: candidates for selection, in order of consideration
/// * `in_use`: handed out and awaiting an outcome, oldest first
/// * `disabled`: known to be unusable until re-admitted or reset
///
/// Priority among available endpoints is purely positional: endpoints that just succeeded and
///  endpoints that were just admitted go to the head, failed endpoints go to the tail. There is
///  no clock based ranking.
pub struct EndpointSelector {
    config: Arc<DeliveryConfig>,
    arena: FxHashMap<EndpointId, Endpoint>,
    by_addr: FxHashMap<(SocketAddr, TransportVariant), EndpointId>,
    next_id: u32,
    available: VecDeque<EndpointId>,
    in_use: VecDeque<EndpointId>,
    disabled: VecDeque<EndpointId>,
}

impl EndpointSelector {
    pub fn new(config: Arc<DeliveryConfig>) -> EndpointSelector {
        EndpointSelector {
            config,
            arena: Default::default(),
            by_addr: Default::default(),
            next_id: 0,
            available: Default::default(),
            in_use: Default::default(),
            disabled: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Admits a list of addresses, returning the number of newly created endpoints (including
    ///  synthesized twins).
    pub fn admit(&mut self, addrs: &[SocketAddr], variant: TransportVariant, source: EndpointSource) -> usize {
        let mut num_new = 0;
        for addr in addrs {
            if self.admit_one(*addr, variant, source) {
                num_new += 1;
                if let Some(twin) = synthesized_twin(addr) {
                    if self.admit_one(twin, variant, source) {
                        num_new += 1;
                    }
                }
            }
        }
        debug!("admitted {} new endpoints from {:?} for {:?}, {} known in total", num_new, source, variant, self.arena.len());
        num_new
    }

    /// returns `true` if a new endpoint was created
    fn admit_one(&mut self, addr: SocketAddr, variant: TransportVariant, source: EndpointSource) -> bool {
        if let Some(&id) = self.by_addr.get(&(addr, variant)) {
            if let Some(ep) = self.arena.get_mut(&id) {
                if source < ep.source {
                    ep.source = source;
                }
            }

            if let Some(pos) = self.disabled.iter().position(|&d| d == id) {
                trace!("recycling disabled endpoint {:?}", addr);
                self.disabled.remove(pos);
                if let Some(ep) = self.arena.get_mut(&id) {
                    ep.reset_backoff();
                }
                self.available.push_back(id);
            }
            return false;
        }

        let id = EndpointId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        trace!("new endpoint {:?} ({:?}) as {:?}", addr, variant, id);
        self.arena.insert(id, Endpoint::new(addr, variant, source));
        self.by_addr.insert((addr, variant), id);
        self.available.push_front(id);
        true
    }

    /// Hands out the first available endpoint matching the criteria that is not backing off, or
    ///  `None` if there is none - which is a regular situation during an outage.
    pub fn select(&mut self, family: FamilyFilter, variant: TransportVariant) -> Option<SocketAddr> {
        let now = Instant::now();

        let arena = &self.arena;
        let pos = self.available.iter().position(|id| {
            arena.get(id)
                .map(|ep| ep.variant == variant && family.matches(ep.family) && ep.is_eligible(now))
                .unwrap_or(false)
        })?;

        let id = self.available.remove(pos)?;
        let ep = self.arena.get_mut(&id)?;
        ep.next_eligible_time = Some(now);
        self.in_use.push_back(id);

        trace!("selected endpoint {:?}", ep.addr);
        Some(ep.addr)
    }

    /// Returns an in-use endpoint to the pool. Returns `false` if no endpoint with this address
    ///  is in use.
    pub fn report_outcome(&mut self, addr: SocketAddr, outcome: Outcome) -> bool {
        let arena = &self.arena;
        let pos = match self.in_use.iter()
            .position(|id| arena.get(id).map(|ep| ep.addr == addr).unwrap_or(false))
        {
            Some(pos) => pos,
            None => return false,
        };

        if let Some(id) = self.in_use.remove(pos) {
            self.release(id, outcome);
        }
        true
    }

    fn release(&mut self, id: EndpointId, outcome: Outcome) {
        let ep = match self.arena.get_mut(&id) {
            Some(ep) => ep,
            None => {
                warn!("endpoint list refers to unknown id {:?} - dropping it", id);
                return;
            }
        };

        match outcome {
            Outcome::Success | Outcome::Recycled => {
                ep.reset_backoff();
                if outcome == Outcome::Success {
                    ep.has_ever_succeeded = true;
                }
                self.available.push_front(id);
            }
            Outcome::Failed => {
                ep.apply_failure(Instant::now(), self.config.backoff_initial, self.config.backoff_max);
                debug!("endpoint {:?} failed, backing off for {:?}", ep.addr, ep.backoff);
                self.available.push_back(id);
            }
        }
    }

    /// Recycles endpoints that were in use for longer than `timeout` without an outcome, without
    ///  penalizing them. They are returned oldest first.
    pub fn sweep_timed_out(&mut self, timeout: Duration) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut result = Vec::new();

        while let Some(&id) = self.in_use.front() {
            let (addr, in_use_since) = match self.arena.get(&id) {
                Some(ep) => (ep.addr, ep.next_eligible_time.unwrap_or(now)),
                None => {
                    self.in_use.pop_front();
                    continue;
                }
            };

            if now.saturating_duration_since(in_use_since) <= timeout {
                break;
            }

            debug!("endpoint {:?} in use for more than {:?} - recycling", addr, timeout);
            self.in_use.pop_front();
            self.release(id, Outcome::Recycled);
            result.push(addr);
        }
        result
    }

    /// Marks an endpoint as unusable. It stays known (so it is not re-created by the next
    ///  admission), and is recycled by re-admission or [EndpointSelector::reset_all].
    pub fn disable(&mut self, addr: SocketAddr, variant: TransportVariant) -> bool {
        let id = match self.by_addr.get(&(addr, variant)) {
            Some(&id) => id,
            None => return false,
        };
        if self.disabled.contains(&id) {
            return true;
        }

        self.available.retain(|&i| i != id);
        self.in_use.retain(|&i| i != id);
        self.disabled.push_back(id);
        debug!("disabled endpoint {:?} ({:?})", addr, variant);
        true
    }

    /// Moves every known endpoint back to 'available' with its backoff cleared
    pub fn reset_all(&mut self) {
        while let Some(id) = self.in_use.pop_front() {
            self.available.push_back(id);
        }
        while let Some(id) = self.disabled.pop_front() {
            self.available.push_back(id);
        }
        for ep in self.arena.values_mut() {
            ep.reset_backoff();
        }
        debug!("reset all {} endpoints", self.arena.len());
    }

    /// Removes all endpoints of a given variant, or all endpoints if `variant` is `None`.
    pub fn clear_by_variant(&mut self, variant: Option<TransportVariant>) {
        let removed = self.arena.iter()
            .filter(|(_, ep)| variant.map(|v| ep.variant == v).unwrap_or(true))
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        for id in &removed {
            if let Some(ep) = self.arena.remove(id) {
                self.by_addr.remove(&(ep.addr, ep.variant));
            }
        }

        let arena = &self.arena;
        self.available.retain(|id| arena.contains_key(id));
        self.in_use.retain(|id| arena.contains_key(id));
        self.disabled.retain(|id| arena.contains_key(id));

        debug!("cleared {} endpoints for {:?}", removed.len(), variant);
    }

    pub fn count_by_family(&self, family: FamilyFilter, variant: TransportVariant) -> usize {
        self.arena.values()
            .filter(|ep| ep.variant == variant && family.matches(ep.family))
            .count()
    }

    pub fn get(&self, addr: SocketAddr, variant: TransportVariant) -> Option<&Endpoint> {
        self.by_addr.get(&(addr, variant))
            .and_then(|id| self.arena.get(id))
    }

    pub fn state_of(&self, addr: SocketAddr, variant: TransportVariant) -> Option<EndpointState> {
        let id = self.by_addr.get(&(addr, variant))?;
        if self.available.contains(id) {
            Some(EndpointState::Available)
        }
        else if self.in_use.contains(id) {
            Some(EndpointState::InUse)
        }
        else if self.disabled.contains(id) {
            Some(EndpointState::Disabled)
        }
        else {
            None
        }
    }

    /// available endpoints in order of consideration
    pub fn available_addrs(&self) -> Vec<SocketAddr> {
        self.available.iter()
            .filter_map(|id| self.arena.get(id))
            .map(|ep| ep.addr)
            .collect()
    }

    pub fn endpoints_by_source(&self) -> BTreeMap<EndpointSource, Vec<SocketAddr>> {
        let mut result: BTreeMap<EndpointSource, Vec<SocketAddr>> = BTreeMap::new();
        for ep in self.arena.values() {
            result.entry(ep.source).or_default().push(ep.addr);
        }
        for addrs in result.values_mut() {
            addrs.sort();
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn assert_list_invariant(&self) {
        for id in self.arena.keys() {
            let memberships = [&self.available, &self.in_use, &self.disabled].iter()
                .map(|l| l.iter().filter(|&i| i == id).count())
                .sum::<usize>();
            assert_eq!(memberships, 1, "endpoint {:?} is in {} lists", id, memberships);
        }
        assert_eq!(self.available.len() + self.in_use.len() + self.disabled.len(), self.arena.len());
        assert_eq!(self.by_addr.len(), self.arena.len());
    }
}
