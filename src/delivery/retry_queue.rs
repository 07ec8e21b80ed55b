use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::report::{ContentHash, ReportKind, ReportTags, Severity};

#[derive(Debug, Clone)]
pub struct InFlightReport {
    pub sequence: u32,
    pub retry_budget: u32,
    pub severity: Severity,
    pub kind: ReportKind,
    pub payload: Bytes,
    pub hash: ContentHash,
    pub tags: Option<ReportTags>,
    pub enqueued_at: Instant,
    pub last_attempt: Instant,
}

#[derive(Debug, Default)]
pub struct RetryTickResult {
    /// sequence numbers to be sent again - their retry budget was already decremented
    pub resend: Vec<u32>,
    /// reports that ran out of retry budget or time and are no longer tracked
    pub expired: Vec<InFlightReport>,
}

/// Reports that were sent and await acknowledgment, keyed by sequence number.
pub struct RetryQueue {
    max_len: usize,
    entries: BTreeMap<u32, InFlightReport>,
}

impl RetryQueue {
    pub fn new(max_len: usize) -> RetryQueue {
        RetryQueue {
            max_len,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_room(&self) -> bool {
        self.entries.len() < self.max_len
    }

    /// Starts tracking a report. Returns `false` (and does not track it) if the queue is full -
    ///  older entries are never evicted to make room.
    #[must_use]
    pub fn insert(&mut self, report: InFlightReport) -> bool {
        if !self.has_room() || self.entries.contains_key(&report.sequence) {
            return false;
        }
        self.entries.insert(report.sequence, report);
        true
    }

    pub fn get(&self, sequence: u32) -> Option<&InFlightReport> {
        self.entries.get(&sequence)
    }

    pub fn remove(&mut self, sequence: u32) -> Option<InFlightReport> {
        self.entries.remove(&sequence)
    }

    /// Decides the fate of every tracked report: reports without remaining budget or exceeding
    ///  the maximum age are removed and returned as expired, reports whose last attempt is at
    ///  least `resend_interval` ago are due for another attempt.
    pub fn tick(&mut self, now: Instant, resend_interval: Duration, max_age: Duration) -> RetryTickResult {
        let mut result = RetryTickResult::default();

        let expired = self.entries.values()
            .filter(|r| r.retry_budget == 0 || now.saturating_duration_since(r.enqueued_at) >= max_age)
            .map(|r| r.sequence)
            .collect::<Vec<_>>();
        for sequence in expired {
            if let Some(report) = self.entries.remove(&sequence) {
                trace!("in-flight report {} expired", sequence);
                result.expired.push(report);
            }
        }

        for report in self.entries.values_mut() {
            if now.saturating_duration_since(report.last_attempt) >= resend_interval {
                report.retry_budget -= 1;
                report.last_attempt = now;
                result.resend.push(report.sequence);
            }
        }

        result
    }
}
