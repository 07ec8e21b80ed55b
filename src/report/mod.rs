pub mod header;

use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A report's importance tier. It gates retry and caching: anything above [Severity::Normal] is
///  never written to the overflow cache.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Severity {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub fn is_cacheable(&self) -> bool {
        *self <= Severity::Normal
    }
}

/// The kind of data a report carries. Its numeric value is the packet type on the wire.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ReportKind {
    Event = 1,
    Counter = 2,
    Quality = 3,
    Custom = 4,
}

/// Optional routing tags attached to a report, transmitted as the header's vendor and channel id
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ReportTags {
    pub vendor_id: u32,
    pub channel_id: u32,
}

/// Identifies a report's content independently of its sequence number, so that a report cached
///  several times is stored only once and an acknowledgment of a cache resend finds its entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ContentHash(pub u64);

impl ContentHash {
    pub fn new(kind: ReportKind, payload: &[u8]) -> ContentHash {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();
        digest.update(&[kind.into()]);
        digest.update(payload);
        ContentHash(digest.finalize())
    }
}
