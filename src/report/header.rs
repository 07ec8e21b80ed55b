use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::report::Severity;

/// Whether a payload length precedes the payload on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WireVariant {
    Plain,
    LengthPrefixed,
}

/// The fixed size header preceding every report payload. All numbers are in network byte order.
///
/// ```ascii
///  0: packet type (u8) - the report kind, or ACK for acknowledgments
///  1: qos flags (u8)
///     * bit 0: acknowledgment requested
///     * bit 1: high priority
///  2: sequence number (u32)
///  6: send timestamp, seconds since epoch (u32)
/// 10: vendor id (u32)
/// 14: channel id (u32)
/// 18: payload length (u16) - only for [WireVariant::LengthPrefixed]
/// *:  payload
/// ```
///
/// An acknowledgment is a bare header with packet type [ReportHeader::PACKET_TYPE_ACK], carrying
///  the acknowledged sequence number.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReportHeader {
    pub packet_type: u8,
    pub qos: u8,
    pub sequence: u32,
    pub sent_timestamp_secs: u32,
    pub vendor_id: u32,
    pub channel_id: u32,
}

impl ReportHeader {
    pub const SERIALIZED_LEN: usize = 2 + 4 * size_of::<u32>();

    pub const PACKET_TYPE_ACK: u8 = 0x80;

    pub const QOS_ACK_REQUESTED: u8 = 0x01;
    pub const QOS_HIGH_PRIORITY: u8 = 0x02;

    pub fn qos_for(severity: Severity, ack_requested: bool) -> u8 {
        let mut qos = 0;
        if ack_requested {
            qos |= Self::QOS_ACK_REQUESTED;
        }
        if severity > Severity::Normal {
            qos |= Self::QOS_HIGH_PRIORITY;
        }
        qos
    }

    pub fn ack(sequence: u32) -> ReportHeader {
        ReportHeader {
            packet_type: Self::PACKET_TYPE_ACK,
            qos: 0,
            sequence,
            sent_timestamp_secs: 0,
            vendor_id: 0,
            channel_id: 0,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.packet_type == Self::PACKET_TYPE_ACK
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type);
        buf.put_u8(self.qos);
        buf.put_u32(self.sequence);
        buf.put_u32(self.sent_timestamp_secs);
        buf.put_u32(self.vendor_id);
        buf.put_u32(self.channel_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ReportHeader> {
        Ok(ReportHeader {
            packet_type: buf.try_get_u8()?,
            qos: buf.try_get_u8()?,
            sequence: buf.try_get_u32()?,
            sent_timestamp_secs: buf.try_get_u32()?,
            vendor_id: buf.try_get_u32()?,
            channel_id: buf.try_get_u32()?,
        })
    }

    /// Frames a payload for sending: header, optional length prefix, payload
    pub fn frame(&self, wire_variant: WireVariant, payload: &[u8]) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN + 2 + payload.len());
        self.ser(&mut buf);
        if wire_variant == WireVariant::LengthPrefixed {
            let len: u16 = match payload.len().try_into() {
                Ok(len) => len,
                Err(_) => bail!("payload of {} bytes exceeds the length prefix range", payload.len()),
            };
            buf.put_u16(len);
        }
        buf.put_slice(payload);
        Ok(buf)
    }

    /// The inverse of [ReportHeader::frame], returning the header and the payload
    pub fn unframe(mut buf: &[u8], wire_variant: WireVariant) -> anyhow::Result<(ReportHeader, &[u8])> {
        let header = Self::deser(&mut buf)?;
        if wire_variant == WireVariant::LengthPrefixed {
            let len = buf.try_get_u16()? as usize;
            if len != buf.len() {
                bail!("payload length prefix {} does not match actual payload length {}", len, buf.len());
            }
        }
        Ok((header, buf))
    }
}
