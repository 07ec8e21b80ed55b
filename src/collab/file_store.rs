use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::collab::CacheStore;
use crate::delivery::overflow_cache::CacheEntry;
use crate::report::{ContentHash, ReportKind, ReportTags, Severity};

const MAGIC: &[u8; 4] = b"RUPC";
const VERSION: u8 = 1;

const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Persists the overflow cache as a single snapshot file.
///
/// File format, all numbers in network byte order:
/// ```ascii
/// 0: magic "RUPC"
/// 4: version (u8)
/// 5: number of entries (varint)
/// *: entries:
///    * content hash (u64)
///    * severity (u8)
///    * report kind (u8)
///    * enqueued at, seconds since epoch (u64)
///    * tags flag (u8): 1 if vendor id (u32) and channel id (u32) follow, 0 otherwise
///    * payload length (varint)
///    * payload
/// *: CRC-32 (iSCSI) of everything before (u32)
/// ```
///
/// A missing or corrupt file loads as an empty cache.
pub struct FileCacheStore {
    path: PathBuf,
}

impl FileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> FileCacheStore {
        FileCacheStore {
            path: path.into(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

pub fn encode_snapshot(entries: &[CacheEntry]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_usize_varint(entries.len());

    for entry in entries {
        buf.put_u64(entry.hash.0);
        buf.put_u8(entry.severity.into());
        buf.put_u8(entry.kind.into());
        buf.put_u64(entry.enqueued_at_secs);
        match entry.tags {
            Some(tags) => {
                buf.put_u8(1);
                buf.put_u32(tags.vendor_id);
                buf.put_u32(tags.channel_id);
            }
            None => buf.put_u8(0),
        }
        buf.put_usize_varint(entry.payload.len());
        buf.put_slice(&entry.payload);
    }

    let checksum = CRC.checksum(&buf);
    buf.put_u32(checksum);
    buf
}

pub fn decode_snapshot(data: &[u8]) -> anyhow::Result<Vec<CacheEntry>> {
    if data.len() < MAGIC.len() + 1 + size_of::<u32>() {
        bail!("snapshot is truncated");
    }
    let (content, mut trailer) = data.split_at(data.len() - size_of::<u32>());
    let expected_checksum = trailer.try_get_u32()?;
    let actual_checksum = CRC.checksum(content);
    if expected_checksum != actual_checksum {
        bail!("snapshot checksum mismatch: expected {:x}, was {:x}", expected_checksum, actual_checksum);
    }

    let mut buf = content;
    if &buf[..MAGIC.len()] != MAGIC {
        bail!("not a cache snapshot");
    }
    buf.advance(MAGIC.len());

    let version = buf.try_get_u8()?;
    if version != VERSION {
        bail!("unsupported snapshot version {}", version);
    }

    let num_entries = buf.try_get_usize_varint()?;
    let mut entries = Vec::new();
    for _ in 0..num_entries {
        let hash = ContentHash(buf.try_get_u64()?);
        let severity = Severity::try_from(buf.try_get_u8()?)?;
        let kind = ReportKind::try_from(buf.try_get_u8()?)?;
        let enqueued_at_secs = buf.try_get_u64()?;
        let tags = match buf.try_get_u8()? {
            0 => None,
            1 => Some(ReportTags {
                vendor_id: buf.try_get_u32()?,
                channel_id: buf.try_get_u32()?,
            }),
            other => bail!("invalid tags flag {}", other),
        };
        let payload_len = buf.try_get_usize_varint()?;
        if buf.remaining() < payload_len {
            bail!("payload length {} exceeds remaining snapshot data", payload_len);
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        entries.push(CacheEntry {
            hash,
            severity,
            kind,
            payload,
            enqueued_at_secs,
            tags,
        });
    }

    if buf.has_remaining() {
        bail!("{} bytes of trailing data after the last entry", buf.remaining());
    }
    Ok(entries)
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn load_snapshot(&self) -> anyhow::Result<Vec<CacheEntry>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no cache snapshot at {:?}", self.path);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match decode_snapshot(&data) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!("discarding corrupt cache snapshot {:?}: {}", self.path, e);
                Ok(Vec::new())
            }
        }
    }

    /// Replaces the snapshot file atomically
    async fn save_snapshot(&self, entries: &[CacheEntry]) -> anyhow::Result<()> {
        let buf = encode_snapshot(entries);
        let tmp_path = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Snapshots are written completely by [FileCacheStore::save_snapshot], there is nothing
    ///  buffered
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn entries() -> Vec<CacheEntry> {
        vec![
            CacheEntry {
                hash: ContentHash::new(ReportKind::Event, b"abc"),
                severity: Severity::Low,
                kind: ReportKind::Event,
                payload: Bytes::from_static(b"abc"),
                enqueued_at_secs: 1_700_000_000,
                tags: None,
            },
            CacheEntry {
                hash: ContentHash::new(ReportKind::Quality, &[7; 300]),
                severity: Severity::Normal,
                kind: ReportKind::Quality,
                payload: Bytes::from(vec![7; 300]),
                enqueued_at_secs: 1_700_000_123,
                tags: Some(ReportTags { vendor_id: 12, channel_id: 3 }),
            },
        ]
    }

    fn temp_path() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!("report-uplink-test-{}-{}.snapshot", std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst)))
    }

    #[test]
    fn test_encode_decode() {
        let encoded = encode_snapshot(&entries());
        assert_eq!(&encoded[..5], b"RUPC\x01");
        assert_eq!(decode_snapshot(&encoded).unwrap(), entries());

        let empty = encode_snapshot(&[]);
        assert!(decode_snapshot(&empty).unwrap().is_empty());
    }

    #[rstest]
    #[case::flipped_payload_byte(20)]
    #[case::flipped_magic(0)]
    #[case::flipped_checksum(-1)]
    fn test_decode_corrupt(#[case] offset: isize) {
        let mut encoded = encode_snapshot(&entries()).to_vec();
        let idx = if offset < 0 { encoded.len() - offset.unsigned_abs() } else { offset as usize };
        encoded[idx] ^= 0x55;
        assert!(decode_snapshot(&encoded).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = encode_snapshot(&entries());
        assert!(decode_snapshot(&encoded[..encoded.len() - 10]).is_err());
        assert!(decode_snapshot(&encoded[..3]).is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let path = temp_path();
        let store = FileCacheStore::new(&path);

        assert!(store.load_snapshot().await.unwrap().is_empty());

        store.save_snapshot(&entries()).await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap(), entries());

        store.save_snapshot(&entries()[..1]).await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap(), entries()[..1].to_vec());

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let path = temp_path();
        tokio::fs::write(&path, b"definitely not a snapshot").await.unwrap();

        let store = FileCacheStore::new(&path);
        assert!(store.load_snapshot().await.unwrap().is_empty());

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
