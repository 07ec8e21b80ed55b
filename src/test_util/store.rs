use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::collab::CacheStore;
use crate::delivery::overflow_cache::CacheEntry;

/// Keeps the overflow cache snapshot in memory, counting flushes
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    snapshot: RwLock<Vec<CacheEntry>>,
    num_flushes: RwLock<usize>,
}

impl InMemoryCacheStore {
    pub fn new() -> InMemoryCacheStore {
        Default::default()
    }

    pub fn with_snapshot(snapshot: Vec<CacheEntry>) -> InMemoryCacheStore {
        InMemoryCacheStore {
            snapshot: RwLock::new(snapshot),
            num_flushes: Default::default(),
        }
    }

    pub async fn snapshot(&self) -> Vec<CacheEntry> {
        self.snapshot.read().await.clone()
    }

    pub async fn num_flushes(&self) -> usize {
        *self.num_flushes.read().await
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn load_snapshot(&self) -> anyhow::Result<Vec<CacheEntry>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save_snapshot(&self, entries: &[CacheEntry]) -> anyhow::Result<()> {
        *self.snapshot.write().await = entries.to_vec();
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        *self.num_flushes.write().await += 1;
        Ok(())
    }
}
