//! In-process lease table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::trace;

use crate::{DistributedLock, LockError, TtlCounter};

#[derive(Debug)]
struct Entry {
    value: u32,
    expires_at: Instant,
}

/// Lease table held in process memory.
///
/// Provides the same semantics as the database-backed implementation for a
/// single reconciler process: development setups and tests.
#[derive(Debug, Default)]
pub struct MemoryLeases {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held (lock) or set (counter).
    pub fn is_live(&self, key: &str) -> bool {
        let now = Instant::now();
        self.with_entries(|entries| entries.get(key).is_some_and(|e| e.expires_at > now))
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        // A panic while holding the guard cannot leave an entry half-written.
        let mut guard = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl DistributedLock for MemoryLeases {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let acquired = self.with_entries(|entries| match entries.get(key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: 1,
                        expires_at: now + ttl,
                    },
                );
                true
            }
        });
        trace!(key, acquired, "lease acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }
}

#[async_trait]
impl TtlCounter for MemoryLeases {
    async fn get(&self, key: &str) -> Result<Option<u32>, LockError> {
        let now = Instant::now();
        Ok(self.with_entries(|entries| {
            entries
                .get(key)
                .filter(|e| e.expires_at > now)
                .map(|e| e.value)
        }))
    }

    async fn set(&self, key: &str, value: u32, ttl: Duration) -> Result<(), LockError> {
        let expires_at = Instant::now() + ttl;
        self.with_entries(|entries| entries.insert(key.to_owned(), Entry { value, expires_at }));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LockError> {
        self.with_entries(|entries| entries.remove(key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released() {
        let leases = MemoryLeases::new();
        let ttl = Duration::from_secs(60);

        assert!(leases.acquire("sync:ws_a", ttl).await.unwrap());
        assert!(!leases.acquire("sync:ws_a", ttl).await.unwrap());
        assert!(leases.acquire("sync:ws_b", ttl).await.unwrap());

        leases.release("sync:ws_a").await.unwrap();
        assert!(leases.acquire("sync:ws_a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_expires_without_release() {
        let leases = MemoryLeases::new();

        assert!(leases.acquire("gate", Duration::from_millis(10)).await.unwrap());
        assert!(leases.is_live("gate"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!leases.is_live("gate"));
        assert!(leases.acquire("gate", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let leases = Arc::new(MemoryLeases::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let leases = Arc::clone(&leases);
            handles.push(tokio::spawn(async move {
                leases.acquire("contended", Duration::from_secs(5)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_counter_roundtrip_and_expiry() {
        let leases = MemoryLeases::new();

        assert_eq!(leases.get("retry").await.unwrap(), None);
        leases.set("retry", 2, Duration::from_secs(60)).await.unwrap();
        assert_eq!(leases.get("retry").await.unwrap(), Some(2));
        leases.delete("retry").await.unwrap();
        assert_eq!(leases.get("retry").await.unwrap(), None);

        leases.set("short", 1, Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(leases.get("short").await.unwrap(), None);
    }
}
