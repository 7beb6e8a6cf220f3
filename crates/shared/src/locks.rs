//! Per-key async mutual exclusion
//!
//! Callers racing on the same key (an email address, a sheet name) queue on a
//! shared `tokio::sync::Mutex`; unrelated keys never contend. Entries are
//! dropped from the map once the last guard for a key is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    slots: Arc<Mutex<Slots>>,
}

/// Held while the caller owns the key
pub struct KeyedGuard {
    key: String,
    slot: Arc<AsyncMutex<()>>,
    slots: Arc<Mutex<Slots>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized key for email-scoped locks
    pub fn email_key(email: &str) -> String {
        email.trim().to_lowercase()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the map lock cannot leave it inconsistent
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = self
            .slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = slot.clone().lock_owned().await;

        KeyedGuard {
            key: key.to_string(),
            slot,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.slots().len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map and this guard hold the only references: nobody is waiting
        if Arc::strong_count(&self.slot) == 2 {
            if let Some(existing) = slots.get(&self.key) {
                if Arc::ptr_eq(existing, &self.slot) {
                    slots.remove(&self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("a@example.com").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active_keys(), 2);
    }

    #[tokio::test]
    async fn test_entry_survives_while_waiter_queued() {
        let locks = KeyedLocks::new();
        let first = locks.lock("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(first);
        assert_eq!(locks.active_keys(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.active_keys(), 0);
    }

    #[test]
    fn test_email_key_normalization() {
        assert_eq!(KeyedLocks::email_key("  Jane@Example.COM "), "jane@example.com");
    }
}
