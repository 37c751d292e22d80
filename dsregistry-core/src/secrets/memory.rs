//! In-memory secret controller.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::SecretController;
use crate::Result;
use crate::error::RegistryError;

/// Ephemeral controller; secrets are lost when it is dropped.
///
/// It can be switched into a failing mode to exercise the registry's
/// degraded path when a secure store is locked.
#[derive(Default)]
pub struct MemorySecretController {
    values: Mutex<BTreeMap<String, String>>,
    locked: AtomicBool,
}

impl std::fmt::Debug for MemorySecretController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretController")
            .field("keys", &self.values.lock().len())
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemorySecretController {
    /// Creates an empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail until unlocked.
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }

    fn check(&self) -> Result<()> {
        if self.locked.load(Ordering::SeqCst) {
            Err(RegistryError::secret_storage("Secret storage is locked"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SecretController for MemorySecretController {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Option<String>) -> Result<()> {
        self.check()?;
        let mut values = self.values.lock();
        match value {
            Some(value) => {
                values.insert(key.to_string(), value);
            }
            None => {
                values.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        let prefix = format!("{}/", key);
        self.values
            .lock()
            .retain(|k, _| k != key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.check()
    }

    fn is_available(&self) -> bool {
        !self.locked.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let controller = MemorySecretController::new();
        for key in ["ds/a", "ds/a/network/ssh", "ds/ab"] {
            controller.set(key, Some("v".to_string())).await.unwrap();
        }
        controller.delete("ds/a").await.unwrap();
        assert_eq!(controller.keys(), ["ds/ab"]);
    }

    #[tokio::test]
    async fn test_locked_controller_fails() {
        let controller = MemorySecretController::new();
        controller.set_locked(true);
        assert!(!controller.is_available());
        assert!(controller.get("k").await.is_err());
        controller.set_locked(false);
        assert!(controller.get("k").await.unwrap().is_none());
    }
}
