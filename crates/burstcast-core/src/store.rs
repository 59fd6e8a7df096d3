//! In-memory target config store — for embedding and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{BurstError, Result};
use crate::traits::ConfigStore;
use crate::types::TargetConfig;

/// Config store kept entirely in memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryConfigStore {
    targets: Mutex<HashMap<String, TargetConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, TargetConfig>>> {
        self.targets
            .lock()
            .map_err(|_| BurstError::Store("config store lock poisoned".into()))
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, id: &str) -> Result<Option<TargetConfig>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn list(&self) -> Result<HashMap<String, TargetConfig>> {
        Ok(self.lock()?.clone())
    }

    fn upsert(&self, id: &str, config: &TargetConfig) -> Result<()> {
        self.lock()?.insert(id.to_string(), config.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        match self.lock()?.remove(id) {
            Some(_) => Ok(()),
            None => Err(BurstError::NotFound(id.to_string())),
        }
    }

    fn set_running(&self, id: &str, running: bool) -> Result<()> {
        let mut targets = self.lock()?;
        let target = targets
            .get_mut(id)
            .ok_or_else(|| BurstError::NotFound(id.to_string()))?;
        target.running = running;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_get_delete() {
        let store = MemoryConfigStore::new();
        let cfg = TargetConfig::channel("c1", "general", "ping");
        store.upsert("c1", &cfg).unwrap();
        assert_eq!(store.get("c1").unwrap(), Some(cfg));
        assert_eq!(store.list().unwrap().len(), 1);

        store.delete("c1").unwrap();
        assert!(store.get("c1").unwrap().is_none());
        assert!(matches!(store.delete("c1"), Err(BurstError::NotFound(_))));
    }

    #[test]
    fn test_set_running_requires_target() {
        let store = MemoryConfigStore::new();
        assert!(store.set_running("missing", true).is_err());

        store.upsert("c1", &TargetConfig::channel("c1", "general", "ping")).unwrap();
        store.set_running("c1", true).unwrap();
        assert!(store.get("c1").unwrap().unwrap().running);
    }
}
