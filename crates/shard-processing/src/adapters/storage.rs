//! In-memory persisted units and the bootstrap store on top of them.

use crate::domain::BootstrapData;
use crate::error::{ProcessError, ProcessResult};
use crate::ports::{nonce_key, BootstrapStorer, StorageService, UnitType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Every unit as a hash map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    units: RwLock<HashMap<UnitType, HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in `unit`.
    pub fn unit_len(&self, unit: UnitType) -> usize {
        self.units.read().get(&unit).map_or(0, HashMap::len)
    }
}

impl StorageService for MemoryStorage {
    fn put(&self, unit: UnitType, key: &[u8], value: Vec<u8>) -> ProcessResult<()> {
        self.units
            .write()
            .entry(unit)
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    fn get(&self, unit: UnitType, key: &[u8]) -> ProcessResult<Vec<u8>> {
        self.units
            .read()
            .get(&unit)
            .and_then(|u| u.get(key).cloned())
            .ok_or_else(|| ProcessError::not_found(format!("{unit:?} key {}", hex::encode(key))))
    }

    fn has(&self, unit: UnitType, key: &[u8]) -> bool {
        self.units
            .read()
            .get(&unit)
            .is_some_and(|u| u.contains_key(key))
    }

    fn remove(&self, unit: UnitType, key: &[u8]) -> ProcessResult<()> {
        if let Some(u) = self.units.write().get_mut(&unit) {
            u.remove(key);
        }
        Ok(())
    }
}

const HIGHEST_ROUND_KEY: &[u8] = b"highest_round";

/// [`BootstrapStorer`] writing into the `Bootstrap` unit of a storage service.
pub struct StorageBootstrapper {
    storage: Arc<dyn StorageService>,
}

impl StorageBootstrapper {
    pub fn new(storage: Arc<dyn StorageService>) -> Self {
        Self { storage }
    }
}

impl BootstrapStorer for StorageBootstrapper {
    fn put(&self, round: u64, data: &BootstrapData) -> ProcessResult<()> {
        let bytes = data.marshal()?;
        self.storage
            .put(UnitType::Bootstrap, &nonce_key(round), bytes)?;
        self.storage.put(
            UnitType::Bootstrap,
            HIGHEST_ROUND_KEY,
            nonce_key(round).to_vec(),
        )
    }

    fn get(&self, round: u64) -> ProcessResult<BootstrapData> {
        let bytes = self.storage.get(UnitType::Bootstrap, &nonce_key(round))?;
        BootstrapData::unmarshal(&bytes)
    }

    fn highest_round(&self) -> Option<u64> {
        let bytes = self.storage.get(UnitType::Bootstrap, HIGHEST_ROUND_KEY).ok()?;
        let raw: [u8; 8] = bytes.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }
}
