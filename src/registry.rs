use std::collections::{BTreeSet, HashSet};
use std::sync::{PoisonError, RwLock};

/// The set of devices that currently have a live connection.
///
/// Written only by the connection cache, on creation success and on eviction.
/// Readers get a point-in-time snapshot for observability.
#[derive(Debug, Default)]
pub struct RegisteredDevices {
    devices: RwLock<HashSet<String, ahash::RandomState>>,
}

impl RegisteredDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the device was already registered.
    pub(crate) fn add(&self, device_id: &str) -> bool {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device_id.to_owned())
    }

    /// Returns false if the device was not registered.
    pub(crate) fn remove(&self, device_id: &str) -> bool {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(device_id)
    }

    /// Consistent copy of the registered device ids, sorted.
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
