//! Registry of live-device counter blocks.
//!
//! One [`LiveDevice`] exists per captured interface, shared by every worker
//! on it. Reads happen on the per-packet path, so the map is lock-free.

use std::sync::Arc;

use dashmap::DashMap;
use harrier_common::LiveDevice;

#[derive(Default)]
pub struct LiveDeviceRegistry {
    devices: DashMap<String, Arc<LiveDevice>>,
}

impl LiveDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_register(&self, name: &str) -> Arc<LiveDevice> {
        self.devices
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LiveDevice::new(name)))
            .clone()
    }

    #[allow(dead_code)]
    pub fn get(&self, name: &str) -> Option<Arc<LiveDevice>> {
        self.devices.get(name).map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_yields_same_device() {
        let registry = LiveDeviceRegistry::new();
        let a = registry.get_or_register("em0");
        let b = registry.get_or_register("em0");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("em1").is_none());
    }
}
