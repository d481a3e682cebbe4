use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use log::{error, info};
use parking_lot::Mutex;

use crate::{
    error::Result,
    verbs::{Device, MrKeys, PdHandle},
};

use super::GlobalMemory;

/// A protection domain plus the registration of the global memory on one
/// device. Shared by every connection opened on that device.
pub struct DeviceResource {
    device: Arc<dyn Device>,
    pd: PdHandle,
    keys: MrKeys,
    memory: Arc<GlobalMemory>,
}

impl std::fmt::Debug for DeviceResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceResource")
            .field("device", &self.device.name())
            .field("pd", &self.pd)
            .field("keys", &self.keys)
            .finish()
    }
}

impl DeviceResource {
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn pd(&self) -> PdHandle {
        self.pd
    }

    pub fn lkey(&self) -> u32 {
        self.keys.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.keys.rkey
    }

    /// Start address of the registered region.
    pub fn addr(&self) -> u64 {
        self.memory.addr()
    }

    /// Length of the registered region.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

impl Drop for DeviceResource {
    fn drop(&mut self) {
        if let Err(err) = self.device.dereg_mr(self.keys) {
            error!("failed to deregister global memory: {err}");
        }
        if let Err(err) = self.device.dealloc_pd(self.pd) {
            error!("failed to deallocate pd {}: {err}", self.pd);
        }
    }
}

/// Registers the global memory once per device and hands out the shared
/// result.
pub struct ResourceManager {
    memory: Arc<GlobalMemory>,
    resources: Mutex<HashMap<String, Weak<DeviceResource>>>,
}

impl ResourceManager {
    pub fn new(memory: Arc<GlobalMemory>) -> Self {
        Self {
            memory,
            resources: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory(&self) -> &Arc<GlobalMemory> {
        &self.memory
    }

    /// Returns the resource of `device`, creating it on first use. The
    /// registration is released when the last holder drops it.
    pub fn get_resource(&self, device: &Arc<dyn Device>) -> Result<Arc<DeviceResource>> {
        let mut resources = self.resources.lock();
        if let Some(res) = resources.get(device.name()).and_then(Weak::upgrade) {
            return Ok(res);
        }
        let pd = device.alloc_pd()?;
        let keys = match device.reg_mr(pd, &self.memory) {
            Ok(keys) => keys,
            Err(err) => {
                if let Err(e) = device.dealloc_pd(pd) {
                    error!("failed to deallocate pd {pd}: {e}");
                }
                return Err(err);
            }
        };
        info!(
            "registered global memory on {}: pd {pd}, lkey {:#x}, rkey {:#x}",
            device.name(),
            keys.lkey,
            keys.rkey
        );
        let res = Arc::new(DeviceResource {
            device: Arc::clone(device),
            pd,
            keys,
            memory: Arc::clone(&self.memory),
        });
        let _old = resources.insert(device.name().to_owned(), Arc::downgrade(&res));
        Ok(res)
    }
}
