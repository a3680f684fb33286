//! Process-wide routing from foreign device pointers to their controllers.
//!
//! Replacement entry points are plain functions with no closure state; the
//! router is how they find the controller for the device they were invoked on.
//! Reads vastly outnumber writes (every intercepted call resolves, attach and
//! teardown register and unregister), hence the read-write lock. This lock is
//! its own domain: it is never held across a controller's tracker lock or any
//! forwarded foreign call.

use std::sync::{Arc, OnceLock, RwLock};

use hashbrown::HashMap;

use crate::device::DeviceController;

#[derive(Default)]
pub struct Router {
    map: RwLock<HashMap<usize, Arc<DeviceController>>>,
}

impl Router {
    /// The controller attached to `device`, if any. Unknown devices get `None`
    /// and the caller passes the call through untouched.
    pub fn resolve(&self, device: usize) -> Option<Arc<DeviceController>> {
        match self.map.read() {
            Ok(map) => map.get(&device).cloned(),
            // A poisoned router means a panic mid-registration; treating every
            // device as unknown degrades to pass-through rather than crashing
            // the host.
            Err(_) => None,
        }
    }

    pub(crate) fn register(&self, device: usize, controller: Arc<DeviceController>) {
        if let Ok(mut map) = self.map.write() {
            map.insert(device, controller);
        }
    }

    pub(crate) fn unregister(&self, device: usize) -> Option<Arc<DeviceController>> {
        self.map.write().ok().and_then(|mut map| map.remove(&device))
    }

    pub fn is_attached(&self, device: usize) -> bool {
        self.map.read().map(|map| map.contains_key(&device)).unwrap_or(false)
    }
}

static ROUTER: OnceLock<Router> = OnceLock::new();

pub fn global() -> &'static Router {
    ROUTER.get_or_init(Router::default)
}
