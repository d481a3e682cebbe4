use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::info;
use parking_lot::Mutex;

use crate::{
    config::Config,
    connection::Connection,
    dispatcher::Dispatcher,
    error::{RdmaError, Result},
    mem::{pool::BufferPool, resource::DeviceResource, resource::ResourceManager},
    poller::Poller,
    verbs::{loopback::LoopbackDevice, Device},
};

/// Everything connections on one device share: the registered memory, the
/// buffer pool, the poller thread and the application's dispatcher.
pub struct Context {
    config: Config,
    device: Arc<LoopbackDevice>,
    resource: Arc<DeviceResource>,
    pool: BufferPool,
    poller: Arc<Poller>,
    dispatcher: Arc<dyn Dispatcher>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_connection_id: AtomicU64,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.device)
            .field("resource", &self.resource)
            .field("connections", &self.connections.lock().len())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context on `device`. `pool` must allocate from the memory
    /// managed by `resources`, which is registered with the device here.
    pub fn new(
        config: Config,
        device: Arc<LoopbackDevice>,
        resources: &ResourceManager,
        pool: BufferPool,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Arc<Self>> {
        let _ignore = env_logger::try_init();
        config.validate()?;
        if !Arc::ptr_eq(pool.memory(), resources.memory()) {
            return Err(RdmaError::InvalidInput(
                "buffer pool does not allocate from the registered memory".into(),
            ));
        }
        let dyn_device: Arc<dyn Device> = Arc::clone(&device) as Arc<dyn Device>;
        let resource = resources.get_resource(&dyn_device)?;
        let poller = Poller::spawn(&format!("poller-{}", device.name()))?;
        info!("context created on {}", device.name());
        Ok(Arc::new(Self {
            config,
            device,
            resource,
            pool,
            poller,
            dispatcher,
            connections: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Arc<LoopbackDevice> {
        &self.device
    }

    pub fn resource(&self) -> &Arc<DeviceResource> {
        &self.resource
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Established connections that have not disconnected yet.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Closes every connection and stops the poller thread.
    pub fn shutdown(&self) {
        let connections: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        info!("context shutdown, closing {} connections", connections.len());
        for conn in connections {
            conn.close();
        }
        self.poller.shutdown();
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        let _prev = self.connections.lock().insert(conn.id(), conn);
    }

    pub(crate) fn unregister(&self, id: u64) {
        let _conn = self.connections.lock().remove(&id);
    }
}
