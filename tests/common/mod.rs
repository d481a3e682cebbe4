#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rdma_messenger::{
    verbs::loopback::LoopbackFabric, Acceptor, Buffer, BufferPool, Config, Connection,
    ConnectionEvent, Connector, Context, Dispatcher, GlobalMemory, ResourceManager,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data { conn: u64, ty: u32, bytes: Vec<u8> },
    Connected(u64),
    Disconnected(u64),
}

/// Dispatcher that records everything it is handed. While held, data
/// dispatch blocks the poller thread after recording.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
    held: Mutex<bool>,
    released: Condvar,
}

impl Recorder {
    pub fn hold(&self) {
        *self.held.lock() = true;
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        let _woken = self.released.notify_all();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Payloads of every data event, in dispatch order.
    pub fn data(&self) -> Vec<(u32, Vec<u8>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match *e {
                Event::Data { ty, ref bytes, .. } => Some((ty, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Waits until `pred` holds for the recorded events.
    pub fn wait_until<F>(&self, pred: F) -> bool
    where
        F: Fn(&[Event]) -> bool,
    {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        loop {
            if pred(&events) {
                return true;
            }
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return pred(&events);
            }
        }
    }

    pub fn wait_for_data(&self, n: usize) -> bool {
        self.wait_until(|events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::Data { .. }))
                .count()
                >= n
        })
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
        let _woken = self.changed.notify_all();
    }
}

impl Dispatcher for Recorder {
    fn dispatch_data_event(&self, ty: u32, buffer: Buffer, conn: &Arc<Connection>) {
        self.record(Event::Data {
            conn: conn.id(),
            ty,
            bytes: buffer.to_vec(),
        });
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }

    fn dispatch_connection_event(&self, event: ConnectionEvent, conn: &Arc<Connection>) {
        self.record(match event {
            ConnectionEvent::Connected => Event::Connected(conn.id()),
            ConnectionEvent::Disconnected => Event::Disconnected(conn.id()),
        });
    }
}

/// Polls `cond` until it holds or the timeout passes.
pub fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A small layout that runs out of credit quickly.
pub fn small_config() -> Config {
    let mut config = Config::default();
    config.connection.recv_buffer_size = 256;
    config.connection.recv_buffer_count = 32;
    config.connection.credit_threshold = 8;
    config.connection.reserved_credit = 4;
    config.connection.max_send_wr = 64;
    config.connection.ctrl_buffer_count = 8;
    config.memory.region_size = 16 << 20;
    config
}

pub struct Node {
    pub ctx: Arc<Context>,
    pub recorder: Arc<Recorder>,
}

pub fn node(fabric: &Arc<LoopbackFabric>, name: &str, config: &Config) -> Node {
    let device = fabric.open_device(name);
    let memory = Arc::new(GlobalMemory::new(config.memory.region_size).unwrap());
    let resources = ResourceManager::new(Arc::clone(&memory));
    let pool = BufferPool::new(memory, config.memory.frame_size).unwrap();
    let recorder = Arc::new(Recorder::default());
    let dispatcher: Arc<dyn Dispatcher> = Arc::clone(&recorder) as _;
    let ctx = Context::new(config.clone(), device, &resources, pool, dispatcher).unwrap();
    Node { ctx, recorder }
}

/// Two contexts on one fabric with an established connection between them.
pub struct Pair {
    pub fabric: Arc<LoopbackFabric>,
    pub server: Node,
    pub client: Node,
    pub server_conn: Arc<Connection>,
    pub client_conn: Arc<Connection>,
    acceptor: Option<Acceptor>,
}

pub const ADDR: &str = "192.168.0.2:7471";

impl Pair {
    pub fn connect(config: &Config) -> Self {
        let fabric = LoopbackFabric::new();
        let server = node(&fabric, "server", config);
        let client = node(&fabric, "client", config);
        let (tx, rx) = flume::unbounded();
        let acceptor = Acceptor::bind(&server.ctx, ADDR, move |conn| {
            let _ignore = tx.send(conn);
        })
        .unwrap();
        let client_conn = Connector::connect(&client.ctx, ADDR).unwrap();
        let server_conn = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert!(wait_for(|| client_conn.remote_access().is_some()
            && server_conn.remote_access().is_some()));
        Self {
            fabric,
            server,
            client,
            server_conn,
            client_conn,
            acceptor: Some(acceptor),
        }
    }

    /// Allocates a client buffer holding `bytes`.
    pub fn client_buffer(&self, bytes: &[u8]) -> Buffer {
        let mut buf = self.client.ctx.pool().alloc(bytes.len()).unwrap();
        buf.write_bytes(bytes).unwrap();
        buf
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.server.recorder.release();
        self.client.recorder.release();
        drop(self.acceptor.take());
        self.client.ctx.shutdown();
        self.server.ctx.shutdown();
    }
}

/// `len / 4` little-endian `u32`s, each holding its own index.
pub fn indexed_words(len: usize) -> Vec<u8> {
    (0..len / 4).flat_map(|i| (i as u32).to_le_bytes()).collect()
}

/// Index of the first word that does not hold its own index.
pub fn first_misplaced_word(bytes: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .enumerate()
        .position(|(i, w)| w != i as u32)
}
