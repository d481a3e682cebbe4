//! In-process RC fabric.
//!
//! Every queue pair is driven by one worker thread that owns all writes into
//! the local memory on its behalf. Linked queue pairs exchange
//! [`WireMessage`]s over flume channels, the way two NICs exchange packets.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bitvec::vec::BitVec;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::random;

use crate::{
    error::{RdmaError, Result},
    mem::GlobalMemory,
    poller::Notifier,
};

use super::{
    CmChannel, CmEvent, CompletionQueue, Device, MrKeys, PdHandle, QueuePair, RecvWr, SendWr,
    WcOpcode, WcStatus, WorkCompletion, WorkReqOpCode,
};

const MAX_PD_CNT: usize = 256;

/// Upper bound on how long `quiesce` waits for the worker.
const FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Registry of listening addresses shared by every device of the fabric.
#[derive(Default)]
pub struct LoopbackFabric {
    listeners: Mutex<HashMap<String, Arc<LoopbackListener>>>,
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("listeners", &self.listeners.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open_device(self: &Arc<Self>, name: &str) -> Arc<LoopbackDevice> {
        info!("open loopback device {name}");
        Arc::new(LoopbackDevice::new(name, Arc::clone(self)))
    }

    /// Starts accepting connection requests on `addr`.
    pub fn listen(&self, addr: &str) -> Result<Arc<LoopbackListener>> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(addr) {
            return Err(RdmaError::ConnectionError(format!(
                "address {addr} already in use"
            )));
        }
        let (tx, rx) = flume::unbounded();
        let listener = Arc::new(LoopbackListener {
            addr: addr.to_owned(),
            tx,
            rx,
            notifier: Mutex::new(None),
        });
        let _ignore = listeners.insert(addr.to_owned(), Arc::clone(&listener));
        info!("listening on {addr}");
        Ok(listener)
    }

    pub fn unlisten(&self, addr: &str) {
        if self.listeners.lock().remove(addr).is_some() {
            info!("stop listening on {addr}");
        }
    }

    /// Sends a connection request carrying `local` to the listener on `addr`.
    /// The receiver yields the acceptor's endpoint.
    pub fn connect(
        &self,
        addr: &str,
        local: QpEndpoint,
    ) -> Result<oneshot::Receiver<Result<QpEndpoint>>> {
        let listener = self
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| RdmaError::ConnectionError(format!("connection to {addr} refused")))?;
        let (reply, rx) = oneshot::channel();
        listener.push(ConnectRequest { peer: local, reply })?;
        Ok(rx)
    }
}

/// A pending connection request.
pub struct ConnectRequest {
    peer: QpEndpoint,
    reply: oneshot::Sender<Result<QpEndpoint>>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("peer", &self.peer)
            .finish()
    }
}

impl ConnectRequest {
    pub fn peer(&self) -> &QpEndpoint {
        &self.peer
    }

    /// Answers the connector with the accepting queue pair.
    pub fn accept(self, local: QpEndpoint) -> Result<()> {
        self.reply
            .send(Ok(local))
            .map_err(|_err| RdmaError::ConnectionError("connector went away".into()))
    }

    pub fn reject(self, err: RdmaError) {
        let _ignore = self.reply.send(Err(err));
    }
}

pub struct LoopbackListener {
    addr: String,
    tx: flume::Sender<ConnectRequest>,
    rx: flume::Receiver<ConnectRequest>,
    notifier: Mutex<Option<Notifier>>,
}

impl fmt::Debug for LoopbackListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackListener")
            .field("addr", &self.addr)
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl LoopbackListener {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Installs the readiness notifier. Fires at once if requests are
    /// already pending.
    pub fn set_notifier(&self, notifier: Notifier) {
        let pending = !self.rx.is_empty();
        let _old = self.notifier.lock().replace(notifier.clone());
        if pending {
            notifier.notify();
        }
    }

    pub fn try_accept(&self) -> Option<ConnectRequest> {
        self.rx.try_recv().ok()
    }

    fn push(&self, req: ConnectRequest) -> Result<()> {
        self.tx
            .send(req)
            .map_err(|_err| RdmaError::ConnectionError("listener closed".into()))?;
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier.notify();
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MrEntry {
    pd: PdHandle,
    memory: Arc<GlobalMemory>,
    remote: bool,
}

/// A loopback device: protection domains plus a memory registration table.
pub struct LoopbackDevice {
    name: String,
    fabric: Arc<LoopbackFabric>,
    pd_table: Mutex<BitVec<u32>>,
    mr_table: Mutex<HashMap<u32, MrEntry>>,
    next_key: AtomicU32,
}

impl fmt::Debug for LoopbackDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackDevice")
            .field("name", &self.name)
            .field("regions", &self.registered_regions())
            .finish()
    }
}

impl LoopbackDevice {
    fn new(name: &str, fabric: Arc<LoopbackFabric>) -> Self {
        let mut bitmap = BitVec::with_capacity(MAX_PD_CNT);
        bitmap.resize(MAX_PD_CNT, false);
        // handle 0 is never handed out
        bitmap.set(0, true);
        Self {
            name: name.to_owned(),
            fabric,
            pd_table: Mutex::new(bitmap),
            mr_table: Mutex::new(HashMap::new()),
            next_key: AtomicU32::new(random::<u32>() & 0xff00),
        }
    }

    pub fn fabric(&self) -> &Arc<LoopbackFabric> {
        &self.fabric
    }

    /// Number of live memory registrations.
    pub fn registered_regions(&self) -> usize {
        self.mr_table.lock().values().filter(|mr| !mr.remote).count()
    }

    /// Resolves `key` for an access of `len` bytes at `addr`.
    fn memory_for(&self, key: u32, remote: bool, addr: u64, len: usize) -> Option<Arc<GlobalMemory>> {
        let table = self.mr_table.lock();
        let mr = table.get(&key)?;
        (mr.remote == remote && mr.memory.contains(addr, len)).then(|| Arc::clone(&mr.memory))
    }

    fn read_local(&self, key: u32, remote: bool, addr: u64, len: u32) -> Option<Vec<u8>> {
        let len = usize::try_from(len).ok()?;
        let memory = self.memory_for(key, remote, addr, len)?;
        let mut data = vec![0u8; len];
        // SAFETY: range validated against the registration above.
        #[allow(unsafe_code)]
        let ok = unsafe { memory.read_at(addr, &mut data) };
        ok.then_some(data)
    }

    fn write_local(&self, key: u32, remote: bool, addr: u64, data: &[u8]) -> bool {
        let Some(memory) = self.memory_for(key, remote, addr, data.len()) else {
            warn!("invalid mr, key: {key:#x}, addr: {addr:x}, length: {}", data.len());
            return false;
        };
        // SAFETY: range validated against the registration above; only the
        // queue pair worker writes on behalf of the device.
        #[allow(unsafe_code)]
        unsafe {
            memory.write_at(addr, data)
        }
    }
}

impl Device for LoopbackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::as_conversions)]
    fn alloc_pd(&self) -> Result<PdHandle> {
        let mut table = self.pd_table.lock();
        let index = table
            .first_zero()
            .ok_or(RdmaError::ResourceExhausted("No PD available".into()))?;
        table.set(index, true);
        Ok(index as PdHandle)
    }

    #[allow(clippy::as_conversions)]
    fn dealloc_pd(&self, pd: PdHandle) -> Result<()> {
        let index = pd as usize;
        let mut table = self.pd_table.lock();
        if index == 0 || !table.get(index).is_some_and(|x| *x) {
            return Err(RdmaError::InvalidInput(format!(
                "PD handle {pd} not present"
            )));
        }
        if self.mr_table.lock().values().any(|mr| mr.pd == pd) {
            return Err(RdmaError::InvalidInput(format!(
                "PD handle {pd} still has registrations"
            )));
        }
        table.set(index, false);
        Ok(())
    }

    #[allow(clippy::as_conversions)]
    fn reg_mr(&self, pd: PdHandle, memory: &Arc<GlobalMemory>) -> Result<MrKeys> {
        if !self.pd_table.lock().get(pd as usize).is_some_and(|x| *x) {
            return Err(RdmaError::MemoryError(format!("PD handle {pd} not present")));
        }
        let lkey = self.next_key.fetch_add(2, Ordering::Relaxed);
        let keys = MrKeys {
            lkey,
            rkey: lkey.wrapping_add(1),
        };
        let mut table = self.mr_table.lock();
        for (key, remote) in [(keys.lkey, false), (keys.rkey, true)] {
            let _old = table.insert(
                key,
                MrEntry {
                    pd,
                    memory: Arc::clone(memory),
                    remote,
                },
            );
        }
        info!(
            "loopback reg mr, addr: {:x}, length: {}, keys: {keys:?}",
            memory.addr(),
            memory.len()
        );
        Ok(keys)
    }

    fn dereg_mr(&self, keys: MrKeys) -> Result<()> {
        let mut table = self.mr_table.lock();
        let local = table.remove(&keys.lkey);
        let remote = table.remove(&keys.rkey);
        if local.is_none() || remote.is_none() {
            return Err(RdmaError::InvalidInput(format!("MR {keys:?} not present")));
        }
        info!("loopback dereg mr, keys: {keys:?}");
        Ok(())
    }
}

/// Completion queue with one-shot arming.
#[derive(Default)]
pub struct LoopbackCq {
    entries: Mutex<VecDeque<WorkCompletion>>,
    armed: AtomicBool,
    notifier: Mutex<Option<Notifier>>,
    unacked_events: AtomicU32,
}

impl fmt::Debug for LoopbackCq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackCq")
            .field("entries", &self.entries.lock().len())
            .field("armed", &self.armed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoopbackCq {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events delivered but not yet acknowledged.
    pub fn unacked_events(&self) -> u32 {
        self.unacked_events.load(Ordering::Relaxed)
    }

    fn push(&self, wc: WorkCompletion) {
        debug!("new completion: {wc:?}");
        self.entries.lock().push_back(wc);
        if self.armed.swap(false, Ordering::AcqRel) {
            let _prev = self.unacked_events.fetch_add(1, Ordering::Relaxed);
            if let Some(notifier) = self.notifier.lock().as_ref() {
                notifier.notify();
            }
        }
    }
}

impl CompletionQueue for LoopbackCq {
    fn poll(&self, max_entries: usize) -> Vec<WorkCompletion> {
        let mut entries = self.entries.lock();
        let n = entries.len().min(max_entries);
        entries.drain(..n).collect()
    }

    fn req_notify(&self) {
        self.armed.store(true, Ordering::Release);
    }

    fn ack_events(&self, count: u32) {
        let _ignore = self
            .unacked_events
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }

    fn set_notifier(&self, notifier: Notifier) {
        let _old = self.notifier.lock().replace(notifier);
    }
}

#[derive(Default)]
pub struct LoopbackCmChannel {
    events: Mutex<VecDeque<CmEvent>>,
    notifier: Mutex<Option<Notifier>>,
}

impl fmt::Debug for LoopbackCmChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackCmChannel")
            .field("events", &*self.events.lock())
            .finish()
    }
}

impl LoopbackCmChannel {
    fn push(&self, event: CmEvent) {
        self.events.lock().push_back(event);
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier.notify();
        }
    }
}

impl CmChannel for LoopbackCmChannel {
    fn get_event(&self) -> Option<CmEvent> {
        self.events.lock().pop_front()
    }

    fn set_notifier(&self, notifier: Notifier) {
        let pending = !self.events.lock().is_empty();
        let _old = self.notifier.lock().replace(notifier.clone());
        if pending {
            notifier.notify();
        }
    }
}

enum WireMessage {
    Send {
        wr_id: u64,
        data: Vec<u8>,
        imm: Option<u32>,
    },
    Write {
        wr_id: u64,
        raddr: u64,
        rkey: u32,
        data: Vec<u8>,
    },
    ReadReq {
        wr_id: u64,
        raddr: u64,
        rkey: u32,
        len: u32,
        laddr: u64,
        lkey: u32,
    },
    SendAck {
        wr_id: u64,
        status: WcStatus,
    },
    WriteAck {
        wr_id: u64,
        status: WcStatus,
        len: u32,
    },
    ReadResp {
        wr_id: u64,
        status: WcStatus,
        laddr: u64,
        lkey: u32,
        data: Vec<u8>,
    },
    Disconnect,
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WireMessage::Send {
                wr_id,
                ref data,
                imm,
            } => f
                .debug_struct("Send")
                .field("wr_id", &wr_id)
                .field("data", &format!("<{} bytes>", data.len()))
                .field("imm", &imm)
                .finish(),
            WireMessage::Write {
                wr_id,
                raddr,
                rkey,
                ref data,
            } => f
                .debug_struct("Write")
                .field("wr_id", &wr_id)
                .field("raddr", &format_args!("{raddr:x}"))
                .field("rkey", &rkey)
                .field("data", &format!("<{} bytes>", data.len()))
                .finish(),
            WireMessage::ReadReq {
                wr_id, raddr, len, ..
            } => f
                .debug_struct("ReadReq")
                .field("wr_id", &wr_id)
                .field("raddr", &format_args!("{raddr:x}"))
                .field("len", &len)
                .finish(),
            WireMessage::SendAck { wr_id, status } => f
                .debug_struct("SendAck")
                .field("wr_id", &wr_id)
                .field("status", &status)
                .finish(),
            WireMessage::WriteAck { wr_id, status, len } => f
                .debug_struct("WriteAck")
                .field("wr_id", &wr_id)
                .field("status", &status)
                .field("len", &len)
                .finish(),
            WireMessage::ReadResp {
                wr_id,
                status,
                ref data,
                ..
            } => f
                .debug_struct("ReadResp")
                .field("wr_id", &wr_id)
                .field("status", &status)
                .field("data", &format!("<{} bytes>", data.len()))
                .finish(),
            WireMessage::Disconnect => f.write_str("Disconnect"),
        }
    }
}

enum QpTask {
    Post(SendWr),
    PostRecv(RecvWr),
    Link(flume::Sender<QpTask>),
    Wire(WireMessage),
    Fence(oneshot::Sender<()>),
    Disconnect,
    Shutdown,
}

/// Addressing information a peer needs to link with a queue pair.
#[derive(Clone)]
pub struct QpEndpoint {
    qpn: u32,
    tx: flume::Sender<QpTask>,
}

impl fmt::Debug for QpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QpEndpoint").field("qpn", &self.qpn).finish()
    }
}

impl QpEndpoint {
    pub fn qpn(&self) -> u32 {
        self.qpn
    }
}

struct QpShared {
    qpn: u32,
    device: Arc<LoopbackDevice>,
    send_cq: Arc<LoopbackCq>,
    recv_cq: Arc<LoopbackCq>,
    cm: Arc<LoopbackCmChannel>,
    error: AtomicBool,
    disconnected: AtomicBool,
}

impl QpShared {
    fn complete_send(&self, wr_id: u64, opcode: WcOpcode, status: WcStatus, byte_len: u32) {
        let mut wc = WorkCompletion::new(wr_id, opcode, status);
        wc.byte_len = byte_len;
        self.send_cq.push(wc);
    }

    fn mark_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.cm.push(CmEvent::Disconnected);
        }
    }
}

struct QpWorker {
    shared: Arc<QpShared>,
    peer: Option<flume::Sender<QpTask>>,
    recv_queue: VecDeque<RecvWr>,
    /// Inbound requests stalled behind a SEND that found no posted receive
    rnr_backlog: VecDeque<WireMessage>,
    /// Locally posted requests awaiting the peer's response
    inflight: VecDeque<(u64, WcOpcode)>,
}

impl QpWorker {
    fn run(mut self, rx: &flume::Receiver<QpTask>) {
        while let Ok(task) = rx.recv() {
            match task {
                QpTask::Post(wr) => self.handle_post(wr),
                QpTask::PostRecv(wr) => {
                    self.recv_queue.push_back(wr);
                    if self.is_error() {
                        self.flush();
                    } else {
                        self.drain_backlog();
                    }
                }
                QpTask::Link(peer) => self.peer = Some(peer),
                QpTask::Wire(msg) => self.handle_wire(msg),
                QpTask::Fence(done) => {
                    self.enter_error();
                    let _ignore = done.send(());
                }
                QpTask::Disconnect => {
                    self.send_to_peer(WireMessage::Disconnect);
                    self.enter_error();
                }
                QpTask::Shutdown => break,
            }
        }
    }

    fn is_error(&self) -> bool {
        self.shared.error.load(Ordering::Acquire)
    }

    fn send_to_peer(&self, msg: WireMessage) -> bool {
        debug!("qp {} send to peer: {msg:?}", self.shared.qpn);
        self.peer
            .as_ref()
            .is_some_and(|peer| peer.send(QpTask::Wire(msg)).is_ok())
    }

    fn handle_post(&mut self, wr: SendWr) {
        let wr_id = wr.wr_id();
        let (opcode, msg) = match wr {
            SendWr::Send(base) => {
                let imm = (base.opcode == WorkReqOpCode::SendWithImm).then_some(base.imm_data);
                let data = self
                    .shared
                    .device
                    .read_local(base.lkey, false, base.laddr, base.length);
                (WcOpcode::Send, data.map(|data| WireMessage::Send { wr_id, data, imm }))
            }
            SendWr::Rdma(x) if x.base.opcode == WorkReqOpCode::RdmaWrite => {
                let data = self
                    .shared
                    .device
                    .read_local(x.base.lkey, false, x.base.laddr, x.base.length);
                let msg = data.map(|data| WireMessage::Write {
                    wr_id,
                    raddr: x.raddr,
                    rkey: x.rkey,
                    data,
                });
                (WcOpcode::RdmaWrite, msg)
            }
            SendWr::Rdma(x) if x.base.opcode == WorkReqOpCode::RdmaRead => {
                let valid = usize::try_from(x.base.length).is_ok_and(|len| {
                    self.shared
                        .device
                        .memory_for(x.base.lkey, false, x.base.laddr, len)
                        .is_some()
                });
                let msg = valid.then_some(WireMessage::ReadReq {
                    wr_id,
                    raddr: x.raddr,
                    rkey: x.rkey,
                    len: x.base.length,
                    laddr: x.base.laddr,
                    lkey: x.base.lkey,
                });
                (WcOpcode::RdmaRead, msg)
            }
            SendWr::Rdma(x) => {
                error!("unsupported one-sided opcode: {:?}", x.base.opcode);
                self.shared
                    .complete_send(wr_id, WcOpcode::Send, WcStatus::GeneralError, 0);
                return;
            }
        };
        if self.is_error() {
            self.shared
                .complete_send(wr_id, opcode, WcStatus::WrFlushError, 0);
            return;
        }
        let Some(msg) = msg else {
            warn!("qp {} local protection error, wr_id: {wr_id}", self.shared.qpn);
            self.shared
                .complete_send(wr_id, opcode, WcStatus::LocalProtectionError, 0);
            return;
        };
        self.inflight.push_back((wr_id, opcode));
        if !self.send_to_peer(msg) {
            warn!("qp {} has no reachable peer", self.shared.qpn);
            let _ignore = self.take_inflight(wr_id);
            self.shared
                .complete_send(wr_id, opcode, WcStatus::WrFlushError, 0);
        }
    }

    fn take_inflight(&mut self, wr_id: u64) -> Option<WcOpcode> {
        let pos = self.inflight.iter().position(|&(id, _)| id == wr_id)?;
        self.inflight.remove(pos).map(|(_, opcode)| opcode)
    }

    fn handle_wire(&mut self, msg: WireMessage) {
        debug!("qp {} recv from peer: {msg:?}", self.shared.qpn);
        match msg {
            WireMessage::Send { .. } | WireMessage::Write { .. } | WireMessage::ReadReq { .. } => {
                if self.is_error() {
                    debug!("qp {} in error state, dropping request", self.shared.qpn);
                } else if self.rnr_backlog.is_empty() {
                    if let Some(stalled) = self.process_request(msg) {
                        self.rnr_backlog.push_back(stalled);
                    }
                } else {
                    self.rnr_backlog.push_back(msg);
                }
            }
            WireMessage::SendAck { wr_id, status } => {
                if self.take_inflight(wr_id).is_some() {
                    self.shared.complete_send(wr_id, WcOpcode::Send, status, 0);
                }
            }
            WireMessage::WriteAck { wr_id, status, len } => {
                if self.take_inflight(wr_id).is_some() {
                    self.shared
                        .complete_send(wr_id, WcOpcode::RdmaWrite, status, len);
                }
            }
            WireMessage::ReadResp {
                wr_id,
                status,
                laddr,
                lkey,
                data,
            } => {
                if self.take_inflight(wr_id).is_none() {
                    return;
                }
                let status = if status != WcStatus::Success {
                    status
                } else if self.shared.device.write_local(lkey, false, laddr, &data) {
                    WcStatus::Success
                } else {
                    WcStatus::LocalProtectionError
                };
                let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                self.shared
                    .complete_send(wr_id, WcOpcode::RdmaRead, status, len);
            }
            WireMessage::Disconnect => {
                info!("qp {} peer disconnected", self.shared.qpn);
                self.enter_error();
                self.shared.mark_disconnected();
            }
        }
    }

    /// Executes a peer request. Returns it back if it has to wait for a
    /// receive to be posted.
    fn process_request(&mut self, msg: WireMessage) -> Option<WireMessage> {
        let device = Arc::clone(&self.shared.device);
        match msg {
            WireMessage::Send { wr_id, data, imm } => {
                let Some(recv) = self.recv_queue.pop_front() else {
                    debug!("qp {} receiver not ready", self.shared.qpn);
                    return Some(WireMessage::Send { wr_id, data, imm });
                };
                let byte_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                let (local, remote) = if byte_len > recv.length {
                    (WcStatus::LocalLengthError, WcStatus::RemoteInvalidRequest)
                } else if device.write_local(recv.lkey, false, recv.addr, &data) {
                    (WcStatus::Success, WcStatus::Success)
                } else {
                    (WcStatus::LocalProtectionError, WcStatus::RemoteAccessError)
                };
                let mut wc = WorkCompletion::new(recv.wr_id, WcOpcode::Recv, local);
                wc.byte_len = byte_len;
                wc.imm = imm;
                self.shared.recv_cq.push(wc);
                let _sent = self.send_to_peer(WireMessage::SendAck {
                    wr_id,
                    status: remote,
                });
            }
            WireMessage::Write {
                wr_id,
                raddr,
                rkey,
                data,
            } => {
                let status = if device.write_local(rkey, true, raddr, &data) {
                    WcStatus::Success
                } else {
                    WcStatus::RemoteAccessError
                };
                let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                let _sent = self.send_to_peer(WireMessage::WriteAck { wr_id, status, len });
            }
            WireMessage::ReadReq {
                wr_id,
                raddr,
                rkey,
                len,
                laddr,
                lkey,
            } => {
                let (status, data) = match device.read_local(rkey, true, raddr, len) {
                    Some(data) => (WcStatus::Success, data),
                    None => (WcStatus::RemoteAccessError, Vec::new()),
                };
                let _sent = self.send_to_peer(WireMessage::ReadResp {
                    wr_id,
                    status,
                    laddr,
                    lkey,
                    data,
                });
            }
            WireMessage::SendAck { .. }
            | WireMessage::WriteAck { .. }
            | WireMessage::ReadResp { .. }
            | WireMessage::Disconnect => {
                error!("response routed as request: {msg:?}");
            }
        }
        None
    }

    fn drain_backlog(&mut self) {
        while let Some(msg) = self.rnr_backlog.pop_front() {
            if let Some(stalled) = self.process_request(msg) {
                self.rnr_backlog.push_front(stalled);
                break;
            }
        }
    }

    fn enter_error(&mut self) {
        if !self.shared.error.swap(true, Ordering::AcqRel) {
            info!("qp {} enters error state", self.shared.qpn);
        }
        self.flush();
    }

    /// Completes every outstanding request with a flush error.
    fn flush(&mut self) {
        self.rnr_backlog.clear();
        for (wr_id, opcode) in self.inflight.drain(..) {
            self.shared
                .complete_send(wr_id, opcode, WcStatus::WrFlushError, 0);
        }
        for recv in self.recv_queue.drain(..) {
            self.shared.recv_cq.push(WorkCompletion::new(
                recv.wr_id,
                WcOpcode::Recv,
                WcStatus::WrFlushError,
            ));
        }
    }
}

/// A reliable connected loopback queue pair.
pub struct LoopbackQp {
    shared: Arc<QpShared>,
    tx: flume::Sender<QpTask>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl fmt::Debug for LoopbackQp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackQp")
            .field("qpn", &self.shared.qpn)
            .field("device", &self.shared.device.name)
            .field("error", &self.shared.error.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoopbackQp {
    pub fn new(
        device: &Arc<LoopbackDevice>,
        send_cq: Arc<LoopbackCq>,
        recv_cq: Arc<LoopbackCq>,
    ) -> Result<Self> {
        let qpn = random::<u32>() & 0x00ff_ffff;
        let shared = Arc::new(QpShared {
            qpn,
            device: Arc::clone(device),
            send_cq,
            recv_cq,
            cm: Arc::new(LoopbackCmChannel::default()),
            error: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        });
        let (tx, rx) = flume::unbounded();
        let worker = QpWorker {
            shared: Arc::clone(&shared),
            peer: None,
            recv_queue: VecDeque::new(),
            rnr_backlog: VecDeque::new(),
            inflight: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("loopback-qp-{qpn}"))
            .spawn(move || {
                debug!("qp {qpn} worker running");
                worker.run(&rx);
                debug!("qp {qpn} worker exited");
            })?;
        info!("loopback create qp: {qpn} on {}", device.name);
        Ok(Self {
            shared,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            qpn: self.shared.qpn,
            tx: self.tx.clone(),
        }
    }

    /// Connects this queue pair to `peer` and reports establishment on the
    /// CM channel.
    pub fn link(&self, peer: &QpEndpoint) -> Result<()> {
        self.tx
            .send(QpTask::Link(peer.tx.clone()))
            .map_err(|_err| RdmaError::QpError("qp worker stopped".into()))?;
        info!("qp {} linked to peer qp {}", self.shared.qpn, peer.qpn);
        self.shared.cm.push(CmEvent::Established);
        Ok(())
    }

    pub fn cm_channel(&self) -> Arc<LoopbackCmChannel> {
        Arc::clone(&self.shared.cm)
    }

    pub fn is_error(&self) -> bool {
        self.shared.error.load(Ordering::Acquire)
    }

    fn submit(&self, task: QpTask) -> Result<()> {
        if self.is_error() {
            return Err(RdmaError::QpError(format!(
                "qp {} is in error state",
                self.shared.qpn
            )));
        }
        self.tx
            .send(task)
            .map_err(|_err| RdmaError::QpError("qp worker stopped".into()))
    }
}

impl QueuePair for LoopbackQp {
    fn qpn(&self) -> u32 {
        self.shared.qpn
    }

    fn post_send(&self, wr: SendWr) -> Result<()> {
        debug!("post send wr: {wr:?}, qpn: {}", self.shared.qpn);
        self.submit(QpTask::Post(wr))
    }

    fn post_recv(&self, wr: RecvWr) -> Result<()> {
        debug!("post recv wr: {wr:?}, qpn: {}", self.shared.qpn);
        self.submit(QpTask::PostRecv(wr))
    }

    fn quiesce(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(QpTask::Fence(tx)).is_err() {
            return;
        }
        if rx.recv_timeout(FENCE_TIMEOUT).is_err() {
            warn!("qp {} worker did not confirm quiesce", self.shared.qpn);
        }
    }

    fn disconnect(&self) -> Result<()> {
        if self.shared.disconnected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.tx
            .send(QpTask::Disconnect)
            .map_err(|_err| RdmaError::QpError("qp worker stopped".into()))?;
        self.shared.mark_disconnected();
        Ok(())
    }
}

impl Drop for LoopbackQp {
    fn drop(&mut self) {
        let _ignore = self.tx.send(QpTask::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("qp {} worker panicked", self.shared.qpn);
            }
        }
        info!("qp: {} destroyed", self.shared.qpn);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::as_conversions, unsafe_code)]
mod tests {
    use std::time::Instant;

    use crate::verbs::{SendWrBase, SendWrRdma};

    use super::*;

    struct Side {
        dev: Arc<LoopbackDevice>,
        mem: Arc<GlobalMemory>,
        keys: MrKeys,
        send_cq: Arc<LoopbackCq>,
        recv_cq: Arc<LoopbackCq>,
        qp: LoopbackQp,
    }

    fn create_side(fabric: &Arc<LoopbackFabric>, name: &str) -> Side {
        let dev = fabric.open_device(name);
        let mem = Arc::new(GlobalMemory::new(1 << 16).unwrap());
        let pd = dev.alloc_pd().unwrap();
        let keys = dev.reg_mr(pd, &mem).unwrap();
        let send_cq = LoopbackCq::new();
        let recv_cq = LoopbackCq::new();
        let qp = LoopbackQp::new(&dev, Arc::clone(&send_cq), Arc::clone(&recv_cq)).unwrap();
        Side {
            dev,
            mem,
            keys,
            send_cq,
            recv_cq,
            qp,
        }
    }

    fn pair() -> (Side, Side) {
        let fabric = LoopbackFabric::new();
        let a = create_side(&fabric, "dev-a");
        let b = create_side(&fabric, "dev-b");
        a.qp.link(&b.qp.endpoint()).unwrap();
        b.qp.link(&a.qp.endpoint()).unwrap();
        (a, b)
    }

    fn wait_cq(cq: &LoopbackCq, n: usize) -> Vec<WorkCompletion> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < n {
            assert!(Instant::now() < deadline, "timed out waiting for completions");
            out.extend(cq.poll(n - out.len()));
            thread::sleep(Duration::from_millis(1));
        }
        out
    }

    fn write_mem(side: &Side, off: u64, data: &[u8]) {
        unsafe { assert!(side.mem.write_at(side.mem.addr() + off, data)) };
    }

    fn read_mem(side: &Side, off: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        unsafe { assert!(side.mem.read_at(side.mem.addr() + off, &mut out)) };
        out
    }

    #[test]
    fn send_with_imm_waits_for_posted_receive() {
        let (a, b) = pair();
        write_mem(&a, 0, b"hello");
        let wr = SendWrBase::new(7, a.mem.addr(), 5, a.keys.lkey, WorkReqOpCode::SendWithImm)
            .with_imm(42);
        a.qp.post_send(wr.into()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(a.send_cq.poll(1).is_empty());

        b.qp.post_recv(RecvWr {
            wr_id: 9,
            addr: b.mem.addr() + 128,
            length: 64,
            lkey: b.keys.lkey,
        })
        .unwrap();

        let recv = wait_cq(&b.recv_cq, 1);
        assert_eq!(recv[0].wr_id, 9);
        assert_eq!(recv[0].imm, Some(42));
        assert_eq!(recv[0].byte_len, 5);
        assert_eq!(read_mem(&b, 128, 5), b"hello");
        let send = wait_cq(&a.send_cq, 1);
        assert_eq!(send[0].wr_id, 7);
        assert!(send[0].is_success());
    }

    #[test]
    fn oversized_send_fails_on_both_sides() {
        let (a, b) = pair();
        b.qp.post_recv(RecvWr {
            wr_id: 1,
            addr: b.mem.addr(),
            length: 4,
            lkey: b.keys.lkey,
        })
        .unwrap();
        let wr = SendWrBase::new(2, a.mem.addr(), 16, a.keys.lkey, WorkReqOpCode::Send);
        a.qp.post_send(wr.into()).unwrap();
        assert_eq!(wait_cq(&b.recv_cq, 1)[0].status, WcStatus::LocalLengthError);
        assert_eq!(
            wait_cq(&a.send_cq, 1)[0].status,
            WcStatus::RemoteInvalidRequest
        );
    }

    #[test]
    fn rdma_write_and_read_check_remote_keys() {
        let (a, b) = pair();
        write_mem(&a, 0, &[5u8; 32]);
        let base = SendWrBase::new(1, a.mem.addr(), 32, a.keys.lkey, WorkReqOpCode::RdmaWrite);
        let wr = SendWrRdma::new_from_base(base, b.mem.addr() + 256, b.keys.rkey);
        a.qp.post_send(wr.into()).unwrap();
        let wc = wait_cq(&a.send_cq, 1);
        assert!(wc[0].is_success());
        assert_eq!(wc[0].byte_len, 32);
        assert_eq!(read_mem(&b, 256, 32), vec![5u8; 32]);

        let base = SendWrBase::new(2, a.mem.addr() + 64, 32, a.keys.lkey, WorkReqOpCode::RdmaRead);
        let wr = SendWrRdma::new_from_base(base, b.mem.addr() + 256, b.keys.rkey);
        a.qp.post_send(wr.into()).unwrap();
        let wc = wait_cq(&a.send_cq, 1);
        assert_eq!(wc[0].opcode, WcOpcode::RdmaRead);
        assert!(wc[0].is_success());
        assert_eq!(read_mem(&a, 64, 32), vec![5u8; 32]);

        // a local key is not valid for remote access
        let base = SendWrBase::new(3, a.mem.addr(), 8, a.keys.lkey, WorkReqOpCode::RdmaWrite);
        let wr = SendWrRdma::new_from_base(base, b.mem.addr(), b.keys.lkey);
        a.qp.post_send(wr.into()).unwrap();
        assert_eq!(wait_cq(&a.send_cq, 1)[0].status, WcStatus::RemoteAccessError);
    }

    #[test]
    fn quiesce_flushes_posted_receives() {
        let (a, _b) = pair();
        for wr_id in 0..3 {
            a.qp.post_recv(RecvWr {
                wr_id,
                addr: a.mem.addr(),
                length: 64,
                lkey: a.keys.lkey,
            })
            .unwrap();
        }
        a.qp.quiesce();
        let wcs = a.recv_cq.poll(8);
        assert_eq!(wcs.len(), 3);
        assert!(wcs.iter().all(|wc| wc.status == WcStatus::WrFlushError));
        assert!(a.qp.post_recv(RecvWr {
            wr_id: 4,
            addr: a.mem.addr(),
            length: 64,
            lkey: a.keys.lkey,
        })
        .is_err());
    }

    #[test]
    fn disconnect_is_reported_once_on_both_sides() {
        let (a, b) = pair();
        let a_cm = a.qp.cm_channel();
        let b_cm = b.qp.cm_channel();
        assert_eq!(a_cm.get_event(), Some(CmEvent::Established));
        assert_eq!(b_cm.get_event(), Some(CmEvent::Established));

        a.qp.disconnect().unwrap();
        a.qp.disconnect().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let event = loop {
            if let Some(ev) = b_cm.get_event() {
                break ev;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(event, CmEvent::Disconnected);
        assert_eq!(a_cm.get_event(), Some(CmEvent::Disconnected));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(a_cm.get_event(), None);
        assert_eq!(b_cm.get_event(), None);
        assert!(b.qp.is_error());
    }

    #[test]
    fn pd_with_registrations_cannot_be_freed() {
        let fabric = LoopbackFabric::new();
        let dev = fabric.open_device("dev");
        let mem = Arc::new(GlobalMemory::new(4096).unwrap());
        let pd = dev.alloc_pd().unwrap();
        assert_ne!(pd, 0);
        let keys = dev.reg_mr(pd, &mem).unwrap();
        assert!(dev.dealloc_pd(pd).is_err());
        dev.dereg_mr(keys).unwrap();
        assert!(dev.dereg_mr(keys).is_err());
        dev.dealloc_pd(pd).unwrap();
        assert!(dev.dealloc_pd(pd).is_err());
    }

    #[test]
    fn connect_reaches_listener() {
        let fabric = LoopbackFabric::new();
        let side = create_side(&fabric, "dev");
        let listener = fabric.listen("node-a").unwrap();
        assert!(fabric.listen("node-a").is_err());
        assert!(fabric.connect("node-b", side.qp.endpoint()).is_err());

        let rx = fabric.connect("node-a", side.qp.endpoint()).unwrap();
        let req = listener.try_accept().unwrap();
        assert_eq!(req.peer().qpn(), side.qp.qpn());
        req.accept(side.qp.endpoint()).unwrap();
        let endpoint = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(endpoint.qpn(), side.qp.qpn());

        fabric.unlisten("node-a");
        assert!(fabric.connect("node-a", side.qp.endpoint()).is_err());
        drop(side.dev);
    }
}
