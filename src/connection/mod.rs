//! Per connection messaging state machine.
//!
//! A [`Connection`] owns one queue pair with its completion queues and CM
//! channel. General messages up to `recv_buffer_size` bytes travel as SEND
//! with the message type in the immediate; larger ones are announced with a
//! control message and pulled by the peer with RDMA READ. Completions of
//! both queues are drained on the context's poller thread.

mod control;
mod direct;
mod stats;

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    completion::{CompletionInfo, CompletionSlab, OrderChecker},
    config::ConnectionConfig,
    context::Context,
    dispatcher::{ConnectionEvent, Dispatcher},
    error::{RdmaError, Result},
    flow_control::{CqKind, FlowControl, SendThrottle},
    mem::{
        buffer::Buffer,
        pool::{BufferPool, ControlBufferPool},
        resource::DeviceResource,
    },
    poller::{Poller, Token},
    protocol::ControlMessage,
    verbs::{
        CmChannel, CmEvent, CompletionQueue, QueuePair, RecvWr, SendWr, SendWrBase, WcStatus,
        WorkCompletion, WorkReqOpCode,
    },
};

pub use stats::ConnectionStats;
use stats::{bump, Counters};

/// Verbs objects driven by a connection.
pub struct Transport {
    pub qp: Arc<dyn QueuePair>,
    pub send_cq: Arc<dyn CompletionQueue>,
    pub recv_cq: Arc<dyn CompletionQueue>,
    pub cm: Arc<dyn CmChannel>,
}

/// The peer's registered memory, learned from its access exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAccess {
    pub address: u64,
    pub length: u64,
    pub remote_key: u32,
}

impl RemoteAccess {
    fn contains(&self, address: u64, length: u64) -> bool {
        let end = self.address.saturating_add(self.length);
        address >= self.address && address.checked_add(length).is_some_and(|x| x <= end)
    }
}

/// A credit-consuming SEND waiting for credit or a send slot.
enum SendRequest {
    General { ty: u32, buffer: Buffer },
    Control(ControlMessage),
}

impl SendRequest {
    /// Requests made by [`Connection::send`]. Only these are bounded by
    /// `max_pending_sends`; control replies generated on the poller thread
    /// are always queued.
    fn is_caller_send(&self) -> bool {
        matches!(
            *self,
            Self::General { .. } | Self::Control(ControlMessage::LargeBufferSend { .. })
        )
    }
}

/// A large-buffer pull waiting for a send slot.
struct PendingPull {
    buffer: Buffer,
    ty: u32,
    id: u64,
    address: u64,
    remote_key: u32,
    len: usize,
}

enum PostOutcome {
    Posted,
    Denied(SendRequest),
    Failed(RdmaError, SendRequest),
}

/// State guarded by the send lock. Every SEND and every one-sided request
/// is posted while holding it, so queued requests keep their FIFO order.
#[derive(Default)]
struct SendState {
    pending: VecDeque<SendRequest>,
    pulls: VecDeque<PendingPull>,
    order: OrderChecker,
}

#[derive(Default)]
struct RecvState {
    order: OrderChecker,
    /// Consumed receive buffers that could not be replaced yet
    shortfall: u32,
}

/// Buffers kept alive on behalf of the peer.
#[derive(Default)]
struct Holders {
    /// Announced large buffers, released on the peer's ack
    large_sends: HashMap<u64, Buffer>,
    /// Local buffers registered as direct-write sinks, by sink id
    local_sinks: HashMap<u64, Buffer>,
    /// Peer sink ids mapped to their remote addresses
    remote_sinks: HashMap<u64, u64>,
}

pub struct Connection {
    id: u64,
    self_ref: Weak<Connection>,
    ctx: Weak<Context>,
    config: ConnectionConfig,
    qp: Arc<dyn QueuePair>,
    send_cq: Arc<dyn CompletionQueue>,
    recv_cq: Arc<dyn CompletionQueue>,
    cm: Arc<dyn CmChannel>,
    resource: Arc<DeviceResource>,
    pool: BufferPool,
    ctrl_pool: ControlBufferPool,
    poller: Arc<Poller>,
    dispatcher: Arc<dyn Dispatcher>,
    flow: FlowControl,
    throttle: Mutex<SendThrottle>,
    send_state: Mutex<SendState>,
    recv_state: Mutex<RecvState>,
    completions: Mutex<CompletionSlab>,
    holders: Mutex<Holders>,
    remote_access: Mutex<Option<RemoteAccess>>,
    watchers: Mutex<Vec<Token>>,
    closed: AtomicBool,
    disconnect_issued: AtomicBool,
    disconnect_reported: AtomicBool,
    consecutive_failures: AtomicU32,
    next_large_id: AtomicU64,
    counters: Counters,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("qpn", &self.qp.qpn())
            .field("connected", &self.flow.is_connected())
            .field("flow", &self.flow)
            .finish_non_exhaustive()
    }
}

fn wr_length(len: usize) -> Result<u32> {
    if len == 0 {
        return Err(RdmaError::InvalidInput("empty buffer".into()));
    }
    u32::try_from(len)
        .map_err(|_err| RdmaError::InvalidInput(format!("{len} bytes exceed one work request")))
}

impl Connection {
    pub(crate) fn new(ctx: &Arc<Context>, transport: Transport) -> Result<Arc<Self>> {
        let config = ctx.config().connection.clone();
        let ctrl_pool = ControlBufferPool::new(
            ctx.pool().clone(),
            config.ctrl_buffer_count,
            config.ctrl_buffer_size,
        )?;
        let flow = FlowControl::new(&config);
        let throttle = Mutex::new(SendThrottle::new(&ctx.config().throttle));
        let id = ctx.next_connection_id();
        info!("conn {id} created on qp {}", transport.qp.qpn());
        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            self_ref: self_ref.clone(),
            ctx: Arc::downgrade(ctx),
            config,
            qp: transport.qp,
            send_cq: transport.send_cq,
            recv_cq: transport.recv_cq,
            cm: transport.cm,
            resource: Arc::clone(ctx.resource()),
            pool: ctx.pool().clone(),
            ctrl_pool,
            poller: Arc::clone(ctx.poller()),
            dispatcher: Arc::clone(ctx.dispatcher()),
            flow,
            throttle,
            send_state: Mutex::new(SendState::default()),
            recv_state: Mutex::new(RecvState::default()),
            completions: Mutex::new(CompletionSlab::new()),
            holders: Mutex::new(Holders::default()),
            remote_access: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            disconnect_issued: AtomicBool::new(false),
            disconnect_reported: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            next_large_id: AtomicU64::new(1),
            counters: Counters::default(),
        }))
    }

    /// Arms the completion queues, pre-posts the receive buffers and
    /// announces the local memory to the peer.
    #[allow(clippy::as_conversions)] // usize fits u64
    pub(crate) fn establish(self: &Arc<Self>) -> Result<()> {
        self.start_watching();
        {
            let mut recv = self.recv_state.lock();
            for _ in 0..self.config.recv_buffer_count {
                let buffer = self.pool.alloc(self.config.recv_buffer_size)?;
                self.post_recv_buffer(&mut recv, buffer)?;
            }
        }
        self.flow.set_connected(true);
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.register(Arc::clone(self));
        }
        info!(
            "conn {} established, qpn {}, {} receive buffers of {} bytes",
            self.id,
            self.qp.qpn(),
            self.config.recv_buffer_count,
            self.config.recv_buffer_size
        );
        self.submit(SendRequest::Control(ControlMessage::AccessExchange {
            address: self.resource.addr(),
            length: self.resource.len() as u64,
            remote_key: self.resource.rkey(),
        }))?;
        let conn = Arc::clone(self);
        self.poller.wake(move || {
            conn.dispatcher
                .dispatch_connection_event(ConnectionEvent::Connected, &conn);
        });
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn qpn(&self) -> u32 {
        self.qp.qpn()
    }

    pub fn is_connected(&self) -> bool {
        self.flow.is_connected()
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// Sends deferred for lack of credit or send slots.
    pub fn pending_sends(&self) -> usize {
        self.send_state.lock().pending.len()
    }

    /// Work requests posted and not yet completed, receives included.
    pub fn outstanding_work_requests(&self) -> usize {
        self.completions.lock().len()
    }

    /// Large buffers announced to the peer and not yet acknowledged.
    pub fn held_large_buffers(&self) -> usize {
        self.holders.lock().large_sends.len()
    }

    pub fn remote_access(&self) -> Option<RemoteAccess> {
        *self.remote_access.lock()
    }

    /// Returns `true` once the peer registered `sink_id` as a direct sink.
    pub fn has_remote_sink(&self, sink_id: u64) -> bool {
        self.holders.lock().remote_sinks.contains_key(&sink_id)
    }

    /// Sends the readable bytes of `buffer` as a message of type `ty`.
    ///
    /// Messages that fit a receive buffer go out as a single SEND; larger
    /// ones are announced and pulled by the peer, and `buffer` stays held
    /// until the peer acknowledges the pull. When credit is short the send
    /// is queued in order; `WouldBlock` is returned only once the queue is
    /// full.
    #[allow(clippy::as_conversions)] // usize fits u64
    pub fn send(&self, ty: u32, buffer: &Buffer) -> Result<()> {
        self.ensure_connected()?;
        let size = buffer.data_size();
        if size == 0 {
            return Err(RdmaError::InvalidInput("empty message".into()));
        }
        if size <= self.config.recv_buffer_size {
            return self.submit(SendRequest::General {
                ty,
                buffer: buffer.clone(),
            });
        }
        let _length = wr_length(size)?;
        let id = self.next_large_id.fetch_add(1, Ordering::Relaxed);
        let _prev = self.holders.lock().large_sends.insert(id, buffer.clone());
        debug!("conn {} announces large buffer {id} of {size} bytes", self.id);
        self.submit(SendRequest::Control(ControlMessage::LargeBufferSend {
            id,
            address: buffer.read_addr(),
            length: size as u64,
            remote_key: self.resource.rkey(),
            ty,
        }))
    }

    /// Like [`Self::send`], but backs off and retries while the send queue
    /// is full instead of returning `WouldBlock`.
    pub fn send_throttled(&self, ty: u32, buffer: &Buffer) -> Result<()> {
        if self.poller.is_poller_thread() {
            return self.send(ty, buffer);
        }
        loop {
            let delay = self.throttle.lock().delay();
            if !delay.is_zero() {
                spin_sleep::sleep(delay);
            }
            match self.send(ty, buffer) {
                Ok(()) => {
                    self.throttle.lock().on_success();
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    debug!("conn {} send throttled: {err}", self.id);
                    self.throttle.lock().on_failure();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Tears the connection down. Idempotent.
    ///
    /// The queue pair is quiesced before any buffer is released, so no
    /// in-flight DMA can touch memory handed back to the pool. Pending
    /// one-sided handlers run with `NotConnected`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_connected = self.flow.disconnect();
        info!("conn {} closing, qpn {}", self.id, self.qp.qpn());
        for kind in [CqKind::Send, CqKind::Recv] {
            let events = self.flow.take_unacked_cq_events(kind);
            if events > 0 {
                self.cq(kind).ack_events(events);
            }
        }
        self.qp.quiesce();

        let infos = self.completions.lock().drain();
        {
            let mut send = self.send_state.lock();
            send.pending.clear();
            send.pulls.clear();
            send.order.clear();
        }
        {
            let mut recv = self.recv_state.lock();
            recv.order.clear();
            recv.shortfall = 0;
        }
        {
            let mut holders = self.holders.lock();
            holders.large_sends.clear();
            holders.local_sinks.clear();
            holders.remote_sinks.clear();
        }
        *self.remote_access.lock() = None;
        self.ctrl_pool.clear();
        for info in infos {
            match info {
                CompletionInfo::DirectRead { buffer, handler, .. }
                | CompletionInfo::DirectWrite {
                    buffer,
                    handler: Some(handler),
                    ..
                } => handler(Err(RdmaError::NotConnected), buffer),
                _ => {}
            }
        }

        if !was_connected {
            self.stop_watching();
        } else if !self.disconnect_issued.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.qp.disconnect() {
                warn!("conn {} disconnect failed: {err}", self.id);
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.flow.is_connected() {
            Ok(())
        } else {
            Err(RdmaError::NotConnected)
        }
    }

    fn cq(&self, kind: CqKind) -> &Arc<dyn CompletionQueue> {
        match kind {
            CqKind::Send => &self.send_cq,
            CqKind::Recv => &self.recv_cq,
        }
    }

    fn start_watching(&self) {
        let mut tokens = Vec::with_capacity(4);
        for kind in [CqKind::Send, CqKind::Recv] {
            let weak = self.self_ref.clone();
            let (token, notifier) = self.poller.start_io(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.on_cq_event(kind);
                }
            });
            let cq = self.cq(kind);
            cq.set_notifier(notifier);
            cq.req_notify();
            tokens.push(token);
        }

        let weak = self.self_ref.clone();
        let (token, notifier) = self.poller.start_io(move || {
            if let Some(conn) = weak.upgrade() {
                conn.on_cm_event();
            }
        });
        self.cm.set_notifier(notifier);
        tokens.push(token);

        let weak = self.self_ref.clone();
        tokens.push(
            self.poller
                .start_timer(self.config.replenish_interval(), move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.replenish_recv_buffers();
                    }
                }),
        );
        *self.watchers.lock() = tokens;
    }

    fn stop_watching(&self) {
        for token in self.watchers.lock().drain(..) {
            self.poller.stop(token);
        }
    }

    fn on_cm_event(self: &Arc<Self>) {
        while let Some(event) = self.cm.get_event() {
            match event {
                CmEvent::Established => debug!("conn {} cm established", self.id),
                CmEvent::Disconnected => self.on_disconnected(),
            }
        }
    }

    fn on_disconnected(self: &Arc<Self>) {
        info!("conn {} disconnected", self.id);
        self.stop_watching();
        self.close();
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.unregister(self.id);
        }
        if !self.disconnect_reported.swap(true, Ordering::AcqRel) {
            self.dispatcher
                .dispatch_connection_event(ConnectionEvent::Disconnected, self);
        }
    }

    fn on_cq_event(self: &Arc<Self>, kind: CqKind) {
        let cq = self.cq(kind);
        if let Some(events) = self.flow.on_cq_event(kind) {
            cq.ack_events(events);
        }
        cq.req_notify();
        self.drain_completions();
    }

    fn drain_completions(self: &Arc<Self>) {
        let batch = self.config.poll_batch;
        loop {
            let mut wcs = self.recv_cq.poll(batch);
            wcs.extend(self.send_cq.poll(batch));
            if wcs.is_empty() {
                break;
            }
            for wc in wcs {
                self.handle_completion(&wc);
            }
        }
        if self.is_connected() {
            self.flush_send_queue();
            self.send_credit_if_necessary();
        }
    }

    fn handle_completion(self: &Arc<Self>, wc: &WorkCompletion) {
        let Some(info) = self.completions.lock().take(wc.wr_id) else {
            debug!(
                "conn {} completion for retired wr_id {:#x}: {:?}",
                self.id, wc.wr_id, wc.status
            );
            return;
        };
        if self.config.check_order {
            let _in_order = if matches!(info, CompletionInfo::Recv(_)) {
                self.recv_state.lock().order.on_complete("recv", wc.wr_id)
            } else {
                self.send_state.lock().order.on_complete("send", wc.wr_id)
            };
        }
        match info {
            CompletionInfo::Recv(buffer) => self.on_recv(wc, buffer),
            info => {
                self.flow.complete_send();
                self.on_send_complete(wc, info);
            }
        }
        if wc.is_success() {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.on_failed_completion(wc);
        }
    }

    fn on_failed_completion(&self, wc: &WorkCompletion) {
        if wc.status == WcStatus::WrFlushError {
            bump(&self.counters.flushed_completions);
            return;
        }
        bump(&self.counters.failed_completions);
        if !self.is_connected() {
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "conn {} wr_id {:#x} failed with {:?}, {failures} in a row",
            self.id, wc.wr_id, wc.status
        );
        if failures >= self.config.max_completion_failures {
            error!("conn {} too many failed completions, closing", self.id);
            self.close();
        }
    }

    #[allow(clippy::as_conversions)] // u32 fits usize
    fn on_recv(self: &Arc<Self>, wc: &WorkCompletion, mut buffer: Buffer) {
        if !wc.is_success() {
            if wc.status != WcStatus::WrFlushError {
                warn!("conn {} receive failed: {:?}", self.id, wc.status);
            }
            if self.is_connected() {
                buffer.clear();
                self.repost_recv(buffer);
            }
            return;
        }
        let byte_len = wc.byte_len as usize;
        match wc.imm {
            Some(ty) => self.on_general_recv(ty, buffer, byte_len),
            None => self.on_control_recv(buffer, byte_len),
        }
        self.send_credit_if_necessary();
    }

    fn on_general_recv(self: &Arc<Self>, ty: u32, mut buffer: Buffer, byte_len: usize) {
        buffer.clear();
        if let Err(err) = buffer.advance_write(byte_len) {
            error!("conn {} receive overran its buffer: {err}", self.id);
            self.repost_recv(buffer);
            return;
        }
        bump(&self.counters.messages_received);
        match self.pool.alloc(self.config.recv_buffer_size) {
            Ok(fresh) => self.repost_recv(fresh),
            Err(err) => {
                debug!("conn {} receive buffer replacement deferred: {err}", self.id);
                self.recv_state.lock().shortfall += 1;
            }
        }
        self.dispatcher.dispatch_data_event(ty, buffer, self);
    }

    /// Posts `buffer` as a receive and counts it as credit for the peer.
    fn repost_recv(&self, buffer: Buffer) {
        let mut recv = self.recv_state.lock();
        match self.post_recv_buffer(&mut recv, buffer) {
            Ok(()) => self.flow.on_recv_reposted(),
            Err(err) => {
                warn!("conn {} failed to post receive: {err}", self.id);
                recv.shortfall += 1;
            }
        }
    }

    fn replenish_recv_buffers(&self) {
        if !self.is_connected() {
            return;
        }
        {
            let mut recv = self.recv_state.lock();
            while recv.shortfall > 0 {
                let Ok(buffer) = self.pool.alloc(self.config.recv_buffer_size) else {
                    break;
                };
                if let Err(err) = self.post_recv_buffer(&mut recv, buffer) {
                    warn!("conn {} failed to replenish receive: {err}", self.id);
                    break;
                }
                recv.shortfall -= 1;
                self.flow.on_recv_reposted();
            }
        }
        self.send_credit_if_necessary();
    }

    fn post_recv_buffer(&self, recv: &mut RecvState, buffer: Buffer) -> Result<()> {
        let length = wr_length(buffer.capacity())?;
        let addr = buffer.addr();
        let wr_id = self.completions.lock().insert(CompletionInfo::Recv(buffer));
        if self.config.check_order {
            recv.order.on_post(wr_id);
        }
        let wr = RecvWr {
            wr_id,
            addr,
            length,
            lkey: self.resource.lkey(),
        };
        if let Err(err) = self.qp.post_recv(wr) {
            let _info = self.completions.lock().take(wr_id);
            recv.order.on_reject(wr_id);
            return Err(err);
        }
        Ok(())
    }

    fn on_send_complete(self: &Arc<Self>, wc: &WorkCompletion, info: CompletionInfo) {
        let ok = wc.is_success();
        match info {
            CompletionInfo::Recv(_) => error!("conn {} receive context on send queue", self.id),
            CompletionInfo::GeneralSend(_buffer) => {
                if !ok {
                    debug!("conn {} general send failed: {:?}", self.id, wc.status);
                }
            }
            CompletionInfo::ControlSend(buffer) => {
                if !ok {
                    debug!("conn {} control send failed: {:?}", self.id, wc.status);
                }
                self.ctrl_pool.release(buffer);
            }
            CompletionInfo::LargePull {
                buffer,
                ty,
                id,
                len,
            } => self.on_pull_complete(wc, buffer, ty, id, len),
            CompletionInfo::DirectRead {
                mut buffer,
                len,
                handler,
            } => {
                let result = if ok {
                    buffer.advance_write(len)
                } else {
                    Err(RdmaError::Completion(wc.status))
                };
                handler(result, buffer);
            }
            CompletionInfo::DirectWrite {
                mut buffer,
                handler,
                signal,
            } => {
                let result = if ok {
                    let len = buffer.data_size();
                    let signalled = signal.map_or(Ok(()), |signal| {
                        self.signal_direct_write(signal, &buffer, len)
                    });
                    buffer.advance_read(len).and(signalled)
                } else {
                    Err(RdmaError::Completion(wc.status))
                };
                match handler {
                    Some(handler) => handler(result, buffer),
                    None => {
                        if let Err(err) = result {
                            warn!("conn {} direct write failed: {err}", self.id);
                        }
                    }
                }
            }
        }
    }

    fn flush_send_queue(&self) {
        let mut state = self.send_state.lock();
        self.flush_locked(&mut state);
    }

    /// Posts deferred pulls and sends, oldest first, until flow control
    /// denies one.
    fn flush_locked(&self, state: &mut SendState) {
        while let Some(pull) = state.pulls.pop_front() {
            if !self.flow.request_wr_slot() {
                state.pulls.push_front(pull);
                break;
            }
            let id = pull.id;
            if let Err(err) = self.post_pull(state, pull) {
                self.flow.refund_wr_slot();
                warn!("conn {} deferred pull {id} failed: {err}", self.id);
                state
                    .pending
                    .push_back(SendRequest::Control(control::pull_failed(id)));
            }
        }
        while let Some(request) = state.pending.pop_front() {
            match self.try_post(state, request) {
                PostOutcome::Posted => {}
                PostOutcome::Denied(request) => {
                    state.pending.push_front(request);
                    break;
                }
                PostOutcome::Failed(err, request) => {
                    warn!("conn {} deferred send failed: {err}", self.id);
                    self.discard_request(&request);
                }
            }
        }
    }

    /// Posts `request` now if nothing is queued ahead of it and credit
    /// allows, otherwise queues it.
    fn submit(&self, request: SendRequest) -> Result<()> {
        if let Err(err) = self.ensure_connected() {
            self.discard_request(&request);
            return Err(err);
        }
        let mut state = self.send_state.lock();
        let request = if state.pending.is_empty() {
            match self.try_post(&mut state, request) {
                PostOutcome::Posted => return Ok(()),
                PostOutcome::Denied(request) => request,
                PostOutcome::Failed(err, request) => {
                    drop(state);
                    self.discard_request(&request);
                    return Err(err);
                }
            }
        } else {
            request
        };
        if request.is_caller_send() && state.pending.len() >= self.config.max_pending_sends {
            drop(state);
            self.discard_request(&request);
            return Err(RdmaError::WouldBlock(format!(
                "{} sends already queued",
                self.config.max_pending_sends
            )));
        }
        debug!(
            "conn {} defers send, xmit credit {}, outstanding {}",
            self.id,
            self.flow.xmit_credit(),
            self.flow.outstanding_send()
        );
        state.pending.push_back(request);
        Ok(())
    }

    fn try_post(&self, state: &mut SendState, request: SendRequest) -> PostOutcome {
        if !self.flow.request_send() {
            return PostOutcome::Denied(request);
        }
        let result = match request {
            SendRequest::General { ty, ref buffer } => self.post_general(state, ty, buffer),
            SendRequest::Control(ref msg) => self.post_control(state, msg),
        };
        match result {
            Ok(()) => PostOutcome::Posted,
            Err(err) => {
                self.flow.refund_send();
                PostOutcome::Failed(err, request)
            }
        }
    }

    /// Releases what a dropped request was holding.
    fn discard_request(&self, request: &SendRequest) {
        if let SendRequest::Control(ControlMessage::LargeBufferSend { id, .. }) = *request {
            let _held = self.holders.lock().large_sends.remove(&id);
        }
    }

    fn post_general(&self, state: &mut SendState, ty: u32, buffer: &Buffer) -> Result<()> {
        let length = wr_length(buffer.data_size())?;
        let laddr = buffer.read_addr();
        let wr_id = self
            .completions
            .lock()
            .insert(CompletionInfo::GeneralSend(buffer.clone()));
        let wr = SendWrBase::new(
            wr_id,
            laddr,
            length,
            self.resource.lkey(),
            WorkReqOpCode::SendWithImm,
        )
        .with_imm(ty);
        self.post_send_wr(state, wr_id, wr.into())?;
        bump(&self.counters.general_sends);
        Ok(())
    }

    fn post_control(&self, state: &mut SendState, msg: &ControlMessage) -> Result<()> {
        let mut buffer = self.ctrl_pool.acquire_or_alloc()?;
        if let Err(err) = msg.encode_into(&mut buffer) {
            self.ctrl_pool.release(buffer);
            return Err(err);
        }
        let length = wr_length(buffer.data_size())?;
        let laddr = buffer.read_addr();
        let wr_id = self
            .completions
            .lock()
            .insert(CompletionInfo::ControlSend(buffer));
        let wr = SendWrBase::new(
            wr_id,
            laddr,
            length,
            self.resource.lkey(),
            WorkReqOpCode::Send,
        );
        self.post_send_wr(state, wr_id, wr.into())?;
        debug!("conn {} sent {msg:?}", self.id);
        bump(&self.counters.control_sends);
        match *msg {
            ControlMessage::CreditUpdate { .. } => bump(&self.counters.credit_updates_sent),
            ControlMessage::LargeBufferSend { .. } => bump(&self.counters.large_sends),
            _ => {}
        }
        Ok(())
    }

    /// Posts a send work request whose context is already stored under
    /// `wr_id`. On rejection the context is taken back.
    fn post_send_wr(&self, state: &mut SendState, wr_id: u64, wr: SendWr) -> Result<()> {
        if self.config.check_order {
            state.order.on_post(wr_id);
        }
        if let Err(err) = self.qp.post_send(wr) {
            state.order.on_reject(wr_id);
            let info = self.completions.lock().take(wr_id);
            if let Some(CompletionInfo::ControlSend(buffer)) = info {
                self.ctrl_pool.release(buffer);
            }
            return Err(err);
        }
        Ok(())
    }
}
