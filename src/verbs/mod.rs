//! Verbs-style transport seam.
//!
//! The messaging core only talks to hardware through [`Device`],
//! [`QueuePair`], [`CompletionQueue`] and [`CmChannel`]. The [`loopback`]
//! module provides an in-process implementation of all of them.

pub mod loopback;

use std::{fmt, sync::Arc};

use crate::{error::Result, mem::GlobalMemory, poller::Notifier};

/// Work request opcodes supported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReqOpCode {
    Send,
    SendWithImm,
    RdmaWrite,
    RdmaRead,
}

/// Base fields shared by every send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWrBase {
    pub wr_id: u64,
    pub laddr: u64,
    pub length: u32,
    pub lkey: u32,
    pub imm_data: u32,
    pub opcode: WorkReqOpCode,
}

impl SendWrBase {
    pub fn new(wr_id: u64, laddr: u64, length: u32, lkey: u32, opcode: WorkReqOpCode) -> Self {
        Self {
            wr_id,
            laddr,
            length,
            lkey,
            imm_data: 0,
            opcode,
        }
    }

    #[must_use]
    pub fn with_imm(mut self, imm_data: u32) -> Self {
        self.imm_data = imm_data;
        self
    }
}

/// A one-sided work request targeting remote memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SendWrRdma {
    pub base: SendWrBase,
    pub raddr: u64,
    pub rkey: u32,
}

impl fmt::Debug for SendWrRdma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendWrRdma")
            .field("base", &self.base)
            .field("raddr", &format_args!("{:x}", self.raddr))
            .field("rkey", &self.rkey)
            .finish()
    }
}

impl SendWrRdma {
    pub fn new_from_base(base: SendWrBase, raddr: u64, rkey: u32) -> Self {
        Self { base, raddr, rkey }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendWr {
    Rdma(SendWrRdma),
    Send(SendWrBase),
}

impl SendWr {
    pub fn wr_id(&self) -> u64 {
        self.base().wr_id
    }

    pub fn opcode(&self) -> WorkReqOpCode {
        self.base().opcode
    }

    pub fn length(&self) -> u32 {
        self.base().length
    }

    fn base(&self) -> &SendWrBase {
        match *self {
            SendWr::Rdma(ref wr) => &wr.base,
            SendWr::Send(ref wr) => wr,
        }
    }
}

impl From<SendWrRdma> for SendWr {
    fn from(wr: SendWrRdma) -> Self {
        SendWr::Rdma(wr)
    }
}

impl From<SendWrBase> for SendWr {
    fn from(wr: SendWrBase) -> Self {
        SendWr::Send(wr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Opcode reported by a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    RemoteAccessError,
    RemoteInvalidRequest,
    WrFlushError,
    GeneralError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub imm: Option<u32>,
}

impl WorkCompletion {
    pub(crate) fn new(wr_id: u64, opcode: WcOpcode, status: WcStatus) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len: 0,
            imm: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Connection management events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    Established,
    Disconnected,
}

/// Protection domain and memory registration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub lkey: u32,
    pub rkey: u32,
}

/// Protection domain handle.
pub type PdHandle = u32;

/// An RDMA capable device.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn alloc_pd(&self) -> Result<PdHandle>;

    fn dealloc_pd(&self, pd: PdHandle) -> Result<()>;

    /// Registers the whole of `memory` for local and remote access.
    fn reg_mr(&self, pd: PdHandle, memory: &Arc<GlobalMemory>) -> Result<MrKeys>;

    fn dereg_mr(&self, keys: MrKeys) -> Result<()>;
}

/// A reliable connected queue pair.
pub trait QueuePair: Send + Sync {
    fn qpn(&self) -> u32;

    fn post_send(&self, wr: SendWr) -> Result<()>;

    fn post_recv(&self, wr: RecvWr) -> Result<()>;

    /// Moves the queue pair to the error state and waits until the device no
    /// longer touches local memory on its behalf. Posted receives are flushed.
    fn quiesce(&self);

    /// Tears down the transport association; both sides observe
    /// [`CmEvent::Disconnected`].
    fn disconnect(&self) -> Result<()>;
}

pub trait CompletionQueue: Send + Sync {
    fn poll(&self, max_entries: usize) -> Vec<WorkCompletion>;

    /// Arms the queue: the next completion fires the notifier once.
    fn req_notify(&self);

    fn ack_events(&self, count: u32);

    fn set_notifier(&self, notifier: Notifier);
}

pub trait CmChannel: Send + Sync {
    fn get_event(&self) -> Option<CmEvent>;

    fn set_notifier(&self, notifier: Notifier);
}
