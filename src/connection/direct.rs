//! One-sided direct transfers into buffers the peer registered as sinks.
//!
//! A sink id is the address of the registered buffer on the side that owns
//! it. The owner announces it with `RegDirectBuffer`; the other side may
//! then RDMA WRITE into it or READ from it.

use log::debug;

use crate::{
    completion::{CompletionHandler, CompletionInfo, DirectSignal},
    error::{RdmaError, Result},
    mem::buffer::Buffer,
    protocol::ControlMessage,
    verbs::{SendWr, SendWrBase, SendWrRdma, WorkReqOpCode},
};

use super::{stats::bump, wr_length, Connection, SendRequest};

impl Connection {
    /// Registers `buffer` as a sink the peer may write into and returns its
    /// sink id. The buffer is held until unregistered or closed.
    pub fn register_direct(&self, buffer: &Buffer) -> Result<u64> {
        self.ensure_connected()?;
        let sink_id = buffer.addr();
        if self
            .holders
            .lock()
            .local_sinks
            .insert(sink_id, buffer.clone())
            .is_some()
        {
            debug!("conn {} re-registers sink {sink_id:#x}", self.id);
        }
        let msg = ControlMessage::RegDirectBuffer {
            sink_id,
            address: buffer.addr(),
        };
        if let Err(err) = self.submit(SendRequest::Control(msg)) {
            let _held = self.holders.lock().local_sinks.remove(&sink_id);
            return Err(err);
        }
        Ok(sink_id)
    }

    pub fn unregister_direct(&self, sink_id: u64) -> Result<()> {
        if self.holders.lock().local_sinks.remove(&sink_id).is_none() {
            return Err(RdmaError::NotFound(format!("direct sink {sink_id:#x}")));
        }
        if self.is_connected() {
            self.submit(SendRequest::Control(ControlMessage::UnregDirectBuffer {
                sink_id,
            }))?;
        }
        Ok(())
    }

    /// Writes the readable bytes of `buffer` into the peer's sink `sink_id`
    /// and waits for completion. On success the read cursor of `buffer`
    /// has advanced past the written bytes.
    pub fn write(&self, sink_id: u64, buffer: &mut Buffer) -> Result<()> {
        self.ensure_not_poller()?;
        let (tx, rx) = oneshot::channel();
        self.write_async(
            sink_id,
            buffer.clone(),
            Box::new(move |result, buf| {
                let _ignore = tx.send((result, buf));
            }),
        )?;
        let (result, done) = rx.recv().map_err(|_err| RdmaError::NotConnected)?;
        *buffer = done;
        result
    }

    /// Posts an RDMA WRITE into the peer's sink `sink_id`. `handler` runs on
    /// the poller thread once the write completes, or from [`Self::close`].
    /// It is not invoked when this returns an error.
    pub fn write_async(
        &self,
        sink_id: u64,
        buffer: Buffer,
        handler: CompletionHandler,
    ) -> Result<()> {
        self.post_direct_write(sink_id, buffer, Some(handler), None)
    }

    /// Writes `buffer` into the peer's sink and, once the write lands,
    /// signals the peer to dispatch the sink contents as a message of type
    /// `ty`.
    pub fn send_direct(&self, ty: u32, sink_id: u64, buffer: &Buffer) -> Result<()> {
        self.post_direct_write(
            sink_id,
            buffer.clone(),
            None,
            Some(DirectSignal { ty, sink_id }),
        )
    }

    /// Reads `len` bytes from the start of the peer's sink into the
    /// writable space of `buffer` and waits for completion.
    pub fn read(&self, sink_id: u64, buffer: &mut Buffer, len: usize) -> Result<()> {
        self.ensure_not_poller()?;
        let (tx, rx) = oneshot::channel();
        self.read_async(
            sink_id,
            buffer.clone(),
            len,
            Box::new(move |result, buf| {
                let _ignore = tx.send((result, buf));
            }),
        )?;
        let (result, done) = rx.recv().map_err(|_err| RdmaError::NotConnected)?;
        *buffer = done;
        result
    }

    pub fn read_async(
        &self,
        sink_id: u64,
        buffer: Buffer,
        len: usize,
        handler: CompletionHandler,
    ) -> Result<()> {
        self.ensure_connected()?;
        if len > buffer.free_size() {
            return Err(RdmaError::InvalidInput(format!(
                "{len} bytes exceed {} writable",
                buffer.free_size()
            )));
        }
        let length = wr_length(len)?;
        let (raddr, rkey) = self.remote_sink(sink_id)?;
        let laddr = buffer.write_addr();
        let lkey = self.resource.lkey();
        self.post_one_sided(
            |wr_id| {
                let base = SendWrBase::new(wr_id, laddr, length, lkey, WorkReqOpCode::RdmaRead);
                SendWrRdma::new_from_base(base, raddr, rkey).into()
            },
            CompletionInfo::DirectRead {
                buffer,
                len,
                handler,
            },
        )?;
        bump(&self.counters.direct_reads);
        Ok(())
    }

    pub(super) fn signal_direct_write(
        &self,
        signal: DirectSignal,
        buffer: &Buffer,
        len: usize,
    ) -> Result<()> {
        let length = u64::try_from(len)
            .map_err(|_err| RdmaError::InvalidInput(format!("{len} bytes")))?;
        self.submit(SendRequest::Control(ControlMessage::SendDirectSignal {
            source_id: buffer.addr(),
            sink_id: signal.sink_id,
            length,
            ty: signal.ty,
        }))
    }

    fn post_direct_write(
        &self,
        sink_id: u64,
        buffer: Buffer,
        handler: Option<CompletionHandler>,
        signal: Option<DirectSignal>,
    ) -> Result<()> {
        self.ensure_connected()?;
        let length = wr_length(buffer.data_size())?;
        let (raddr, rkey) = self.remote_sink(sink_id)?;
        let laddr = buffer.read_addr();
        let lkey = self.resource.lkey();
        self.post_one_sided(
            |wr_id| {
                let base = SendWrBase::new(wr_id, laddr, length, lkey, WorkReqOpCode::RdmaWrite);
                SendWrRdma::new_from_base(base, raddr, rkey).into()
            },
            CompletionInfo::DirectWrite {
                buffer,
                handler,
                signal,
            },
        )?;
        bump(&self.counters.direct_writes);
        Ok(())
    }

    /// Resolves a peer sink to its remote address and key.
    fn remote_sink(&self, sink_id: u64) -> Result<(u64, u32)> {
        let address = self
            .holders
            .lock()
            .remote_sinks
            .get(&sink_id)
            .copied()
            .ok_or_else(|| RdmaError::NotFound(format!("direct sink {sink_id:#x}")))?;
        let access = self.remote_access.lock().ok_or_else(|| {
            RdmaError::ConnectionError("peer memory access not exchanged".into())
        })?;
        Ok((address, access.remote_key))
    }

    /// Posts a READ or WRITE under the send lock. One-sided requests use no
    /// credit, only a send slot, and are never queued.
    fn post_one_sided<F>(&self, build: F, info: CompletionInfo) -> Result<()>
    where
        F: FnOnce(u64) -> SendWr,
    {
        let mut state = self.send_state.lock();
        if !self.flow.request_wr_slot() {
            return Err(RdmaError::WouldBlock(format!(
                "{} send work requests outstanding",
                self.flow.outstanding_send()
            )));
        }
        let wr_id = self.completions.lock().insert(info);
        if let Err(err) = self.post_send_wr(&mut state, wr_id, build(wr_id)) {
            self.flow.refund_wr_slot();
            return Err(err);
        }
        Ok(())
    }

    fn ensure_not_poller(&self) -> Result<()> {
        if self.poller.is_poller_thread() {
            return Err(RdmaError::InvalidInput(
                "synchronous transfer on the poller thread".into(),
            ));
        }
        Ok(())
    }
}
