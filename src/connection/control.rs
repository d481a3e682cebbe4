//! Handling of the control sub-protocol: credit announcements, the
//! large-buffer pull and direct sink bookkeeping.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::{
    completion::CompletionInfo,
    error::Result,
    mem::buffer::Buffer,
    protocol::{ControlMessage, LARGE_BUFFER_FAILED, LARGE_BUFFER_OK},
    verbs::{SendWrBase, SendWrRdma, WorkCompletion, WorkReqOpCode},
};

use super::{
    stats::bump, wr_length, Connection, PendingPull, RemoteAccess, SendRequest, SendState,
};

pub(super) fn pull_failed(id: u64) -> ControlMessage {
    ControlMessage::LargeBufferAck {
        id,
        result: LARGE_BUFFER_FAILED,
    }
}

impl Connection {
    pub(super) fn on_control_recv(self: &Arc<Self>, buffer: Buffer, byte_len: usize) {
        let mut view = buffer.clone();
        view.clear();
        let decoded = view
            .advance_write(byte_len)
            .and_then(|()| ControlMessage::decode(&view.to_vec()));
        drop(view);

        let mut buffer = buffer;
        buffer.clear();
        self.repost_recv(buffer);

        match decoded {
            Ok(msg) => {
                debug!("conn {} received {msg:?}", self.id);
                self.handle_control(msg);
            }
            Err(err) => {
                bump(&self.counters.protocol_errors);
                error!("conn {} closing on malformed control message: {err}", self.id);
                self.close();
            }
        }
    }

    fn handle_control(self: &Arc<Self>, msg: ControlMessage) {
        match msg {
            ControlMessage::CreditUpdate { credit } => {
                bump(&self.counters.credit_updates_received);
                self.flow.add_xmit_credit(credit);
                self.flush_send_queue();
            }
            ControlMessage::LargeBufferSend {
                id,
                address,
                length,
                remote_key,
                ty,
            } => self.start_pull(id, address, length, remote_key, ty),
            ControlMessage::LargeBufferAck { id, result } => {
                let held = self.holders.lock().large_sends.remove(&id);
                match held {
                    None => warn!("conn {} ack for unknown large buffer {id}", self.id),
                    Some(_) if result != LARGE_BUFFER_OK => {
                        warn!("conn {} peer failed to pull large buffer {id}", self.id);
                    }
                    Some(_) => debug!("conn {} large buffer {id} released", self.id),
                }
            }
            ControlMessage::AccessExchange {
                address,
                length,
                remote_key,
            } => {
                info!(
                    "conn {} peer memory {address:#x}+{length:#x}, rkey {remote_key:#x}",
                    self.id
                );
                *self.remote_access.lock() = Some(RemoteAccess {
                    address,
                    length,
                    remote_key,
                });
            }
            ControlMessage::SendDirectSignal {
                source_id,
                sink_id,
                length,
                ty,
            } => self.on_direct_signal(source_id, sink_id, length, ty),
            ControlMessage::RegDirectBuffer { sink_id, address } => {
                let _prev = self.holders.lock().remote_sinks.insert(sink_id, address);
            }
            ControlMessage::UnregDirectBuffer { sink_id } => {
                if self.holders.lock().remote_sinks.remove(&sink_id).is_none() {
                    warn!("conn {} peer unregistered unknown sink {sink_id:#x}", self.id);
                }
            }
        }
    }

    /// Sends a credit update once enough receive buffers were re-posted.
    /// Credit updates bypass the deferred send queue.
    pub(super) fn send_credit_if_necessary(&self) {
        if !self.flow.recv_credit_due() {
            return;
        }
        let mut state = self.send_state.lock();
        if !self.flow.recv_credit_due() || !self.flow.request_ack() {
            return;
        }
        let credit = self.flow.take_recv_credit();
        if let Err(err) = self.post_control(&mut state, &ControlMessage::CreditUpdate { credit }) {
            warn!("conn {} credit update failed: {err}", self.id);
            self.flow.refund_send();
            self.flow.restore_recv_credit(credit);
        }
    }

    /// Validates an announced large buffer and pulls it with RDMA READ, or
    /// queues the pull while the send queue is full.
    fn start_pull(&self, id: u64, address: u64, length: u64, remote_key: u32, ty: u32) {
        let access = *self.remote_access.lock();
        let len = match access {
            Some(access) if access.remote_key == remote_key && access.contains(address, length) => {
                usize::try_from(length).ok().filter(|&len| wr_length(len).is_ok())
            }
            _ => None,
        };
        let Some(len) = len else {
            warn!(
                "conn {} rejects large buffer {id}: {address:#x}+{length:#x} outside peer memory",
                self.id
            );
            self.ack_large_buffer(id, LARGE_BUFFER_FAILED);
            return;
        };
        let buffer = match self.pool.alloc(len) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("conn {} cannot hold large buffer {id}: {err}", self.id);
                self.ack_large_buffer(id, LARGE_BUFFER_FAILED);
                return;
            }
        };
        let pull = PendingPull {
            buffer,
            ty,
            id,
            address,
            remote_key,
            len,
        };
        let mut state = self.send_state.lock();
        if !state.pulls.is_empty() || !self.flow.request_wr_slot() {
            debug!("conn {} defers pull of large buffer {id}", self.id);
            state.pulls.push_back(pull);
            return;
        }
        if let Err(err) = self.post_pull(&mut state, pull) {
            self.flow.refund_wr_slot();
            drop(state);
            warn!("conn {} pull of large buffer {id} failed: {err}", self.id);
            self.ack_large_buffer(id, LARGE_BUFFER_FAILED);
        }
    }

    pub(super) fn post_pull(&self, state: &mut SendState, pull: PendingPull) -> Result<()> {
        let length = wr_length(pull.len)?;
        let laddr = pull.buffer.write_addr();
        let wr_id = self.completions.lock().insert(CompletionInfo::LargePull {
            buffer: pull.buffer,
            ty: pull.ty,
            id: pull.id,
            len: pull.len,
        });
        let base = SendWrBase::new(
            wr_id,
            laddr,
            length,
            self.resource.lkey(),
            WorkReqOpCode::RdmaRead,
        );
        let wr = SendWrRdma::new_from_base(base, pull.address, pull.remote_key);
        self.post_send_wr(state, wr_id, wr.into())?;
        bump(&self.counters.large_pulls);
        Ok(())
    }

    pub(super) fn on_pull_complete(
        self: &Arc<Self>,
        wc: &WorkCompletion,
        mut buffer: Buffer,
        ty: u32,
        id: u64,
        len: usize,
    ) {
        if !wc.is_success() {
            warn!("conn {} pull of large buffer {id} failed: {:?}", self.id, wc.status);
            self.ack_large_buffer(id, LARGE_BUFFER_FAILED);
            return;
        }
        if let Err(err) = buffer.advance_write(len) {
            error!("conn {} large buffer {id}: {err}", self.id);
            self.ack_large_buffer(id, LARGE_BUFFER_FAILED);
            return;
        }
        self.dispatcher.dispatch_data_event(ty, buffer, self);
        self.ack_large_buffer(id, LARGE_BUFFER_OK);
    }

    fn ack_large_buffer(&self, id: u64, result: u32) {
        let msg = ControlMessage::LargeBufferAck { id, result };
        if let Err(err) = self.submit(SendRequest::Control(msg)) {
            warn!("conn {} cannot ack large buffer {id}: {err}", self.id);
        }
    }

    fn on_direct_signal(self: &Arc<Self>, source_id: u64, sink_id: u64, length: u64, ty: u32) {
        let sink = self.holders.lock().local_sinks.get(&sink_id).cloned();
        let Some(mut buffer) = sink else {
            warn!("conn {} direct signal for unknown sink {sink_id:#x}", self.id);
            return;
        };
        buffer.clear();
        let filled = usize::try_from(length)
            .map_err(|_err| length)
            .and_then(|len| buffer.advance_write(len).map_err(|_err| length));
        if let Err(length) = filled {
            warn!(
                "conn {} direct write of {length} bytes overflows sink {sink_id:#x}",
                self.id
            );
            return;
        }
        debug!(
            "conn {} direct write {source_id:#x} -> {sink_id:#x}, {length} bytes",
            self.id
        );
        self.dispatcher.dispatch_data_event(ty, buffer, self);
    }
}
