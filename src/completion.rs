use std::{collections::VecDeque, fmt};

use bitvec::vec::BitVec;
use log::error;

use crate::{error::Result, mem::buffer::Buffer};

/// Callback invoked when a one-sided operation completes.
pub type CompletionHandler = Box<dyn FnOnce(Result<()>, Buffer) + Send>;

/// Notification sent to the peer after a direct write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirectSignal {
    pub(crate) ty: u32,
    pub(crate) sink_id: u64,
}

/// Context of a posted work request, recovered from its `wr_id`.
pub(crate) enum CompletionInfo {
    /// A posted receive buffer
    Recv(Buffer),
    /// A general message sent with the type in the immediate
    GeneralSend(Buffer),
    /// A control message; the buffer returns to the control pool
    ControlSend(Buffer),
    /// RDMA READ pulling an announced large buffer
    LargePull {
        buffer: Buffer,
        ty: u32,
        id: u64,
        len: usize,
    },
    DirectRead {
        buffer: Buffer,
        len: usize,
        handler: CompletionHandler,
    },
    DirectWrite {
        buffer: Buffer,
        handler: Option<CompletionHandler>,
        signal: Option<DirectSignal>,
    },
}

impl fmt::Debug for CompletionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CompletionInfo::Recv(ref buf) => f.debug_tuple("Recv").field(buf).finish(),
            CompletionInfo::GeneralSend(ref buf) => {
                f.debug_tuple("GeneralSend").field(buf).finish()
            }
            CompletionInfo::ControlSend(ref buf) => {
                f.debug_tuple("ControlSend").field(buf).finish()
            }
            CompletionInfo::LargePull {
                ref buffer,
                ty,
                id,
                len,
            } => f
                .debug_struct("LargePull")
                .field("buffer", buffer)
                .field("ty", &ty)
                .field("id", &id)
                .field("len", &len)
                .finish(),
            CompletionInfo::DirectRead {
                ref buffer, len, ..
            } => f
                .debug_struct("DirectRead")
                .field("buffer", buffer)
                .field("len", &len)
                .finish_non_exhaustive(),
            CompletionInfo::DirectWrite {
                ref buffer,
                ref signal,
                ..
            } => f
                .debug_struct("DirectWrite")
                .field("buffer", buffer)
                .field("signal", signal)
                .finish_non_exhaustive(),
        }
    }
}

/// Arena of in-flight work requests.
///
/// A `wr_id` packs the slot index in the low 32 bits and the slot generation
/// in the high 32 bits, so a stale or forged id never resolves to a reused
/// slot.
#[derive(Default)]
pub(crate) struct CompletionSlab {
    /// Bitmap tracking occupied slots
    bitmap: BitVec,
    generations: Vec<u32>,
    slots: Vec<Option<CompletionInfo>>,
}

#[allow(clippy::as_conversions, clippy::indexing_slicing)]
impl CompletionSlab {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores `info` and returns the `wr_id` identifying it.
    #[allow(clippy::cast_possible_truncation)] // slot count stays far below u32::MAX
    pub(crate) fn insert(&mut self, info: CompletionInfo) -> u64 {
        let index = if let Some(index) = self.bitmap.first_zero() {
            index
        } else {
            self.bitmap.push(false);
            self.generations.push(0);
            self.slots.push(None);
            self.slots.len() - 1
        };
        self.bitmap.set(index, true);
        let generation = self.generations[index].wrapping_add(1);
        self.generations[index] = generation;
        self.slots[index] = Some(info);
        (u64::from(generation) << 32) | index as u64
    }

    /// Removes and returns the context of `wr_id`.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn take(&mut self, wr_id: u64) -> Option<CompletionInfo> {
        let index = (wr_id & 0xffff_ffff) as usize;
        let generation = (wr_id >> 32) as u32;
        if !self.bitmap.get(index).is_some_and(|x| *x) || self.generations[index] != generation {
            return None;
        }
        self.bitmap.set(index, false);
        self.slots[index].take()
    }

    pub(crate) fn len(&self) -> usize {
        self.bitmap.count_ones()
    }

    /// Removes every pending context.
    pub(crate) fn drain(&mut self) -> Vec<CompletionInfo> {
        self.bitmap.fill(false);
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// Verifies that completions arrive in posting order.
#[derive(Debug, Default)]
pub(crate) struct OrderChecker {
    posted: VecDeque<u64>,
}

impl OrderChecker {
    pub(crate) fn on_post(&mut self, wr_id: u64) {
        self.posted.push_back(wr_id);
    }

    /// Forgets a post the queue pair rejected.
    pub(crate) fn on_reject(&mut self, wr_id: u64) {
        if let Some(pos) = self.posted.iter().rposition(|&id| id == wr_id) {
            let _ignore = self.posted.remove(pos);
        }
    }

    /// Returns `false` and logs if `wr_id` is not the oldest outstanding
    /// request.
    pub(crate) fn on_complete(&mut self, direction: &str, wr_id: u64) -> bool {
        match self.posted.front() {
            Some(&expected) if expected == wr_id => {
                let _front = self.posted.pop_front();
                true
            }
            expected => {
                error!("{direction} completion out of order: expected {expected:?}, got {wr_id:#x}");
                if let Some(pos) = self.posted.iter().position(|&id| id == wr_id) {
                    let _ignore = self.posted.remove(pos);
                }
                false
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.posted.clear();
    }
}
