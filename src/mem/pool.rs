use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use buddy_system_allocator::FrameAllocator;
use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{RdmaError, Result};

use super::{
    buffer::{Buffer, Chunk},
    GlobalMemory,
};

const ORDER: usize = 32;

/// Poll interval of [`ControlBufferPool::acquire_timeout`].
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_micros(50);

pub(crate) struct PoolInner {
    allocator: Mutex<FrameAllocator<ORDER>>,
    frame_size: usize,
    /// Frame numbers start here so buddy blocks never straddle frame zero.
    frame_base: usize,
    allocated: AtomicUsize,
}

impl PoolInner {
    pub(crate) fn release(&self, frame: usize, frames: usize, len: usize) {
        self.allocator.lock().dealloc(frame, frames);
        let _prev = self.allocated.fetch_sub(len, Ordering::Relaxed);
    }
}

/// Hands out buffers carved from the global memory.
///
/// Allocation is buddy based with a granularity of one frame, so every
/// buffer is contiguous and covered by the single registration of the
/// global memory.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    memory: Arc<GlobalMemory>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("memory", &self.memory)
            .field("frame_size", &self.inner.frame_size)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

impl BufferPool {
    pub fn new(memory: Arc<GlobalMemory>, frame_size: usize) -> Result<Self> {
        if !frame_size.is_power_of_two() {
            return Err(RdmaError::InvalidInput(format!(
                "frame size {frame_size} is not a power of two"
            )));
        }
        let frames = memory.len() / frame_size;
        if frames == 0 {
            return Err(RdmaError::InvalidInput(
                "global memory smaller than one frame".into(),
            ));
        }
        let frame_base = frames.next_power_of_two();
        let mut allocator = FrameAllocator::<ORDER>::new();
        allocator.add_frame(frame_base, frame_base + frames);
        Ok(Self {
            inner: Arc::new(PoolInner {
                allocator: Mutex::new(allocator),
                frame_size,
                frame_base,
                allocated: AtomicUsize::new(0),
            }),
            memory,
        })
    }

    /// Allocates an empty buffer with capacity `size`.
    pub fn alloc(&self, size: usize) -> Result<Buffer> {
        if size == 0 {
            return Err(RdmaError::InvalidInput("zero sized buffer".into()));
        }
        let frames = size.div_ceil(self.inner.frame_size);
        let Some(frame) = self.inner.allocator.lock().alloc(frames) else {
            return Err(RdmaError::ResourceExhausted(format!(
                "no contiguous space for {size} bytes"
            )));
        };
        let _prev = self.inner.allocated.fetch_add(size, Ordering::Relaxed);
        let chunk = Chunk::new(
            Arc::clone(&self.memory),
            Arc::clone(&self.inner),
            (frame - self.inner.frame_base) * self.inner.frame_size,
            size,
            frame,
            frames,
        );
        Ok(Buffer::new(chunk))
    }

    pub fn memory(&self) -> &Arc<GlobalMemory> {
        &self.memory
    }

    /// Bytes currently handed out.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

/// Bounded free list of small fixed-size buffers reserved for control sends.
#[derive(Debug)]
pub struct ControlBufferPool {
    free: ArrayQueue<Buffer>,
    fallback: BufferPool,
    buffer_size: usize,
    closed: AtomicBool,
}

impl ControlBufferPool {
    pub fn new(fallback: BufferPool, count: usize, buffer_size: usize) -> Result<Self> {
        if count == 0 {
            return Err(RdmaError::InvalidInput(
                "control pool needs at least one buffer".into(),
            ));
        }
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            let buf = fallback.alloc(buffer_size)?;
            // capacity is `count`, the push cannot fail
            let _ignore = free.push(buf);
        }
        Ok(Self {
            free,
            fallback,
            buffer_size,
            closed: AtomicBool::new(false),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn try_acquire(&self) -> Option<Buffer> {
        self.free.pop()
    }

    /// Takes a pooled buffer, falling back to the general pool when the free
    /// list is empty.
    pub fn acquire_or_alloc(&self) -> Result<Buffer> {
        if let Some(buf) = self.try_acquire() {
            return Ok(buf);
        }
        debug!("control pool empty, allocating from the general pool");
        self.fallback.alloc(self.buffer_size)
    }

    /// Waits up to `timeout` for a pooled buffer.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Buffer> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(buf) = self.try_acquire() {
                return Ok(buf);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(RdmaError::NotConnected);
            }
            if Instant::now() >= deadline {
                return Err(RdmaError::Timeout(format!(
                    "no control buffer within {timeout:?}"
                )));
            }
            spin_sleep::sleep(ACQUIRE_POLL_INTERVAL);
        }
    }

    /// Returns a buffer to the free list. Buffers of a foreign size, or
    /// released after [`Self::clear`], go back to the general pool.
    pub fn release(&self, mut buf: Buffer) {
        if self.closed.load(Ordering::Acquire) || buf.capacity() != self.buffer_size {
            return;
        }
        buf.clear();
        if self.free.push(buf).is_err() {
            warn!("control pool overflow, dropping buffer");
        }
    }

    /// Drops every idle buffer and stops recycling.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        while self.free.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(len: usize) -> BufferPool {
        BufferPool::new(Arc::new(GlobalMemory::new(len).unwrap()), 64).unwrap()
    }

    #[test]
    fn alloc_rejects_zero_and_oversized() {
        let pool = pool(4096);
        assert!(matches!(pool.alloc(0), Err(RdmaError::InvalidInput(_))));
        assert!(matches!(
            pool.alloc(8192),
            Err(RdmaError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn exhausted_space_comes_back_after_drop() {
        let pool = pool(4096);
        let bufs: Vec<_> = (0..4).map(|_| pool.alloc(1024).unwrap()).collect();
        assert!(pool.alloc(64).unwrap_err().is_retryable());
        assert_eq!(pool.allocated_bytes(), 4096);
        drop(bufs);
        assert_eq!(pool.allocated_bytes(), 0);
        let whole = pool.alloc(4096).unwrap();
        assert_eq!(whole.capacity(), 4096);
    }

    #[test]
    fn buffers_do_not_overlap() {
        let pool = pool(1 << 16);
        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(100).unwrap();
        let (lo, hi) = if a.addr() < b.addr() { (a, b) } else { (b, a) };
        assert!(lo.addr() + 100 <= hi.addr());
        assert!(pool.memory().contains(hi.addr(), 100));
    }

    #[test]
    fn control_pool_falls_back_when_empty() {
        let pool = pool(1 << 16);
        let ctrl = ControlBufferPool::new(pool.clone(), 2, 64).unwrap();
        let a = ctrl.try_acquire().unwrap();
        let _b = ctrl.try_acquire().unwrap();
        assert!(ctrl.try_acquire().is_none());
        let c = ctrl.acquire_or_alloc().unwrap();
        assert_eq!(c.capacity(), 64);
        ctrl.release(a);
        assert_eq!(ctrl.available(), 1);
        assert!(ctrl.acquire_timeout(Duration::from_millis(1)).is_ok());
        assert!(matches!(
            ctrl.acquire_timeout(Duration::from_millis(1)),
            Err(RdmaError::Timeout(_))
        ));
    }

    #[test]
    fn cleared_control_pool_stops_recycling() {
        let pool = pool(1 << 16);
        let ctrl = ControlBufferPool::new(pool.clone(), 4, 64).unwrap();
        let held = ctrl.try_acquire().unwrap();
        ctrl.clear();
        ctrl.release(held);
        assert_eq!(ctrl.available(), 0);
        assert_eq!(pool.allocated_bytes(), 0);
    }
}
