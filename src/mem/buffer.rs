use std::{fmt, sync::Arc};

use crate::error::{RdmaError, Result};

use super::{pool::PoolInner, GlobalMemory};

/// A range of the global memory owned by the pool until the last buffer
/// referencing it is dropped.
pub(crate) struct Chunk {
    memory: Arc<GlobalMemory>,
    pool: Arc<PoolInner>,
    /// Offset from the start of the global memory
    offset: usize,
    len: usize,
    frame: usize,
    frames: usize,
}

impl Chunk {
    pub(crate) fn new(
        memory: Arc<GlobalMemory>,
        pool: Arc<PoolInner>,
        offset: usize,
        len: usize,
        frame: usize,
        frames: usize,
    ) -> Self {
        Self {
            memory,
            pool,
            offset,
            len,
            frame,
            frames,
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.pool.release(self.frame, self.frames, self.len);
    }
}

/// A byte container with independent read and write cursors.
///
/// Cloning and slicing never copy bytes: every clone refers to the same
/// memory and keeps it alive. Clones share bytes but not cursors; writing the
/// same bytes through two handles from different threads at once is a data
/// race the caller must avoid, exactly as with memory handed to the device.
#[derive(Clone)]
pub struct Buffer {
    chunk: Arc<Chunk>,
    /// Start of this view inside the chunk
    start: usize,
    capacity: usize,
    reader: usize,
    writer: usize,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("addr", &format_args!("{:x}", self.addr()))
            .field("capacity", &self.capacity)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

macro_rules! primitive_rw {
    ($($write:ident, $read:ident => $ty:ty;)*) => {
        $(
            #[doc = concat!("Appends a little-endian `", stringify!($ty), "`.")]
            pub fn $write(&mut self, value: $ty) -> Result<()> {
                self.write_bytes(&value.to_le_bytes())
            }

            #[doc = concat!("Consumes a little-endian `", stringify!($ty), "`.")]
            pub fn $read(&mut self) -> Result<$ty> {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                self.read_bytes(&mut bytes)?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        )*
    };
}

impl Buffer {
    pub(crate) fn new(chunk: Chunk) -> Self {
        let capacity = chunk.len;
        Self {
            chunk: Arc::new(chunk),
            start: 0,
            capacity,
            reader: 0,
            writer: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes written but not yet read.
    pub fn data_size(&self) -> usize {
        self.writer - self.reader
    }

    /// Number of bytes that can still be written.
    pub fn free_size(&self) -> usize {
        self.capacity - self.writer
    }

    pub fn is_empty(&self) -> bool {
        self.data_size() == 0
    }

    /// Address of the first byte of this view. Stable for the lifetime of
    /// the buffer, which makes it usable as an identity.
    #[allow(clippy::as_conversions)]
    pub fn addr(&self) -> u64 {
        self.chunk.memory.addr() + (self.chunk.offset + self.start) as u64
    }

    /// Address of the next byte to read.
    #[allow(clippy::as_conversions)]
    pub fn read_addr(&self) -> u64 {
        self.addr() + self.reader as u64
    }

    /// Address of the next byte to write.
    #[allow(clippy::as_conversions)]
    pub fn write_addr(&self) -> u64 {
        self.addr() + self.writer as u64
    }

    /// Resets both cursors.
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }

    pub fn advance_read(&mut self, n: usize) -> Result<()> {
        if n > self.data_size() {
            return Err(RdmaError::InvalidInput(format!(
                "cannot consume {n} bytes, {} readable",
                self.data_size()
            )));
        }
        self.reader += n;
        Ok(())
    }

    pub fn advance_write(&mut self, n: usize) -> Result<()> {
        if n > self.free_size() {
            return Err(RdmaError::InvalidInput(format!(
                "cannot produce {n} bytes, {} free",
                self.free_size()
            )));
        }
        self.writer += n;
        Ok(())
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.free_size() {
            return Err(RdmaError::InvalidInput(format!(
                "write of {} bytes exceeds {} free",
                src.len(),
                self.free_size()
            )));
        }
        // SAFETY: the range is inside this view, which the chunk owns.
        #[allow(unsafe_code)]
        let copied = unsafe { self.chunk.memory.write_at(self.write_addr(), src) };
        debug_assert!(copied, "buffer view outside global memory");
        self.writer += src.len();
        Ok(())
    }

    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.data_size() {
            return Err(RdmaError::InvalidInput(format!(
                "read of {} bytes exceeds {} readable",
                dst.len(),
                self.data_size()
            )));
        }
        // SAFETY: the range is inside this view, which the chunk owns.
        #[allow(unsafe_code)]
        let copied = unsafe { self.chunk.memory.read_at(self.read_addr(), dst) };
        debug_assert!(copied, "buffer view outside global memory");
        self.reader += dst.len();
        Ok(())
    }

    primitive_rw! {
        write_u8, read_u8 => u8;
        write_u16, read_u16 => u16;
        write_u32, read_u32 => u32;
        write_u64, read_u64 => u64;
        write_i32, read_i32 => i32;
        write_i64, read_i64 => i64;
    }

    /// Copies the readable bytes without moving the read cursor.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.data_size()];
        // SAFETY: the range is inside this view, which the chunk owns.
        #[allow(unsafe_code)]
        let copied = unsafe { self.chunk.memory.read_at(self.read_addr(), &mut out) };
        debug_assert!(copied, "buffer view outside global memory");
        out
    }

    /// Returns a zero-copy view of `len` readable bytes starting `offset`
    /// bytes past the read cursor. The view is full: its readable size is
    /// `len`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Buffer> {
        let _end = offset
            .checked_add(len)
            .filter(|&end| end <= self.data_size())
            .ok_or_else(|| {
                RdmaError::InvalidInput(format!(
                    "slice {offset}+{len} exceeds {} readable",
                    self.data_size()
                ))
            })?;
        Ok(Buffer {
            chunk: Arc::clone(&self.chunk),
            start: self.start + self.reader + offset,
            capacity: len,
            reader: 0,
            writer: len,
        })
    }

    /// Returns `true` if both handles view the same bytes.
    pub fn same_memory(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
            && self.start == other.start
            && self.capacity == other.capacity
    }
}
