/// Reference counted buffers with cursors
pub mod buffer;
/// Buffer pools backed by the global memory
pub mod pool;
/// Per-device protection domain and registration
pub mod resource;

use std::{fmt, io, ptr::NonNull};

use memmap2::MmapMut;

/// The process-wide memory area that is registered once with every device.
///
/// All buffers handed out by the pool live inside this mapping, so a single
/// local/remote key pair per device covers every buffer.
pub struct GlobalMemory {
    /// Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: `base` points into `_map`, which lives as long as `self` and is
// never remapped. Callers of the raw accessors uphold the aliasing contract.
#[allow(unsafe_code)]
unsafe impl Send for GlobalMemory {}
#[allow(unsafe_code)]
unsafe impl Sync for GlobalMemory {}

impl fmt::Debug for GlobalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalMemory")
            .field("addr", &format_args!("{:x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl GlobalMemory {
    /// Maps `len` bytes of anonymous memory.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        let mut map = MmapMut::map_anon(len)?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self {
            _map: map,
            base,
            len,
        })
    }

    /// Virtual address of the first byte.
    #[allow(clippy::as_conversions)]
    pub fn addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `[addr, addr + len)` lies inside the mapping.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(offset) = addr.checked_sub(self.addr()) else {
            return false;
        };
        usize::try_from(offset)
            .ok()
            .and_then(|o| o.checked_add(len))
            .is_some_and(|end| end <= self.len)
    }

    /// Copies `dst.len()` bytes starting at `addr` into `dst`.
    ///
    /// # Safety
    ///
    /// No other thread may write the same bytes concurrently.
    #[allow(unsafe_code, clippy::as_conversions)]
    pub(crate) unsafe fn read_at(&self, addr: u64, dst: &mut [u8]) -> bool {
        if !self.contains(addr, dst.len()) {
            return false;
        }
        std::ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len());
        true
    }

    /// Copies `src` to the bytes starting at `addr`.
    ///
    /// # Safety
    ///
    /// No other thread may access the same bytes concurrently.
    #[allow(unsafe_code, clippy::as_conversions)]
    pub(crate) unsafe fn write_at(&self, addr: u64, src: &[u8]) -> bool {
        if !self.contains(addr, src.len()) {
            return false;
        }
        std::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_both_ends() {
        let mem = GlobalMemory::new(4096).unwrap();
        let base = mem.addr();
        assert!(mem.contains(base, 4096));
        assert!(mem.contains(base + 4095, 1));
        assert!(!mem.contains(base + 4095, 2));
        assert!(!mem.contains(base - 1, 1));
        assert!(!mem.contains(u64::MAX, 1));
    }

    #[test]
    #[allow(unsafe_code)]
    fn raw_access_round_trips_and_rejects_out_of_range() {
        let mem = GlobalMemory::new(4096).unwrap();
        let base = mem.addr();
        let mut out = [0u8; 4];
        unsafe {
            assert!(mem.write_at(base + 100, &[1, 2, 3, 4]));
            assert!(mem.read_at(base + 100, &mut out));
            assert!(!mem.write_at(base + 4094, &[0; 4]));
        }
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
