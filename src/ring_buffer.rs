//! Double-mapped circular byte regions.
//!
//! The backing storage (a memfd of `capacity` bytes) is mapped twice,
//! back-to-back, into one reserved virtual range of `2 * capacity` bytes.
//! Any read or write of length `<= capacity` starting at `offset %
//! capacity` is then a single contiguous memory operation at `base +
//! offset`: the second mapping aliases the start of the buffer, so the
//! wrap point never needs splitting.
//!
//! The full doubled range is registered once as an RDMA memory region, so
//! remote writes that run past the seam also land in registered memory.
//! What goes on the wire in SETUP is `(base, capacity, rkey)`: peers
//! address the ring through the first mapping only.

use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::AccessFlags;
use std::ffi::CStr;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;
use std::sync::Arc;

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Round `n` up to a whole number of pages (the two halves of the mapping
/// must be page-aligned).
pub fn page_aligned(n: usize) -> usize {
    let page = page_size();
    n.div_ceil(page) * page
}

/// A `capacity`-byte buffer mapped twice into contiguous virtual memory.
pub struct DoubleMapping {
    base: *mut u8,
    capacity: usize,
}

// SAFETY: the mapping is owned exclusively; the raw pointer is only an
// address, and all access goes through &self/&mut self methods.
unsafe impl Send for DoubleMapping {}

impl DoubleMapping {
    /// Allocate and doubly map a ring of at least `capacity` bytes
    /// (rounded up to the page size).
    pub fn alloc(capacity: usize) -> io::Result<Self> {
        if capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring capacity must be > 0",
            ));
        }
        let capacity = page_aligned(capacity);

        let name = CStr::from_bytes_with_nul(b"rdma-stream-ring\0").unwrap();
        // SAFETY: name is a valid NUL-terminated string.
        let raw_fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw_fd was just returned open by memfd_create.
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        // SAFETY: fd is open; capacity fits in off_t for any sane ring size.
        if unsafe { libc::ftruncate(raw_fd, capacity as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // Reserve the doubled range, then pin both halves onto the same fd.
        // SAFETY: plain anonymous reservation, no aliasing yet.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        for half in 0..2usize {
            // SAFETY: MAP_FIXED within the range we just reserved; both
            // halves map the same memfd at offset 0, creating the alias.
            let addr = unsafe {
                libc::mmap(
                    (base as usize + half * capacity) as *mut libc::c_void,
                    capacity,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_FIXED | libc::MAP_SHARED,
                    raw_fd,
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                // SAFETY: unmapping the whole reservation we own.
                unsafe { libc::munmap(base, capacity * 2) };
                return Err(err);
            }
        }
        drop(fd); // both mappings hold the backing store alive

        let mapping = Self {
            base: base as *mut u8,
            capacity,
        };
        debug_assert!(mapping.aliases());
        Ok(mapping)
    }

    /// Rounded-up capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Base virtual address of the first mapping.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.base as u64
    }

    /// Copy `src` into the ring at `offset` (`offset < capacity`,
    /// `src.len() <= capacity`). Contiguous even across the seam.
    pub fn copy_in(&mut self, offset: u64, src: &[u8]) {
        debug_assert!((offset as usize) < self.capacity);
        debug_assert!(src.len() <= self.capacity);
        // SAFETY: offset + src.len() <= 2 * capacity, inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset as usize), src.len());
        }
    }

    /// Copy `dst.len()` bytes out of the ring at `offset`.
    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) {
        debug_assert!((offset as usize) < self.capacity);
        debug_assert!(dst.len() <= self.capacity);
        // SAFETY: offset + dst.len() <= 2 * capacity, inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset as usize), dst.as_mut_ptr(), dst.len());
        }
    }

    /// Local address of `offset` for scatter-gather entries.
    #[inline]
    pub fn addr_at(&self, offset: u64) -> u64 {
        debug_assert!((offset as usize) < self.capacity);
        self.base_addr() + offset
    }

    fn aliases(&self) -> bool {
        // SAFETY: both addresses are inside the mapping.
        unsafe {
            self.base.write(0x45);
            self.base.add(self.capacity).read() == 0x45
        }
    }
}

impl Drop for DoubleMapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact range alloc() mapped.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity * 2);
        }
    }
}

/// A double-mapped ring plus its memory registration.
///
/// The sink ring of a connection is registered with local + remote write
/// access (it is the target of peer RDMA writes); the source ring needs
/// only local access.
pub struct RingBuffer {
    map: DoubleMapping,
    mr: Option<Arc<MemoryRegion>>,
}

impl RingBuffer {
    /// Allocate an unregistered ring (usable for local I/O only).
    pub fn alloc(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            map: DoubleMapping::alloc(capacity)?,
            mr: None,
        })
    }

    /// Register the full doubled range with the protection domain.
    pub fn register(&mut self, pd: &Arc<ProtectionDomain>, access: AccessFlags) -> io::Result<()> {
        // SAFETY: the mapping outlives the registration (mr is dropped
        // before map by field order) and covers the registered range.
        let mr = unsafe {
            pd.reg_mr(self.map.base_addr() as usize, self.map.capacity() * 2, access)
                .map_err(|e| io::Error::other(e.to_string()))?
        };
        self.mr = Some(mr);
        Ok(())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.map.base_addr()
    }

    #[inline]
    pub fn addr_at(&self, offset: u64) -> u64 {
        self.map.addr_at(offset)
    }

    pub fn copy_in(&mut self, offset: u64, src: &[u8]) {
        self.map.copy_in(offset, src);
    }

    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) {
        self.map.copy_out(offset, dst);
    }

    /// Local key for scatter-gather entries. Panics if unregistered.
    pub fn lkey(&self) -> u32 {
        self.mr.as_ref().expect("ring buffer not registered").lkey()
    }

    /// Remote key advertised in SETUP. Panics if unregistered.
    pub fn rkey(&self) -> u32 {
        self.mr.as_ref().expect("ring buffer not registered").rkey()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_page_rounded() {
        let ring = DoubleMapping::alloc(1000).unwrap();
        assert!(ring.capacity() >= 1000);
        assert_eq!(ring.capacity() % page_size(), 0);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(DoubleMapping::alloc(0).is_err());
    }

    #[test]
    fn copy_across_wrap_boundary_is_contiguous() {
        let mut ring = DoubleMapping::alloc(1).unwrap(); // one page
        let cap = ring.capacity();

        // Start near the end so the payload straddles the seam.
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let offset = (cap - 100) as u64;
        ring.copy_in(offset, &payload);

        let mut out = vec![0u8; payload.len()];
        ring.copy_out(offset, &mut out);
        assert_eq!(out, payload);

        // The tail of the payload must be visible at the start of the
        // first mapping: that is the aliasing guarantee.
        let mut head = vec![0u8; payload.len() - 100];
        ring.copy_out(0, &mut head);
        assert_eq!(&head[..], &payload[100..]);
    }

    #[test]
    fn full_capacity_write_round_trips() {
        for request in [1usize, 4096, 10_000] {
            let mut ring = DoubleMapping::alloc(request).unwrap();
            let cap = ring.capacity();
            let payload: Vec<u8> = (0..cap).map(|i| (i * 7 % 256) as u8).collect();
            // Worst case: a capacity-sized write starting mid-ring.
            let offset = (cap / 2) as u64;
            ring.copy_in(offset, &payload);
            let mut out = vec![0u8; cap];
            ring.copy_out(offset, &mut out);
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn writes_via_second_half_alias_first() {
        let mut ring = DoubleMapping::alloc(1).unwrap();
        let cap = ring.capacity() as u64;
        ring.copy_in(cap - 1, &[0xAA, 0xBB]);
        let mut first = [0u8; 1];
        ring.copy_out(0, &mut first);
        assert_eq!(first[0], 0xBB);
    }
}
