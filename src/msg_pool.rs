//! Fixed pool of pre-registered buffers for the two-sided control channel.
//!
//! SETUP and FC messages are tiny and fixed-size, so the pool is one
//! page-aligned allocation of `2 * depth` slots (sends and receives share
//! it), registered once. Slots circulate through a free list: `get` hands a
//! slot to a send or receive work request, and the slot comes back via
//! `put` only when that request's completion is observed. An empty free
//! list stalls control-message posting until a completion returns a slot.

use crate::protocol::MSG_BUF_SIZE;
use sideway::ibverbs::memory_region::MemoryRegion;
use sideway::ibverbs::protection_domain::ProtectionDomain;
use sideway::ibverbs::AccessFlags;
use std::alloc::{self, Layout};
use std::collections::VecDeque;
use std::io;
use std::slice;
use std::sync::Arc;

/// Index of a pool slot, used as the stable identity of an in-flight
/// control buffer.
pub type MsgSlot = u16;

pub struct MsgPool {
    storage: *mut u8,
    layout: Layout,
    slots: u16,
    free: VecDeque<MsgSlot>,
    mr: Option<Arc<MemoryRegion>>,
}

// SAFETY: the allocation is owned exclusively and only reachable through
// &self/&mut self methods; the connection serializes access behind its lock.
unsafe impl Send for MsgPool {}

impl MsgPool {
    /// Allocate a pool of `slots` control buffers.
    pub fn new(slots: u16) -> io::Result<Self> {
        if slots == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "pool needs at least one slot",
            ));
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let layout = Layout::from_size_align(slots as usize * MSG_BUF_SIZE, page)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        // SAFETY: layout has non-zero size for any slots >= 1; zeroed so
        // stale bytes never leak to the wire.
        let storage = unsafe { alloc::alloc_zeroed(layout) };
        if storage.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "control buffer pool allocation failed",
            ));
        }
        Ok(Self {
            storage,
            layout,
            slots,
            free: (0..slots).collect(),
            mr: None,
        })
    }

    /// Register the pool with the protection domain (local write access:
    /// receives land here, sends are only read by the HCA).
    pub fn register(&mut self, pd: &Arc<ProtectionDomain>) -> io::Result<()> {
        // SAFETY: the allocation outlives the registration (mr dropped
        // first by field order) and spans the registered range.
        let mr = unsafe {
            pd.reg_mr(
                self.storage as usize,
                self.slots as usize * MSG_BUF_SIZE,
                AccessFlags::LocalWrite,
            )
            .map_err(|e| io::Error::other(e.to_string()))?
        };
        self.mr = Some(mr);
        Ok(())
    }

    /// Take a free slot, or `None` if every buffer is in flight.
    pub fn get(&mut self) -> Option<MsgSlot> {
        self.free.pop_front()
    }

    /// Return a slot whose work request has completed.
    pub fn put(&mut self, slot: MsgSlot) {
        debug_assert!(slot < self.slots);
        debug_assert!(!self.free.contains(&slot), "double free of msg slot {slot}");
        self.free.push_back(slot);
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Local address of a slot, for scatter-gather entries.
    #[inline]
    pub fn addr_of(&self, slot: MsgSlot) -> u64 {
        debug_assert!(slot < self.slots);
        self.storage as u64 + slot as u64 * MSG_BUF_SIZE as u64
    }

    pub fn slice(&self, slot: MsgSlot) -> &[u8] {
        debug_assert!(slot < self.slots);
        // SAFETY: slot bounds checked; slots never overlap.
        unsafe { slice::from_raw_parts(self.storage.add(slot as usize * MSG_BUF_SIZE), MSG_BUF_SIZE) }
    }

    pub fn slice_mut(&mut self, slot: MsgSlot) -> &mut [u8] {
        debug_assert!(slot < self.slots);
        // SAFETY: slot bounds checked; slots never overlap; &mut self
        // guarantees exclusivity.
        unsafe {
            slice::from_raw_parts_mut(self.storage.add(slot as usize * MSG_BUF_SIZE), MSG_BUF_SIZE)
        }
    }

    /// Local key for scatter-gather entries. Panics if unregistered.
    pub fn lkey(&self) -> u32 {
        self.mr.as_ref().expect("msg pool not registered").lkey()
    }
}

impl Drop for MsgPool {
    fn drop(&mut self) {
        self.mr.take(); // deregister before the backing store goes away
        // SAFETY: storage was allocated with this exact layout.
        unsafe { alloc::dealloc(self.storage, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_hand_out_and_return() {
        let mut pool = MsgPool::new(4).unwrap();
        assert_eq!(pool.free_slots(), 4);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_slots(), 2);
        pool.put(a);
        assert_eq!(pool.free_slots(), 3);
    }

    #[test]
    fn exhaustion_yields_none_until_put() {
        let mut pool = MsgPool::new(2).unwrap();
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        assert_eq!(pool.get(), Some(a));
    }

    #[test]
    fn slot_addresses_do_not_overlap() {
        let mut pool = MsgPool::new(8).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let (lo, hi) = if pool.addr_of(a) < pool.addr_of(b) {
            (pool.addr_of(a), pool.addr_of(b))
        } else {
            (pool.addr_of(b), pool.addr_of(a))
        };
        assert!(hi - lo >= MSG_BUF_SIZE as u64);
    }

    #[test]
    fn slot_contents_are_isolated() {
        let mut pool = MsgPool::new(2).unwrap();
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        pool.slice_mut(a).fill(0x11);
        pool.slice_mut(b).fill(0x22);
        assert!(pool.slice(a).iter().all(|&x| x == 0x11));
        assert!(pool.slice(b).iter().all(|&x| x == 0x22));
    }
}
