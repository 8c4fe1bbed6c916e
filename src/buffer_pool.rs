//! Per-connection pool of up to 32 message slots.
//!
//! Each slot is a preallocated small header/data buffer plus overflow
//! allocation for oversized fields. Slots are tracked with a 32-bit
//! bitmask of free slots so acquisition and accounting are O(1).
//!
//! Backed by `Arc<Mutex<_>>` rather than `Rc<RefCell<_>>`: a delivered
//! [`Message`] can be handed to a worker thread and later released via
//! `release_msg_slot_ts`, so the pool it references has to be safe to
//! move across that boundary even though every actual pool operation
//! still only ever runs on the protocol's own thread.

use std::sync::{Arc, Mutex};

use crate::message::Message;

pub const MAX_SLOTS: u32 = 32;
pub const INLINE_HEADER_SIZE: usize = 32;
pub const INLINE_DATA_SIZE: usize = 1024;

/// A single preallocated receive slot: a `Message` plus the inline
/// buffers the [`Reader`](crate::reader::Reader) fills while
/// reassembling a wire message.
pub struct Slot {
    pub index: u32,
    pub msg: Message,
    pub inline_header: [u8; INLINE_HEADER_SIZE],
    pub inline_data: [u8; INLINE_DATA_SIZE],
}

impl Slot {
    fn new(index: u32) -> Self {
        Slot {
            index,
            msg: Message::new("0.0.0.0".parse().unwrap(), 0),
            inline_header: [0; INLINE_HEADER_SIZE],
            inline_data: [0; INLINE_DATA_SIZE],
        }
    }
}

struct Inner {
    max_slots: u32,
    /// Bit `i` set means slot `i` is free.
    free_mask: u32,
    used_slots: u32,
    slots: Vec<Slot>,
    refcnt: u32,
}

/// A reference-counted pool of receive slots. Cloning shares the same
/// pool; the pool (and its slots) is freed once every `Arc<BufferPool>`
/// clone handed out by [`BufferPool::bump_refcount`] has been dropped.
#[derive(Clone)]
pub struct BufferPool(Arc<Mutex<Inner>>);

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.0.lock().unwrap();
        f.debug_struct("BufferPool")
            .field("max_slots", &inner.max_slots)
            .field("used_slots", &inner.used_slots)
            .field("refcnt", &inner.refcnt)
            .finish()
    }
}

impl BufferPool {
    /// `max_slots` must already have been validated to `1..=32` by
    /// [`Config::validate`](crate::config::Config::validate).
    pub fn new(max_slots: u8) -> Self {
        let max_slots = u32::from(max_slots).min(MAX_SLOTS).max(1);
        let slots = (0..max_slots).map(Slot::new).collect();
        let free_mask = if max_slots == 32 {
            u32::MAX
        } else {
            (1u32 << max_slots) - 1
        };
        BufferPool(Arc::new(Mutex::new(Inner {
            max_slots,
            free_mask,
            used_slots: 0,
            slots,
            refcnt: 1,
        })))
    }

    /// Acquire the highest-indexed free slot, or `None` if the pool is
    /// exhausted. The returned index must be paired with a later
    /// [`BufferPool::release`].
    pub fn acquire(&self) -> Option<u32> {
        let mut inner = self.0.lock().unwrap();
        if inner.free_mask == 0 {
            return None;
        }
        let index = 31 - inner.free_mask.leading_zeros();
        inner.free_mask &= !(1 << index);
        inner.used_slots += 1;
        let slot = &mut inner.slots[index as usize];
        slot.msg = Message::new("0.0.0.0".parse().unwrap(), 0);
        slot.msg.flags_set_has_slot();
        Some(index)
    }

    pub fn with_slot<R>(&self, index: u32, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut inner = self.0.lock().unwrap();
        f(&mut inner.slots[index as usize])
    }

    /// Release a slot back to the pool. Fatal (panics, matching the
    /// spec's "fatal if double-released") if the slot was not in use.
    pub fn release(&self, index: u32) {
        let mut inner = self.0.lock().unwrap();
        let bit = 1u32 << index;
        assert!(
            inner.free_mask & bit == 0,
            "double release of buffer pool slot {}",
            index
        );
        inner.free_mask |= bit;
        inner.used_slots -= 1;
    }

    pub fn is_exhausted(&self) -> bool {
        let inner = self.0.lock().unwrap();
        inner.used_slots == inner.max_slots
    }

    pub fn used_slots(&self) -> u32 {
        self.0.lock().unwrap().used_slots
    }

    pub fn max_slots(&self) -> u32 {
        self.0.lock().unwrap().max_slots
    }

    /// Called once when a message is handed to the receive callback:
    /// the user may hold the slot past connection close, so the pool
    /// must outlive the connection until they release it.
    pub fn bump_refcount(&self) {
        self.0.lock().unwrap().refcnt += 1;
    }

    /// Called on every [`BufferPool::release`]'s matching decrement.
    /// Dropping the last `Arc` (all clones gone) frees slot storage
    /// regardless; this purely tracks the logical refcount invariant
    /// from the spec so `is_exhausted`/accounting stay honest even
    /// while extra owners keep the `Arc` alive.
    pub fn drop_refcount(&self) -> u32 {
        let mut inner = self.0.lock().unwrap();
        inner.refcnt -= 1;
        inner.refcnt
    }

    pub fn refcount(&self) -> u32 {
        self.0.lock().unwrap().refcnt
    }
}

impl Message {
    pub(crate) fn flags_set_has_slot(&mut self) {
        self.flags.insert(crate::message::MsgFlags::HAS_SLOT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_highest_indexed_free_slot() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.acquire(), Some(3));
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.used_slots(), 2);
    }

    #[test]
    fn acquire_fails_when_exhausted() {
        let pool = BufferPool::new(1);
        assert_eq!(pool.acquire(), Some(0));
        assert!(pool.is_exhausted());
        assert_eq!(pool.acquire(), None);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_panics() {
        let pool = BufferPool::new(1);
        let s = pool.acquire().unwrap();
        pool.release(s);
        pool.release(s);
    }

    #[test]
    fn release_frees_slot_for_reacquire() {
        let pool = BufferPool::new(1);
        let s = pool.acquire().unwrap();
        pool.release(s);
        assert_eq!(pool.acquire(), Some(0));
    }
}
