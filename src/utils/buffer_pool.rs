//! # Buffer Arena
//!
//! Fixed set of reusable receive slabs shared by all server connections.
//!
//! Slabs are indexed by slot and allocated lazily up to the configured count. A
//! checked-out slab is moved into its [`ArenaBuffer`], so no two connections can
//! ever reference the same slab; dropping the buffer pushes its slot back onto the
//! free-list. All bookkeeping sits behind a single mutex.
//!
//! When every slot is checked out the arena hands out an unpooled buffer instead
//! of failing, so an accept burst never stalls on buffer availability.
//!
//! ## Usage
//! ```rust
//! use framelink::utils::buffer_pool::BufferArena;
//!
//! let arena = BufferArena::new(4, 8192);
//! let buffer = arena.acquire();
//! assert_eq!(arena.in_use(), 1);
//! drop(buffer);
//! assert_eq!(arena.in_use(), 0);
//! ```

use std::borrow::{Borrow, BorrowMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

#[derive(Debug)]
struct ArenaState {
    /// Parked slabs; `None` while checked out or not yet allocated.
    slots: Vec<Option<Vec<u8>>>,
    /// Slots holding a parked slab, most recently released last.
    free: Vec<usize>,
    /// Slots below this index have been allocated at least once.
    allocated: usize,
}

#[derive(Debug)]
struct ArenaShared {
    state: Mutex<ArenaState>,
    slab_size: usize,
}

impl ArenaShared {
    fn lock(&self) -> MutexGuard<'_, ArenaState> {
        // State stays consistent across a panicking holder: each critical section
        // is a single push/pop/take.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A receive slab checked out of a [`BufferArena`]; returned to its slot on drop.
#[derive(Debug)]
pub struct ArenaBuffer {
    buffer: Vec<u8>,
    slot: Option<usize>,
    arena: Arc<ArenaShared>,
}

impl ArenaBuffer {
    /// Slot index, or `None` for an unpooled overflow buffer.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }
}

impl Drop for ArenaBuffer {
    fn drop(&mut self) {
        let Some(slot) = self.slot else {
            return;
        };
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        buffer.shrink_to(self.arena.slab_size);
        let mut state = self.arena.lock();
        state.slots[slot] = Some(buffer);
        state.free.push(slot);
    }
}

impl std::ops::Deref for ArenaBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for ArenaBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Borrow<Vec<u8>> for ArenaBuffer {
    fn borrow(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl BorrowMut<Vec<u8>> for ArenaBuffer {
    fn borrow_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

/// Thread-safe arena of fixed-size receive slabs
#[derive(Debug, Clone)]
pub struct BufferArena {
    shared: Arc<ArenaShared>,
}

impl BufferArena {
    /// Create an arena of `slab_count` slots holding `slab_size`-byte slabs.
    pub fn new(slab_count: usize, slab_size: usize) -> Self {
        Self {
            shared: Arc::new(ArenaShared {
                state: Mutex::new(ArenaState {
                    slots: (0..slab_count).map(|_| None).collect(),
                    free: Vec::with_capacity(slab_count),
                    allocated: 0,
                }),
                slab_size,
            }),
        }
    }

    /// Check out a slab (or an unpooled buffer if every slot is in use).
    pub fn acquire(&self) -> ArenaBuffer {
        let slab_size = self.shared.slab_size;
        let (buffer, slot) = {
            let mut state = self.shared.lock();
            if let Some(slot) = state.free.pop() {
                let buffer = state.slots[slot]
                    .take()
                    .unwrap_or_else(|| Vec::with_capacity(slab_size));
                (buffer, Some(slot))
            } else if state.allocated < state.slots.len() {
                let slot = state.allocated;
                state.allocated += 1;
                (Vec::with_capacity(slab_size), Some(slot))
            } else {
                (Vec::with_capacity(slab_size), None)
            }
        };

        if slot.is_none() {
            debug!(slab_size, "Buffer arena exhausted, allocating unpooled buffer");
        }

        ArenaBuffer {
            buffer,
            slot,
            arena: self.shared.clone(),
        }
    }

    /// Size of each slab in bytes.
    pub fn slab_size(&self) -> usize {
        self.shared.slab_size
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Number of slots currently checked out.
    pub fn in_use(&self) -> usize {
        let state = self.shared.lock();
        state.allocated - state.free.len()
    }

    /// Number of slots that can be handed out without an unpooled allocation.
    pub fn available(&self) -> usize {
        let state = self.shared.lock();
        state.slots.len() - (state.allocated - state.free.len())
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new(1024, crate::config::INITIAL_BUFFER_SIZE)
    }
}
