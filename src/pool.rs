// src/pool.rs
//
// Per-worker pool of fixed-size, reference-counted media buffers. The worker
// is single-threaded, so handles use plain `Rc` and interior `Cell` state.
// Dropping the last handle returns the backing memory to the free list.
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use crate::util::now_ms;

/// One MTU of RTP plus headroom. A single size class keeps the free list and
/// the fair-share arithmetic trivial; oversized control payloads are split
/// across buffers at enqueue time.
pub const BUFFER_SIZE: usize = 2048;

const GROW_CHUNK: usize = 128;
const SHRINK_COOLDOWN_MS: i64 = 5000;
const CONTROL_RESERVE: usize = 16;

struct BufShared {
    mem: RefCell<Box<[u8]>>,
    offset: Cell<usize>,
    len: Cell<usize>,
}

/// Shared-ownership handle to a pooled buffer. Clone to take a reference;
/// the buffer returns to its pool when the last handle drops.
pub struct BufferRef {
    buf: Option<Rc<BufShared>>,
    pool: Weak<RefCell<PoolShared>>,
}

impl BufferRef {
    fn shared(&self) -> &Rc<BufShared> {
        self.buf.as_ref().expect("buffer already released")
    }

    /// Whole backing region, for receiving directly into the buffer. Only
    /// valid while this handle is the sole holder.
    pub fn mem_mut(&self) -> RefMut<'_, Box<[u8]>> {
        self.shared().mem.borrow_mut()
    }

    pub fn set_len(&self, len: usize) {
        debug_assert!(len <= BUFFER_SIZE);
        self.shared().len.set(len);
        self.shared().offset.set(0);
    }

    /// Trim `n` bytes off the front (e.g. an RTP header).
    pub fn advance(&self, n: usize) {
        let s = self.shared();
        let n = n.min(s.len.get());
        s.offset.set(s.offset.get() + n);
        s.len.set(s.len.get() - n);
    }

    pub fn offset(&self) -> usize {
        self.shared().offset.get()
    }

    pub fn len(&self) -> usize {
        self.shared().len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current payload region.
    pub fn payload(&self) -> Ref<'_, [u8]> {
        let s = self.shared();
        let (off, len) = (s.offset.get(), s.len.get());
        Ref::map(s.mem.borrow(), |m| &m[off..off + len])
    }

    pub fn copy_from(&self, data: &[u8]) {
        let n = data.len().min(BUFFER_SIZE);
        self.mem_mut()[..n].copy_from_slice(&data[..n]);
        self.set_len(n);
    }

    #[cfg(test)]
    pub fn refcount(&self) -> usize {
        Rc::strong_count(self.shared())
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        Self { buf: self.buf.clone(), pool: self.pool.clone() }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if let Some(rc) = self.buf.take() {
            // Last holder returns the memory; earlier drops just decrement.
            if let Ok(shared) = Rc::try_unwrap(rc) {
                if let Some(pool) = self.pool.upgrade() {
                    pool.borrow_mut().free.push(shared.mem.into_inner());
                }
            }
        }
    }
}

struct PoolShared {
    free: Vec<Box<[u8]>>,
    num_buffers: usize,
    max_buffers: usize,
    low_watermark: usize,
    high_watermark: usize,
    initial_size: usize,
    control_reserve: usize,
    last_grow_ms: i64,
    stream_clients: usize,
}

impl PoolShared {
    fn new_mem() -> Box<[u8]> {
        vec![0u8; BUFFER_SIZE].into_boxed_slice()
    }

    fn grow(&mut self) {
        let room = self.max_buffers.saturating_sub(self.num_buffers);
        let chunk = GROW_CHUNK.min(room);
        for _ in 0..chunk {
            self.free.push(Self::new_mem());
        }
        self.num_buffers += chunk;
        if chunk > 0 {
            self.last_grow_ms = now_ms();
        }
    }
}

/// Per-worker buffer pool handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct BufferPool {
    shared: Rc<RefCell<PoolShared>>,
}

/// Point-in-time pool numbers consumed by the backpressure controller.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub num_buffers: usize,
    pub num_free: usize,
    pub max_buffers: usize,
    pub low_watermark: usize,
    pub stream_clients: usize,
}

impl BufferPool {
    pub fn new(initial_size: usize, max_buffers: usize, low_watermark: usize, high_watermark: usize) -> Self {
        let mut free = Vec::with_capacity(initial_size);
        for _ in 0..initial_size {
            free.push(PoolShared::new_mem());
        }
        let inner = PoolShared {
            free,
            num_buffers: initial_size,
            max_buffers: max_buffers.max(initial_size),
            low_watermark,
            high_watermark,
            initial_size,
            // The carve-out never exceeds the grow threshold, so media
            // allocations hit the low watermark (and grow) before they can
            // touch it.
            control_reserve: CONTROL_RESERVE.min(initial_size / 4).min(low_watermark),
            last_grow_ms: 0,
            stream_clients: 0,
        };
        Self { shared: Rc::new(RefCell::new(inner)) }
    }

    fn wrap(&self, mem: Box<[u8]>) -> BufferRef {
        BufferRef {
            buf: Some(Rc::new(BufShared {
                mem: RefCell::new(mem),
                offset: Cell::new(0),
                len: Cell::new(0),
            })),
            pool: Rc::downgrade(&self.shared),
        }
    }

    /// Media-path allocation. Grows by a chunk once the free list falls
    /// below the low watermark; fails once the hard cap leaves nothing but
    /// the control carve-out.
    pub fn alloc(&self) -> Option<BufferRef> {
        let mem = {
            let mut inner = self.shared.borrow_mut();
            if inner.free.len() <= inner.low_watermark && inner.num_buffers < inner.max_buffers {
                inner.grow();
            }
            if inner.free.len() <= inner.control_reserve {
                return None;
            }
            inner.free.pop()?
        };
        Some(self.wrap(mem))
    }

    /// Control-path allocation: may dip into the carve-out that the media
    /// path leaves alone, so HTTP headers can still be produced while media
    /// has drained the pool.
    pub fn alloc_control(&self) -> Option<BufferRef> {
        let mem = {
            let mut inner = self.shared.borrow_mut();
            if inner.free.is_empty() && inner.num_buffers < inner.max_buffers {
                inner.grow();
            }
            inner.free.pop()?
        };
        Some(self.wrap(mem))
    }

    /// Release whole chunks back to the allocator when the pool has been
    /// quiescent above the high watermark. Never drops below `initial_size`.
    pub fn try_shrink(&self) {
        let mut inner = self.shared.borrow_mut();
        if now_ms() - inner.last_grow_ms < SHRINK_COOLDOWN_MS {
            return;
        }
        while inner.free.len() > inner.high_watermark && inner.num_buffers > inner.initial_size {
            let chunk = GROW_CHUNK
                .min(inner.free.len() - inner.high_watermark)
                .min(inner.num_buffers - inner.initial_size);
            if chunk == 0 {
                break;
            }
            let keep = inner.free.len() - chunk;
            inner.free.truncate(keep);
            inner.num_buffers -= chunk;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.borrow();
        PoolStats {
            num_buffers: inner.num_buffers,
            num_free: inner.free.len(),
            max_buffers: inner.max_buffers,
            low_watermark: inner.low_watermark,
            stream_clients: inner.stream_clients,
        }
    }

    pub fn register_stream_client(&self) {
        self.shared.borrow_mut().stream_clients += 1;
    }

    pub fn unregister_stream_client(&self) {
        let mut inner = self.shared.borrow_mut();
        inner.stream_clients = inner.stream_clients.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> BufferPool {
        // control_reserve = 1 at this size
        BufferPool::new(4, 8, 1, 2)
    }

    #[test]
    fn alloc_release_cycles_free_list() {
        let pool = small_pool();
        let before = pool.stats();
        assert_eq!(before.num_buffers, 4);
        assert_eq!(before.num_free, 4);

        let a = pool.alloc().unwrap();
        assert_eq!(pool.stats().num_free, 3);
        let b = a.clone();
        assert_eq!(b.refcount(), 2);
        drop(a);
        // still held by the clone
        assert_eq!(pool.stats().num_free, 3);
        drop(b);
        assert_eq!(pool.stats().num_free, 4);
    }

    #[test]
    fn grows_to_cap_then_fails() {
        let pool = small_pool();
        let mut held = Vec::new();
        while let Some(b) = pool.alloc() {
            held.push(b);
        }
        // Hard cap reached with only the control carve-out left.
        assert_eq!(pool.stats().num_buffers, 8);
        assert_eq!(pool.stats().num_free, 1);
        assert!(pool.alloc().is_none());
        drop(held);
        assert_eq!(pool.stats().num_free, 8);
    }

    #[test]
    fn control_carveout_survives_media_exhaustion() {
        let pool = BufferPool::new(8, 8, 1, 4);
        let mut held = Vec::new();
        while let Some(b) = pool.alloc() {
            held.push(b);
        }
        // Media path is dry, control path still produces a buffer.
        assert!(pool.alloc_control().is_some());
    }

    #[test]
    fn shrink_is_noop_at_initial_size() {
        let pool = small_pool();
        pool.try_shrink();
        assert_eq!(pool.stats().num_buffers, 4);
    }

    #[test]
    fn payload_bounds_follow_advance() {
        let pool = small_pool();
        let b = pool.alloc().unwrap();
        b.copy_from(&[1, 2, 3, 4, 5]);
        assert_eq!(&*b.payload(), &[1, 2, 3, 4, 5]);
        b.advance(2);
        assert_eq!(&*b.payload(), &[3, 4, 5]);
        assert_eq!(b.offset(), 2);
        assert_eq!(b.len(), 3);
    }
}
