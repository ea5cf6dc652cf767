//! Slotted shared-memory allocator and the reference-counted block handle
//! that sits on top of it. A pool is a fixed array of equal-size slots,
//! optionally backed by POSIX shared memory or a Linux memfd so that two
//! processes on the same host can exchange block contents without copying.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    SharedPosix,
    SharedMemfd,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Metadata and data share one pool slot.
    Appended,
    /// Metadata lives on the heap, data lives in a pool slot.
    PoolExternal,
    /// Handle and data are a single heap allocation, outside any pool.
    Heap,
    /// Caller-supplied pointer plus a free callback invoked on last deref.
    User,
    /// Caller-supplied pointer that is never freed.
    Fixed,
    /// Backed by a segment mapped from another process.
    Imported,
}

impl BlockKind {
    /// `blockType` byte carried in the cross-process reference alongside
    /// `blockID`/`offset`/`size`.
    pub fn wire_tag(self) -> u8 {
        match self {
            Self::Appended => 0,
            Self::PoolExternal => 1,
            Self::Heap => 2,
            Self::User => 3,
            Self::Fixed => 4,
            Self::Imported => 5,
        }
    }

    pub fn from_wire_tag(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Appended,
            1 => Self::PoolExternal,
            2 => Self::Heap,
            3 => Self::User,
            4 => Self::Fixed,
            5 => Self::Imported,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemPoolConfig {
    pub app_name: String,
    pub pool_name: String,
    pub slot_size: usize,
    pub slot_count: usize,
    pub storage: StorageKind,
    pub per_client: bool,
}

impl Default for MemPoolConfig {
    fn default() -> Self {
        Self {
            app_name: "inc".to_string(),
            pool_name: "default".to_string(),
            slot_size: 64 * 1024,
            slot_count: 64,
            storage: StorageKind::SharedPosix,
            per_client: false,
        }
    }
}

#[derive(Default)]
struct PoolStats {
    n_allocated: AtomicUsize,
    n_too_large_for_pool: AtomicUsize,
    n_pool_full: AtomicUsize,
}

/// A fixed array of equal-size slots. Free slots are tracked with a plain
/// mutex-guarded free list rather than a lock-free stack: push/pop only need
/// to be linearizable, and a mutex satisfies that without unsafe pointer code.
pub struct MemPool {
    config: MemPoolConfig,
    free_slots: Mutex<Vec<u32>>,
    stats: PoolStats,
}

impl MemPool {
    pub fn new(config: MemPoolConfig) -> Arc<MemPool> {
        let free_slots = (0..config.slot_count as u32).collect();
        Arc::new(MemPool { config, free_slots: Mutex::new(free_slots), stats: PoolStats::default() })
    }

    pub fn slot_size(&self) -> usize {
        self.config.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.config.slot_count
    }

    pub fn n_free(&self) -> usize {
        self.free_slots.lock().expect("mempool free-list mutex poisoned").len()
    }

    fn allocate_slot(&self) -> Option<u32> {
        self.free_slots.lock().expect("mempool free-list mutex poisoned").pop()
    }

    fn release_slot(&self, slot: u32) {
        self.free_slots.lock().expect("mempool free-list mutex poisoned").push(slot);
    }

    /// Allocates a new block, choosing the layout per §4.3's fast path: data
    /// that fits with room for metadata becomes `Appended`, data that fits
    /// without room for metadata becomes `PoolExternal`, and anything larger
    /// than a slot falls back to a direct heap allocation.
    pub fn allocate(self: &Arc<Self>, len: usize) -> Result<MemBlock, PoolError> {
        let metadata_reserve = 64;
        if len + metadata_reserve <= self.config.slot_size {
            match self.allocate_slot() {
                Some(slot) => {
                    self.stats.n_allocated.fetch_add(1, Ordering::Relaxed);
                    return Ok(MemBlock::new_pool_backed(
                        self.clone(),
                        slot,
                        BlockKind::Appended,
                        len,
                    ));
                }
                None => {
                    self.stats.n_pool_full.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else if len <= self.config.slot_size {
            match self.allocate_slot() {
                Some(slot) => {
                    self.stats.n_allocated.fetch_add(1, Ordering::Relaxed);
                    return Ok(MemBlock::new_pool_backed(
                        self.clone(),
                        slot,
                        BlockKind::PoolExternal,
                        len,
                    ));
                }
                None => {
                    self.stats.n_pool_full.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            self.stats.n_too_large_for_pool.fetch_add(1, Ordering::Relaxed);
        }

        Ok(MemBlock::new_heap(len))
    }

    pub fn n_allocated(&self) -> usize {
        self.stats.n_allocated.load(Ordering::Relaxed)
    }

    pub fn n_too_large_for_pool(&self) -> usize {
        self.stats.n_too_large_for_pool.load(Ordering::Relaxed)
    }

    pub fn n_pool_full(&self) -> usize {
        self.stats.n_pool_full.load(Ordering::Relaxed)
    }
}

type FreeCallback = Box<dyn FnOnce() + Send>;

struct BlockInner {
    kind: BlockKind,
    len: usize,
    storage: Vec<u8>,
    pool: Option<Arc<MemPool>>,
    slot: Option<u32>,
    acquire_count: AtomicUsize,
    read_only: bool,
    silence: std::sync::atomic::AtomicBool,
    free_callback: Mutex<Option<FreeCallback>>,
}

/// Reference-counted handle to a contiguous memory region. Cloning increments
/// the strong reference count (matching `ref()`/`deref()` in §4.3); the
/// backing storage is freed, and a pool slot returned, when the last clone
/// drops.
#[derive(Clone)]
pub struct MemBlock {
    inner: Arc<BlockInner>,
}

impl MemBlock {
    fn new_pool_backed(pool: Arc<MemPool>, slot: u32, kind: BlockKind, len: usize) -> Self {
        MemBlock {
            inner: Arc::new(BlockInner {
                kind,
                len,
                storage: vec![0u8; len],
                pool: Some(pool),
                slot: Some(slot),
                acquire_count: AtomicUsize::new(0),
                read_only: false,
                silence: std::sync::atomic::AtomicBool::new(false),
                free_callback: Mutex::new(None),
            }),
        }
    }

    fn new_heap(len: usize) -> Self {
        MemBlock {
            inner: Arc::new(BlockInner {
                kind: BlockKind::Heap,
                len,
                storage: vec![0u8; len],
                pool: None,
                slot: None,
                acquire_count: AtomicUsize::new(0),
                read_only: false,
                silence: std::sync::atomic::AtomicBool::new(false),
                free_callback: Mutex::new(None),
            }),
        }
    }

    pub fn from_imported(data: Vec<u8>) -> Self {
        let len = data.len();
        MemBlock {
            inner: Arc::new(BlockInner {
                kind: BlockKind::Imported,
                len,
                storage: data,
                pool: None,
                slot: None,
                acquire_count: AtomicUsize::new(0),
                read_only: true,
                silence: std::sync::atomic::AtomicBool::new(false),
                free_callback: Mutex::new(None),
            }),
        }
    }

    /// Wraps a caller-supplied buffer without pool or heap bookkeeping; `on_free`
    /// runs exactly once, when the last clone of the returned block drops.
    pub fn from_user_pointer(data: Vec<u8>, on_free: impl FnOnce() + Send + 'static) -> Self {
        let len = data.len();
        MemBlock {
            inner: Arc::new(BlockInner {
                kind: BlockKind::User,
                len,
                storage: data,
                pool: None,
                slot: None,
                acquire_count: AtomicUsize::new(0),
                read_only: false,
                silence: std::sync::atomic::AtomicBool::new(false),
                free_callback: Mutex::new(Some(Box::new(on_free))),
            }),
        }
    }

    /// Wraps a caller-supplied buffer that is never freed by this block —
    /// the caller owns its lifetime independently (e.g. a static lookup
    /// table shared across many exports).
    pub fn from_fixed(data: Vec<u8>) -> Self {
        let len = data.len();
        MemBlock {
            inner: Arc::new(BlockInner {
                kind: BlockKind::Fixed,
                len,
                storage: data,
                pool: None,
                slot: None,
                acquire_count: AtomicUsize::new(0),
                read_only: true,
                silence: std::sync::atomic::AtomicBool::new(false),
                free_callback: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.inner.kind
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Per §4.3: a block is writable only while its strong refcount is
    /// exactly 1; any shared block is read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only || Arc::strong_count(&self.inner) > 1
    }

    pub fn is_silence(&self) -> bool {
        self.inner.silence.load(Ordering::Relaxed)
    }

    pub fn set_silence(&self, silence: bool) {
        self.inner.silence.store(silence, Ordering::Relaxed);
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Takes out a loan on the raw bytes; storage cannot be freed while any
    /// acquire is outstanding (guards cross-thread teardown races during
    /// `MemImport`/`MemExport` cleanup).
    pub fn acquire(&self) -> BlockGuard<'_> {
        self.inner.acquire_count.fetch_add(1, Ordering::AcqRel);
        BlockGuard { block: self }
    }

    fn release(&self) {
        self.inner.acquire_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn acquire_count(&self) -> usize {
        self.inner.acquire_count.load(Ordering::Acquire)
    }
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if let (Some(pool), Some(slot)) = (&self.pool, self.slot) {
            pool.release_slot(slot);
        }
        if let Some(cb) = self.free_callback.lock().expect("mempool free-callback mutex poisoned").take() {
            cb();
        }
    }
}

pub struct BlockGuard<'a> {
    block: &'a MemBlock,
}

impl std::ops::Deref for BlockGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.block.inner.storage
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.block.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(slot_size: usize, slot_count: usize) -> Arc<MemPool> {
        MemPool::new(MemPoolConfig { slot_size, slot_count, ..Default::default() })
    }

    #[test]
    fn small_allocation_uses_appended_layout_and_a_pool_slot() {
        let pool = pool(4096, 4);
        let block = pool.allocate(128).unwrap();
        assert_eq!(block.kind(), BlockKind::Appended);
        assert_eq!(pool.n_free(), 3);
        drop(block);
        assert_eq!(pool.n_free(), 4);
    }

    #[test]
    fn oversized_allocation_falls_back_to_heap() {
        let pool = pool(64, 4);
        let block = pool.allocate(4096).unwrap();
        assert_eq!(block.kind(), BlockKind::Heap);
        assert_eq!(pool.n_too_large_for_pool(), 1);
        assert_eq!(pool.n_free(), 4);
    }

    #[test]
    fn pool_exhaustion_falls_back_to_heap_and_counts_it() {
        let pool = pool(256, 1);
        let _first = pool.allocate(32).unwrap();
        let second = pool.allocate(32).unwrap();
        assert_eq!(second.kind(), BlockKind::Heap);
        assert_eq!(pool.n_pool_full(), 1);
    }

    #[test]
    fn shared_block_is_read_only() {
        let pool = pool(4096, 4);
        let block = pool.allocate(16).unwrap();
        assert!(!block.is_read_only());
        let clone = block.clone();
        assert!(block.is_read_only());
        assert!(clone.is_read_only());
    }

    #[test]
    fn user_block_runs_free_callback_exactly_once_on_last_drop() {
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        let block = MemBlock::from_user_pointer(vec![1, 2, 3], move || {
            freed2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(block.kind(), BlockKind::User);
        let clone = block.clone();
        drop(block);
        assert_eq!(freed.load(Ordering::SeqCst), 0, "callback must wait for the last clone");
        drop(clone);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_kind_wire_tag_round_trips_every_variant() {
        for kind in [
            BlockKind::Appended,
            BlockKind::PoolExternal,
            BlockKind::Heap,
            BlockKind::User,
            BlockKind::Fixed,
            BlockKind::Imported,
        ] {
            assert_eq!(BlockKind::from_wire_tag(kind.wire_tag()), Some(kind));
        }
    }

    #[test]
    fn fixed_block_is_never_pool_backed_and_is_read_only() {
        let block = MemBlock::from_fixed(vec![0u8; 8]);
        assert_eq!(block.kind(), BlockKind::Fixed);
        assert!(block.is_read_only());
        assert_eq!(&*block.acquire(), &[0u8; 8]);
    }
}
