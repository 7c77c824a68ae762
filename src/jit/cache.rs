//! Compiled block cache.
//!
//! Maps a guest entry address to a directly callable native block. The cache
//! is bounded: before an insert at capacity, the resident entry with the
//! lowest use count is released back to the arena and dropped (first-found
//! order breaks ties). Eviction only happens lazily, on the compile request
//! that would overflow capacity.
//!
//! Self-modified code is handled by [`BlockCache::invalidate_covering`]: the
//! driver feeds it every guest write address (masked to physical) before the
//! next lookup, so a fetch can never dispatch into a block compiled from
//! bytes that have since been overwritten.

use log::debug;

use super::arena::{CodeArena, CodeHandle};
use crate::bus::mask_region;
use crate::cpu::ExecContext;

/// Resident block limit.
pub const CACHE_CAPACITY: usize = 32;

/// Signature of a compiled block: mutates the context it is handed, returns
/// nothing.
pub type HostFn = unsafe extern "C" fn(*mut ExecContext);

/// Opaque callable entry point of a compiled block.
///
/// The only way to run generated code; `invoke` is the single unsafe
/// boundary between safe driver code and the arena.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint {
    ptr: *const u8,
}

impl EntryPoint {
    pub fn new(ptr: *const u8) -> Self {
        Self { ptr }
    }

    pub fn as_ptr(self) -> *const u8 {
        self.ptr
    }

    /// Run the block against `ctx`.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a complete block emitted by the compiler into a
    /// live arena allocation, and `ctx` must be valid for the whole call.
    pub unsafe fn invoke(self, ctx: *mut ExecContext) {
        let f: HostFn = unsafe { std::mem::transmute(self.ptr) };
        unsafe { f(ctx) }
    }
}

/// One resident compiled block.
#[derive(Debug)]
pub struct CodeBlock {
    /// Guest address the block was compiled from.
    pub guest_addr: u32,
    /// Length of the guest range covered, in bytes.
    pub guest_len: u32,
    /// Backing arena allocation.
    pub handle: CodeHandle,
    /// Callable native entry.
    pub entry: EntryPoint,
    /// Use counter driving eviction. Starts at 1 (the compile itself).
    pub hits: u64,
}

/// Lookup and lifecycle counters, exposed read-only.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// The bounded block cache. Lookup is a linear scan, fine at this size.
pub struct BlockCache {
    blocks: Vec<CodeBlock>,
    capacity: usize,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: Vec::with_capacity(capacity),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Find a resident block for `guest_addr`, counting the use.
    pub fn lookup(&mut self, guest_addr: u32) -> Option<EntryPoint> {
        for block in &mut self.blocks {
            if block.guest_addr == guest_addr {
                block.hits += 1;
                self.stats.hits += 1;
                return Some(block.entry);
            }
        }
        self.stats.misses += 1;
        None
    }

    /// Inspect a resident block without touching any counter.
    pub fn peek(&self, guest_addr: u32) -> Option<&CodeBlock> {
        self.blocks.iter().find(|b| b.guest_addr == guest_addr)
    }

    /// Make room for one insert, evicting the least-used entry if the cache
    /// is at capacity.
    pub fn ensure_capacity(&mut self, arena: &mut CodeArena) {
        while self.blocks.len() >= self.capacity {
            let mut least = 0;
            for (i, block) in self.blocks.iter().enumerate() {
                if block.hits < self.blocks[least].hits {
                    least = i;
                }
            }
            let evicted = self.blocks.remove(least);
            debug!(
                "evicting block {:#010x} after {} uses",
                evicted.guest_addr, evicted.hits
            );
            arena.release(evicted.handle);
            self.stats.evictions += 1;
        }
    }

    /// Register a freshly compiled block.
    ///
    /// The caller looks up before compiling, so at most one resident block
    /// per guest address can exist.
    pub fn insert(&mut self, block: CodeBlock) {
        debug_assert!(
            self.peek(block.guest_addr).is_none(),
            "duplicate block for {:#010x}",
            block.guest_addr
        );
        self.blocks.push(block);
        self.stats.insertions += 1;
    }

    /// Drop (and release) every resident block whose guest range covers the
    /// written physical address.
    pub fn invalidate_covering(&mut self, phys_addr: u32, arena: &mut CodeArena) {
        let mut i = 0;
        while i < self.blocks.len() {
            let start = mask_region(self.blocks[i].guest_addr);
            let len = self.blocks[i].guest_len;
            if phys_addr.wrapping_sub(start) < len {
                let stale = self.blocks.remove(i);
                debug!(
                    "invalidating block {:#010x} after write to {:#010x}",
                    stale.guest_addr, phys_addr
                );
                arena.release(stale.handle);
                self.stats.invalidations += 1;
            } else {
                i += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A block body is irrelevant here; the cache only tracks metadata.
    fn make_block(arena: &mut CodeArena, guest_addr: u32) -> CodeBlock {
        let handle = arena.alloc(64);
        let entry = EntryPoint::new(arena.entry_ptr(&handle));
        CodeBlock {
            guest_addr,
            guest_len: 8,
            handle,
            entry,
            hits: 1,
        }
    }

    #[test]
    fn test_lookup_counts_uses() {
        let mut arena = CodeArena::new(64 * 1024);
        let mut cache = BlockCache::new(CACHE_CAPACITY);

        cache.insert(make_block(&mut arena, 0x1000));
        assert!(cache.lookup(0x1000).is_some());
        assert!(cache.lookup(0x1000).is_some());
        assert!(cache.lookup(0x2000).is_none());

        assert_eq!(cache.peek(0x1000).unwrap().hits, 3);
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_eviction_picks_least_used() {
        let mut arena = CodeArena::new(64 * 1024);
        let mut cache = BlockCache::new(CACHE_CAPACITY);

        for i in 0..CACHE_CAPACITY as u32 {
            cache.insert(make_block(&mut arena, i * 0x100));
        }
        // Touch everything except the block at 0x300.
        for i in 0..CACHE_CAPACITY as u32 {
            if i != 3 {
                cache.lookup(i * 0x100);
            }
        }

        let free_before = arena.free_bytes();
        cache.ensure_capacity(&mut arena);
        cache.insert(make_block(&mut arena, 0xdead_0000));

        assert_eq!(cache.len(), CACHE_CAPACITY);
        assert!(cache.peek(0x300).is_none(), "least-used block survived");
        assert!(cache.peek(0xdead_0000).is_some());
        assert_eq!(cache.stats().evictions, 1);
        // The evicted block's backing memory was returned before the new
        // allocation was carved out.
        assert_eq!(arena.free_bytes(), free_before);
    }

    #[test]
    fn test_eviction_tie_breaks_first_found() {
        let mut arena = CodeArena::new(64 * 1024);
        let mut cache = BlockCache::new(4);

        for addr in [0x100, 0x200, 0x300, 0x400] {
            cache.insert(make_block(&mut arena, addr));
        }
        // All tied at 1 use: the first inserted goes.
        cache.ensure_capacity(&mut arena);
        assert!(cache.peek(0x100).is_none());
        assert!(cache.peek(0x200).is_some());
    }

    #[test]
    fn test_invalidate_covering_masks_regions() {
        let mut arena = CodeArena::new(64 * 1024);
        let mut cache = BlockCache::new(CACHE_CAPACITY);

        // Block compiled from a KSEG0 address; physically it covers
        // [0x1000, 0x1008).
        cache.insert(make_block(&mut arena, 0x8000_1000));
        cache.insert(make_block(&mut arena, 0x8000_2000));

        cache.invalidate_covering(0x1004, &mut arena);
        assert!(cache.peek(0x8000_1000).is_none());
        assert!(cache.peek(0x8000_2000).is_some());
        assert_eq!(cache.stats().invalidations, 1);

        // A write outside every range touches nothing.
        cache.invalidate_covering(0x5000, &mut arena);
        assert_eq!(cache.stats().invalidations, 1);
    }
}
