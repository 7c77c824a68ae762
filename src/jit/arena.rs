//! Executable code arena.
//!
//! A single read/write/execute reservation obtained once with `mmap` backs
//! every compiled block. Allocations are carved out of the reservation by a
//! first-fit scan over an ordered metadata table whose records tile the whole
//! region with zero gaps; release coalesces with free neighbours so no two
//! adjacent records are ever both free.
//!
//! Metadata is index-based and lives outside the region, so generated code
//! can never stomp on it. Callers hold a validated [`CodeHandle`] rather than
//! a raw pointer; releasing a handle that is unknown, already free, or whose
//! integrity tag has been cleared is a fatal "double free / invalid handle"
//! condition, diagnosed rather than silently ignored.

use log::error;

#[cfg(not(unix))]
compile_error!("the executable code arena requires a Unix mmap");

/// Integrity tag stamped on live allocations ("MEMB").
const MEMBLOCK_TAG: u32 = 0x4d45_4d42;

/// Default reservation: enough virtual space for anything a 32-bit guest
/// could ask for. Backed lazily, never committed up front.
pub const JIT_RESERVE_SIZE: usize = 0xffff_ffff;

/// A free block is only split when the remainder could hold a metadata
/// record plus at least 4 bytes of payload; otherwise the whole block is
/// handed out unsplit.
const MIN_SPLIT: usize = std::mem::size_of::<MemBlock>() + 4;

#[derive(Debug, Clone)]
struct MemBlock {
    offset: usize,
    size: usize,
    free: bool,
    tag: u32,
}

/// Validated offset+length ticket for one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeHandle {
    offset: usize,
    size: usize,
}

impl CodeHandle {
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Allocator over the executable reservation.
pub struct CodeArena {
    base: *mut u8,
    size: usize,
    blocks: Vec<MemBlock>,
}

impl CodeArena {
    /// Reserve `size` bytes of read/write/execute memory.
    ///
    /// Fatal if the kernel refuses the mapping; there is nothing useful the
    /// translator can do without it.
    pub fn new(size: usize) -> Self {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            error!("couldn't reserve {size:#x} bytes of executable memory");
            panic!("executable memory reservation failed");
        }

        Self {
            base: base as *mut u8,
            size,
            blocks: vec![MemBlock {
                offset: 0,
                size,
                free: true,
                tag: 0,
            }],
        }
    }

    /// First-fit allocation of `size` bytes.
    ///
    /// Fatal if no free block anywhere in the table is large enough; the
    /// arena does not grow or compact beyond coalescing on release.
    pub fn alloc(&mut self, size: usize) -> CodeHandle {
        for i in 0..self.blocks.len() {
            if !self.blocks[i].free || self.blocks[i].size < size {
                continue;
            }

            if self.blocks[i].size >= size + MIN_SPLIT {
                let remainder = MemBlock {
                    offset: self.blocks[i].offset + size,
                    size: self.blocks[i].size - size,
                    free: true,
                    tag: 0,
                };
                self.blocks[i].size = size;
                self.blocks.insert(i + 1, remainder);
            }

            let block = &mut self.blocks[i];
            block.free = false;
            block.tag = MEMBLOCK_TAG;
            return CodeHandle {
                offset: block.offset,
                size: block.size,
            };
        }

        error!("code arena exhausted allocating {size} bytes");
        panic!("no executable memory left for a {size} byte block");
    }

    /// Return an allocation to the arena, coalescing with free neighbours
    /// on both sides (up to three records collapse into one).
    pub fn release(&mut self, handle: CodeHandle) {
        let mut idx = match self
            .blocks
            .binary_search_by(|b| b.offset.cmp(&handle.offset))
        {
            Ok(idx) => idx,
            Err(_) => {
                error!("release of unknown code handle at offset {:#x}", handle.offset);
                panic!("double free or invalid code handle");
            }
        };

        let block = &self.blocks[idx];
        if block.free || block.tag != MEMBLOCK_TAG || block.size != handle.size {
            error!(
                "double free or corruption at offset {:#x}: free={} tag={:#010x} size={}",
                block.offset, block.free, block.tag, block.size
            );
            panic!("double free or invalid code handle");
        }

        self.blocks[idx].free = true;
        self.blocks[idx].tag = 0;

        if idx > 0 && self.blocks[idx - 1].free {
            self.blocks[idx - 1].size += self.blocks[idx].size;
            self.blocks.remove(idx);
            idx -= 1;
        }
        if idx + 1 < self.blocks.len() && self.blocks[idx + 1].free {
            self.blocks[idx].size += self.blocks[idx + 1].size;
            self.blocks.remove(idx + 1);
        }
    }

    /// Writable view of an allocation, used by the emitter.
    pub fn slice_mut(&mut self, handle: &CodeHandle) -> &mut [u8] {
        debug_assert!(handle.offset + handle.size <= self.size);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(handle.offset), handle.size) }
    }

    /// Read-only view of an allocation, used for the block dump artifact.
    pub fn slice(&self, handle: &CodeHandle) -> &[u8] {
        debug_assert!(handle.offset + handle.size <= self.size);
        unsafe { std::slice::from_raw_parts(self.base.add(handle.offset), handle.size) }
    }

    /// Native address of an allocation's first byte.
    pub fn entry_ptr(&self, handle: &CodeHandle) -> *const u8 {
        debug_assert!(handle.offset + handle.size <= self.size);
        unsafe { self.base.add(handle.offset) }
    }

    /// Total free capacity across all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.blocks.iter().filter(|b| b.free).map(|b| b.size).sum()
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}
