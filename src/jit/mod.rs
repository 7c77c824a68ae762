//! Dynamic binary translation pipeline.
//!
//! Guest instructions are decoded ([`decode`]), sized and translated to
//! native x86-64 ([`compiler`], [`emitter`]) into a read/write/execute
//! arena ([`arena`]), and the resulting blocks are kept in a bounded,
//! use-counted cache ([`cache`]) until evicted or invalidated by a guest
//! write over their source bytes.

pub mod arena;
pub mod cache;
pub mod compiler;
pub mod decode;
pub mod emitter;

pub use arena::{CodeArena, CodeHandle, JIT_RESERVE_SIZE};
pub use cache::{BlockCache, CacheStats, EntryPoint, CACHE_CAPACITY};
pub use compiler::Recompiler;
pub use decode::Instruction;
