//! Pool memory allocator for large numbers of small, fixed-size objects
//!
//! Graph nodes, edges, list cells and similar objects are allocated and freed
//! at very high rates with only a handful of distinct sizes. This crate
//! serves them from per-size free lists carved out of large blocks, with a
//! per-thread cache in front so that the common case takes no lock.
//!
//! ```
//! use poolmem::PoolAllocator;
//!
//! let pool = PoolAllocator::new();
//! let mut cache = pool.thread_cache();
//! let p = cache.allocate(24);
//! unsafe { cache.deallocate(24, p) };
//! assert_eq!(cache.allocate(24), p);
//! # unsafe { cache.deallocate(24, p) };
//! drop(cache);
//! pool.cleanup();
//! ```

pub mod allocator;
pub mod block;
pub mod config;
pub mod free_list;
mod loom_testing;
pub mod util;

pub use allocator::{PoolAllocator, ThreadCache};
pub use block::{BlockProvider, SystemBlocks};
pub use config::{ConfigError, PoolConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_SIZE, WORD_SIZE};
pub use free_list::link_chain;
