//! Real-time-safe memory management.
//!
//! This module provides the buddy allocator that backs all sample buffers:
//!
//! - [`BuddyAllocator`]: page-based buddy allocator with bitset bookkeeping
//! - [`Block`]: value-type handle to one allocation (page, level, offset)
//! - [`PageMemory`]: one fixed-size heap arena, shared via `Arc`
//! - [`LevelBitset`]: per-level occupancy bitset with a running free count
//!
//! The allocator itself is single-threaded and owned by the render thread;
//! growing it is a cooperative protocol driven by the orchestrator in
//! [`crate::system`].

mod bitset;
mod buddy;
mod page;

pub use bitset::LevelBitset;
pub use buddy::{Block, BuddyAllocator};
pub use page::{Page, PageMemory};
