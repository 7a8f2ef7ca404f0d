//! # Cadence
//!
//! A real-time-safe memory allocator and cross-thread handoff protocol for
//! audio sample buffers, shared between a hard-real-time render callback
//! and a soft-real-time UI/logic thread.
//!
//! ## Architecture
//!
//! - **[`memory`]**: a from-scratch buddy allocator over fixed-size pages
//!   with bit-level bookkeeping, owned exclusively by the render thread.
//! - **[`handoff`]**: a single-slot, two-phase ownership mailbox built on
//!   acquire/release atomics.
//! - **[`system`]**: the orchestrator that composes the allocator, four
//!   bounded SPSC queues (via `rtrb`), and the mailbox into a cooperative
//!   grow/shrink and buffer-handoff protocol that never blocks the audio
//!   thread and never locks.
//! - **[`view`]**: self-describing sample buffers with an embedded
//!   channel-layout descriptor.
//!
//! ## Quick Start
//!
//! ```rust
//! use cadence::prelude::*;
//!
//! let (mut render, mut ui) = BufferSystem::new(BufferSystemConfig::default())?;
//!
//! // Audio callback (render thread), once per epoch:
//! render.begin_epoch();
//! if let Some(buf) = render.allocate(&[ChannelType::F32, ChannelType::F32], 128) {
//!     // fill samples, then either free it or park it on an event:
//!     render.wait_for_event(1, 1, 1, buf);
//! }
//! render.end_epoch();
//!
//! // Logic thread, once per tick:
//! ui.tick(&[1], false);
//! for ready in ui.read_newly_received() {
//!     let _bytes = ui.view_bytes(&ready.view);
//! }
//! # cadence::system::terminate(render, ui);
//! # Ok::<(), cadence::Error>(())
//! ```
//!
//! ## Known risk
//!
//! The UI side's expiry heuristic assumes event ids are monotonic and
//! delivered in order, while the same interface admits lossy delivery
//! (`dropped_some`). A buffer whose event is merely late can therefore be
//! reclaimed as if it were lost. This trade-off favors bounded memory over
//! perfect delivery and is deliberately left unresolved; see `UiSide::tick`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod handoff;
pub mod memory;
pub mod system;
pub mod view;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::memory::{Block, BuddyAllocator};
    pub use crate::system::{
        BufferAwaitingEvent, BufferSystem, BufferSystemConfig, BufferSystemStats, RenderSide,
        UiSide,
    };
    pub use crate::view::{BufferView, ChannelType};
}

pub use error::{Error, Result};
