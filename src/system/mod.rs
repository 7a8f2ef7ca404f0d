//! Cross-thread buffer orchestration.
//!
//! [`BufferSystem::new`] builds the whole pipeline and splits it into two
//! owned halves: a [`RenderSide`] for the hard-real-time audio thread and a
//! [`UiSide`] for the soft-real-time logic thread. The halves cooperate
//! through four independent bounded SPSC queues and one single-slot
//! handoff, with no locks and no blocking waits:
//!
//! ```text
//!   render ──PageRequest──────▶ UI     (growth requests)
//!   render ◀──Arc<PageMemory>── UI     (newly grown pages)
//!   render ──SubmittedBatch───▶ UI     (event-pending buffers)
//!   render ──RenderStats──────▶ UI     (periodic snapshots)
//!   render ◀──Vec<Block>──────▶ UI     (pending-free handoff mailbox)
//! ```
//!
//! Backpressure policy throughout: a full queue drops the payload and frees
//! its memory immediately (with a logged diagnostic); the render thread's
//! timing is never at the mercy of the UI tick rate.

mod render;
mod ui;

pub use render::RenderSide;
pub use ui::UiSide;

use crate::error::{Error, Result};
use crate::handoff::handoff;
use crate::memory::{Block, BuddyAllocator, PageMemory};
use crate::view::BufferView;
use std::sync::Arc;

/// Capacity of every bounded cross-thread queue.
pub const QUEUE_CAPACITY: usize = 32;

/// Defensive cap on pages asked for in a single growth request; a larger
/// computed demand indicates a bug upstream.
pub(crate) const MAX_PAGES_PER_REQUEST: u32 = 64;

/// A buffer parked until an external asynchronous event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAwaitingEvent {
    /// Correlation token for the external event; always nonzero.
    pub event_id: u64,
    /// Caller-defined type tag; always nonzero.
    pub type_tag: u32,
    /// Caller-defined instance id; always nonzero.
    pub instance_id: u32,
    /// The parked buffer.
    pub view: BufferView,
}

/// Render→UI request for additional pages.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageRequest {
    pub pages: u32,
}

/// Render→UI batch of event-pending buffers, encoded into one allocator
/// block as fixed-width records.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubmittedBatch {
    pub block: Block,
    pub count: u32,
}

/// Render→UI stats snapshot, published once per epoch when there is room.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RenderStats {
    pub num_pages: usize,
    pub bytes_allocated: usize,
    pub bytes_reserved: usize,
    pub max_bytes_allocated_in_epoch: usize,
    pub max_bytes_requested_in_epoch: usize,
}

/// Combined system statistics, read on the UI side.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSystemStats {
    /// Size of one allocator page in bytes.
    pub page_size: usize,
    /// Pages installed in the render-side allocator.
    pub num_pages: usize,
    /// Bytes held by live blocks.
    pub bytes_allocated: usize,
    /// Total bytes across installed pages.
    pub bytes_reserved: usize,
    /// High-water mark of bytes allocated within one epoch.
    pub max_bytes_allocated_in_epoch: usize,
    /// High-water mark of bytes requested within one epoch.
    pub max_bytes_requested_in_epoch: usize,
    /// Event-pending buffers currently tracked on the UI side.
    pub num_received_buffers: usize,
    /// Blocks waiting to be returned to the render thread.
    pub num_pending_free: usize,
}

// Wire format of one BufferAwaitingEvent record inside a submitted batch:
// u64 event_id | u32 type_tag | u32 instance_id |
// u32 page | u32 level | u32 offset | u32 len
pub(crate) const ENTRY_BYTES: usize = 32;

pub(crate) fn encode_entry(bytes: &mut [u8], entry: &BufferAwaitingEvent) {
    debug_assert!(bytes.len() >= ENTRY_BYTES);
    let (page, level, offset) = entry.view.block.raw_parts();
    bytes[0..8].copy_from_slice(&entry.event_id.to_le_bytes());
    bytes[8..12].copy_from_slice(&entry.type_tag.to_le_bytes());
    bytes[12..16].copy_from_slice(&entry.instance_id.to_le_bytes());
    bytes[16..20].copy_from_slice(&page.to_le_bytes());
    bytes[20..24].copy_from_slice(&level.to_le_bytes());
    bytes[24..28].copy_from_slice(&offset.to_le_bytes());
    bytes[28..32].copy_from_slice(&(entry.view.len as u32).to_le_bytes());
}

pub(crate) fn decode_entry(bytes: &[u8]) -> BufferAwaitingEvent {
    debug_assert!(bytes.len() >= ENTRY_BYTES);
    let u32_at = |at: usize| -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().expect("fixed-width field"))
    };
    let event_id = u64::from_le_bytes(bytes[0..8].try_into().expect("fixed-width field"));
    BufferAwaitingEvent {
        event_id,
        type_tag: u32_at(8),
        instance_id: u32_at(12),
        view: BufferView {
            block: Block::new(u32_at(16), u32_at(20), u32_at(24)),
            len: u32_at(28) as usize,
        },
    }
}

/// Construction-time configuration for a [`BufferSystem`].
#[derive(Debug, Clone, Copy)]
pub struct BufferSystemConfig {
    /// Number of buddy levels; page size is `slot_size * 2^(levels-1)`.
    pub levels: u32,
    /// Smallest allocation granularity in bytes.
    pub slot_size: usize,
    /// Pages created up front, before the first epoch.
    pub initial_pages: usize,
}

impl Default for BufferSystemConfig {
    fn default() -> Self {
        // 512-byte slots, 10 levels: 256 KiB pages, enough for a stereo
        // f32 buffer of 32k frames in a single allocation.
        Self {
            levels: 10,
            slot_size: 512,
            initial_pages: 1,
        }
    }
}

impl BufferSystemConfig {
    fn validate(&self) -> Result<()> {
        if self.levels < 1 || self.levels > 24 {
            return Err(Error::InvalidConfig(format!(
                "levels must be in 1..=24, got {}",
                self.levels
            )));
        }
        if self.slot_size == 0 {
            return Err(Error::InvalidConfig("slot size must be nonzero".into()));
        }
        let page_size = self.slot_size << (self.levels - 1);
        if page_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "page size {page_size} does not fit block offsets"
            )));
        }
        Ok(())
    }

    /// Page size implied by this geometry.
    pub fn page_size(&self) -> usize {
        self.slot_size << (self.levels - 1)
    }
}

/// Factory for the two halves of the allocation/handoff pipeline.
pub struct BufferSystem;

impl BufferSystem {
    /// Build a pipeline and split it into its render and UI halves.
    ///
    /// Initial pages are created here (on the constructing thread) and
    /// installed directly, so the first epoch can allocate without waiting
    /// for a growth round-trip.
    pub fn new(config: BufferSystemConfig) -> Result<(RenderSide, UiSide)> {
        config.validate()?;

        let mut allocator = BuddyAllocator::new(config.levels, config.slot_size);
        let mut page_mirror = Vec::with_capacity(config.initial_pages);
        for _ in 0..config.initial_pages {
            let page = Arc::new(PageMemory::new(config.page_size()));
            allocator.push_page(Arc::clone(&page));
            page_mirror.push(page);
        }

        let (request_tx, request_rx) = rtrb::RingBuffer::new(QUEUE_CAPACITY);
        let (pages_tx, pages_rx) = rtrb::RingBuffer::new(QUEUE_CAPACITY);
        let (submitted_tx, submitted_rx) = rtrb::RingBuffer::new(QUEUE_CAPACITY);
        let (stats_tx, stats_rx) = rtrb::RingBuffer::new(QUEUE_CAPACITY);
        let (free_tx, free_rx) = handoff();

        let render = RenderSide::new(allocator, pages_rx, request_tx, submitted_tx, stats_tx, free_rx);
        let ui = UiSide::new(
            config.page_size(),
            page_mirror,
            request_rx,
            pages_tx,
            submitted_rx,
            stats_rx,
            free_tx,
        );
        Ok((render, ui))
    }
}

/// Tear the pipeline down.
///
/// Must only be called after the render thread has stopped calling into its
/// half; both halves are consumed and every page, queue payload, and tracked
/// buffer is released with them.
pub fn terminate(render: RenderSide, ui: UiSide) {
    tracing::debug!(
        pages = render.allocator().num_pages(),
        bytes_allocated = render.allocator().bytes_allocated(),
        "terminating buffer system"
    );
    drop(render);
    drop(ui);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let entry = BufferAwaitingEvent {
            event_id: 0x1122_3344_5566_7788,
            type_tag: 9,
            instance_id: 4,
            view: BufferView {
                block: Block::new(2, 1, 384),
                len: 200,
            },
        };
        let mut bytes = [0u8; ENTRY_BYTES];
        encode_entry(&mut bytes, &entry);
        assert_eq!(decode_entry(&bytes), entry);
    }

    #[test]
    fn test_config_validation() {
        assert!(BufferSystemConfig::default().validate().is_ok());

        let bad_levels = BufferSystemConfig {
            levels: 0,
            ..Default::default()
        };
        assert!(bad_levels.validate().is_err());

        let bad_slot = BufferSystemConfig {
            slot_size: 0,
            ..Default::default()
        };
        assert!(bad_slot.validate().is_err());
    }

    #[test]
    fn test_initial_pages_installed() {
        let (render, ui) = BufferSystem::new(BufferSystemConfig {
            levels: 4,
            slot_size: 64,
            initial_pages: 2,
        })
        .unwrap();
        assert_eq!(render.allocator().num_pages(), 2);
        assert_eq!(render.allocator().bytes_reserved(), 1024);
        terminate(render, ui);
    }
}
