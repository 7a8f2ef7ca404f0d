//! Render-thread half of the buffer pipeline.

use super::{
    encode_entry, BufferAwaitingEvent, PageRequest, RenderStats, SubmittedBatch, ENTRY_BYTES,
    MAX_PAGES_PER_REQUEST,
};
use crate::handoff::HandoffReceiver;
use crate::memory::{Block, BuddyAllocator, PageMemory};
use crate::view::{self, BufferView, ChannelType};
use rtrb::{Consumer, Producer, PushError};
use std::sync::Arc;

/// The hard-real-time half of the pipeline.
///
/// Steady-state operation never blocks and never touches the
/// general-purpose heap; the one deliberate exception is the growable
/// pending-wait list fed by [`wait_for_event`], which stabilizes at its
/// high-water mark after warm-up.
///
/// Calls follow an implicit per-epoch state machine, once per audio
/// callback:
///
/// ```text
/// begin_epoch → { allocate | free | wait_for_event }* → end_epoch
/// ```
///
/// [`wait_for_event`]: RenderSide::wait_for_event
pub struct RenderSide {
    allocator: BuddyAllocator,
    new_pages: Consumer<Arc<PageMemory>>,
    page_requests: Producer<PageRequest>,
    submitted: Producer<SubmittedBatch>,
    stats: Producer<RenderStats>,
    free_returns: HandoffReceiver<Vec<Block>>,
    /// Buffers parked until an external event; drained every end_epoch.
    pending_waits: Vec<BufferAwaitingEvent>,
    /// Pages requested from the UI but not yet installed.
    pages_outstanding: u32,
    bytes_requested_epoch: usize,
    bytes_allocated_epoch: usize,
    max_bytes_requested: usize,
    max_bytes_allocated: usize,
}

impl RenderSide {
    pub(crate) fn new(
        allocator: BuddyAllocator,
        new_pages: Consumer<Arc<PageMemory>>,
        page_requests: Producer<PageRequest>,
        submitted: Producer<SubmittedBatch>,
        stats: Producer<RenderStats>,
        free_returns: HandoffReceiver<Vec<Block>>,
    ) -> Self {
        Self {
            allocator,
            new_pages,
            page_requests,
            submitted,
            stats,
            free_returns,
            pending_waits: Vec::new(),
            pages_outstanding: 0,
            bytes_requested_epoch: 0,
            bytes_allocated_epoch: 0,
            max_bytes_requested: 0,
            max_bytes_allocated: 0,
        }
    }

    /// The underlying allocator (stats and tests).
    pub fn allocator(&self) -> &BuddyAllocator {
        &self.allocator
    }

    /// Start an audio epoch.
    ///
    /// Installs any pages the UI thread has grown since the last epoch,
    /// then services the free-list mailbox: a received batch has every
    /// block freed and the drained container is returned immediately.
    pub fn begin_epoch(&mut self) {
        while let Ok(page) = self.new_pages.pop() {
            self.allocator.push_page(page);
            self.pages_outstanding = self.pages_outstanding.saturating_sub(1);
        }

        if let Some(mut batch) = self.free_returns.try_read() {
            for block in batch.drain(..) {
                self.allocator.free(block);
            }
            self.free_returns.give_back(batch);
        }

        self.bytes_requested_epoch = 0;
        self.bytes_allocated_epoch = 0;
    }

    /// Allocate a sample buffer for the given channel layout.
    ///
    /// The requested size always counts toward this epoch's demand, so a
    /// failed allocation is folded into the growth request at `end_epoch`.
    /// On success the self-describing descriptor is written into the block.
    pub fn allocate(&mut self, channels: &[ChannelType], frame_count: usize) -> Option<BufferView> {
        let size = view::descriptor_size(channels) + view::frame_stride(channels) * frame_count;
        self.bytes_requested_epoch += size;

        let block = self.allocator.try_allocate(size)?;
        self.bytes_allocated_epoch += size;
        view::write_descriptor(self.allocator.block_bytes_mut(block), channels);
        Some(BufferView { block, len: size })
    }

    /// Free a buffer immediately.
    pub fn free(&mut self, view: BufferView) {
        self.allocator.free(view.block);
    }

    /// Park a buffer until the external event `event_id` fires.
    ///
    /// Ownership moves to the handoff pipeline: the buffer is delivered to
    /// the UI side at `end_epoch` and comes back through the free-list
    /// mailbox once claimed or reclaimed. Ids, tags, and instances are
    /// always nonzero (debug-asserted).
    pub fn wait_for_event(
        &mut self,
        event_id: u64,
        type_tag: u32,
        instance_id: u32,
        view: BufferView,
    ) {
        debug_assert!(event_id > 0, "event id must be nonzero");
        debug_assert!(type_tag > 0, "type tag must be nonzero");
        debug_assert!(instance_id > 0, "instance id must be nonzero");
        self.pending_waits.push(BufferAwaitingEvent {
            event_id,
            type_tag,
            instance_id,
            view,
        });
    }

    /// Finish an audio epoch: ship pending waits, request growth, publish
    /// stats.
    pub fn end_epoch(&mut self) {
        self.flush_pending_waits();
        self.request_growth();
        self.publish_stats();
    }

    /// Resolve a live view to its bytes (descriptor + payload), mutably.
    pub fn view_bytes_mut(&mut self, view: &BufferView) -> &mut [u8] {
        &mut self.allocator.block_bytes_mut(view.block)[..view.len]
    }

    /// Resolve a live view to its bytes (descriptor + payload).
    pub fn view_bytes(&self, view: &BufferView) -> &[u8] {
        &self.allocator.block_bytes(view.block)[..view.len]
    }

    /// Batch the pending-wait list into allocator blocks and push them to
    /// the UI thread. A batch block cannot span pages, so a wait list
    /// longer than one page of records ships as several batches. Any batch
    /// whose block cannot be allocated or whose queue push fails is
    /// dropped and every constituent buffer freed: never leak, never
    /// block.
    fn flush_pending_waits(&mut self) {
        if self.pending_waits.is_empty() {
            return;
        }

        let max_entries = (self.allocator.page_size() / ENTRY_BYTES).max(1);
        let pending = std::mem::take(&mut self.pending_waits);
        for entries in pending.chunks(max_entries) {
            self.ship_batch(entries);
        }
        // Keep the warmed-up list for the next epoch.
        self.pending_waits = pending;
        self.pending_waits.clear();
    }

    fn ship_batch(&mut self, entries: &[BufferAwaitingEvent]) {
        let needed = entries.len() * ENTRY_BYTES;
        if needed > self.allocator.page_size() {
            // Degenerate geometry where a page holds less than one record.
            tracing::error!(
                count = entries.len(),
                "event batch exceeds page size; dropping pending buffers"
            );
            self.free_entries(entries);
            return;
        }
        let Some(block) = self.allocator.try_allocate(needed) else {
            tracing::error!(
                count = entries.len(),
                "no block for event batch; dropping pending buffers"
            );
            self.free_entries(entries);
            return;
        };

        let bytes = self.allocator.block_bytes_mut(block);
        for (i, entry) in entries.iter().enumerate() {
            encode_entry(&mut bytes[i * ENTRY_BYTES..], entry);
        }

        let batch = SubmittedBatch {
            block,
            count: entries.len() as u32,
        };
        match self.submitted.push(batch) {
            Ok(()) => {}
            Err(PushError::Full(batch)) => {
                tracing::error!(
                    count = batch.count,
                    "submitted-buffer queue full; dropping batch"
                );
                self.allocator.free(batch.block);
                self.free_entries(entries);
            }
        }
    }

    fn free_entries(&mut self, entries: &[BufferAwaitingEvent]) {
        for entry in entries {
            self.allocator.free(entry.view.block);
        }
    }

    /// Convert this epoch's allocation deficit into an incremental page
    /// request, capped defensively.
    fn request_growth(&mut self) {
        let deficit = self
            .bytes_requested_epoch
            .saturating_sub(self.bytes_allocated_epoch);
        if deficit == 0 {
            return;
        }

        let pages_needed = deficit.div_ceil(self.allocator.page_size()) as u32;
        if pages_needed <= self.pages_outstanding {
            return;
        }
        let increment = (pages_needed - self.pages_outstanding).min(MAX_PAGES_PER_REQUEST);

        match self.page_requests.push(PageRequest { pages: increment }) {
            Ok(()) => {
                self.pages_outstanding += increment;
                tracing::debug!(pages = increment, deficit, "requested allocator growth");
            }
            Err(PushError::Full(_)) => {
                // Deficit recurs next epoch; the request is merely deferred.
                tracing::error!("page request queue full; deferring growth request");
            }
        }
    }

    fn publish_stats(&mut self) {
        self.max_bytes_requested = self.max_bytes_requested.max(self.bytes_requested_epoch);
        self.max_bytes_allocated = self.max_bytes_allocated.max(self.bytes_allocated_epoch);

        let snapshot = RenderStats {
            num_pages: self.allocator.num_pages(),
            bytes_allocated: self.allocator.bytes_allocated(),
            bytes_reserved: self.allocator.bytes_reserved(),
            max_bytes_allocated_in_epoch: self.max_bytes_allocated,
            max_bytes_requested_in_epoch: self.max_bytes_requested,
        };
        // Stats are advisory; silently skip when the UI is behind.
        let _ = self.stats.push(snapshot);
    }
}
