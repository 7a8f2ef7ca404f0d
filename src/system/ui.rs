//! UI-thread half of the buffer pipeline.

use super::{
    decode_entry, BufferAwaitingEvent, BufferSystemStats, PageRequest, RenderStats,
    SubmittedBatch, ENTRY_BYTES,
};
use crate::handoff::HandoffSender;
use crate::memory::{Block, PageMemory};
use crate::view::BufferView;
use rtrb::{Consumer, Producer};
use std::collections::HashMap;
use std::sync::Arc;

/// The soft-real-time half of the pipeline, driven once per tick.
///
/// The tick sequence is a correctness invariant: pending frees must be
/// submitted *before* newly-ready buffers are scheduled for return, or a
/// buffer could be reclaimed before the caller has read it out of the
/// newly-received list.
pub struct UiSide {
    page_size: usize,
    /// Every page ever created, in installation order; mirrors the
    /// render-side allocator's page table so in-transit blocks can be
    /// resolved here.
    pages: Vec<Arc<PageMemory>>,
    page_requests: Consumer<PageRequest>,
    new_pages: Producer<Arc<PageMemory>>,
    submitted: Consumer<SubmittedBatch>,
    stats: Consumer<RenderStats>,
    free_returns: HandoffSender<Vec<Block>>,
    /// Pages owed to the render thread, carried across ticks when the
    /// new-pages queue fills.
    pages_owed: u32,
    /// Event-pending buffers keyed by event id.
    received: HashMap<u64, BufferAwaitingEvent>,
    /// Buffers whose events fired, awaiting pickup by the caller.
    newly_received: Vec<BufferAwaitingEvent>,
    /// Blocks accumulated for return to the render thread.
    pending_free: Vec<Block>,
    /// Highest event id ever reported ready.
    ready_watermark: u64,
    last_stats: RenderStats,
}

impl UiSide {
    pub(crate) fn new(
        page_size: usize,
        pages: Vec<Arc<PageMemory>>,
        page_requests: Consumer<PageRequest>,
        new_pages: Producer<Arc<PageMemory>>,
        submitted: Consumer<SubmittedBatch>,
        stats: Consumer<RenderStats>,
        free_returns: HandoffSender<Vec<Block>>,
    ) -> Self {
        Self {
            page_size,
            pages,
            page_requests,
            new_pages,
            submitted,
            stats,
            free_returns,
            pages_owed: 0,
            received: HashMap::new(),
            newly_received: Vec::new(),
            pending_free: Vec::new(),
            ready_watermark: 0,
            last_stats: RenderStats::default(),
        }
    }

    /// Run one UI tick.
    ///
    /// `ready_event_ids` lists events that have fired since the last tick;
    /// `dropped_some` reports that an unknown subset of events was lost
    /// upstream, in which case every tracked buffer is reclaimed.
    pub fn tick(&mut self, ready_event_ids: &[u64], dropped_some: bool) {
        self.respond_to_page_requests();
        self.read_submitted();
        self.submit_pending_free();
        self.update_newly_received(ready_event_ids);
        self.drop_expired();
        if dropped_some {
            self.drop_received();
        }
        self.read_render_stats();
    }

    /// Take the buffers whose events have fired since the last call.
    ///
    /// Each entry's backing block is already scheduled for return, so its
    /// contents must be consumed before the *next* tick submits the
    /// pending-free batch.
    pub fn read_newly_received(&mut self) -> Vec<BufferAwaitingEvent> {
        std::mem::take(&mut self.newly_received)
    }

    /// Resolve a delivered view to its bytes through the page mirror.
    ///
    /// Only valid for views handed out by [`read_newly_received`] (the UI
    /// side owns those blocks until the pending-free batch carrying them
    /// is submitted).
    ///
    /// [`read_newly_received`]: UiSide::read_newly_received
    pub fn view_bytes(&self, view: &BufferView) -> &[u8] {
        let page = &self.pages[view.block.page_index()];
        // SAFETY: the UI side owns this block while it sits in
        // newly_received/pending_free; the render thread does not touch it.
        let bytes = unsafe { page.as_slice() };
        &bytes[view.block.offset()..view.block.offset() + view.len]
    }

    /// Combined system statistics from the last render snapshot plus the
    /// UI-side trackers.
    pub fn stats(&self) -> BufferSystemStats {
        BufferSystemStats {
            page_size: self.page_size,
            num_pages: self.last_stats.num_pages,
            bytes_allocated: self.last_stats.bytes_allocated,
            bytes_reserved: self.last_stats.bytes_reserved,
            max_bytes_allocated_in_epoch: self.last_stats.max_bytes_allocated_in_epoch,
            max_bytes_requested_in_epoch: self.last_stats.max_bytes_requested_in_epoch,
            num_received_buffers: self.received.len(),
            num_pending_free: self.pending_free.len(),
        }
    }

    /// Drain growth requests and grow as many pages as the queue allows,
    /// carrying the remainder to the next tick.
    fn respond_to_page_requests(&mut self) {
        while let Ok(request) = self.page_requests.pop() {
            self.pages_owed += request.pages;
        }

        while self.pages_owed > 0 {
            if self.new_pages.is_full() {
                tracing::debug!(
                    remaining = self.pages_owed,
                    "new-page queue full; deferring growth"
                );
                break;
            }
            let page = Arc::new(PageMemory::new(self.page_size));
            if self.new_pages.push(Arc::clone(&page)).is_err() {
                break;
            }
            self.pages.push(page);
            self.pages_owed -= 1;
        }
    }

    /// Drain submitted batches into the `received` map.
    ///
    /// A colliding event id is a possible leak upstream: the old entry's
    /// block is reclaimed and the new entry wins. The batch's own backing
    /// block is always scheduled for return.
    fn read_submitted(&mut self) {
        while let Ok(batch) = self.submitted.pop() {
            let start = batch.block.offset();
            let len = batch.count as usize * ENTRY_BYTES;
            let page = &self.pages[batch.block.page_index()];
            // SAFETY: the batch block's ownership transferred to the UI
            // side with the queue payload; the render thread no longer
            // touches it.
            let bytes = unsafe { page.as_slice() };

            debug_assert!(start + len <= bytes.len(), "batch exceeds page bounds");
            for i in 0..batch.count as usize {
                let at = start + i * ENTRY_BYTES;
                let entry = decode_entry(&bytes[at..at + ENTRY_BYTES]);
                if let Some(old) = self.received.insert(entry.event_id, entry) {
                    tracing::warn!(
                        event_id = old.event_id,
                        "duplicate event id; reclaiming previously tracked buffer"
                    );
                    self.pending_free.push(old.view.block);
                }
            }
            self.pending_free.push(batch.block);
        }
    }

    /// Drive the free-list mailbox: reclaim a finished container first,
    /// then submit the current pending-free set if nothing is in flight.
    fn submit_pending_free(&mut self) {
        if let Some(mut container) = self.free_returns.try_reclaim() {
            debug_assert!(container.is_empty(), "reclaimed container not drained");
            // Reuse the round-tripped allocation; it carries the
            // high-water capacity after warm-up.
            std::mem::swap(&mut self.pending_free, &mut container);
            self.pending_free.append(&mut container);
        }
        if !self.free_returns.in_flight() && !self.pending_free.is_empty() {
            self.free_returns
                .submit(std::mem::take(&mut self.pending_free));
        }
    }

    /// Move buffers whose events fired into the newly-received list and
    /// schedule their blocks for return.
    ///
    /// Runs after `submit_pending_free` in the same tick, so a delivered
    /// buffer stays readable until the caller has had a full tick to pick
    /// it up.
    fn update_newly_received(&mut self, ready_event_ids: &[u64]) {
        for &id in ready_event_ids {
            if id > self.ready_watermark {
                self.ready_watermark = id;
            }
            if let Some(entry) = self.received.remove(&id) {
                self.pending_free.push(entry.view.block);
                self.newly_received.push(entry);
            }
        }
    }

    /// Treat entries below the ready watermark as permanently lost.
    ///
    /// Heuristic: relies on event ids being monotonic and delivered in
    /// order. When delivery is lossy or out of order this can reclaim a
    /// buffer whose event simply has not arrived yet; see the crate docs
    /// for the flagged risk.
    fn drop_expired(&mut self) {
        let watermark = self.ready_watermark;
        let pending_free = &mut self.pending_free;
        self.received.retain(|&id, entry| {
            if id >= watermark {
                return true;
            }
            tracing::error!(
                event_id = id,
                watermark,
                "event id below ready watermark; force-freeing buffer"
            );
            pending_free.push(entry.view.block);
            false
        });
    }

    /// The caller reported lost events with unknown ids: reclaim every
    /// tracked buffer rather than leak any of them.
    fn drop_received(&mut self) {
        if self.received.is_empty() {
            return;
        }
        tracing::error!(
            count = self.received.len(),
            "events dropped upstream; reclaiming all tracked buffers"
        );
        for (_, entry) in self.received.drain() {
            self.pending_free.push(entry.view.block);
        }
    }

    fn read_render_stats(&mut self) {
        while let Ok(snapshot) = self.stats.pop() {
            self.last_stats = snapshot;
        }
    }
}
