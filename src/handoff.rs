//! Single-slot two-phase ownership handoff.
//!
//! A [`HandoffSender`]/[`HandoffReceiver`] pair moves one value at a time
//! between two fixed threads without locks. The full cycle is
//! submit → read → return → reclaim:
//!
//! 1. sender [`submit`]s a value (release-publish),
//! 2. receiver [`try_read`]s it and takes ownership (acquire-consume),
//! 3. receiver [`give_back`]s the drained container (release-publish),
//! 4. sender [`try_reclaim`]s the container for reuse (acquire-consume).
//!
//! At most one value is ever in flight, which bounds the memory the slow
//! side can accumulate against the fast side. In this crate the sender role
//! is the UI thread handing freed-block batches toward the render thread.
//!
//! [`submit`]: HandoffSender::submit
//! [`try_read`]: HandoffReceiver::try_read
//! [`give_back`]: HandoffReceiver::give_back
//! [`try_reclaim`]: HandoffSender::try_reclaim

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared<T> {
    /// The in-flight value. Exactly one side may touch it in any protocol
    /// phase, mediated by the two flags.
    slot: UnsafeCell<Option<T>>,
    /// Set by the sender after storing a value (release); cleared by the
    /// receiver when it takes the value (acquire).
    published: AtomicBool,
    /// Set by the receiver after storing the returned container (release);
    /// cleared by the sender when it reclaims it (acquire).
    finished: AtomicBool,
}

// SAFETY: the slot is accessed by exactly one thread in each phase of the
// handshake; the release/acquire flag transitions order those accesses.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Create a connected handoff pair.
pub fn handoff<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let shared = Arc::new(Shared {
        slot: UnsafeCell::new(None),
        published: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });
    (
        HandoffSender {
            shared: Arc::clone(&shared),
            awaiting_return: false,
        },
        HandoffReceiver { shared },
    )
}

/// Submitting side of the handoff (the UI role).
pub struct HandoffSender<T> {
    shared: Arc<Shared<T>>,
    /// Local guard: true from submit until reclaim. Never touched by the
    /// receiving thread.
    awaiting_return: bool,
}

impl<T> HandoffSender<T> {
    /// Whether a value is currently in flight.
    #[inline]
    pub fn in_flight(&self) -> bool {
        self.awaiting_return
    }

    /// Publish a value to the receiver.
    ///
    /// Submitting while a previous value is still in flight is a caller
    /// bug, checked in debug builds only.
    pub fn submit(&mut self, value: T) {
        debug_assert!(!self.awaiting_return, "handoff submit while in flight");
        // SAFETY: nothing is in flight, so the receiver is not touching the
        // slot; the release store below hands it over.
        unsafe { *self.shared.slot.get() = Some(value) };
        self.awaiting_return = true;
        self.shared.published.store(true, Ordering::Release);
    }

    /// Take back the container the receiver has finished with, if any.
    pub fn try_reclaim(&mut self) -> Option<T> {
        if !self.shared.finished.load(Ordering::Acquire) {
            return None;
        }
        self.shared.finished.store(false, Ordering::Relaxed);
        // SAFETY: the acquire load above ordered us after the receiver's
        // give_back; the receiver will not touch the slot again until the
        // next submit.
        let value = unsafe { (*self.shared.slot.get()).take() };
        self.awaiting_return = false;
        value
    }
}

/// Receiving side of the handoff (the render role).
pub struct HandoffReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> HandoffReceiver<T> {
    /// Take ownership of a published value, if any.
    pub fn try_read(&mut self) -> Option<T> {
        if !self.shared.published.load(Ordering::Acquire) {
            return None;
        }
        self.shared.published.store(false, Ordering::Relaxed);
        // SAFETY: the acquire load ordered us after the sender's submit;
        // the sender will not touch the slot until we give the container
        // back and it reclaims.
        unsafe { (*self.shared.slot.get()).take() }
    }

    /// Return the drained container to the sender.
    pub fn give_back(&mut self, value: T) {
        debug_assert!(
            !self.shared.published.load(Ordering::Relaxed),
            "give_back before reading the published value"
        );
        // SAFETY: we own the slot between try_read and give_back.
        unsafe { *self.shared.slot.get() = Some(value) };
        self.shared.finished.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_full_handshake() {
        let (mut tx, mut rx) = handoff::<Vec<u32>>();
        assert!(!tx.in_flight());
        assert!(rx.try_read().is_none());
        assert!(tx.try_reclaim().is_none());

        tx.submit(vec![1, 2, 3]);
        assert!(tx.in_flight());
        // Nothing to reclaim until the receiver finishes.
        assert!(tx.try_reclaim().is_none());

        let mut batch = rx.try_read().unwrap();
        assert_eq!(batch, vec![1, 2, 3]);
        assert!(rx.try_read().is_none());

        batch.clear();
        rx.give_back(batch);

        let container = tx.try_reclaim().unwrap();
        assert!(container.is_empty());
        assert!(!tx.in_flight());
    }

    #[test]
    fn test_single_value_in_flight() {
        let (mut tx, mut rx) = handoff::<u64>();
        tx.submit(7);
        // The sender stays in flight across the whole cycle, so a second
        // submit is not legal until reclaim succeeds.
        assert!(tx.in_flight());
        let v = rx.try_read().unwrap();
        rx.give_back(v);
        assert!(tx.in_flight());
        assert_eq!(tx.try_reclaim(), Some(7));
        assert!(!tx.in_flight());
        tx.submit(8);
        assert_eq!(rx.try_read(), Some(8));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "submit while in flight")]
    fn test_double_submit_asserts() {
        let (mut tx, _rx) = handoff::<u64>();
        tx.submit(1);
        tx.submit(2);
    }

    #[test]
    fn test_cross_thread_cycles() {
        let (mut tx, mut rx) = handoff::<Vec<usize>>();

        let receiver = thread::spawn(move || {
            let mut seen = 0usize;
            while seen < 100 {
                if let Some(mut batch) = rx.try_read() {
                    seen += batch.len();
                    batch.clear();
                    rx.give_back(batch);
                }
                std::hint::spin_loop();
            }
            seen
        });

        let mut sent = 0usize;
        let mut container = Vec::new();
        while sent < 100 {
            if !tx.in_flight() {
                container.extend(0..10);
                sent += container.len();
                tx.submit(std::mem::take(&mut container));
            } else if let Some(reclaimed) = tx.try_reclaim() {
                container = reclaimed;
            }
            std::hint::spin_loop();
        }
        // Let the receiver drain the last batch.
        assert_eq!(receiver.join().unwrap(), 100);
    }
}
