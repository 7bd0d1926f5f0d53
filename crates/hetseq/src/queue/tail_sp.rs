//! Single-producer tail: plain cursor advancement.
//!
//! With one producer there is no reservation race: the tail cursor is
//! advanced with relaxed stores and the only synchronization is the release
//! store that publishes each control word to consumers. Both consistency
//! models degenerate to this module on the producer side.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::invariants::debug_assert_granular;
use crate::page_alloc::{PagedAllocator, ProgressGuarantee};
use crate::queue::layout::{
    self, first_block, header_of, page_limit, page_of, ControlBlock, Slot, DEAD, END_OF_PAGE,
};
use crate::queue::{SlotKind, Tail};

/// Tail state for the single-producer configurations.
///
/// The cursor is atomic only so the queue stays `Sync`; the unique
/// [`Producer`](crate::queue::Producer) handle guarantees a single writer,
/// so all cursor accesses are relaxed.
#[derive(Default)]
pub struct SpTail {
    tail: AtomicUsize,
}

impl SpTail {
    fn install_first_page<A: PagedAllocator>(
        &self,
        alloc: &A,
        entry: &AtomicUsize,
        guarantee: ProgressGuarantee,
    ) -> Option<usize> {
        let page = alloc.allocate_page(guarantee)?;
        let first = first_block::<A>(page.as_ptr() as usize);
        // The head discovers the chain through `entry`; only the first page
        // ever installs it.
        let _ = entry.compare_exchange(0, first, Ordering::Release, Ordering::Relaxed);
        self.tail.store(first, Ordering::Relaxed);
        Some(first)
    }

    fn roll_over<A: PagedAllocator>(
        &self,
        alloc: &A,
        guarantee: ProgressGuarantee,
        sentinel_at: usize,
    ) -> Option<usize> {
        let page = alloc.allocate_page(guarantee)?;
        let page_addr = page.as_ptr() as usize;
        let first = first_block::<A>(page_addr);
        // Link the pages before the sentinel becomes visible: a consumer that
        // acquires the sentinel word must find the successor.
        unsafe {
            (*header_of::<A>(sentinel_at))
                .next_page
                .store(page_addr, Ordering::Release);
            (*(sentinel_at as *const ControlBlock))
                .next
                .store(END_OF_PAGE, Ordering::Release);
        }
        self.tail.store(first, Ordering::Relaxed);
        Some(first)
    }
}

impl<A: PagedAllocator> Tail<A> for SpTail {
    const RELAXED: bool = false;
    const SINGLE: bool = true;

    fn allocate(
        &self,
        alloc: &A,
        entry: &AtomicUsize,
        guarantee: ProgressGuarantee,
        flags: usize,
        kind: SlotKind,
    ) -> Option<Slot> {
        let mut t = self.tail.load(Ordering::Relaxed);
        if t == 0 {
            t = self.install_first_page(alloc, entry, guarantee)?;
        }
        loop {
            debug_assert_granular!(t);
            let end = match kind {
                SlotKind::Element { size, align } => layout::element_extents(t, size, align).1,
                SlotKind::ExternalRecord => layout::external_extents(t).1,
            };
            if end <= page_limit::<A>(page_of::<A>(t)) {
                let word = end | flags;
                // The word at `t` is zero until this store (zeroed-page
                // contract), so consumers treat the slot as absent until the
                // release store publishes it.
                unsafe {
                    (*(t as *const ControlBlock)).next.store(word, Ordering::Release);
                }
                self.tail.store(end, Ordering::Relaxed);
                return Some(Slot {
                    block: t,
                    end,
                    flags,
                });
            }
            t = self.roll_over(alloc, guarantee, t)?;
        }
    }

    fn commit_put(&self, slot: &Slot) {
        // BUSY -> READY.
        slot_commit_clear_busy(slot);
    }

    fn cancel_put(&self, slot: &Slot) {
        // BUSY -> DEAD, preserving the EXTERNAL flag.
        slot_cancel_mark_dead(slot);
    }
}

pub(crate) fn slot_commit_clear_busy(slot: &Slot) {
    unsafe {
        slot.control()
            .next
            .fetch_and(!layout::BUSY, Ordering::Release);
    }
}

pub(crate) fn slot_cancel_mark_dead(slot: &Slot) {
    unsafe {
        let _ = slot
            .control()
            .next
            .fetch_update(Ordering::Release, Ordering::Relaxed, |w| {
                Some((w & !layout::BUSY) | DEAD)
            });
    }
}
