//! Multi-producer tail, relaxed consistency.
//!
//! Reservations advance the tail with acquire-release CAS only: there is no
//! global order of reservations across threads. A reserved element slot is
//! left unlinked (its control word stays zero) until the producer commits
//! and links it explicitly with a release store. Until then the queue is
//! truncated from every other thread's perspective — elements reserved after
//! the unlinked slot are unreachable too, even to their own producers. The
//! truncation window is unbounded; it ends when the slow producer commits or
//! cancels.
//!
//! Raw sub-allocations are born DEAD and are linked immediately: they carry
//! no payload visibility requirement.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::invariants::debug_assert_granular;
use crate::page_alloc::{PagedAllocator, ProgressGuarantee};
use crate::queue::layout::{
    self, first_block, header_of, page_limit, page_of, ControlBlock, Slot, DEAD, END_OF_PAGE,
    EXTERNAL,
};
use crate::queue::{SlotKind, Tail};

/// Low bit of the tail word while a rollover is in flight.
const ROLLING: usize = 1;

/// Tail state for the relaxed multi-producer configuration.
#[derive(Default)]
pub struct MpRelaxedTail {
    tail: CachePadded<AtomicUsize>,
}

impl<A: PagedAllocator> Tail<A> for MpRelaxedTail {
    const RELAXED: bool = true;
    const SINGLE: bool = false;

    fn allocate(
        &self,
        alloc: &A,
        entry: &AtomicUsize,
        guarantee: ProgressGuarantee,
        flags: usize,
        kind: SlotKind,
    ) -> Option<Slot> {
        let wait_free = guarantee == ProgressGuarantee::WaitFree;
        let blocking = guarantee == ProgressGuarantee::Blocking;
        let mut backoff = Backoff::new();
        loop {
            let t = self.tail.load(Ordering::Acquire);

            if t == 0 {
                let page = alloc.allocate_page(guarantee)?;
                let first = first_block::<A>(page.as_ptr() as usize);
                match self
                    .tail
                    .compare_exchange(0, first, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        let _ =
                            entry.compare_exchange(0, first, Ordering::Release, Ordering::Relaxed);
                    }
                    Err(_) => unsafe {
                        alloc.deallocate_page(page);
                        if wait_free {
                            return None;
                        }
                    },
                }
                continue;
            }

            if t & ROLLING != 0 {
                if !blocking {
                    return None;
                }
                backoff.snooze();
                continue;
            }

            debug_assert_granular!(t);
            let end = match kind {
                SlotKind::Element { size, align } => layout::element_extents(t, size, align).1,
                SlotKind::ExternalRecord => layout::external_extents(t).1,
            };

            if end <= page_limit::<A>(page_of::<A>(t)) {
                // Phase 1: reserve, with no sequential fence.
                match self
                    .tail
                    .compare_exchange_weak(t, end, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        if flags & DEAD != 0 {
                            // Raw sub-allocation: link now, it is already
                            // terminal.
                            unsafe {
                                (*(t as *const ControlBlock))
                                    .next
                                    .store(end | flags, Ordering::Release);
                            }
                        }
                        // Element slots stay unlinked until Phase 2 in
                        // `commit_put`/`cancel_put`.
                        return Some(Slot {
                            block: t,
                            end,
                            flags,
                        });
                    }
                    Err(_) => {
                        if wait_free {
                            return None;
                        }
                        backoff.spin();
                        continue;
                    }
                }
            }

            match self
                .tail
                .compare_exchange(t, t | ROLLING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => match alloc.allocate_page(guarantee) {
                    None => {
                        self.tail.store(t, Ordering::Release);
                        return None;
                    }
                    Some(page) => {
                        let page_addr = page.as_ptr() as usize;
                        let first = first_block::<A>(page_addr);
                        unsafe {
                            (*header_of::<A>(t)).next_page.store(page_addr, Ordering::Release);
                            (*(t as *const ControlBlock))
                                .next
                                .store(END_OF_PAGE, Ordering::Release);
                        }
                        self.tail.store(first, Ordering::Release);
                        continue;
                    }
                },
                Err(_) => {
                    if !blocking {
                        return None;
                    }
                    backoff.snooze();
                    continue;
                }
            }
        }
    }

    fn commit_put(&self, slot: &Slot) {
        // Phase 2: link. The slot becomes observable (READY) here, not at
        // reservation.
        unsafe {
            slot.control()
                .next
                .store(slot.end | (slot.flags & EXTERNAL), Ordering::Release);
        }
    }

    fn cancel_put(&self, slot: &Slot) {
        // Link directly as DEAD so consumers can pass over the slot.
        unsafe {
            slot.control()
                .next
                .store(slot.end | DEAD | (slot.flags & EXTERNAL), Ordering::Release);
        }
    }
}
