//! Multi-producer tail, sequential consistency.
//!
//! Reservations are sequentially-consistent CAS advances of the tail cursor,
//! so all puts across all threads have a single global order, and each slot
//! is linked (in BUSY state) at reservation time: consumers observe the
//! reservation immediately and wait for it to become READY or DEAD.
//!
//! Page rollover briefly locks the tail word (low bit) while the winning
//! producer installs the successor page. Losers back off under `Blocking`
//! and fail under `LockFree`/`WaitFree` — waiting on another thread's
//! progress is exactly what those guarantees forbid.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::invariants::debug_assert_granular;
use crate::page_alloc::{PagedAllocator, ProgressGuarantee};
use crate::queue::layout::{
    self, first_block, header_of, page_limit, page_of, ControlBlock, Slot, END_OF_PAGE,
};
use crate::queue::tail_sp::{slot_cancel_mark_dead, slot_commit_clear_busy};
use crate::queue::{SlotKind, Tail};

/// Low bit of the tail word while a rollover is in flight.
const ROLLING: usize = 1;

/// Tail state for the sequentially-consistent multi-producer configuration.
#[derive(Default)]
pub struct MpSeqTail {
    tail: CachePadded<AtomicUsize>,
}

impl<A: PagedAllocator> Tail<A> for MpSeqTail {
    const RELAXED: bool = false;
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
            let t = self.tail.load(Ordering::SeqCst);

            if t == 0 {
                // Race to install the first page; losers return their page.
                let page = alloc.allocate_page(guarantee)?;
                let first = first_block::<A>(page.as_ptr() as usize);
                match self
                    .tail
                    .compare_exchange(0, first, Ordering::SeqCst, Ordering::SeqCst)
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
                // Phase 1: reserve. The SeqCst CAS carries the global order
                // of reservations across producers.
                match self
                    .tail
                    .compare_exchange_weak(t, end, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => {
                        // Phase 2: link. The word at `t` was zero; this store
                        // makes the reservation observable (still BUSY).
                        let word = end | flags;
                        unsafe {
                            (*(t as *const ControlBlock)).next.store(word, Ordering::SeqCst);
                        }
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

            // Rollover: lock the tail word, install the successor, publish
            // the end-of-page sentinel at `t`.
            match self
                .tail
                .compare_exchange(t, t | ROLLING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => match alloc.allocate_page(guarantee) {
                    None => {
                        self.tail.store(t, Ordering::SeqCst);
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
                        self.tail.store(first, Ordering::SeqCst);
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
        slot_commit_clear_busy(slot);
    }

    fn cancel_put(&self, slot: &Slot) {
        slot_cancel_mark_dead(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_alloc::PageAllocator;
    use crate::queue::layout::{ADDR_MASK, BUSY, STATE_MASK};
    use std::sync::Arc;

    #[test]
    fn test_mp_seq_reservations_are_linked_busy() {
        let alloc = PageAllocator::with_cache_capacity(4);
        let entry = AtomicUsize::new(0);
        let tail = MpSeqTail::default();

        let a = Tail::<PageAllocator>::allocate(
            &tail,
            &alloc,
            &entry,
            ProgressGuarantee::Blocking,
            BUSY,
            SlotKind::Element { size: 16, align: 8 },
        )
        .unwrap();
        let b = Tail::<PageAllocator>::allocate(
            &tail,
            &alloc,
            &entry,
            ProgressGuarantee::Blocking,
            BUSY,
            SlotKind::Element { size: 16, align: 8 },
        )
        .unwrap();

        // The first slot's word points at the second slot.
        let word = unsafe { a.control().next.load(Ordering::Relaxed) };
        assert_eq!(word & ADDR_MASK, b.block);
        assert_eq!(word & STATE_MASK, BUSY);
    }

    #[test]
    fn test_mp_seq_wait_free_fails_without_cached_page() {
        let alloc = PageAllocator::with_cache_capacity(4);
        let entry = AtomicUsize::new(0);
        let tail = MpSeqTail::default();

        // No page installed and none cached: wait-free cannot allocate one.
        let r = Tail::<PageAllocator>::allocate(
            &tail,
            &alloc,
            &entry,
            ProgressGuarantee::WaitFree,
            BUSY,
            SlotKind::Element { size: 16, align: 8 },
        );
        assert!(r.is_none());
        assert_eq!(entry.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_mp_seq_concurrent_reservations_are_disjoint() {
        let alloc = PageAllocator::with_cache_capacity(4);
        let entry = Arc::new(AtomicUsize::new(0));
        let tail = Arc::new(MpSeqTail::default());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = alloc.clone();
            let entry = Arc::clone(&entry);
            let tail = Arc::clone(&tail);
            handles.push(std::thread::spawn(move || {
                let mut blocks = Vec::new();
                for _ in 0..200 {
                    let slot = Tail::<PageAllocator>::allocate(
                        &*tail,
                        &alloc,
                        &entry,
                        ProgressGuarantee::Blocking,
                        BUSY,
                        SlotKind::Element { size: 24, align: 8 },
                    )
                    .unwrap();
                    blocks.push(slot.block);
                }
                blocks
            }));
        }

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "two producers shared a slot");
    }
}
