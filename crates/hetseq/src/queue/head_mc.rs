//! Multi-consumer head: pin, scan, claim by CAS.
//!
//! A consumer pins the page under the head before reading any control word
//! on it, then validates that the head did not move while it pinned; a
//! failed validation means the page may have been recycled, so the consumer
//! unpins and restarts from a fresh head. The pin keeps the page alive for
//! the whole claim (through commit or cancel).
//!
//! Head advancement is cooperative: any consumer that finds a DEAD prefix
//! CASes the head forward, and the one that moves the head across an
//! end-of-page sentinel retires the page. The last unpinner of a retired
//! page releases it — exactly when all its control blocks are DEAD and the
//! pin count reaches zero.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::invariants::{debug_assert_claimable, debug_assert_pin_balance};
use crate::page_alloc::PagedAllocator;
use crate::queue::layout::{
    first_block, header_of, page_of, release_external, ControlBlock, PageHeader, ADDR_MASK, BUSY,
    DEAD, END_OF_PAGE, EXTERNAL, PAGE_RETIRED,
};
use crate::queue::{Claim, Head};

/// Head state for the multi-consumer configurations.
#[derive(Default)]
pub struct McHead {
    head: CachePadded<AtomicUsize>,
}

impl McHead {
    /// Releases one pin; the last unpinner of a retired page frees it.
    unsafe fn unpin<A: PagedAllocator>(alloc: &A, page: usize) {
        let header = &*(page as *const PageHeader);
        let prev = header.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert_pin_balance!(prev);
        if prev == PAGE_RETIRED + 1 {
            alloc.deallocate_page(NonNull::new_unchecked(page as *mut u8));
        }
    }

    /// Marks a page retired once the head has moved off it. If no consumer
    /// holds a pin, the retiring consumer frees the page on the spot.
    unsafe fn retire<A: PagedAllocator>(alloc: &A, page: usize) {
        let header = &*(page as *const PageHeader);
        let prev = header.pins.fetch_or(PAGE_RETIRED, Ordering::AcqRel);
        if prev == 0 {
            alloc.deallocate_page(NonNull::new_unchecked(page as *mut u8));
        }
    }
}

impl<A: PagedAllocator> Head<A> for McHead {
    const SINGLE: bool = false;

    fn try_start_consume(&self, alloc: &A, entry: &AtomicUsize, skip_busy: bool) -> Option<Claim> {
        'restart: loop {
            let h = self.head.load(Ordering::Acquire);
            let h = if h == 0 {
                let start = entry.load(Ordering::Acquire);
                if start == 0 {
                    return None;
                }
                let _ = self
                    .head
                    .compare_exchange(0, start, Ordering::AcqRel, Ordering::Acquire);
                continue 'restart;
            } else {
                h
            };

            // Pin, then validate: if the head moved while we pinned, the
            // page may already be retired (or recycled) and the pin we took
            // is meaningless — undo it and retry.
            let page = page_of::<A>(h);
            let header = unsafe { &*(page as *const PageHeader) };
            header.pins.fetch_add(1, Ordering::AcqRel);
            if self.head.load(Ordering::Acquire) != h {
                unsafe { Self::unpin(alloc, page) };
                continue 'restart;
            }

            let mut head_cursor = h;
            let mut pos = h;
            loop {
                let word =
                    unsafe { (*(pos as *const ControlBlock)).next.load(Ordering::Acquire) };
                if word == 0 {
                    unsafe { Self::unpin(alloc, page) };
                    return None;
                }

                if word & END_OF_PAGE != 0 {
                    if head_cursor != pos {
                        // Skipped-over BUSY blocks pin the head to this
                        // page; the successor is unreachable for now.
                        unsafe { Self::unpin(alloc, page) };
                        return None;
                    }
                    let next_page =
                        unsafe { (*header_of::<A>(pos)).next_page.load(Ordering::Acquire) };
                    debug_assert!(next_page != 0);
                    let first = first_block::<A>(next_page);
                    if self
                        .head
                        .compare_exchange(pos, first, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // We moved the head off this page: all its blocks
                        // are DEAD, retire it.
                        unsafe { Self::retire(alloc, page) };
                    }
                    unsafe { Self::unpin(alloc, page) };
                    continue 'restart;
                }

                let addr = word & ADDR_MASK;
                if word & DEAD != 0 {
                    if head_cursor == pos {
                        match self.head.compare_exchange(
                            pos,
                            addr,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // Winner of the advancement reclaims the
                                // external block, exactly once.
                                if word & EXTERNAL != 0 {
                                    unsafe { release_external(alloc, pos) };
                                }
                                head_cursor = addr;
                            }
                            Err(_) => {
                                // Another consumer advanced; restart from
                                // the fresh head.
                                unsafe { Self::unpin(alloc, page) };
                                continue 'restart;
                            }
                        }
                    }
                    pos = addr;
                    continue;
                }

                if word & BUSY != 0 {
                    if skip_busy {
                        pos = addr;
                        continue;
                    }
                    unsafe { Self::unpin(alloc, page) };
                    return None;
                }

                // READY -> CLAIMED. Acquire pairs with the committing
                // producer's release, publishing the payload.
                debug_assert_claimable!(word);
                match unsafe {
                    (*(pos as *const ControlBlock)).next.compare_exchange(
                        word,
                        word | BUSY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                } {
                    Ok(_) => {
                        // The pin travels with the claim.
                        return Some(Claim {
                            block: pos,
                            word,
                            pinned: page,
                        });
                    }
                    Err(_) => {
                        // Lost the race; re-examine the same block with its
                        // new state.
                        continue;
                    }
                }
            }
        }
    }

    fn commit_consume(&self, alloc: &A, claim: &Claim) {
        unsafe {
            // CLAIMED -> DEAD. Only this consumer owns the claim, but the
            // word is shared with head advancement, so transition by RMW.
            let _ = (*(claim.block as *const ControlBlock)).next.fetch_update(
                Ordering::Release,
                Ordering::Relaxed,
                |w| Some((w & !BUSY) | DEAD),
            );
            if claim.pinned != 0 {
                Self::unpin(alloc, claim.pinned);
            }
        }
    }

    fn cancel_consume(&self, alloc: &A, claim: &Claim) {
        unsafe {
            // CLAIMED -> READY: consumable again.
            let _ = (*(claim.block as *const ControlBlock)).next.fetch_update(
                Ordering::Release,
                Ordering::Relaxed,
                |w| Some(w & !BUSY),
            );
            if claim.pinned != 0 {
                Self::unpin(alloc, claim.pinned);
            }
        }
    }

    fn position(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }
}
