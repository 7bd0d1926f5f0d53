//! Loom-based models of the control-word protocol.
//!
//! Run with: `cargo test --features loom --test loom_tests --release`
//!
//! The full queue allocates real pages, which loom cannot model, so these
//! tests check the two load-bearing pieces of the protocol in isolation:
//! the claim CAS (no element is consumed twice) and the commit/claim
//! release-acquire pairing (a consumer that claims a slot sees the
//! producer's payload writes).

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;
use std::cell::UnsafeCell;

const BUSY: usize = 1;
const DEAD: usize = 2;

/// One control word plus a payload cell, as laid out in a queue page.
struct ModelSlot {
    next: AtomicUsize,
    payload: UnsafeCell<u64>,
}

unsafe impl Send for ModelSlot {}
unsafe impl Sync for ModelSlot {}

impl ModelSlot {
    fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            payload: UnsafeCell::new(0),
        }
    }

    /// Producer: write the payload, then link READY with release.
    fn produce(&self, value: u64, end: usize) {
        unsafe {
            *self.payload.get() = value;
        }
        self.next.store(end, Ordering::Release);
    }

    /// Consumer: acquire the word; claim READY -> CLAIMED by CAS.
    fn try_claim(&self) -> Option<u64> {
        let word = self.next.load(Ordering::Acquire);
        if word == 0 || word & (BUSY | DEAD) != 0 {
            return None;
        }
        match self
            .next
            .compare_exchange(word, word | BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(unsafe { *self.payload.get() }),
            Err(_) => None,
        }
    }

    /// Consumer: CLAIMED -> DEAD.
    fn commit(&self) {
        let word = self.next.load(Ordering::Relaxed);
        self.next.store((word & !BUSY) | DEAD, Ordering::Release);
    }
}

/// A committed payload is fully visible to the claiming consumer.
#[test]
fn loom_commit_happens_before_claim() {
    loom::model(|| {
        let slot = Arc::new(ModelSlot::new());

        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                slot.produce(0xFEED, 16);
            })
        };

        let consumer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                if let Some(v) = slot.try_claim() {
                    // The acquire on the claim must pair with the producer's
                    // release: a torn or stale payload is a protocol bug.
                    assert_eq!(v, 0xFEED);
                    slot.commit();
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    });
}

/// Two consumers racing on one READY slot: exactly one claim succeeds.
#[test]
fn loom_no_element_consumed_twice() {
    loom::model(|| {
        let slot = Arc::new(ModelSlot::new());
        slot.produce(7, 16);

        let a = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.try_claim().is_some())
        };
        let b = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.try_claim().is_some())
        };

        let a = a.join().unwrap();
        let b = b.join().unwrap();
        assert!(
            a ^ b,
            "exactly one consumer must win the claim (a: {a}, b: {b})"
        );
    });
}

/// Claim then cancel restores the word; a second claim then succeeds.
#[test]
fn loom_cancel_restores_claimability() {
    loom::model(|| {
        let slot = Arc::new(ModelSlot::new());
        slot.produce(9, 16);

        let canceller = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                if slot.try_claim().is_some() {
                    // cancel: CLAIMED -> READY
                    let word = slot.next.load(Ordering::Relaxed);
                    slot.next.store(word & !BUSY, Ordering::Release);
                }
            })
        };
        canceller.join().unwrap();

        // After the cancel the element is consumable again.
        assert_eq!(slot.try_claim(), Some(9));
    });
}
