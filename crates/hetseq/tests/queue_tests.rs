//! Integration tests for the lock-free heterogeneous queue: FIFO ordering,
//! cancellation round-trips, relaxed-consistency observability, progress
//! guarantees, and the multi-threaded configurations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use hetseq::{
    MpMcQueue, MpScQueue, ProgressGuarantee, RelaxedMpScQueue, RuntimeType, SpScQueue,
};

#[test]
fn test_fifo_single_producer_single_consumer_threaded() {
    let queue = SpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    const N: u64 = 10_000;

    let writer = thread::spawn(move || {
        for i in 0..N {
            producer.push(i);
        }
    });

    let reader = thread::spawn(move || {
        let mut expected = 0u64;
        while expected < N {
            if let Some(op) = consumer.try_start_consume() {
                assert_eq!(*op.element::<u64>(), expected, "FIFO order violated");
                op.commit();
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        assert!(consumer.try_start_consume().is_none());
    });

    writer.join().unwrap();
    reader.join().unwrap();
    assert!(queue.is_empty());
}

#[test]
fn test_multi_producer_sequential_respects_per_producer_order() {
    let queue = MpScQueue::<()>::new();
    let consumer = queue.consumer().unwrap();

    // Two producers push ("a", 0..N) and ("b", 0..N); a single consumer must
    // observe each producer's values in order, in some interleaving.
    const N: u32 = 2_000;
    let mut writers = Vec::new();
    for label in [b'a', b'b'] {
        let producer = queue.producer().unwrap();
        writers.push(thread::spawn(move || {
            for i in 0..N {
                producer.push((label, i));
            }
        }));
    }

    let mut last_a = None;
    let mut last_b = None;
    let mut seen = 0;
    while seen < 2 * N {
        if let Some(op) = consumer.try_start_consume() {
            let &(label, i) = op.element::<(u8, u32)>();
            let last = if label == b'a' { &mut last_a } else { &mut last_b };
            if let Some(prev) = *last {
                assert!(i > prev, "per-producer order violated: {} after {}", i, prev);
            }
            *last = Some(i);
            op.commit();
            seen += 1;
        } else {
            std::hint::spin_loop();
        }
    }

    for w in writers {
        w.join().unwrap();
    }
    assert_eq!(last_a, Some(N - 1));
    assert_eq!(last_b, Some(N - 1));
}

#[test]
fn test_mpmc_no_element_consumed_twice() {
    let queue = MpMcQueue::<()>::new();

    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 2_500;
    const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

    let mut writers = Vec::new();
    for p in 0..PRODUCERS {
        let producer = queue.producer().unwrap();
        writers.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                producer.push(p * PER_PRODUCER + i);
            }
        }));
    }

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..3 {
        let consumer = queue.consumer().unwrap();
        let done = Arc::clone(&done);
        readers.push(thread::spawn(move || {
            let mut got = Vec::new();
            loop {
                if let Some(op) = consumer.try_start_consume() {
                    got.push(*op.element::<u64>());
                    op.commit();
                } else if done.load(Ordering::Acquire) {
                    // One final sweep after producers finished.
                    if let Some(op) = consumer.try_start_consume() {
                        got.push(*op.element::<u64>());
                        op.commit();
                    } else {
                        return got;
                    }
                } else {
                    std::hint::spin_loop();
                }
            }
        }));
    }

    for w in writers {
        w.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let mut all = Vec::new();
    for r in readers {
        all.extend(r.join().unwrap());
    }
    assert_eq!(all.len() as u64, TOTAL, "lost or duplicated elements");
    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(unique.len() as u64, TOTAL, "an element was consumed twice");
}

#[test]
fn test_relaxed_observability_until_commit() {
    let queue = RelaxedMpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    // An uncommitted transactional put is unobservable.
    let txn = producer.start_push(42u32);
    assert!(consumer.try_start_consume().is_none());
    assert!(queue.is_empty());

    // After commit the element appears.
    txn.commit();
    let op = consumer.try_start_consume().expect("committed element");
    assert_eq!(*op.element::<u32>(), 42);
    op.commit();
    assert!(queue.is_empty());
}

#[test]
fn test_relaxed_truncation_hides_later_elements() {
    let queue = RelaxedMpScQueue::<()>::new();
    let p1 = queue.producer().unwrap();
    let p2 = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    // p1 reserves but does not commit; p2's later put is committed but sits
    // after the unlinked slot, so the queue is truncated before it.
    let txn = p1.start_push(1u32);
    p2.push(2u32);
    assert!(consumer.try_start_consume().is_none());

    // Linking the first slot reveals both, in reservation order.
    txn.commit();
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u32>(), 1);
    op.commit();
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u32>(), 2);
    op.commit();
}

#[test]
fn test_put_cancel_round_trip() {
    let queue = MpMcQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    let txn = producer.start_push(10u32);
    txn.cancel();
    assert!(queue.is_empty());
    assert!(consumer.try_start_consume().is_none());

    // Dropping a transaction without committing is also a cancel.
    {
        let _txn = producer.start_push(11u32);
    }
    assert!(queue.is_empty());
}

#[test]
fn test_consume_cancel_restores_element() {
    let queue = MpMcQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    producer.push(String::from("keep me"));

    let op = consumer.try_start_consume().unwrap();
    assert_eq!(op.element::<String>(), "keep me");
    op.cancel();

    // Still consumable after the cancel.
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(op.element::<String>(), "keep me");
    op.commit();
    assert!(queue.is_empty());
}

#[test]
fn test_consume_mutation_then_cancel_republishes() {
    let queue = MpMcQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    producer.push(1u64);
    let mut op = consumer.try_start_consume().unwrap();
    *op.element_mut::<u64>() = 2;
    op.cancel();

    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u64>(), 2);
    op.commit();
}

#[test]
fn test_transactional_field_population() {
    let queue = MpMcQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    let mut txn = producer.start_push([0u8; 16]);
    txn.element_mut()[3] = 0xEE;
    txn.commit();

    let op = consumer.try_start_consume().unwrap();
    assert_eq!(op.element::<[u8; 16]>()[3], 0xEE);
    op.commit();
}

#[test]
fn test_raw_allocation_bound_to_element() {
    let queue = MpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    // The element carries the address of a variable-length payload placed
    // in raw storage from the same transaction.
    let mut txn = producer.start_push((0usize, 0usize));
    let bytes = txn.raw_allocate_copy(b"variable length payload");
    let (addr, len) = (bytes.as_ptr() as usize, bytes.len());
    *txn.element_mut() = (addr, len);
    txn.commit();

    let op = consumer.try_start_consume().unwrap();
    let &(addr, len) = op.element::<(usize, usize)>();
    let copied = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
    assert_eq!(copied, b"variable length payload");
    op.commit();
}

#[test]
fn test_reentrant_put_keeps_queue_usable() {
    let queue = MpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    let txn = producer.start_reentrant_push(1u32);
    // The queue stays usable from this thread while the transaction is live.
    producer.push(2u32);
    txn.commit();

    // Slots are consumed in reservation order.
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u32>(), 1);
    op.commit();
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u32>(), 2);
    op.commit();
}

#[test]
fn test_dyn_push_family() {
    let queue = MpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    let ty = RuntimeType::<()>::of_constructible::<u64>();
    unsafe {
        producer.dyn_push(ty).unwrap();
        let src = 77u64;
        producer
            .dyn_push_copy(ty, std::ptr::NonNull::from(&src).cast())
            .unwrap();
        let mut moved = 88u64;
        producer.dyn_push_move(ty, std::ptr::NonNull::from(&mut moved).cast());
        std::mem::forget(moved);
    }

    for expected in [0u64, 77, 88] {
        let op = consumer.try_start_consume().unwrap();
        assert!(op.complete_type().is::<u64>());
        assert_eq!(*op.element::<u64>(), expected);
        op.commit();
    }
    assert!(queue.is_empty());
}

#[test]
fn test_dyn_push_ctor_failure_leaves_queue_unchanged() {
    use hetseq::{CtorError, TryClone, TryDefault};

    struct Refusing {
        _pad: u8,
    }
    impl TryClone for Refusing {
        fn try_clone(&self) -> Result<Self, CtorError> {
            Err(CtorError::new("no copies"))
        }
    }
    impl TryDefault for Refusing {
        fn try_default() -> Result<Self, CtorError> {
            Err(CtorError::new("no defaults"))
        }
    }

    let queue = MpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    let ty = RuntimeType::<()>::of_constructible::<Refusing>();
    let err = unsafe { producer.dyn_push(ty) };
    assert!(err.is_err());
    assert!(queue.is_empty());

    // The dead slot is passed over by later consumes.
    producer.push(5u8);
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u8>(), 5);
    op.commit();
}

#[test]
fn test_try_operations_fail_without_observable_effect() {
    let queue: MpMcQueue<(), _> =
        MpMcQueue::with_allocator(hetseq::PageAllocator::with_cache_capacity(2));
    let producer = queue.producer().unwrap();

    // No cached page: non-blocking guarantees cannot acquire one.
    assert_eq!(
        producer.try_push(ProgressGuarantee::LockFree, 1u32),
        Err(1u32)
    );
    assert_eq!(
        producer.try_push(ProgressGuarantee::WaitFree, 2u32),
        Err(2u32)
    );
    assert!(queue.is_empty());

    // After a blocking put established a page, lock-free puts proceed.
    producer.push(3u32);
    producer
        .try_push(ProgressGuarantee::LockFree, 4u32)
        .unwrap();

    let consumer = queue.consumer().unwrap();
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u32>(), 3);
    op.commit();
    let op = consumer.try_start_consume().unwrap();
    assert_eq!(*op.element::<u32>(), 4);
    op.commit();
}

#[test]
fn test_commit_nodestroy_skips_destructor() {
    let queue = MpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    producer.push(String::from("taken by hand"));

    let op = consumer.try_start_consume().unwrap();
    // Fused destroy-during-use: move the value out, then promise the queue
    // the destructor already ran.
    let taken = unsafe { op.element_ptr().cast::<String>().as_ptr().read() };
    assert_eq!(taken, "taken by hand");
    op.commit_nodestroy();
    assert!(queue.is_empty());
}

#[test]
fn test_clear_consumes_everything() {
    let queue = MpScQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    for i in 0..100u32 {
        producer.push(i);
    }
    assert!(!queue.is_empty());
    consumer.clear();
    assert!(queue.is_empty());
    assert!(!consumer.try_pop());
}

#[test]
fn test_page_turnover_reclaims_through_cache() {
    // Drive enough traffic through a private allocator to roll pages over
    // many times; reuse must kick in instead of unbounded growth.
    let alloc = hetseq::PageAllocator::with_cache_capacity(8);
    let queue: SpScQueue<(), _> = SpScQueue::with_allocator(alloc);
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    for round in 0..50 {
        for i in 0..500u64 {
            producer.push((round, i, [0u8; 64]));
        }
        let mut n = 0;
        while consumer.try_pop() {
            n += 1;
        }
        assert_eq!(n, 500);
    }

    let m = queue.allocator().metrics();
    assert!(m.pages_reused > 0, "no page was ever recycled: {m:?}");
}

#[test]
fn test_external_elements_cross_threads() {
    // 80 KiB of inline payload exceeds the 64 KiB page, so every element
    // goes through an external block.
    const BIG: usize = 80 * 1024;

    let queue = MpMcQueue::<()>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    let writer = thread::spawn(move || {
        for i in 0..20u8 {
            let payload = Box::new([i; BIG]);
            producer.push(*payload);
        }
    });

    let reader = thread::spawn(move || {
        let mut seen = 0u8;
        while seen < 20 {
            if let Some(op) = consumer.try_start_consume() {
                let v = op.element::<[u8; BIG]>();
                assert_eq!(v[0], seen);
                assert!(v.iter().all(|&b| b == seen));
                op.commit();
                seen += 1;
            } else {
                std::hint::spin_loop();
            }
        }
    });

    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_common_base_trait_queue() {
    use hetseq::BaseOf;

    trait Job {
        fn run(&self) -> u32;
    }
    impl<C: Job + 'static> BaseOf<C> for dyn Job {
        fn upcast_ptr(ptr: *mut C) -> *mut Self {
            ptr
        }
    }

    struct Add(u32, u32);
    impl Job for Add {
        fn run(&self) -> u32 {
            self.0 + self.1
        }
    }
    struct Mul(u32, u32);
    impl Job for Mul {
        fn run(&self) -> u32 {
            self.0 * self.1
        }
    }

    let queue = MpScQueue::<dyn Job>::new();
    let producer = queue.producer().unwrap();
    let consumer = queue.consumer().unwrap();

    producer.push(Add(2, 3));
    producer.push(Mul(4, 5));

    let mut results = Vec::new();
    while let Some(op) = consumer.try_start_consume() {
        results.push(op.element_base().run());
        op.commit();
    }
    assert_eq!(results, [5, 20]);
}
