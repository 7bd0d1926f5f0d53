//! The lock-free heterogeneous FIFO queue.
//!
//! A page-based FIFO whose producers and consumers synchronize exclusively
//! through atomic control words on per-element headers. The configuration is
//! chosen at the type level: producer cardinality and consistency model pick
//! a tail module, consumer cardinality picks a head module, and the
//! [`Queue`] façade composes them. See the type aliases ([`MpMcQueue`],
//! [`SpScQueue`], [`RelaxedMpMcQueue`], ...) for the supported
//! configurations.
//!
//! Producers and consumers operate through registered handles, in both
//! cardinalities: a multi side hands out any number of cloneable handles,
//! a single side hands out exactly one. The unique handle is what makes the
//! single-cardinality fast paths sound — the "one producer" contract is a
//! property of the type system, not a programmer promise.
//!
//! ```
//! use hetseq::MpMcQueue;
//!
//! let queue = MpMcQueue::<()>::new();
//! let producer = queue.producer().unwrap();
//! let consumer = queue.consumer().unwrap();
//!
//! producer.push(42u64);
//! let consume = consumer.try_start_consume().unwrap();
//! assert_eq!(*consume.element::<u64>(), 42);
//! consume.commit();
//! assert!(queue.is_empty());
//! ```

pub(crate) mod layout;

mod head_mc;
mod head_sc;
mod tail_mp_relaxed;
mod tail_mp_seq;
mod tail_sp;
mod transaction;

pub use head_mc::McHead;
pub use head_sc::ScHead;
pub use tail_mp_relaxed::MpRelaxedTail;
pub use tail_mp_seq::MpSeqTail;
pub use tail_sp::SpTail;
pub use transaction::{ConsumeOperation, DynPutTransaction, PutTransaction};

use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::address::align_up;
use crate::error::{CtorError, RegisterError, TryPushError};
use crate::page_alloc::{PageAllocator, PagedAllocator, ProgressGuarantee};
use crate::runtime_type::{BaseOf, RuntimeType};
use layout::{
    element_extents, external_extents, first_block, header_of, max_inline_alloc, payload_of,
    read_rtd, release_external, write_rtd, ControlBlock, ExternalBlock, Slot, ADDR_MASK, BUSY,
    DEAD, END_OF_PAGE, EXTERNAL, GRANULARITY, UNALIGNED_PAYLOAD_OFFSET,
};

mod sealed {
    pub trait Sealed {}
}

/// Shape of a tail allocation.
#[doc(hidden)]
#[derive(Clone, Copy)]
pub enum SlotKind {
    /// Inline element (or raw bytes): descriptor slot plus aligned payload.
    Element { size: usize, align: usize },
    /// Record slot for an externally allocated payload.
    ExternalRecord,
}

/// Producer-side algorithm of a queue configuration.
///
/// Implemented by [`SpTail`], [`MpSeqTail`] and [`MpRelaxedTail`]; not for
/// implementation outside this crate.
#[doc(hidden)]
pub trait Tail<A: PagedAllocator>: sealed::Sealed + Default + Send + Sync + 'static {
    /// Consumers may pass over linked BUSY slots (relaxed model).
    const RELAXED: bool;
    /// Exactly one producer handle may exist.
    const SINGLE: bool;

    fn allocate(
        &self,
        alloc: &A,
        entry: &AtomicUsize,
        guarantee: ProgressGuarantee,
        flags: usize,
        kind: SlotKind,
    ) -> Option<Slot>;

    fn commit_put(&self, slot: &Slot);

    fn cancel_put(&self, slot: &Slot);
}

/// Consumer-side algorithm of a queue configuration.
///
/// Implemented by [`ScHead`] and [`McHead`]; not for implementation outside
/// this crate.
#[doc(hidden)]
pub trait Head<A: PagedAllocator>: sealed::Sealed + Default + Send + Sync + 'static {
    /// Exactly one consumer handle may exist.
    const SINGLE: bool;

    fn try_start_consume(&self, alloc: &A, entry: &AtomicUsize, skip_busy: bool) -> Option<Claim>;

    fn commit_consume(&self, alloc: &A, claim: &Claim);

    fn cancel_consume(&self, alloc: &A, claim: &Claim);

    fn position(&self) -> usize;
}

/// A claimed element: the control block, its pre-claim word and the page pin
/// held until commit or cancel.
#[doc(hidden)]
pub struct Claim {
    pub(crate) block: usize,
    pub(crate) word: usize,
    pub(crate) pinned: usize,
}

impl sealed::Sealed for SpTail {}
impl sealed::Sealed for MpSeqTail {}
impl sealed::Sealed for MpRelaxedTail {}
impl sealed::Sealed for ScHead {}
impl sealed::Sealed for McHead {}

/// Marker for configurations whose producer handles are cloneable.
pub trait MultiProducer: sealed::Sealed {}
impl MultiProducer for MpSeqTail {}
impl MultiProducer for MpRelaxedTail {}

/// Marker for configurations whose consumer handles are cloneable.
pub trait MultiConsumer: sealed::Sealed {}
impl MultiConsumer for McHead {}

// ---------------------------------------------------------------------
// SHARED STATE
// ---------------------------------------------------------------------

pub(crate) struct Shared<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    pub(crate) tail: T,
    pub(crate) head: H,
    /// Address of the first control block of the first page; written once.
    pub(crate) entry: AtomicUsize,
    pub(crate) alloc: A,
    producer_taken: AtomicBool,
    consumer_taken: AtomicBool,
    _base: PhantomData<RuntimeType<B>>,
}

impl<B, T, H, A> Shared<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    fn new(alloc: A) -> Self {
        Self {
            tail: T::default(),
            head: H::default(),
            entry: AtomicUsize::new(0),
            alloc,
            producer_taken: AtomicBool::new(false),
            consumer_taken: AtomicBool::new(false),
            _base: PhantomData,
        }
    }

    /// Read-only emptiness scan: true when no linked, non-DEAD block is
    /// reachable from the head. Exact when the queue is quiescent;
    /// approximate under concurrency.
    fn scan_is_empty(&self) -> bool {
        let mut pos = self.head.position();
        if pos == 0 {
            pos = self.entry.load(Ordering::Acquire);
            if pos == 0 {
                return true;
            }
        }
        loop {
            let word = unsafe { (*(pos as *const ControlBlock)).next.load(Ordering::Acquire) };
            if word == 0 {
                return true;
            }
            if word & END_OF_PAGE != 0 {
                let next_page = unsafe { (*header_of::<A>(pos)).next_page.load(Ordering::Acquire) };
                if next_page == 0 {
                    return true;
                }
                pos = first_block::<A>(next_page);
                continue;
            }
            if word & DEAD != 0 {
                pos = word & ADDR_MASK;
                continue;
            }
            // READY, or BUSY (an element is at least reserved).
            return false;
        }
    }
}

impl<B, T, H, A> Drop for Shared<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    fn drop(&mut self) {
        // No handles, transactions or claims outlive the shared state, so
        // every reachable block is READY, DEAD, a sentinel, or the frontier.
        // Destroy remaining elements, release external blocks, free pages.
        // Pages before the head were already reclaimed by consumers; start
        // from the head, or from the entry when no consumer ever ran.
        let mut pos = self.head.position();
        if pos == 0 {
            pos = self.entry.load(Ordering::Acquire);
        }
        if pos == 0 {
            return;
        }
        unsafe {
            loop {
                let word = (*(pos as *const ControlBlock)).next.load(Ordering::Acquire);
                if word == 0 {
                    self.alloc.deallocate_page(NonNull::new_unchecked(
                        layout::page_of::<A>(pos) as *mut u8,
                    ));
                    return;
                }
                if word & END_OF_PAGE != 0 {
                    let next_page = (*header_of::<A>(pos)).next_page.load(Ordering::Acquire);
                    self.alloc.deallocate_page(NonNull::new_unchecked(
                        layout::page_of::<A>(pos) as *mut u8,
                    ));
                    pos = first_block::<A>(next_page);
                    continue;
                }
                let addr = word & ADDR_MASK;
                if word & (DEAD | BUSY) == 0 {
                    // READY: the element was never consumed.
                    let ty = read_rtd::<B>(pos);
                    ty.destroy(payload_of::<B>(pos, word));
                }
                debug_assert!(word & BUSY == 0, "open transaction outlived the queue");
                if word & EXTERNAL != 0 {
                    release_external(&self.alloc, pos);
                }
                pos = addr;
            }
        }
    }
}

// ---------------------------------------------------------------------
// FAÇADE
// ---------------------------------------------------------------------

/// Lock-free heterogeneous FIFO queue of values under common base `B`.
///
/// `T` selects the producer algorithm, `H` the consumer algorithm, `A` the
/// paged allocator. Prefer the aliases: [`MpMcQueue`], [`MpScQueue`],
/// [`SpMcQueue`], [`SpScQueue`], [`RelaxedMpMcQueue`], [`RelaxedMpScQueue`].
///
/// The queue itself is cheap to clone (shared state behind an `Arc`); puts
/// and consumes go through [`Producer`] and [`Consumer`] handles.
pub struct Queue<B: ?Sized + 'static = (), T = MpSeqTail, H = McHead, A = PageAllocator>
where
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    shared: Arc<Shared<B, T, H, A>>,
}

/// Multi-producer multi-consumer, sequentially consistent. The default.
pub type MpMcQueue<B = (), A = PageAllocator> = Queue<B, MpSeqTail, McHead, A>;
/// Multi-producer single-consumer, sequentially consistent.
pub type MpScQueue<B = (), A = PageAllocator> = Queue<B, MpSeqTail, ScHead, A>;
/// Single-producer multi-consumer.
pub type SpMcQueue<B = (), A = PageAllocator> = Queue<B, SpTail, McHead, A>;
/// Single-producer single-consumer.
pub type SpScQueue<B = (), A = PageAllocator> = Queue<B, SpTail, ScHead, A>;
/// Multi-producer multi-consumer, relaxed consistency.
pub type RelaxedMpMcQueue<B = (), A = PageAllocator> = Queue<B, MpRelaxedTail, McHead, A>;
/// Multi-producer single-consumer, relaxed consistency.
pub type RelaxedMpScQueue<B = (), A = PageAllocator> = Queue<B, MpRelaxedTail, ScHead, A>;

impl<B, T, H, A> Queue<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator + Default,
{
    /// Creates an empty queue. Does not allocate; the first page is acquired
    /// on first use.
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }
}

impl<B, T, H, A> Queue<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    /// Creates an empty queue over the given allocator.
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            shared: Arc::new(Shared::new(alloc)),
        }
    }

    /// Registers a producer handle.
    ///
    /// Multi-producer configurations hand out any number; single-producer
    /// configurations hand out exactly one and fail afterwards.
    pub fn producer(&self) -> Result<Producer<B, T, H, A>, RegisterError> {
        if T::SINGLE && self.shared.producer_taken.swap(true, Ordering::AcqRel) {
            return Err(RegisterError::AlreadyTaken);
        }
        Ok(Producer {
            shared: Arc::clone(&self.shared),
            _not_sync: PhantomData,
        })
    }

    /// Registers a consumer handle; same cardinality rules as
    /// [`producer`](Self::producer).
    pub fn consumer(&self) -> Result<Consumer<B, T, H, A>, RegisterError> {
        if H::SINGLE && self.shared.consumer_taken.swap(true, Ordering::AcqRel) {
            return Err(RegisterError::AlreadyTaken);
        }
        Ok(Consumer {
            shared: Arc::clone(&self.shared),
            _not_sync: PhantomData,
        })
    }

    /// True when no element is reserved or consumable. Exact when the queue
    /// is quiescent; a racing snapshot otherwise.
    pub fn is_empty(&self) -> bool {
        self.shared.scan_is_empty()
    }

    /// The queue's allocator.
    pub fn allocator(&self) -> &A {
        &self.shared.alloc
    }
}

impl<B, T, H, A> Default for Queue<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<B, T, H, A> Clone for Queue<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// ---------------------------------------------------------------------
// PRODUCER
// ---------------------------------------------------------------------

/// Producer handle. `Send` but deliberately not `Sync`: one handle is used
/// by one thread at a time, which is what makes the single-producer cursor
/// sound. Multi-producer configurations clone handles instead of sharing
/// one.
pub struct Producer<B: ?Sized + 'static, T, H, A>
where
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    pub(crate) shared: Arc<Shared<B, T, H, A>>,
    pub(crate) _not_sync: PhantomData<Cell<()>>,
}

impl<B, T, H, A> Clone for Producer<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A> + MultiProducer,
    H: Head<A>,
    A: PagedAllocator,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _not_sync: PhantomData,
        }
    }
}

#[cold]
fn page_oom() -> ! {
    panic!("queue page allocation failed")
}

impl<B, T, H, A> Producer<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    /// Conservative inline-fit test: worst-case slot extent regardless of
    /// where in the page the block lands.
    fn fits_inline(size: usize, align: usize) -> bool {
        let worst = align_up(
            UNALIGNED_PAYLOAD_OFFSET + align.saturating_sub(1) + size,
            GRANULARITY,
        );
        worst <= max_inline_alloc::<A>()
    }

    /// Allocates a slot for one element, inline or external, in the given
    /// initial state. Returns the slot and the payload address. On `None`
    /// the queue is observationally unchanged.
    pub(crate) fn allocate_element(
        &self,
        guarantee: ProgressGuarantee,
        flags: usize,
        size: usize,
        align: usize,
    ) -> Option<(Slot, NonNull<u8>)> {
        let shared = &*self.shared;
        if Self::fits_inline(size, align) {
            let slot = shared.tail.allocate(
                &shared.alloc,
                &shared.entry,
                guarantee,
                flags,
                SlotKind::Element { size, align },
            )?;
            let (payload, _) = element_extents(slot.block, size, align);
            Some((slot, unsafe {
                NonNull::new_unchecked(payload as *mut u8)
            }))
        } else {
            // Oversize: external block first (so failure has no observable
            // effect), then the inline record slot.
            let ext_layout = Layout::from_size_align(size, align).ok()?;
            let ptr = shared.alloc.allocate(ext_layout, guarantee)?;
            let flags = flags | EXTERNAL;
            let Some(slot) = shared.tail.allocate(
                &shared.alloc,
                &shared.entry,
                guarantee,
                flags,
                SlotKind::ExternalRecord,
            ) else {
                unsafe { shared.alloc.deallocate(ptr, ext_layout) };
                return None;
            };
            let (record, _) = external_extents(slot.block);
            unsafe {
                (record as *mut ExternalBlock).write(ExternalBlock {
                    ptr: ptr.as_ptr(),
                    size,
                    align,
                });
            }
            Some((slot, ptr))
        }
    }

    fn do_push<C: Send + 'static>(&self, guarantee: ProgressGuarantee, value: C) -> Result<(), C>
    where
        B: BaseOf<C>,
    {
        let ty = RuntimeType::<B>::of::<C>();
        let Some((slot, payload)) = self.allocate_element(guarantee, BUSY, ty.size(), ty.alignment())
        else {
            return Err(value);
        };
        unsafe {
            write_rtd(slot.block, ty);
            payload.cast::<C>().as_ptr().write(value);
        }
        self.shared.tail.commit_put(&slot);
        Ok(())
    }

    /// Appends `value` at the end of the queue. Blocking; panics on
    /// out-of-memory.
    ///
    /// A Rust move is a byte copy, so constructing in place buys nothing:
    /// this single method covers both the copy/move put and the emplace put
    /// of in-place-construction APIs.
    pub fn push<C: Send + 'static>(&self, value: C)
    where
        B: BaseOf<C>,
    {
        if self.do_push(ProgressGuarantee::Blocking, value).is_err() {
            page_oom();
        }
    }

    /// Appends `value` if the progress guarantee can be honored; otherwise
    /// returns the value back with no observable effect.
    pub fn try_push<C: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: C,
    ) -> Result<(), C>
    where
        B: BaseOf<C>,
    {
        self.do_push(guarantee, value)
    }

    fn do_start_push<C: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: C,
    ) -> Result<PutTransaction<'_, C, B, T, H, A>, C>
    where
        B: BaseOf<C>,
    {
        let ty = RuntimeType::<B>::of::<C>();
        let Some((slot, payload)) = self.allocate_element(guarantee, BUSY, ty.size(), ty.alignment())
        else {
            return Err(value);
        };
        unsafe {
            write_rtd(slot.block, ty);
            payload.cast::<C>().as_ptr().write(value);
        }
        Ok(PutTransaction::new(self, slot, payload))
    }

    /// Begins a transactional put: the element is constructed now but
    /// becomes observable only at [`PutTransaction::commit`]. Dropping the
    /// transaction cancels it.
    ///
    /// Between start and commit the queue must not be used from this thread;
    /// use [`start_reentrant_push`](Self::start_reentrant_push) when it must.
    pub fn start_push<C: Send + 'static>(&self, value: C) -> PutTransaction<'_, C, B, T, H, A>
    where
        B: BaseOf<C>,
    {
        match self.do_start_push(ProgressGuarantee::Blocking, value) {
            Ok(txn) => txn,
            Err(_) => page_oom(),
        }
    }

    /// Try-variant of [`start_push`](Self::start_push); returns the value
    /// back when the guarantee cannot be honored.
    pub fn try_start_push<C: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: C,
    ) -> Result<PutTransaction<'_, C, B, T, H, A>, C>
    where
        B: BaseOf<C>,
    {
        self.do_start_push(guarantee, value)
    }

    /// Reentrant [`start_push`](Self::start_push): the queue remains usable
    /// from this thread while the transaction is live. Same implementation,
    /// different contract.
    pub fn start_reentrant_push<C: Send + 'static>(
        &self,
        value: C,
    ) -> PutTransaction<'_, C, B, T, H, A>
    where
        B: BaseOf<C>,
    {
        self.start_push(value)
    }

    /// Reentrant try-variant of [`start_push`](Self::start_push).
    pub fn try_start_reentrant_push<C: Send + 'static>(
        &self,
        guarantee: ProgressGuarantee,
        value: C,
    ) -> Result<PutTransaction<'_, C, B, T, H, A>, C>
    where
        B: BaseOf<C>,
    {
        self.do_start_push(guarantee, value)
    }

    // -----------------------------------------------------------------
    // DYNAMIC PUTS: construction driven by a runtime descriptor
    // -----------------------------------------------------------------

    fn do_dyn_start(
        &self,
        guarantee: ProgressGuarantee,
        ty: RuntimeType<B>,
        construct: impl FnOnce(NonNull<u8>) -> Result<(), CtorError>,
    ) -> Result<DynPutTransaction<'_, B, T, H, A>, TryPushError> {
        let Some((slot, payload)) =
            self.allocate_element(guarantee, BUSY, ty.size(), ty.alignment())
        else {
            return Err(TryPushError::Contention);
        };
        unsafe {
            write_rtd(slot.block, ty);
        }
        if let Err(e) = construct(payload) {
            // Nothing was constructed: discard the slot without destroying.
            self.shared.tail.cancel_put(&slot);
            return Err(TryPushError::Ctor(e));
        }
        Ok(DynPutTransaction::new(self, slot, payload))
    }

    /// Appends a default-constructed element of the descriptor's complete
    /// type. Requires the `default_construct` feature.
    ///
    /// # Safety
    ///
    /// The descriptor's complete type must be safe to send to whichever
    /// thread consumes the queue (`Send`), which the type system cannot
    /// check through a runtime descriptor.
    pub unsafe fn dyn_push(&self, ty: RuntimeType<B>) -> Result<(), CtorError> {
        match self.do_dyn_start(ProgressGuarantee::Blocking, ty, |dst| unsafe {
            ty.default_construct(dst)
        }) {
            Ok(txn) => {
                txn.commit();
                Ok(())
            }
            Err(TryPushError::Ctor(e)) => Err(e),
            Err(TryPushError::Contention) => page_oom(),
        }
    }

    /// Appends a copy of `*src`. Requires the `copy_construct` feature.
    ///
    /// # Safety
    ///
    /// `src` points to an initialized value of the descriptor's complete
    /// type; that type must be `Send` (see [`dyn_push`](Self::dyn_push)).
    pub unsafe fn dyn_push_copy(
        &self,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<(), CtorError> {
        match self.do_dyn_start(ProgressGuarantee::Blocking, ty, |dst| unsafe {
            ty.copy_construct(dst, src)
        }) {
            Ok(txn) => {
                txn.commit();
                Ok(())
            }
            Err(TryPushError::Ctor(e)) => Err(e),
            Err(TryPushError::Contention) => page_oom(),
        }
    }

    /// Moves the value at `src` into the queue. Nothrow: a move is a byte
    /// copy.
    ///
    /// # Safety
    ///
    /// `src` points to an initialized value of the descriptor's complete
    /// type, which must not be used (or dropped) afterwards; the type must
    /// be `Send`.
    pub unsafe fn dyn_push_move(&self, ty: RuntimeType<B>, src: NonNull<u8>) {
        let r = self.do_dyn_start(ProgressGuarantee::Blocking, ty, |dst| {
            unsafe { ty.move_construct(dst, src) };
            Ok(())
        });
        match r {
            Ok(txn) => txn.commit(),
            Err(_) => page_oom(),
        }
    }

    /// Transactional [`dyn_push`](Self::dyn_push).
    ///
    /// # Safety
    ///
    /// As [`dyn_push`](Self::dyn_push).
    pub unsafe fn start_dyn_push(
        &self,
        ty: RuntimeType<B>,
    ) -> Result<DynPutTransaction<'_, B, T, H, A>, CtorError> {
        match self.do_dyn_start(ProgressGuarantee::Blocking, ty, |dst| unsafe {
            ty.default_construct(dst)
        }) {
            Ok(txn) => Ok(txn),
            Err(TryPushError::Ctor(e)) => Err(e),
            Err(TryPushError::Contention) => page_oom(),
        }
    }

    /// Transactional [`dyn_push_copy`](Self::dyn_push_copy).
    ///
    /// # Safety
    ///
    /// As [`dyn_push_copy`](Self::dyn_push_copy).
    pub unsafe fn start_dyn_push_copy(
        &self,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<DynPutTransaction<'_, B, T, H, A>, CtorError> {
        match self.do_dyn_start(ProgressGuarantee::Blocking, ty, |dst| unsafe {
            ty.copy_construct(dst, src)
        }) {
            Ok(txn) => Ok(txn),
            Err(TryPushError::Ctor(e)) => Err(e),
            Err(TryPushError::Contention) => page_oom(),
        }
    }

    /// Transactional [`dyn_push_move`](Self::dyn_push_move).
    ///
    /// # Safety
    ///
    /// As [`dyn_push_move`](Self::dyn_push_move).
    pub unsafe fn start_dyn_push_move(
        &self,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> DynPutTransaction<'_, B, T, H, A> {
        let r = self.do_dyn_start(ProgressGuarantee::Blocking, ty, |dst| {
            unsafe { ty.move_construct(dst, src) };
            Ok(())
        });
        match r {
            Ok(txn) => txn,
            Err(_) => page_oom(),
        }
    }

    /// Try-variant of [`dyn_push`](Self::dyn_push).
    ///
    /// # Safety
    ///
    /// As [`dyn_push`](Self::dyn_push).
    pub unsafe fn try_dyn_push(
        &self,
        guarantee: ProgressGuarantee,
        ty: RuntimeType<B>,
    ) -> Result<(), TryPushError> {
        self.do_dyn_start(guarantee, ty, |dst| unsafe { ty.default_construct(dst) })
            .map(DynPutTransaction::commit)
    }

    /// Try-variant of [`dyn_push_copy`](Self::dyn_push_copy).
    ///
    /// # Safety
    ///
    /// As [`dyn_push_copy`](Self::dyn_push_copy).
    pub unsafe fn try_dyn_push_copy(
        &self,
        guarantee: ProgressGuarantee,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<(), TryPushError> {
        self.do_dyn_start(guarantee, ty, |dst| unsafe { ty.copy_construct(dst, src) })
            .map(DynPutTransaction::commit)
    }

    /// Try-variant of [`dyn_push_move`](Self::dyn_push_move). On contention
    /// failure the source value is untouched.
    ///
    /// # Safety
    ///
    /// As [`dyn_push_move`](Self::dyn_push_move), except that on `Err` the
    /// caller still owns the value at `src`.
    pub unsafe fn try_dyn_push_move(
        &self,
        guarantee: ProgressGuarantee,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<(), TryPushError> {
        self.do_dyn_start(guarantee, ty, |dst| {
            unsafe { ty.move_construct(dst, src) };
            Ok(())
        })
        .map(DynPutTransaction::commit)
    }

    /// Try-variant of [`start_dyn_push`](Self::start_dyn_push).
    ///
    /// # Safety
    ///
    /// As [`dyn_push`](Self::dyn_push).
    pub unsafe fn try_start_dyn_push(
        &self,
        guarantee: ProgressGuarantee,
        ty: RuntimeType<B>,
    ) -> Result<DynPutTransaction<'_, B, T, H, A>, TryPushError> {
        self.do_dyn_start(guarantee, ty, |dst| unsafe { ty.default_construct(dst) })
    }

    /// Try-variant of [`start_dyn_push_copy`](Self::start_dyn_push_copy).
    ///
    /// # Safety
    ///
    /// As [`dyn_push_copy`](Self::dyn_push_copy).
    pub unsafe fn try_start_dyn_push_copy(
        &self,
        guarantee: ProgressGuarantee,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<DynPutTransaction<'_, B, T, H, A>, TryPushError> {
        self.do_dyn_start(guarantee, ty, |dst| unsafe { ty.copy_construct(dst, src) })
    }

    /// Reentrant [`start_dyn_push`](Self::start_dyn_push); the queue remains
    /// usable from this thread while the transaction is live.
    ///
    /// # Safety
    ///
    /// As [`dyn_push`](Self::dyn_push).
    pub unsafe fn start_reentrant_dyn_push(
        &self,
        ty: RuntimeType<B>,
    ) -> Result<DynPutTransaction<'_, B, T, H, A>, CtorError> {
        self.start_dyn_push(ty)
    }
}

// ---------------------------------------------------------------------
// CONSUMER
// ---------------------------------------------------------------------

/// Consumer handle. `Send` but not `Sync`, like [`Producer`]; multi-consumer
/// configurations clone handles instead of sharing one.
pub struct Consumer<B: ?Sized + 'static, T, H, A>
where
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    pub(crate) shared: Arc<Shared<B, T, H, A>>,
    pub(crate) _not_sync: PhantomData<Cell<()>>,
}

impl<B, T, H, A> Clone for Consumer<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A> + MultiConsumer,
    A: PagedAllocator,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _not_sync: PhantomData,
        }
    }
}

impl<B, T, H, A> Consumer<B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    /// Claims the first consumable element, if any. The claim holds its page
    /// pin until committed or cancelled; dropping the operation cancels it.
    pub fn try_start_consume(&self) -> Option<ConsumeOperation<'_, B, T, H, A>> {
        let shared = &*self.shared;
        shared
            .head
            .try_start_consume(&shared.alloc, &shared.entry, T::RELAXED)
            .map(|claim| ConsumeOperation::new(self, claim))
    }

    /// Reentrant [`try_start_consume`](Self::try_start_consume): the queue
    /// remains usable from this thread while the operation is live. Same
    /// implementation, different contract.
    pub fn try_start_reentrant_consume(&self) -> Option<ConsumeOperation<'_, B, T, H, A>> {
        self.try_start_consume()
    }

    /// Consumes and destroys the first consumable element. Returns false
    /// when nothing was consumable.
    pub fn try_pop(&self) -> bool {
        match self.try_start_consume() {
            Some(op) => {
                op.commit();
                true
            }
            None => false,
        }
    }

    /// Consumes everything currently consumable.
    pub fn clear(&self) {
        while self.try_pop() {}
    }

    /// See [`Queue::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.shared.scan_is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_consume_roundtrip() {
        let queue = MpMcQueue::<()>::new();
        let producer = queue.producer().unwrap();
        let consumer = queue.consumer().unwrap();

        assert!(queue.is_empty());
        producer.push(7u32);
        assert!(!queue.is_empty());

        let op = consumer.try_start_consume().unwrap();
        assert!(op.complete_type().is::<u32>());
        assert_eq!(*op.element::<u32>(), 7);
        op.commit();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_single_producer_handle_is_unique() {
        let queue = SpScQueue::<()>::new();
        let _p = queue.producer().unwrap();
        assert!(matches!(queue.producer(), Err(RegisterError::AlreadyTaken)));
        let _c = queue.consumer().unwrap();
        assert!(matches!(queue.consumer(), Err(RegisterError::AlreadyTaken)));
    }

    #[test]
    fn test_multi_handles_are_cloneable() {
        let queue = MpMcQueue::<()>::new();
        let p = queue.producer().unwrap();
        let _p2 = p.clone();
        let c = queue.consumer().unwrap();
        let _c2 = c.clone();
    }

    #[test]
    fn test_fifo_order_spsc() {
        let queue = SpScQueue::<()>::new();
        let producer = queue.producer().unwrap();
        let consumer = queue.consumer().unwrap();

        producer.push(1u64);
        producer.push(2u64);
        producer.push(3u64);

        for expected in 1u64..=3 {
            let op = consumer.try_start_consume().unwrap();
            assert_eq!(*op.element::<u64>(), expected);
            op.commit();
        }
        assert!(consumer.try_start_consume().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_heterogeneous_elements() {
        let queue = MpMcQueue::<()>::new();
        let producer = queue.producer().unwrap();
        let consumer = queue.consumer().unwrap();

        producer.push(1u8);
        producer.push(String::from("two"));
        producer.push(3.0f64);

        let op = consumer.try_start_consume().unwrap();
        assert_eq!(*op.element::<u8>(), 1);
        op.commit();

        let op = consumer.try_start_consume().unwrap();
        assert_eq!(op.element::<String>(), "two");
        op.commit();

        let op = consumer.try_start_consume().unwrap();
        assert_eq!(*op.element::<f64>(), 3.0);
        op.commit();
    }

    #[test]
    fn test_try_push_wait_free_fails_cleanly() {
        let queue: MpMcQueue<(), _> =
            Queue::with_allocator(crate::PageAllocator::with_cache_capacity(2));
        let producer = queue.producer().unwrap();

        // Empty cache: a wait-free put cannot acquire its first page.
        assert_eq!(
            producer.try_push(ProgressGuarantee::WaitFree, 5u32),
            Err(5u32)
        );
        assert!(queue.is_empty());

        // Blocking put succeeds and leaves a cached page for later.
        producer.push(5u32);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_drop_destroys_unconsumed_elements() {
        use std::sync::atomic::AtomicUsize as Counter;
        static DROPS: Counter = Counter::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let queue = MpMcQueue::<()>::new();
            let producer = queue.producer().unwrap();
            producer.push(Tracked);
            producer.push(Tracked);
            producer.push(Tracked);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_oversize_element_uses_external_block() {
        let queue = MpMcQueue::<()>::new();
        let producer = queue.producer().unwrap();
        let consumer = queue.consumer().unwrap();

        // An element whose inline size is far past the 64 KiB page limit;
        // the payload must land in an external block.
        let big = Box::new([0xABu8; 100 * 1024]);
        producer.push(*big);

        let op = consumer.try_start_consume().unwrap();
        let back = op.element::<[u8; 100 * 1024]>();
        assert_eq!(back.len(), 100 * 1024);
        assert_eq!(back[123], 0xAB);
        op.commit();
        assert!(queue.is_empty());
    }
}
