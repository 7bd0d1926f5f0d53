//! RAII handles for in-progress puts and consumes.
//!
//! A put transaction owns a constructed-but-unobservable element until
//! `commit` publishes it; a consume operation owns a claimed element (and
//! its page pin) until `commit` destroys it or `cancel` puts it back.
//! Dropping either handle without committing is a cancel, so resources are
//! released deterministically on every path, including unwinding.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::page_alloc::{PagedAllocator, ProgressGuarantee};
use crate::runtime_type::RuntimeType;

use super::layout::{payload_of, read_rtd, Slot, DEAD, EXTERNAL, UNALIGNED_PAYLOAD_OFFSET};
use super::{Claim, Consumer, Head, Producer, Tail};

// ---------------------------------------------------------------------
// TYPED PUT TRANSACTION
// ---------------------------------------------------------------------

/// A pending typed put. The element of type `C` is fully constructed but
/// not observable until [`commit`](Self::commit); dropping the transaction
/// cancels it and destroys the element.
pub struct PutTransaction<'a, C, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    producer: &'a Producer<B, T, H, A>,
    slot: Slot,
    payload: NonNull<u8>,
    armed: bool,
    _value: PhantomData<C>,
}

impl<'a, C, B, T, H, A> PutTransaction<'a, C, B, T, H, A>
where
    C: 'static,
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    pub(crate) fn new(producer: &'a Producer<B, T, H, A>, slot: Slot, payload: NonNull<u8>) -> Self {
        Self {
            producer,
            slot,
            payload,
            armed: true,
            _value: PhantomData,
        }
    }

    /// The element under construction.
    pub fn element(&self) -> &C {
        // SAFETY: the transaction constructed a C at `payload` and owns it
        // exclusively until commit.
        unsafe { self.payload.cast::<C>().as_ref() }
    }

    /// Mutable access for field population before commit.
    pub fn element_mut(&mut self) -> &mut C {
        // SAFETY: as `element`, plus `&mut self` gives unique access.
        unsafe { self.payload.cast::<C>().as_mut() }
    }

    /// Raw payload address.
    pub fn element_ptr(&self) -> NonNull<u8> {
        self.payload
    }

    /// Descriptor of the element's complete type.
    pub fn complete_type(&self) -> RuntimeType<B> {
        // SAFETY: the slot's descriptor was written at transaction start.
        unsafe { read_rtd::<B>(self.slot.block) }
    }

    /// Allocates raw bytes bound to this element's lifetime: the storage is
    /// reclaimed together with the element's control block, after the
    /// element is consumed. Blocking; panics on out-of-memory.
    pub fn raw_allocate(&mut self, size: usize, align: usize) -> NonNull<u8> {
        raw_allocate_impl(self.producer, size, align)
    }

    /// [`raw_allocate`](Self::raw_allocate) plus a copy of `src`; returns
    /// the copy, borrowed from the transaction.
    pub fn raw_allocate_copy<U: Copy>(&mut self, src: &[U]) -> &mut [U] {
        raw_allocate_copy_impl(self.producer, src)
    }

    /// Publishes the element: it becomes observable to consumers, in FIFO
    /// position of this producer's commit order.
    pub fn commit(mut self) {
        self.armed = false;
        self.producer.shared.tail.commit_put(&self.slot);
    }

    /// Cancels the put: the element is destroyed and never becomes
    /// observable.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        self.armed = false;
        unsafe {
            std::ptr::drop_in_place(self.payload.cast::<C>().as_ptr());
        }
        self.producer.shared.tail.cancel_put(&self.slot);
    }
}

impl<C, B, T, H, A> Drop for PutTransaction<'_, C, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            unsafe {
                std::ptr::drop_in_place(self.payload.cast::<C>().as_ptr());
            }
            self.producer.shared.tail.cancel_put(&self.slot);
        }
    }
}

// ---------------------------------------------------------------------
// DYNAMIC PUT TRANSACTION
// ---------------------------------------------------------------------

/// A pending dynamic put: like [`PutTransaction`] but the complete type is
/// known only through the runtime descriptor.
pub struct DynPutTransaction<'a, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    producer: &'a Producer<B, T, H, A>,
    slot: Slot,
    payload: NonNull<u8>,
    armed: bool,
}

impl<'a, B, T, H, A> DynPutTransaction<'a, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    pub(crate) fn new(producer: &'a Producer<B, T, H, A>, slot: Slot, payload: NonNull<u8>) -> Self {
        Self {
            producer,
            slot,
            payload,
            armed: true,
        }
    }

    /// Raw payload address of the constructed element.
    pub fn element_ptr(&self) -> NonNull<u8> {
        self.payload
    }

    /// Reference through the common base.
    pub fn element_base(&self) -> &B {
        // SAFETY: the payload is an initialized element of the descriptor's
        // complete type.
        unsafe { self.complete_type().upcast(self.payload).as_ref() }
    }

    /// Descriptor of the element's complete type.
    pub fn complete_type(&self) -> RuntimeType<B> {
        unsafe { read_rtd::<B>(self.slot.block) }
    }

    /// See [`PutTransaction::raw_allocate`].
    pub fn raw_allocate(&mut self, size: usize, align: usize) -> NonNull<u8> {
        raw_allocate_impl(self.producer, size, align)
    }

    /// See [`PutTransaction::raw_allocate_copy`].
    pub fn raw_allocate_copy<U: Copy>(&mut self, src: &[U]) -> &mut [U] {
        raw_allocate_copy_impl(self.producer, src)
    }

    /// Publishes the element.
    pub fn commit(mut self) {
        self.armed = false;
        self.producer.shared.tail.commit_put(&self.slot);
    }

    /// Cancels the put, destroying the element through its descriptor.
    pub fn cancel(mut self) {
        self.armed = false;
        unsafe {
            let ty = read_rtd::<B>(self.slot.block);
            ty.destroy(self.payload);
        }
        self.producer.shared.tail.cancel_put(&self.slot);
    }
}

impl<B, T, H, A> Drop for DynPutTransaction<'_, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            unsafe {
                let ty = read_rtd::<B>(self.slot.block);
                ty.destroy(self.payload);
            }
            self.producer.shared.tail.cancel_put(&self.slot);
        }
    }
}

fn raw_allocate_impl<B, T, H, A>(
    producer: &Producer<B, T, H, A>,
    size: usize,
    align: usize,
) -> NonNull<u8>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    assert!(align.is_power_of_two(), "alignment must be a power of two");
    // Raw sub-allocations are born DEAD: consumers pass over them and the
    // storage lives until the page (or external block) is reclaimed.
    match producer.allocate_element(ProgressGuarantee::Blocking, DEAD, size.max(1), align) {
        Some((_slot, payload)) => payload,
        None => panic!("queue page allocation failed"),
    }
}

fn raw_allocate_copy_impl<'t, B, T, H, A, U: Copy>(
    producer: &'t Producer<B, T, H, A>,
    src: &[U],
) -> &'t mut [U]
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    let bytes = std::mem::size_of_val(src);
    let ptr = raw_allocate_impl(producer, bytes, std::mem::align_of::<U>());
    unsafe {
        std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.cast::<U>().as_ptr(), src.len());
        std::slice::from_raw_parts_mut(ptr.cast::<U>().as_ptr(), src.len())
    }
}

// ---------------------------------------------------------------------
// CONSUME OPERATION
// ---------------------------------------------------------------------

/// A claimed element. Exactly one of [`commit`](Self::commit),
/// [`commit_nodestroy`](Self::commit_nodestroy) or [`cancel`](Self::cancel)
/// finalizes it; dropping the operation cancels, making the element
/// consumable again.
pub struct ConsumeOperation<'a, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    consumer: &'a Consumer<B, T, H, A>,
    claim: Claim,
    armed: bool,
}

impl<'a, B, T, H, A> ConsumeOperation<'a, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    pub(crate) fn new(consumer: &'a Consumer<B, T, H, A>, claim: Claim) -> Self {
        Self {
            consumer,
            claim,
            armed: true,
        }
    }

    /// Descriptor of the claimed element's complete type.
    pub fn complete_type(&self) -> RuntimeType<B> {
        unsafe { read_rtd::<B>(self.claim.block) }
    }

    /// Aligned payload address, resolving the external indirection.
    pub fn element_ptr(&self) -> NonNull<u8> {
        unsafe { payload_of::<B>(self.claim.block, self.claim.word) }
    }

    /// Payload address before alignment (inline elements only differ).
    pub fn unaligned_element_ptr(&self) -> NonNull<u8> {
        if self.claim.word & EXTERNAL != 0 {
            self.element_ptr()
        } else {
            unsafe {
                NonNull::new_unchecked((self.claim.block + UNALIGNED_PAYLOAD_OFFSET) as *mut u8)
            }
        }
    }

    /// Typed reference to the element.
    ///
    /// # Panics
    ///
    /// Panics if the complete type is not `C`; use
    /// [`complete_type`](Self::complete_type) to test first.
    pub fn element<C: 'static>(&self) -> &C {
        assert!(
            self.complete_type().is::<C>(),
            "element is a {}, not a {}",
            self.complete_type().type_name(),
            std::any::type_name::<C>()
        );
        // SAFETY: type checked; the claim gives exclusive element access.
        unsafe { self.element_ptr().cast::<C>().as_ref() }
    }

    /// Typed mutable reference; a cancelled claim republishes any mutation.
    pub fn element_mut<C: 'static>(&mut self) -> &mut C {
        assert!(
            self.complete_type().is::<C>(),
            "element is a {}, not a {}",
            self.complete_type().type_name(),
            std::any::type_name::<C>()
        );
        // SAFETY: as `element`, plus `&mut self` gives unique access.
        unsafe { self.element_ptr().cast::<C>().as_mut() }
    }

    /// Reference through the common base.
    pub fn element_base(&self) -> &B {
        // SAFETY: the payload is an initialized element of the descriptor's
        // complete type.
        unsafe { self.complete_type().upcast(self.element_ptr()).as_ref() }
    }

    /// Destroys the element and removes it from the queue.
    pub fn commit(mut self) {
        self.armed = false;
        unsafe {
            let ty = read_rtd::<B>(self.claim.block);
            ty.destroy(self.element_ptr());
        }
        let shared = &*self.consumer.shared;
        shared.head.commit_consume(&shared.alloc, &self.claim);
    }

    /// Removes the element without destroying it: the caller promises the
    /// value was already dropped in place (fused destroy-during-use).
    pub fn commit_nodestroy(mut self) {
        self.armed = false;
        let shared = &*self.consumer.shared;
        shared.head.commit_consume(&shared.alloc, &self.claim);
    }

    /// Puts the element back: it becomes consumable again.
    pub fn cancel(mut self) {
        self.armed = false;
        let shared = &*self.consumer.shared;
        shared.head.cancel_consume(&shared.alloc, &self.claim);
    }
}

impl<B, T, H, A> Drop for ConsumeOperation<'_, B, T, H, A>
where
    B: ?Sized + 'static,
    T: Tail<A>,
    H: Head<A>,
    A: PagedAllocator,
{
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            let shared = &*self.consumer.shared;
            shared.head.cancel_consume(&shared.alloc, &self.claim);
        }
    }
}
