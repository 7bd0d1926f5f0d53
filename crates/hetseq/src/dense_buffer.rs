//! The dense heterogeneous buffer engine.
//!
//! One contiguous block holds `[Header{count}][descriptor array][elements]`,
//! with each element placed at the next address aligned to its own alignment
//! after the previous element's end. No per-element offset is stored: payload
//! positions are re-derived by walking the descriptor array, which keeps the
//! block maximally compact at the cost of O(n) positioning.
//!
//! Every mutation rebuilds the block and swaps it in atomically. The strong
//! exception guarantee holds throughout: surviving elements are bitwise-moved
//! into the new block (a move is a byte copy, so the old block stays
//! bit-valid until the rebuild commits), newly constructed elements are the
//! only fallible step, and on failure the new block is unwound in reverse
//! construction order while the old block remains current.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::address::{align_up, align_up_ptr, extend_packed};
use crate::error::{AllocError, CtorError, DenseError};
#[cfg(debug_assertions)]
use crate::invariants::debug_assert_in_block;
use crate::runtime_type::RuntimeType;

#[repr(C)]
struct Header {
    count: usize,
}

const HEADER_SIZE: usize = std::mem::size_of::<Header>();

const fn rtd_size<B: ?Sized + 'static>() -> usize {
    std::mem::size_of::<RuntimeType<B>>()
}

const fn rtd_align<B: ?Sized + 'static>() -> usize {
    std::mem::align_of::<RuntimeType<B>>()
}

/// Forward cursor over `(descriptor, payload)` pairs of a block.
///
/// The payload address is derived lazily: the cursor tracks the unaligned
/// end of the previous element and aligns forward on demand. The `end`
/// cursor's payload is never derived.
pub(crate) struct RawIter<B: ?Sized + 'static> {
    unaligned: *mut u8,
    ty: *const RuntimeType<B>,
}

impl<B: ?Sized + 'static> Clone for RawIter<B> {
    fn clone(&self) -> Self {
        Self {
            unaligned: self.unaligned,
            ty: self.ty,
        }
    }
}

impl<B: ?Sized + 'static> RawIter<B> {
    /// Descriptor under the cursor. Must not be the end cursor.
    #[inline]
    pub(crate) unsafe fn ty(&self) -> RuntimeType<B> {
        *self.ty
    }

    /// Aligned payload address of the element under the cursor.
    #[inline]
    pub(crate) unsafe fn payload(&self) -> NonNull<u8> {
        let align = (*self.ty).alignment();
        NonNull::new_unchecked(align_up_ptr(self.unaligned, align))
    }

    /// Moves to the next element.
    #[inline]
    pub(crate) unsafe fn advance(&mut self) {
        let payload = self.payload().as_ptr();
        let size = (*self.ty).size();
        self.unaligned = payload.add(size);
        self.ty = self.ty.add(1);
    }
}

/// The packed block owner. Null descriptor pointer is the empty sentinel.
///
/// Not `Send`/`Sync`: the engine is single-owner by contract, and the raw
/// pointer member keeps the auto traits off.
pub(crate) struct DenseBuffer<B: ?Sized + 'static> {
    /// Points at the descriptor array inside the block; the header sits
    /// immediately before it. Null when empty.
    types: *mut RuntimeType<B>,
}

impl<B: ?Sized + 'static> DenseBuffer<B> {
    pub(crate) const fn new() -> Self {
        Self {
            types: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        if self.types.is_null() {
            0
        } else {
            unsafe { (*self.header()).count }
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.types.is_null()
    }

    fn header(&self) -> *mut Header {
        debug_assert!(!self.types.is_null());
        unsafe { self.types.cast::<Header>().sub(1) }
    }

    /// Cursor at the first element. Valid for `len()` advances.
    pub(crate) fn iter_raw(&self) -> RawIter<B> {
        if self.types.is_null() {
            RawIter {
                unaligned: std::ptr::null_mut(),
                ty: std::ptr::null(),
            }
        } else {
            let count = self.len();
            RawIter {
                unaligned: unsafe { self.types.add(count).cast::<u8>() },
                ty: self.types,
            }
        }
    }

    /// Descriptor and payload of the element at `index`.
    pub(crate) fn get(&self, index: usize) -> Option<(RuntimeType<B>, NonNull<u8>)> {
        if index >= self.len() {
            return None;
        }
        let mut it = self.iter_raw();
        unsafe {
            for _ in 0..index {
                it.advance();
            }
            Some((it.ty(), it.payload()))
        }
    }

    // ---------------------------------------------------------------------
    // LAYOUT PLANNING
    // ---------------------------------------------------------------------
    //
    // Buffer sizes are counted from the start of the descriptor array, which
    // the allocation places at a block-alignment boundary; relative offsets
    // therefore translate directly to aligned absolute addresses.

    fn plan(&self) -> (usize, usize) {
        let count = self.len();
        let mut size = count * rtd_size::<B>();
        let mut align = rtd_align::<B>();
        let mut it = self.iter_raw();
        for _ in 0..count {
            let ty = unsafe { it.ty() };
            size = extend_packed(size, ty.size(), ty.alignment());
            align = align.max(ty.alignment());
            unsafe { it.advance() };
        }
        (size, align)
    }

    fn plan_for_insert(
        &self,
        index: usize,
        insert_count: usize,
        new_ty: RuntimeType<B>,
    ) -> (usize, usize) {
        let count = self.len();
        debug_assert!(index <= count);
        let mut size = (count + insert_count) * rtd_size::<B>();
        let mut align = rtd_align::<B>();
        if insert_count > 0 {
            align = align.max(new_ty.alignment());
        }

        let mut it = self.iter_raw();
        let mut i = 0;
        loop {
            if i == index && insert_count > 0 {
                size = align_up(size, new_ty.alignment());
                size += new_ty.size() * insert_count;
            }
            if i == count {
                break;
            }
            let ty = unsafe { it.ty() };
            size = extend_packed(size, ty.size(), ty.alignment());
            align = align.max(ty.alignment());
            unsafe { it.advance() };
            i += 1;
        }
        (size, align)
    }

    fn plan_for_erase(&self, from: usize, to: usize) -> (usize, usize) {
        let count = self.len();
        debug_assert!(from <= to && to <= count);
        let mut size = (count - (to - from)) * rtd_size::<B>();
        let mut align = rtd_align::<B>();

        let mut it = self.iter_raw();
        for i in 0..count {
            if i < from || i >= to {
                let ty = unsafe { it.ty() };
                size = extend_packed(size, ty.size(), ty.alignment());
                align = align.max(ty.alignment());
            }
            unsafe { it.advance() };
        }
        (size, align)
    }

    // ---------------------------------------------------------------------
    // MUTATIONS
    // ---------------------------------------------------------------------

    /// Inserts one element at `index`, constructed by `write` moving a value
    /// into the slot. `write` must fully initialize the slot and is the last
    /// fallible-free step, so the rebuild cannot fail after it runs.
    pub(crate) unsafe fn insert_with(
        &mut self,
        index: usize,
        ty: RuntimeType<B>,
        write: impl FnOnce(*mut u8),
    ) -> Result<(), DenseError> {
        let count = self.len();
        debug_assert!(index <= count);
        let (buffer_size, buffer_align) = self.plan_for_insert(index, 1, ty);
        let mut builder = Builder::<B>::init(count + 1, buffer_size, buffer_align)?;

        let mut write = Some(write);
        let mut it = self.iter_raw();
        let mut i = 0;
        loop {
            if i == index {
                let slot = builder.payload_slot(ty);
                write.take().unwrap()(slot.as_ptr());
                builder.record(ty, Disposition::Owned);
            }
            if i == count {
                break;
            }
            builder.add_by_move(it.ty(), it.payload());
            it.advance();
            i += 1;
        }

        self.release_moved_out(None);
        self.types = builder.commit();
        Ok(())
    }

    /// Inserts `insert_count` copies of the element at `src` at `index`.
    /// Zero-count insert is a no-op.
    pub(crate) unsafe fn insert_copies(
        &mut self,
        index: usize,
        insert_count: usize,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<(), DenseError> {
        if insert_count == 0 {
            return Ok(());
        }
        let count = self.len();
        debug_assert!(index <= count);
        let (buffer_size, buffer_align) = self.plan_for_insert(index, insert_count, ty);
        let mut builder = Builder::<B>::init(count + insert_count, buffer_size, buffer_align)?;

        let mut it = self.iter_raw();
        let mut i = 0;
        loop {
            if i == index {
                for _ in 0..insert_count {
                    if let Err(e) = builder.add_by_copy(ty, src) {
                        builder.rollback();
                        return Err(DenseError::Ctor(e));
                    }
                }
            }
            if i == count {
                break;
            }
            builder.add_by_move(it.ty(), it.payload());
            it.advance();
            i += 1;
        }

        self.release_moved_out(None);
        self.types = builder.commit();
        Ok(())
    }

    /// Erases `[from, to)`. Erasing the full range releases the block and
    /// returns to the empty sentinel; an empty range is a no-op.
    pub(crate) unsafe fn erase_range(&mut self, from: usize, to: usize) -> Result<(), DenseError> {
        let count = self.len();
        debug_assert!(from <= to && to <= count);
        if from == to {
            return Ok(());
        }
        if to - from == count {
            self.clear();
            return Ok(());
        }

        let (buffer_size, buffer_align) = self.plan_for_erase(from, to);
        let mut builder = Builder::<B>::init(count - (to - from), buffer_size, buffer_align)?;

        let mut it = self.iter_raw();
        for i in 0..count {
            if i < from || i >= to {
                builder.add_by_move(it.ty(), it.payload());
            }
            it.advance();
        }

        self.release_moved_out(Some((from, to)));
        self.types = builder.commit();
        Ok(())
    }

    /// Builds a buffer in one pass by bitwise-moving each `(descriptor,
    /// source)` pair into a freshly sized block. On success the sources are
    /// owned by the buffer and must not be dropped by the caller; on failure
    /// (allocation only — moves cannot fail) no source has been touched.
    pub(crate) unsafe fn build_from(
        parts: &[(RuntimeType<B>, NonNull<u8>)],
    ) -> Result<Self, AllocError> {
        if parts.is_empty() {
            return Ok(Self::new());
        }
        let mut size = parts.len() * rtd_size::<B>();
        let mut align = rtd_align::<B>();
        for (ty, _) in parts {
            size = extend_packed(size, ty.size(), ty.alignment());
            align = align.max(ty.alignment());
        }
        let mut builder = Builder::<B>::init(parts.len(), size, align)?;
        for (ty, src) in parts {
            builder.add_by_move(*ty, *src);
        }
        Ok(Self {
            types: builder.commit(),
        })
    }

    /// Builds a fresh buffer as a copy of `source`.
    pub(crate) fn try_clone_from(source: &Self) -> Result<Self, DenseError> {
        if source.is_empty() {
            return Ok(Self::new());
        }
        let count = source.len();
        let (buffer_size, buffer_align) = source.plan();
        let mut builder = Builder::<B>::init(count, buffer_size, buffer_align)?;

        let mut it = source.iter_raw();
        for _ in 0..count {
            unsafe {
                if let Err(e) = builder.add_by_copy(it.ty(), it.payload()) {
                    builder.rollback();
                    return Err(DenseError::Ctor(e));
                }
                it.advance();
            }
        }
        Ok(Self {
            types: builder.commit(),
        })
    }

    /// Destroys all elements and releases the block.
    pub(crate) fn clear(&mut self) {
        if self.types.is_null() {
            return;
        }
        let count = self.len();
        let mut it = self.iter_raw();
        let mut block_align = rtd_align::<B>();
        let mut buffer_size = count * rtd_size::<B>();
        unsafe {
            for _ in 0..count {
                let ty = it.ty();
                block_align = block_align.max(ty.alignment());
                buffer_size = extend_packed(buffer_size, ty.size(), ty.alignment());
                ty.destroy(it.payload());
                it.advance();
            }
            self.free_block(buffer_size, block_align);
        }
        self.types = std::ptr::null_mut();
    }

    /// Releases the current block after its elements were bitwise-moved into
    /// a new block. Elements in `drop_range` were not moved and are dropped
    /// here; everything else is freed without running destructors.
    unsafe fn release_moved_out(&mut self, drop_range: Option<(usize, usize)>) {
        if self.types.is_null() {
            return;
        }
        let count = self.len();
        let mut it = self.iter_raw();
        let mut block_align = rtd_align::<B>();
        let mut buffer_size = count * rtd_size::<B>();
        for i in 0..count {
            let ty = it.ty();
            block_align = block_align.max(ty.alignment());
            buffer_size = extend_packed(buffer_size, ty.size(), ty.alignment());
            if let Some((from, to)) = drop_range {
                if i >= from && i < to {
                    ty.destroy(it.payload());
                }
            }
            it.advance();
        }
        self.free_block(buffer_size, block_align);
        self.types = std::ptr::null_mut();
    }

    unsafe fn free_block(&mut self, buffer_size: usize, block_align: usize) {
        let prefix = align_up(HEADER_SIZE, block_align);
        let start = self.types.cast::<u8>().sub(prefix);
        let layout = Layout::from_size_align_unchecked(prefix + buffer_size, block_align);
        alloc::dealloc(start, layout);
    }

    /// Structural equality: same length, same descriptor sequence, payloads
    /// equal under the `equals` feature.
    pub(crate) fn equal(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mut a = self.iter_raw();
        let mut b = other.iter_raw();
        for _ in 0..self.len() {
            unsafe {
                let ta = a.ty();
                let tb = b.ty();
                if ta != tb || !ta.equals(a.payload(), b.payload()) {
                    return false;
                }
                a.advance();
                b.advance();
            }
        }
        true
    }
}

impl<B: ?Sized + 'static> Drop for DenseBuffer<B> {
    fn drop(&mut self) {
        self.clear();
    }
}

// ---------------------------------------------------------------------
// BLOCK BUILDER
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Bitwise-moved from the old block; on rollback the old block still
    /// owns the value, so the builder must not destroy it.
    Moved,
    /// Constructed into the new block; destroyed on rollback.
    Owned,
}

/// Builds a block in one pass. On success, `commit` hands the descriptor
/// pointer over; on failure, `rollback` destroys owned elements in reverse
/// construction order and frees the block. Dropping a builder without
/// committing rolls back.
struct Builder<B: ?Sized + 'static> {
    types_start: *mut RuntimeType<B>,
    types_next: *mut RuntimeType<B>,
    elems_next_unaligned: *mut u8,
    dispositions: Vec<Disposition>,
    count: usize,
    layout: Layout,
    prefix: usize,
    committed: bool,
    #[cfg(debug_assertions)]
    block_end: usize,
}

impl<B: ?Sized + 'static> Builder<B> {
    fn init(count: usize, buffer_size: usize, block_align: usize) -> Result<Self, AllocError> {
        debug_assert!(count > 0);
        let prefix = align_up(HEADER_SIZE, block_align);
        let layout =
            Layout::from_size_align(prefix + buffer_size, block_align).map_err(|_| AllocError)?;
        // SAFETY: the layout has non-zero size (count > 0).
        let raw = unsafe { alloc::alloc(layout) };
        let Some(start) = NonNull::new(raw) else {
            return Err(AllocError);
        };
        let types_start = unsafe { start.as_ptr().add(prefix).cast::<RuntimeType<B>>() };
        unsafe {
            types_start.cast::<Header>().sub(1).write(Header { count });
        }
        Ok(Self {
            types_start,
            types_next: types_start,
            elems_next_unaligned: unsafe { types_start.add(count).cast::<u8>() },
            dispositions: Vec::with_capacity(count),
            count,
            layout,
            prefix,
            committed: false,
            #[cfg(debug_assertions)]
            block_end: start.as_ptr() as usize + prefix + buffer_size,
        })
    }

    /// Reserves the aligned payload slot for the next element and advances
    /// the packing cursor. The caller must initialize the slot and then call
    /// [`record`](Self::record).
    unsafe fn payload_slot(&mut self, ty: RuntimeType<B>) -> NonNull<u8> {
        let slot = align_up_ptr(self.elems_next_unaligned, ty.alignment());
        self.elems_next_unaligned = slot.add(ty.size());
        #[cfg(debug_assertions)]
        debug_assert_in_block!(
            self.elems_next_unaligned as usize,
            self.types_start as usize,
            self.block_end
        );
        NonNull::new_unchecked(slot)
    }

    /// Appends the descriptor for the element just written into its slot.
    unsafe fn record(&mut self, ty: RuntimeType<B>, disposition: Disposition) {
        self.types_next.write(ty);
        self.types_next = self.types_next.add(1);
        self.dispositions.push(disposition);
    }

    unsafe fn add_by_move(&mut self, ty: RuntimeType<B>, src: NonNull<u8>) {
        let slot = self.payload_slot(ty);
        ty.move_construct(slot, src);
        self.record(ty, Disposition::Moved);
    }

    unsafe fn add_by_copy(
        &mut self,
        ty: RuntimeType<B>,
        src: NonNull<u8>,
    ) -> Result<NonNull<u8>, CtorError> {
        let slot = self.payload_slot(ty);
        ty.copy_construct(slot, src)?;
        self.record(ty, Disposition::Owned);
        Ok(slot)
    }

    fn commit(mut self) -> *mut RuntimeType<B> {
        self.committed = true;
        self.types_start
    }

    fn rollback(&mut self) {
        if self.committed || self.types_start.is_null() {
            return;
        }
        let constructed = self.dispositions.len();
        // Re-derive payload positions, then unwind owned elements in reverse
        // construction order. The element area starts right after the full
        // descriptor array.
        let mut positions = Vec::with_capacity(constructed);
        let mut it = RawIter::<B> {
            unaligned: unsafe { self.types_start.add(self.count).cast::<u8>() },
            ty: self.types_start,
        };
        unsafe {
            for _ in 0..constructed {
                positions.push((it.ty(), it.payload()));
                it.advance();
            }
            for (i, (ty, payload)) in positions.into_iter().enumerate().rev() {
                if self.dispositions[i] == Disposition::Owned {
                    ty.destroy(payload);
                }
            }
            alloc::dealloc(self.types_start.cast::<u8>().sub(self.prefix), self.layout);
        }
        self.types_start = std::ptr::null_mut();
    }
}

impl<B: ?Sized + 'static> Drop for Builder<B> {
    fn drop(&mut self) {
        self.rollback();
    }
}
