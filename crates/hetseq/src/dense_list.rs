//! Value-semantic heterogeneous list over the dense buffer engine.
//!
//! `DenseList<B>` stores values of different complete types by value, tightly
//! packed, under an optional common base `B`. Forward iteration only; every
//! mutation rebuilds the packed block with the strong exception guarantee.
//!
//! ```
//! use hetseq::dense_list;
//!
//! let list = dense_list![7i32, String::from("x"), 3.5f64];
//! assert_eq!(list.len(), 3);
//! assert_eq!(list.get(0).unwrap().downcast_ref::<i32>(), Some(&7));
//! ```

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Range;
use std::ptr::NonNull;

use crate::dense_buffer::{DenseBuffer, RawIter};
use crate::error::DenseError;
use crate::runtime_type::{BaseOf, RuntimeType, TryClone};

/// Element bound for the dense containers: copyable, comparable, hashable,
/// and convertible to the common base `B`.
///
/// Implemented automatically; the bounds guarantee that every element's
/// descriptor carries the `copy_construct`, `equals` and `hash` features, so
/// list equality can never fall back to a partial comparison.
pub trait Value<B: ?Sized + 'static>: TryClone + PartialEq + Hash + 'static {
    /// Descriptor for this type with the dense feature set.
    fn runtime_type() -> RuntimeType<B>;
}

impl<B, C> Value<B> for C
where
    B: ?Sized + 'static + BaseOf<C>,
    C: TryClone + PartialEq + Hash + 'static,
{
    fn runtime_type() -> RuntimeType<B> {
        RuntimeType::of_comparable::<C>()
    }
}

/// Heterogeneous list of values under common base `B` (default: none).
pub struct DenseList<B: ?Sized + 'static = ()> {
    buffer: DenseBuffer<B>,
}

impl<B: ?Sized + 'static> DenseList<B> {
    /// Empty list. Does not allocate.
    pub const fn new() -> Self {
        Self {
            buffer: DenseBuffer::new(),
        }
    }

    /// Builds a list from a tuple of values in one pass.
    ///
    /// Usually spelled with the [`dense_list!`](crate::dense_list) macro.
    pub fn make<T: MakeList<B>>(values: T) -> Self {
        values.build()
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when the list holds no elements (and no block).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends `value` at the end.
    pub fn push_back<C: Value<B>>(&mut self, value: C) {
        let index = self.len();
        self.insert(index, value);
    }

    /// Prepends `value` at the front.
    pub fn push_front<C: Value<B>>(&mut self, value: C) {
        self.insert(0, value);
    }

    /// Inserts `value` before position `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`, or on allocation failure.
    pub fn insert<C: Value<B>>(&mut self, index: usize, value: C) {
        assert!(index <= self.len(), "insert index out of bounds");
        let ty = C::runtime_type();
        unsafe {
            self.buffer.insert_with(index, ty, move |slot| {
                // SAFETY: the builder hands out an aligned, writable slot of
                // the element's size.
                unsafe { slot.cast::<C>().write(value) }
            })
        }
        .unwrap_or_else(|_| panic!("dense list allocation failed"));
    }

    /// Inserts `count` copies of `value` before position `index`.
    /// A zero count is a no-op.
    ///
    /// On failure the list is observationally unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn insert_n<C: Value<B>>(
        &mut self,
        index: usize,
        count: usize,
        value: &C,
    ) -> Result<(), DenseError> {
        assert!(index <= self.len(), "insert index out of bounds");
        let ty = C::runtime_type();
        unsafe {
            self.buffer
                .insert_copies(index, count, ty, NonNull::from(value).cast())
        }
    }

    /// Removes the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`, or on allocation failure.
    pub fn erase(&mut self, index: usize) {
        assert!(index < self.len(), "erase index out of bounds");
        unsafe { self.buffer.erase_range(index, index + 1) }
            .unwrap_or_else(|_| panic!("dense list allocation failed"));
    }

    /// Removes the elements in `range`. An empty range is a no-op; erasing
    /// everything returns the list to its unallocated empty state.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds, or on allocation failure.
    pub fn erase_range(&mut self, range: Range<usize>) {
        assert!(
            range.start <= range.end && range.end <= self.len(),
            "erase range out of bounds"
        );
        unsafe { self.buffer.erase_range(range.start, range.end) }
            .unwrap_or_else(|_| panic!("dense list allocation failed"));
    }

    /// Destroys all elements and releases the block.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Reference to the element at `index` (O(n) cursor walk).
    pub fn get(&self, index: usize) -> Option<ElementRef<'_, B>> {
        self.buffer.get(index).map(|(ty, payload)| ElementRef {
            ty,
            payload,
            _marker: PhantomData,
        })
    }

    /// Forward iterator over the elements.
    pub fn iter(&self) -> Iter<'_, B> {
        Iter {
            raw: self.buffer.iter_raw(),
            remaining: self.len(),
            _marker: PhantomData,
        }
    }

    /// Deep copy of the list; fails if any element's copy constructor fails.
    pub fn try_clone(&self) -> Result<Self, DenseError> {
        Ok(Self {
            buffer: DenseBuffer::try_clone_from(&self.buffer)?,
        })
    }
}

impl<B: ?Sized + 'static> Default for DenseList<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ?Sized + 'static> PartialEq for DenseList<B> {
    fn eq(&self, other: &Self) -> bool {
        self.buffer.equal(&other.buffer)
    }
}

impl<B: ?Sized + 'static> fmt::Debug for DenseList<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|e| e.complete_type().type_name()))
            .finish()
    }
}

impl<'a, B: ?Sized + 'static> IntoIterator for &'a DenseList<B> {
    type Item = ElementRef<'a, B>;
    type IntoIter = Iter<'a, B>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Borrowed view of one element: its descriptor and payload.
pub struct ElementRef<'a, B: ?Sized + 'static> {
    ty: RuntimeType<B>,
    payload: NonNull<u8>,
    _marker: PhantomData<&'a ()>,
}

impl<'a, B: ?Sized + 'static> ElementRef<'a, B> {
    /// Descriptor of the element's complete type.
    pub fn complete_type(&self) -> RuntimeType<B> {
        self.ty
    }

    /// Typed reference, if the complete type is `C`.
    pub fn downcast_ref<C: 'static>(&self) -> Option<&'a C> {
        if self.ty.is::<C>() {
            // SAFETY: the descriptor guarantees the payload is a C.
            Some(unsafe { self.payload.cast::<C>().as_ref() })
        } else {
            None
        }
    }

    /// Reference through the common base.
    pub fn as_base(&self) -> &'a B {
        // SAFETY: the payload is an initialized element of the descriptor's
        // complete type, which upcasts to B.
        unsafe { self.ty.upcast(self.payload).as_ref() }
    }

    /// Raw payload address, aligned to the element's alignment.
    pub fn payload_ptr(&self) -> NonNull<u8> {
        self.payload
    }
}

/// Forward iterator over a [`DenseList`].
pub struct Iter<'a, B: ?Sized + 'static> {
    raw: RawIter<B>,
    remaining: usize,
    _marker: PhantomData<&'a ()>,
}

impl<'a, B: ?Sized + 'static> Iterator for Iter<'a, B> {
    type Item = ElementRef<'a, B>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        // SAFETY: `remaining` bounds the cursor to constructed elements.
        unsafe {
            let item = ElementRef {
                ty: self.raw.ty(),
                payload: self.raw.payload(),
                _marker: PhantomData,
            };
            self.raw.advance();
            Some(item)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<B: ?Sized + 'static> ExactSizeIterator for Iter<'_, B> {}

/// Tuples of [`Value`]s buildable into a [`DenseList`] in one pass.
pub trait MakeList<B: ?Sized + 'static> {
    fn build(self) -> DenseList<B>;
}

impl<B: ?Sized + 'static> MakeList<B> for () {
    fn build(self) -> DenseList<B> {
        DenseList::new()
    }
}

macro_rules! impl_make_list {
    ($(($T:ident, $v:ident)),+) => {
        impl<Base: ?Sized + 'static, $($T: Value<Base>),+> MakeList<Base> for ($($T,)+) {
            fn build(self) -> DenseList<Base> {
                let ($(mut $v,)+) = self;
                let parts = [
                    $(($T::runtime_type(), NonNull::from(&mut $v).cast::<u8>()),)+
                ];
                // SAFETY: each source pointer matches its descriptor; on
                // success the values are moved into the block and must not be
                // dropped here.
                let buffer = unsafe { DenseBuffer::build_from(&parts) }
                    .unwrap_or_else(|_| panic!("dense list allocation failed"));
                $(std::mem::forget($v);)+
                DenseList { buffer }
            }
        }
    };
}

impl_make_list!((T0, v0));
impl_make_list!((T0, v0), (T1, v1));
impl_make_list!((T0, v0), (T1, v1), (T2, v2));
impl_make_list!((T0, v0), (T1, v1), (T2, v2), (T3, v3));
impl_make_list!((T0, v0), (T1, v1), (T2, v2), (T3, v3), (T4, v4));
impl_make_list!((T0, v0), (T1, v1), (T2, v2), (T3, v3), (T4, v4), (T5, v5));
impl_make_list!(
    (T0, v0),
    (T1, v1),
    (T2, v2),
    (T3, v3),
    (T4, v4),
    (T5, v5),
    (T6, v6)
);
impl_make_list!(
    (T0, v0),
    (T1, v1),
    (T2, v2),
    (T3, v3),
    (T4, v4),
    (T5, v5),
    (T6, v6),
    (T7, v7)
);

/// Builds a [`DenseList`] from a sequence of values.
///
/// ```
/// use hetseq::dense_list;
///
/// let list = dense_list![1u8, 2u64, String::from("three")];
/// assert_eq!(list.len(), 3);
/// ```
#[macro_export]
macro_rules! dense_list {
    () => {
        $crate::DenseList::new()
    };
    ($($v:expr),+ $(,)?) => {
        $crate::DenseList::make(($($v,)+))
    };
}
