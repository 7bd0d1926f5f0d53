//! Runtime type descriptors: value-semantic operations on erased elements.
//!
//! A [`RuntimeType`] is a pointer-sized, copyable handle to a static per-type
//! feature table. It is the only mechanism by which the containers manipulate
//! elements whose concrete type was erased: size and alignment for layout,
//! destroy and move for lifecycle, plus an optional set of features (copy,
//! default-construct, hash, equality, stream I/O) selected when the
//! descriptor is created.
//!
//! # Memory ordering and safety model
//!
//! Descriptors are immutable after creation and freely shared across threads.
//! Every erased operation is `unsafe`: the caller guarantees that the pointer
//! arguments refer to storage of the descriptor's complete type, correctly
//! aligned, and (for reads) initialized. The containers in this crate uphold
//! these contracts internally; user code only meets them through the typed
//! surfaces.

use std::any::TypeId;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::str::FromStr;

use crate::error::{CtorError, StreamError};
use crate::invariants::debug_assert_rtd_well_formed;

// ---------------------------------------------------------------------
// FALLIBLE CONSTRUCTION
// ---------------------------------------------------------------------

/// Fallible clone, the `copy_construct` feature.
///
/// There is deliberately no blanket impl over [`Clone`]: coherence would then
/// forbid hand-written impls, and fallible construction is the whole point of
/// this trait (a type whose copy can fail — an exhausted resource, a test
/// double — implements it directly). For ordinary cloneable types use
/// [`impl_try_clone!`](crate::impl_try_clone).
pub trait TryClone: Sized {
    fn try_clone(&self) -> Result<Self, CtorError>;
}

/// Fallible default construction, the `default_construct` feature.
///
/// Mirror of [`TryClone`] for [`Default`]; see
/// [`impl_try_default!`](crate::impl_try_default).
pub trait TryDefault: Sized {
    fn try_default() -> Result<Self, CtorError>;
}

/// Implements [`TryClone`] for types that already implement [`Clone`].
#[macro_export]
macro_rules! impl_try_clone {
    ($($t:ty),* $(,)?) => {
        $(impl $crate::TryClone for $t {
            #[inline]
            fn try_clone(&self) -> ::std::result::Result<Self, $crate::CtorError> {
                ::std::result::Result::Ok(::std::clone::Clone::clone(self))
            }
        })*
    };
}

/// Implements [`TryDefault`] for types that already implement [`Default`].
#[macro_export]
macro_rules! impl_try_default {
    ($($t:ty),* $(,)?) => {
        $(impl $crate::TryDefault for $t {
            #[inline]
            fn try_default() -> ::std::result::Result<Self, $crate::CtorError> {
                ::std::result::Result::Ok(::std::default::Default::default())
            }
        })*
    };
}

impl_try_clone!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, String,
);
impl_try_default!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, String,
);

impl<T: Clone> TryClone for Vec<T> {
    #[inline]
    fn try_clone(&self) -> Result<Self, CtorError> {
        Ok(self.clone())
    }
}

impl<T> TryDefault for Vec<T> {
    #[inline]
    fn try_default() -> Result<Self, CtorError> {
        Ok(Vec::new())
    }
}

impl<T: Clone> TryClone for Box<T> {
    #[inline]
    fn try_clone(&self) -> Result<Self, CtorError> {
        Ok(self.clone())
    }
}

impl<T: Clone> TryClone for Option<T> {
    #[inline]
    fn try_clone(&self) -> Result<Self, CtorError> {
        Ok(self.clone())
    }
}

impl<T> TryDefault for Option<T> {
    #[inline]
    fn try_default() -> Result<Self, CtorError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------
// COMMON BASE
// ---------------------------------------------------------------------

/// `B: BaseOf<C>` states that a `*mut C` converts to a `*mut B`.
///
/// The unit type is the "void" base: every complete type has it. For a trait
/// base, implement it once per trait:
///
/// ```
/// use hetseq::BaseOf;
///
/// trait Shape { fn area(&self) -> f64; }
///
/// impl<C: Shape + 'static> BaseOf<C> for dyn Shape {
///     fn upcast_ptr(ptr: *mut C) -> *mut Self {
///         ptr
///     }
/// }
/// ```
pub trait BaseOf<C> {
    /// Converts a pointer to the complete type into a pointer to the base.
    fn upcast_ptr(ptr: *mut C) -> *mut Self;
}

impl<C> BaseOf<C> for () {
    #[inline]
    fn upcast_ptr(ptr: *mut C) -> *mut () {
        ptr.cast()
    }
}

// ---------------------------------------------------------------------
// FEATURE TABLE
// ---------------------------------------------------------------------

type CopyFn = unsafe fn(*mut u8, *const u8) -> Result<(), CtorError>;
type DefaultFn = unsafe fn(*mut u8) -> Result<(), CtorError>;
type HashFn = unsafe fn(*const u8) -> u64;
type EqualsFn = unsafe fn(*const u8, *const u8) -> bool;
type FmtWriteFn = unsafe fn(*const u8, &mut dyn fmt::Write) -> Result<(), StreamError>;
type ParseReadFn = unsafe fn(&str, *mut u8) -> Result<(), StreamError>;

/// The static per-type table a [`RuntimeType`] points to.
///
/// Core slots are always present; optional slots are `None` when the feature
/// was not selected by the factory that built the table.
#[doc(hidden)]
pub struct FeatureTable<B: ?Sized + 'static> {
    size: usize,
    align: usize,
    type_id: fn() -> TypeId,
    type_name: fn() -> &'static str,
    drop_in_place: unsafe fn(*mut u8),
    move_construct: unsafe fn(*mut u8, *mut u8),
    upcast: unsafe fn(*mut u8) -> *mut B,
    copy_construct: Option<CopyFn>,
    default_construct: Option<DefaultFn>,
    hash: Option<HashFn>,
    equals: Option<EqualsFn>,
    fmt_write: Option<FmtWriteFn>,
    parse_read: Option<ParseReadFn>,
}

// Erased trampolines, monomorphized per complete type.

unsafe fn drop_erased<C>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr.cast::<C>());
}

unsafe fn move_erased<C>(dst: *mut u8, src: *mut u8) {
    std::ptr::copy_nonoverlapping(src.cast::<C>(), dst.cast::<C>(), 1);
}

unsafe fn upcast_erased<C, B: ?Sized + BaseOf<C>>(ptr: *mut u8) -> *mut B {
    B::upcast_ptr(ptr.cast::<C>())
}

unsafe fn copy_erased<C: TryClone>(dst: *mut u8, src: *const u8) -> Result<(), CtorError> {
    let value = (*src.cast::<C>()).try_clone()?;
    dst.cast::<C>().write(value);
    Ok(())
}

unsafe fn default_erased<C: TryDefault>(dst: *mut u8) -> Result<(), CtorError> {
    dst.cast::<C>().write(C::try_default()?);
    Ok(())
}

unsafe fn hash_erased<C: Hash>(ptr: *const u8) -> u64 {
    let mut hasher = DefaultHasher::new();
    (*ptr.cast::<C>()).hash(&mut hasher);
    hasher.finish()
}

unsafe fn equals_erased<C: PartialEq>(a: *const u8, b: *const u8) -> bool {
    *a.cast::<C>() == *b.cast::<C>()
}

unsafe fn fmt_write_erased<C: fmt::Display>(
    ptr: *const u8,
    out: &mut dyn fmt::Write,
) -> Result<(), StreamError> {
    write!(out, "{}", &*ptr.cast::<C>()).map_err(|_| StreamError::Write)
}

unsafe fn parse_read_erased<C: FromStr>(input: &str, dst: *mut u8) -> Result<(), StreamError>
where
    C::Err: fmt::Display,
{
    match input.parse::<C>() {
        Ok(value) => {
            dst.cast::<C>().write(value);
            Ok(())
        }
        Err(e) => Err(StreamError::Parse(e.to_string())),
    }
}

impl<B: ?Sized + 'static> FeatureTable<B> {
    #[allow(clippy::too_many_arguments)]
    const fn with<C: 'static>(
        copy_construct: Option<CopyFn>,
        default_construct: Option<DefaultFn>,
        hash: Option<HashFn>,
        equals: Option<EqualsFn>,
        fmt_write: Option<FmtWriteFn>,
        parse_read: Option<ParseReadFn>,
    ) -> Self
    where
        B: BaseOf<C>,
    {
        // Zero-sized elements are rejected at descriptor creation: the packed
        // layouts rely on every payload occupying at least one byte.
        assert!(std::mem::size_of::<C>() != 0, "zero-sized element type");
        Self {
            size: std::mem::size_of::<C>(),
            align: std::mem::align_of::<C>(),
            type_id: TypeId::of::<C>,
            type_name: std::any::type_name::<C>,
            drop_in_place: drop_erased::<C>,
            move_construct: move_erased::<C>,
            upcast: upcast_erased::<C, B>,
            copy_construct,
            default_construct,
            hash,
            equals,
            fmt_write,
            parse_read,
        }
    }
}

// Associated-const holders: referencing `Holder::<C, B>::TABLE` through `&`
// promotes the table to a `'static` location, one per (C, B, feature set).

struct CoreTable<C, B: ?Sized>(std::marker::PhantomData<(fn() -> C, fn() -> *const B)>);
struct CopyableTable<C, B: ?Sized>(std::marker::PhantomData<(fn() -> C, fn() -> *const B)>);
struct ComparableTable<C, B: ?Sized>(std::marker::PhantomData<(fn() -> C, fn() -> *const B)>);
struct ConstructibleTable<C, B: ?Sized>(std::marker::PhantomData<(fn() -> C, fn() -> *const B)>);
struct FullTable<C, B: ?Sized>(std::marker::PhantomData<(fn() -> C, fn() -> *const B)>);

impl<C: 'static, B: ?Sized + 'static + BaseOf<C>> CoreTable<C, B> {
    const TABLE: FeatureTable<B> = FeatureTable::with::<C>(None, None, None, None, None, None);
}

impl<C: 'static + TryClone, B: ?Sized + 'static + BaseOf<C>> CopyableTable<C, B> {
    const TABLE: FeatureTable<B> =
        FeatureTable::with::<C>(Some(copy_erased::<C>), None, None, None, None, None);
}

impl<C, B> ComparableTable<C, B>
where
    C: 'static + TryClone + PartialEq + Hash,
    B: ?Sized + 'static + BaseOf<C>,
{
    const TABLE: FeatureTable<B> = FeatureTable::with::<C>(
        Some(copy_erased::<C>),
        None,
        Some(hash_erased::<C>),
        Some(equals_erased::<C>),
        None,
        None,
    );
}

impl<C, B> ConstructibleTable<C, B>
where
    C: 'static + TryClone + TryDefault,
    B: ?Sized + 'static + BaseOf<C>,
{
    const TABLE: FeatureTable<B> = FeatureTable::with::<C>(
        Some(copy_erased::<C>),
        Some(default_erased::<C>),
        None,
        None,
        None,
        None,
    );
}

impl<C, B> FullTable<C, B>
where
    C: 'static + TryClone + TryDefault + PartialEq + Hash + fmt::Display + FromStr,
    C::Err: fmt::Display,
    B: ?Sized + 'static + BaseOf<C>,
{
    const TABLE: FeatureTable<B> = FeatureTable::with::<C>(
        Some(copy_erased::<C>),
        Some(default_erased::<C>),
        Some(hash_erased::<C>),
        Some(equals_erased::<C>),
        Some(fmt_write_erased::<C>),
        Some(parse_read_erased::<C>),
    );
}

// ---------------------------------------------------------------------
// FEATURE MARKERS
// ---------------------------------------------------------------------

/// Zero-sized markers naming the optional features, for
/// [`RuntimeType::has`] / [`RuntimeType::get`].
pub mod feature {
    use super::{
        CopyFn, DefaultFn, EqualsFn, FeatureTable, FmtWriteFn, HashFn, ParseReadFn,
    };

    mod sealed {
        pub trait Sealed {}
    }

    /// An optional capability of a [`super::RuntimeType`].
    pub trait Feature: sealed::Sealed {
        /// The erased function type backing the feature.
        type Fn: Copy;
        #[doc(hidden)]
        fn slot<B: ?Sized + 'static>(table: &FeatureTable<B>) -> Option<Self::Fn>;
    }

    macro_rules! feature_marker {
        ($(#[$doc:meta])* $name:ident, $fnty:ty, $field:ident) => {
            $(#[$doc])*
            pub struct $name;

            impl sealed::Sealed for $name {}

            impl Feature for $name {
                type Fn = $fnty;
                fn slot<B: ?Sized + 'static>(table: &FeatureTable<B>) -> Option<Self::Fn> {
                    table.$field
                }
            }
        };
    }

    feature_marker!(
        /// Fallible copy construction (`TryClone`).
        CopyConstruct, CopyFn, copy_construct
    );
    feature_marker!(
        /// Fallible default construction (`TryDefault`).
        DefaultConstruct, DefaultFn, default_construct
    );
    feature_marker!(
        /// 64-bit hashing of the element value.
        Hashing, HashFn, hash
    );
    feature_marker!(
        /// Equality comparison between two elements of the same complete type.
        Equality, EqualsFn, equals
    );
    feature_marker!(
        /// Display-based formatting into a stream.
        FmtWrite, FmtWriteFn, fmt_write
    );
    feature_marker!(
        /// FromStr-based parsing out of a stream.
        ParseRead, ParseReadFn, parse_read
    );
}

use feature::Feature;

// ---------------------------------------------------------------------
// RUNTIME TYPE
// ---------------------------------------------------------------------

/// Descriptor of one complete element type under common base `B`.
///
/// Pointer-sized, `Copy`, and immutable. Two descriptors compare equal when
/// they describe the same complete type, regardless of feature set.
pub struct RuntimeType<B: ?Sized + 'static = ()> {
    table: &'static FeatureTable<B>,
}

impl<B: ?Sized + 'static> Clone for RuntimeType<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: ?Sized + 'static> Copy for RuntimeType<B> {}

impl<B: ?Sized + 'static> PartialEq for RuntimeType<B> {
    fn eq(&self, other: &Self) -> bool {
        self.type_id() == other.type_id()
    }
}

impl<B: ?Sized + 'static> Eq for RuntimeType<B> {}

impl<B: ?Sized + 'static> fmt::Debug for RuntimeType<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeType")
            .field("type_name", &self.type_name())
            .field("size", &self.size())
            .field("align", &self.alignment())
            .finish()
    }
}

impl<B: ?Sized + 'static> RuntimeType<B> {
    /// Descriptor with the core feature set: size, alignment, destroy, move,
    /// RTTI and base upcast.
    pub fn of<C: 'static>() -> Self
    where
        B: BaseOf<C>,
    {
        Self {
            table: &CoreTable::<C, B>::TABLE,
        }
    }

    /// Core set plus `copy_construct`.
    pub fn of_copyable<C: 'static + TryClone>() -> Self
    where
        B: BaseOf<C>,
    {
        Self {
            table: &CopyableTable::<C, B>::TABLE,
        }
    }

    /// Core set plus `copy_construct`, `equals` and `hash` — the feature set
    /// the dense containers require.
    pub fn of_comparable<C>() -> Self
    where
        C: 'static + TryClone + PartialEq + Hash,
        B: BaseOf<C>,
    {
        Self {
            table: &ComparableTable::<C, B>::TABLE,
        }
    }

    /// Core set plus `copy_construct` and `default_construct` — enough for
    /// the dynamic put family of the queue.
    pub fn of_constructible<C>() -> Self
    where
        C: 'static + TryClone + TryDefault,
        B: BaseOf<C>,
    {
        Self {
            table: &ConstructibleTable::<C, B>::TABLE,
        }
    }

    /// Every feature: copy, default, hash, equals and stream I/O.
    pub fn of_full<C>() -> Self
    where
        C: 'static + TryClone + TryDefault + PartialEq + Hash + fmt::Display + FromStr,
        C::Err: fmt::Display,
        B: BaseOf<C>,
    {
        Self {
            table: &FullTable::<C, B>::TABLE,
        }
    }

    /// Size of the complete type, a non-zero multiple of
    /// [`alignment`](Self::alignment).
    #[inline]
    pub fn size(&self) -> usize {
        debug_assert_rtd_well_formed!(self.table.size, self.table.align);
        self.table.size
    }

    /// Alignment of the complete type, a power of two.
    #[inline]
    pub fn alignment(&self) -> usize {
        self.table.align
    }

    /// `TypeId` of the complete type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        (self.table.type_id)()
    }

    /// Display name of the complete type.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        (self.table.type_name)()
    }

    /// True if this descriptor describes `C`.
    #[inline]
    pub fn is<C: 'static>(&self) -> bool {
        self.type_id() == TypeId::of::<C>()
    }

    /// True if the optional feature `F` was selected when this descriptor was
    /// created.
    #[inline]
    pub fn has<F: Feature>(&self) -> bool {
        F::slot(self.table).is_some()
    }

    /// The erased function implementing feature `F`, if selected.
    #[inline]
    pub fn get<F: Feature>(&self) -> Option<F::Fn> {
        F::slot(self.table)
    }

    /// Drops the element in place. Nothrow; must be called at most once per
    /// constructed element.
    ///
    /// # Safety
    ///
    /// `obj` points to an initialized element of this complete type.
    #[inline]
    pub unsafe fn destroy(&self, obj: NonNull<u8>) {
        (self.table.drop_in_place)(obj.as_ptr());
    }

    /// Bitwise-moves the element from `src` to `dst`. Nothrow. After the
    /// call, `src` must be treated as moved-from and not dropped.
    ///
    /// # Safety
    ///
    /// Both pointers are aligned for this type; `src` is initialized; `dst`
    /// has room for [`size`](Self::size) bytes and does not overlap `src`.
    #[inline]
    pub unsafe fn move_construct(&self, dst: NonNull<u8>, src: NonNull<u8>) {
        (self.table.move_construct)(dst.as_ptr(), src.as_ptr());
    }

    /// Converts an element pointer to a pointer to the common base `B`.
    ///
    /// # Safety
    ///
    /// `obj` points to an initialized element of this complete type.
    #[inline]
    pub unsafe fn upcast(&self, obj: NonNull<u8>) -> NonNull<B> {
        NonNull::new_unchecked((self.table.upcast)(obj.as_ptr()))
    }

    /// Copy-constructs into `dst` from `src`. On failure nothing is
    /// constructed at `dst`.
    ///
    /// Calling this without the [`feature::CopyConstruct`] feature is a
    /// contract violation.
    ///
    /// # Safety
    ///
    /// `src` is an initialized element of this type; `dst` is writable,
    /// aligned storage of at least [`size`](Self::size) bytes.
    pub unsafe fn copy_construct(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
    ) -> Result<(), CtorError> {
        debug_assert!(self.has::<feature::CopyConstruct>(), "feature not selected");
        let f = self
            .table
            .copy_construct
            .expect("copy_construct feature not selected");
        f(dst.as_ptr(), src.as_ptr())
    }

    /// Default-constructs into `dst`. On failure nothing is constructed.
    ///
    /// Calling this without the [`feature::DefaultConstruct`] feature is a
    /// contract violation.
    ///
    /// # Safety
    ///
    /// `dst` is writable, aligned storage of at least [`size`](Self::size)
    /// bytes.
    pub unsafe fn default_construct(&self, dst: NonNull<u8>) -> Result<(), CtorError> {
        debug_assert!(
            self.has::<feature::DefaultConstruct>(),
            "feature not selected"
        );
        let f = self
            .table
            .default_construct
            .expect("default_construct feature not selected");
        f(dst.as_ptr())
    }

    /// Hashes the element.
    ///
    /// # Safety
    ///
    /// `obj` is an initialized element of this type; the [`feature::Hashing`]
    /// feature must be selected.
    pub unsafe fn hash(&self, obj: NonNull<u8>) -> u64 {
        debug_assert!(self.has::<feature::Hashing>(), "feature not selected");
        let f = self.table.hash.expect("hash feature not selected");
        f(obj.as_ptr())
    }

    /// Compares two elements of this complete type.
    ///
    /// # Safety
    ///
    /// Both pointers are initialized elements of this type; the
    /// [`feature::Equality`] feature must be selected.
    pub unsafe fn equals(&self, a: NonNull<u8>, b: NonNull<u8>) -> bool {
        debug_assert!(self.has::<feature::Equality>(), "feature not selected");
        let f = self.table.equals.expect("equals feature not selected");
        f(a.as_ptr(), b.as_ptr())
    }

    /// Formats the element into `out` via its Display impl.
    ///
    /// # Safety
    ///
    /// `obj` is an initialized element of this type; the
    /// [`feature::FmtWrite`] feature must be selected.
    pub unsafe fn fmt_element(
        &self,
        obj: NonNull<u8>,
        out: &mut dyn fmt::Write,
    ) -> Result<(), StreamError> {
        debug_assert!(self.has::<feature::FmtWrite>(), "feature not selected");
        let f = self.table.fmt_write.expect("fmt_write feature not selected");
        f(obj.as_ptr(), out)
    }

    /// Parses an element of this type out of `input` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` is writable, aligned storage of at least [`size`](Self::size)
    /// bytes; the [`feature::ParseRead`] feature must be selected. On failure
    /// nothing is constructed at `dst`.
    pub unsafe fn parse_into(&self, input: &str, dst: NonNull<u8>) -> Result<(), StreamError> {
        debug_assert!(self.has::<feature::ParseRead>(), "feature not selected");
        let f = self
            .table
            .parse_read
            .expect("parse_read feature not selected");
        f(input, dst.as_ptr())
    }
}

// Safety: the table is a static of fn pointers; descriptors carry no state.
unsafe impl<B: ?Sized + 'static> Send for RuntimeType<B> {}
unsafe impl<B: ?Sized + 'static> Sync for RuntimeType<B> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn test_core_descriptor() {
        let t = RuntimeType::<()>::of::<u64>();
        assert_eq!(t.size(), 8);
        assert_eq!(t.alignment(), 8);
        assert!(t.is::<u64>());
        assert!(!t.is::<u32>());
        assert!(t.type_name().contains("u64"));
        assert!(!t.has::<feature::CopyConstruct>());
    }

    #[test]
    fn test_descriptor_equality_is_type_identity() {
        let a = RuntimeType::<()>::of::<String>();
        let b = RuntimeType::<()>::of_full::<String>();
        assert_eq!(a, b);
        assert_ne!(a, RuntimeType::<()>::of::<u32>());
    }

    #[test]
    fn test_copy_construct_roundtrip() {
        let t = RuntimeType::<()>::of_copyable::<String>();
        let src = String::from("payload");
        let mut dst = MaybeUninit::<String>::uninit();
        unsafe {
            t.copy_construct(
                NonNull::new(dst.as_mut_ptr().cast()).unwrap(),
                NonNull::from(&src).cast(),
            )
            .unwrap();
            let copied = dst.assume_init();
            assert_eq!(copied, "payload");
        }
        assert_eq!(src, "payload");
    }

    #[test]
    fn test_equals_and_hash() {
        let t = RuntimeType::<()>::of_comparable::<i32>();
        let a = 7i32;
        let b = 7i32;
        let c = 8i32;
        unsafe {
            assert!(t.equals(NonNull::from(&a).cast(), NonNull::from(&b).cast()));
            assert!(!t.equals(NonNull::from(&a).cast(), NonNull::from(&c).cast()));
            assert_eq!(
                t.hash(NonNull::from(&a).cast()),
                t.hash(NonNull::from(&b).cast())
            );
        }
    }

    #[test]
    fn test_default_construct() {
        let t = RuntimeType::<()>::of_constructible::<u32>();
        let mut dst = MaybeUninit::<u32>::uninit();
        unsafe {
            t.default_construct(NonNull::new(dst.as_mut_ptr().cast()).unwrap())
                .unwrap();
            assert_eq!(dst.assume_init(), 0);
        }
    }

    #[test]
    fn test_stream_features() {
        let t = RuntimeType::<()>::of_full::<i32>();
        let v = 42i32;
        let mut out = String::new();
        unsafe {
            t.fmt_element(NonNull::from(&v).cast(), &mut out).unwrap();
        }
        assert_eq!(out, "42");

        let mut dst = MaybeUninit::<i32>::uninit();
        unsafe {
            t.parse_into("-9", NonNull::new(dst.as_mut_ptr().cast()).unwrap())
                .unwrap();
            assert_eq!(dst.assume_init(), -9);
        }

        let err = unsafe {
            t.parse_into("nope", NonNull::new(dst.as_mut_ptr().cast()).unwrap())
        };
        assert!(matches!(err, Err(StreamError::Parse(_))));
    }

    #[test]
    fn test_move_construct_is_bitwise() {
        let t = RuntimeType::<()>::of::<String>();
        let src = String::from("moved");
        let mut dst = MaybeUninit::<String>::uninit();
        unsafe {
            t.move_construct(
                NonNull::new(dst.as_mut_ptr().cast()).unwrap(),
                NonNull::from(&src).cast(),
            );
        }
        std::mem::forget(src);
        let moved = unsafe { dst.assume_init() };
        assert_eq!(moved, "moved");
    }

    trait Animal {
        fn legs(&self) -> u32;
    }

    struct Dog;

    impl Animal for Dog {
        fn legs(&self) -> u32 {
            4
        }
    }

    impl<C: Animal + 'static> BaseOf<C> for dyn Animal {
        fn upcast_ptr(ptr: *mut C) -> *mut Self {
            ptr
        }
    }

    #[test]
    fn test_upcast_to_trait_base() {
        let t = RuntimeType::<dyn Animal>::of::<Dog>();
        let dog = Dog;
        let base = unsafe { t.upcast(NonNull::from(&dog).cast()) };
        assert_eq!(unsafe { base.as_ref() }.legs(), 4);
    }

    struct FailingClone {
        fails: bool,
    }

    impl TryClone for FailingClone {
        fn try_clone(&self) -> Result<Self, CtorError> {
            if self.fails {
                Err(CtorError::new("refused"))
            } else {
                Ok(Self { fails: false })
            }
        }
    }

    #[test]
    fn test_copy_construct_failure_constructs_nothing() {
        let t = RuntimeType::<()>::of_copyable::<FailingClone>();
        let src = FailingClone { fails: true };
        let mut dst = MaybeUninit::<FailingClone>::uninit();
        let r = unsafe {
            t.copy_construct(
                NonNull::new(dst.as_mut_ptr().cast()).unwrap(),
                NonNull::from(&src).cast(),
            )
        };
        assert!(r.is_err());
    }
}
