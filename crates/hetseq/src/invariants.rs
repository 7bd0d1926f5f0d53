//! Debug assertion macros for container and queue invariants.
//!
//! Only active in debug builds (`debug_assert!`), so there is zero overhead
//! in release builds. Contract violations (broken preconditions) are
//! asserted here rather than turned into runtime errors.

// =============================================================================
// INV-RTD-01: descriptor well-formedness
// =============================================================================

/// Assert that a descriptor's size is a non-zero multiple of its alignment
/// and that the alignment is a power of two.
macro_rules! debug_assert_rtd_well_formed {
    ($size:expr, $align:expr) => {
        debug_assert!(
            $size != 0 && $align.is_power_of_two() && $size % $align == 0,
            "INV-RTD-01 violated: size {} / alignment {}",
            $size,
            $align
        )
    };
}

// =============================================================================
// INV-DENSE-01: packed payload derivation
// =============================================================================

/// Assert that a payload lies inside the block it was derived for.
macro_rules! debug_assert_in_block {
    ($addr:expr, $start:expr, $end:expr) => {
        debug_assert!(
            $addr >= $start && $addr <= $end,
            "INV-DENSE-01 violated: address {:#x} outside block [{:#x}, {:#x}]",
            $addr,
            $start,
            $end
        )
    };
}

// =============================================================================
// INV-Q-01: control block state transitions
// =============================================================================

/// Assert that a claim observed the element in the READY state.
macro_rules! debug_assert_claimable {
    ($word:expr) => {
        debug_assert!(
            $word & (crate::queue::layout::BUSY | crate::queue::layout::DEAD) == 0,
            "INV-Q-01 violated: claiming a block in state {:#x}",
            $word & crate::queue::layout::STATE_MASK
        )
    };
}

/// Assert that commit/cancel operate on a claimed (BUSY) block.
macro_rules! debug_assert_claimed {
    ($word:expr) => {
        debug_assert!(
            $word & crate::queue::layout::BUSY != 0
                && $word & crate::queue::layout::DEAD == 0,
            "INV-Q-01 violated: finalizing a block in state {:#x}",
            $word & crate::queue::layout::STATE_MASK
        )
    };
}

// =============================================================================
// INV-Q-02: pin balance
// =============================================================================

/// Assert that an unpin had a matching pin.
macro_rules! debug_assert_pin_balance {
    ($prev:expr) => {
        debug_assert!(
            $prev & !crate::queue::layout::PAGE_RETIRED != 0,
            "INV-Q-02 violated: unpinning a page with pin count 0"
        )
    };
}

// =============================================================================
// INV-Q-03: allocation granularity
// =============================================================================

/// Assert that a control block address leaves the state bits free.
macro_rules! debug_assert_granular {
    ($addr:expr) => {
        debug_assert!(
            $addr % crate::queue::layout::GRANULARITY == 0,
            "INV-Q-03 violated: control block at {:#x} not {}-byte aligned",
            $addr,
            crate::queue::layout::GRANULARITY
        )
    };
}

pub(crate) use debug_assert_claimable;
pub(crate) use debug_assert_claimed;
pub(crate) use debug_assert_granular;
pub(crate) use debug_assert_in_block;
pub(crate) use debug_assert_pin_balance;
pub(crate) use debug_assert_rtd_well_formed;
