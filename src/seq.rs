//! Wraparound-aware arithmetic over 32-bit TCP sequence space.
//!
//! Sequence numbers, ack numbers, and timestamp-option values all live in
//! a u32 space that wraps. Ordering between two values is decided by the
//! sign of their wrapped difference: `b` is at or after `a` when
//! `(b - a) mod 2^32` lands in the lower half of the space.

/// True when `b` is at or after `a` in sequence space.
#[inline]
pub fn at_or_after(b: u32, a: u32) -> bool {
    b.wrapping_sub(a) as i32 >= 0
}

/// True when `b` is strictly before `a` in sequence space (wrapped or
/// out of order).
#[inline]
pub fn before(b: u32, a: u32) -> bool {
    !at_or_after(b, a)
}

/// Forward distance from `a` to `b`, assuming `b` is at or after `a`.
#[inline]
pub fn distance(a: u32, b: u32) -> u32 {
    b.wrapping_sub(a)
}
