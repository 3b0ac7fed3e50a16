//! Fixed-point rate arithmetic.
//!
//! Every rate, activity level and buffer level in the solver is a Q32.32
//! [`Fixed64`]. Results are therefore bit-identical across hosts, which is
//! what makes repeated solves and replayed runs comparable by hash.
//!
//! "No limit" is represented by [`UNBOUNDED`] (`Fixed64::MAX`). The helpers
//! in this module treat it as absorbing: scaling or adding an unbounded value
//! stays unbounded instead of wrapping.

use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
pub type Fixed64 = I32F32;

/// Items per second.
pub type Rate = Fixed64;

/// Sentinel for an absent rate ceiling.
pub const UNBOUNDED: Fixed64 = Fixed64::MAX;

/// Convert an f64 to Fixed64, saturating at the range ends. Use only for
/// initialization, never in the solve loop. Panics on NaN.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::saturating_from_num(v)
}

/// Like [`f64_to_fixed64`] but returns `None` for NaN or out-of-range input.
#[inline]
pub fn try_f64_to_fixed64(v: f64) -> Option<Fixed64> {
    if v.is_nan() {
        return None;
    }
    Fixed64::checked_from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in the solve loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Resolve an optional capacity into a limit value.
#[inline]
pub fn limit_of(capacity: Option<Fixed64>) -> Fixed64 {
    capacity.unwrap_or(UNBOUNDED)
}

#[inline]
pub fn is_unbounded(v: Fixed64) -> bool {
    v == UNBOUNDED
}

/// Saturating product. An unbounded factor times a positive factor is unbounded.
#[inline]
pub fn mul_rate(a: Fixed64, b: Fixed64) -> Fixed64 {
    if a <= Fixed64::ZERO || b <= Fixed64::ZERO {
        return Fixed64::ZERO;
    }
    if is_unbounded(a) || is_unbounded(b) {
        return UNBOUNDED;
    }
    a.saturating_mul(b)
}

/// Saturating quotient. Dividing by zero yields [`UNBOUNDED`] for a positive
/// dividend and zero otherwise.
#[inline]
pub fn div_rate(a: Fixed64, b: Fixed64) -> Fixed64 {
    if a <= Fixed64::ZERO {
        return Fixed64::ZERO;
    }
    if is_unbounded(a) || b <= Fixed64::ZERO {
        return UNBOUNDED;
    }
    a.checked_div(b).unwrap_or(UNBOUNDED)
}

/// Saturating sum that keeps [`UNBOUNDED`] absorbing.
#[inline]
pub fn add_rate(a: Fixed64, b: Fixed64) -> Fixed64 {
    if is_unbounded(a) || is_unbounded(b) {
        return UNBOUNDED;
    }
    a.saturating_add(b)
}

/// `a - b` clamped at zero.
#[inline]
pub fn sub_floor(a: Fixed64, b: Fixed64) -> Fixed64 {
    if is_unbounded(a) {
        return UNBOUNDED;
    }
    if a > b { a - b } else { Fixed64::ZERO }
}

/// Absolute difference of two non-negative values.
#[inline]
pub fn abs_diff(a: Fixed64, b: Fixed64) -> Fixed64 {
    if a > b { a - b } else { b - a }
}

#[inline]
pub fn approx_eq(a: Fixed64, b: Fixed64, tolerance: Fixed64) -> bool {
    abs_diff(a, b) <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_basic_arithmetic() {
        let a = f64_to_fixed64(1.5);
        let b = f64_to_fixed64(2.0);
        assert_eq!(fixed64_to_f64(a + b), 3.5);
    }

    #[test]
    fn unbounded_is_absorbing() {
        let two = f64_to_fixed64(2.0);
        assert_eq!(mul_rate(UNBOUNDED, two), UNBOUNDED);
        assert_eq!(add_rate(UNBOUNDED, two), UNBOUNDED);
        assert_eq!(div_rate(UNBOUNDED, two), UNBOUNDED);
        assert_eq!(sub_floor(UNBOUNDED, two), UNBOUNDED);
    }

    #[test]
    fn mul_by_zero_is_zero_even_when_unbounded() {
        assert_eq!(mul_rate(UNBOUNDED, Fixed64::ZERO), Fixed64::ZERO);
    }

    #[test]
    fn div_by_zero_saturates() {
        let one = Fixed64::ONE;
        assert_eq!(div_rate(one, Fixed64::ZERO), UNBOUNDED);
        assert_eq!(div_rate(Fixed64::ZERO, Fixed64::ZERO), Fixed64::ZERO);
    }

    #[test]
    fn large_products_saturate_instead_of_wrapping() {
        let big = f64_to_fixed64(1.0e9);
        assert_eq!(mul_rate(big, big), Fixed64::MAX);
    }

    #[test]
    fn sub_floor_clamps_at_zero() {
        let a = f64_to_fixed64(1.0);
        let b = f64_to_fixed64(3.0);
        assert_eq!(sub_floor(a, b), Fixed64::ZERO);
        assert_eq!(sub_floor(b, a), f64_to_fixed64(2.0));
    }

    #[test]
    fn try_conversion_rejects_nan_and_overflow() {
        assert!(try_f64_to_fixed64(f64::NAN).is_none());
        assert!(try_f64_to_fixed64(1.0e30).is_none());
        assert_eq!(try_f64_to_fixed64(0.5), Some(f64_to_fixed64(0.5)));
    }

    #[test]
    fn fixed64_determinism() {
        let a = f64_to_fixed64(1.0 / 3.0);
        let b = f64_to_fixed64(1.0 / 3.0);
        assert_eq!(a * f64_to_fixed64(3.0), b * f64_to_fixed64(3.0));
    }
}
