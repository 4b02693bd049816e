//! Checked size arithmetic for values derived from network input.
//!
//! Every place that accumulates a size from untrusted bytes (content-length
//! sums, base64 output estimates, send offsets, header dump reservations)
//! must go through these instead of bare `+` / `*`. A content-length close to
//! `usize::MAX`, added to already-buffered bytes, must never wrap to a small
//! number and slip past a size cap.

use crate::error::Error;

#[inline]
pub(crate) fn add(a: usize, b: usize) -> crate::Result<usize> {
    a.checked_add(b).ok_or_else(Error::new_overflow)
}

#[inline]
pub(crate) fn mul(a: usize, b: usize) -> crate::Result<usize> {
    a.checked_mul(b).ok_or_else(Error::new_overflow)
}

/// Adds `value` into `target`, returning the new value.
#[inline]
pub(crate) fn add_assign(target: &mut usize, value: usize) -> crate::Result<usize> {
    *target = add(*target, value)?;
    Ok(*target)
}

#[inline]
pub(crate) fn would_overflow_add(a: u64, b: u64) -> bool {
    b > u64::MAX - a
}

#[inline]
pub(crate) fn would_overflow_mul(a: usize, b: usize) -> bool {
    a != 0 && b > usize::MAX / a
}

/// Width-limited parse of a pure decimal unsigned number.
///
/// Stricter than `str::parse`: no sign, no leading `+`, no surrounding
/// whitespace, at least one digit, and the result must fit in `u64`.
pub(crate) fn parse_u64(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut n: u64 = 0;
    for b in s.bytes() {
        n = n.checked_mul(10)?.checked_add(u64::from(b - b'0'))?;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_detects_wraparound() {
        assert_eq!(add(1, 2).unwrap(), 3);
        assert_eq!(add(usize::MAX, 0).unwrap(), usize::MAX);
        assert!(add(usize::MAX, 1).is_err());
    }

    #[test]
    fn mul_detects_wraparound() {
        assert_eq!(mul(0, usize::MAX).unwrap(), 0);
        assert_eq!(mul(3, 4).unwrap(), 12);
        assert!(mul(usize::MAX / 2 + 1, 2).is_err());
    }

    #[test]
    fn add_assign_updates_in_place() {
        let mut total = 10;
        assert_eq!(add_assign(&mut total, 5).unwrap(), 15);
        assert_eq!(total, 15);
        assert!(add_assign(&mut total, usize::MAX).is_err());
        // target is left unchanged on failure
        assert_eq!(total, 15);
    }

    #[test]
    fn overflow_predicates() {
        assert!(!would_overflow_add(1, 2));
        assert!(would_overflow_add(u64::MAX, 1));
        assert!(!would_overflow_mul(0, usize::MAX));
        assert!(would_overflow_mul(usize::MAX, 2));
    }

    #[test]
    fn parse_u64_is_strict() {
        assert_eq!(parse_u64("0"), Some(0));
        assert_eq!(parse_u64("18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_u64("18446744073709551616"), None);
        assert_eq!(parse_u64(""), None);
        assert_eq!(parse_u64("+1"), None);
        assert_eq!(parse_u64("-1"), None);
        assert_eq!(parse_u64(" 1"), None);
        assert_eq!(parse_u64("12a"), None);
    }
}
