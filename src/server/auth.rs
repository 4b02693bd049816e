//! HTTP Basic authentication plugin interface.

/// Decides whether a request's credentials admit it.
///
/// Implementations MUST compare secrets with [`constant_time_eq`] (or an
/// equivalent) — never with `==` — so response timing does not leak where
/// the first mismatching byte sits.
pub trait AuthPlugin: Send + Sync + 'static {
    /// Called with the decoded user and password of a request carrying
    /// `Authorization: Basic` credentials.
    fn authenticate(&self, user: &str, password: &str) -> bool;

    /// Decides whether requests without credentials are admitted.
    fn authenticate_anonymous(&self) -> bool {
        false
    }
}

/// Length-oblivious constant-time byte comparison.
///
/// Iterates over the longer input, folding every byte pair into an
/// accumulator, so the running time is independent of the position of the
/// first mismatch and of `b`'s length for a fixed `a`.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());
    for i in 0..max {
        let ca = a.get(i).copied().unwrap_or(0);
        let cb = b.get(i).copied().unwrap_or(0);
        diff = std::hint::black_box(diff | (ca ^ cb));
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_compare_equal() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"secret", b"secret"));
    }

    #[test]
    fn unequal_inputs_compare_unequal() {
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"Secret"));
        assert!(!constant_time_eq(b"secret", b"secret "));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
