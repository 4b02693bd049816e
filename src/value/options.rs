//! Process-wide value-model options.
//!
//! Each option is an independent atomic. A reader may transiently observe a
//! flag set by one writer and a value set by another; the caller contract is
//! that options are configured once at startup, before worker threads exist.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};

static DEFAULT_INT_SET: AtomicBool = AtomicBool::new(false);
static DEFAULT_INT: AtomicI32 = AtomicI32::new(0);

static DEFAULT_INT64_SET: AtomicBool = AtomicBool::new(false);
static DEFAULT_INT64: AtomicI64 = AtomicI64::new(0);

static OMIT_STRING_TAG: AtomicBool = AtomicBool::new(false);

/// Registers (or clears) the value a parsed empty `<int></int>` element
/// becomes. With no default configured, an empty numeric element is a parse
/// violation.
pub fn set_default_int(value: Option<i32>) {
    match value {
        Some(v) => {
            DEFAULT_INT.store(v, Ordering::Relaxed);
            DEFAULT_INT_SET.store(true, Ordering::Relaxed);
        }
        None => DEFAULT_INT_SET.store(false, Ordering::Relaxed),
    }
}

pub fn default_int() -> Option<i32> {
    if DEFAULT_INT_SET.load(Ordering::Relaxed) {
        Some(DEFAULT_INT.load(Ordering::Relaxed))
    } else {
        None
    }
}

/// Registers (or clears) the value a parsed empty `<i8></i8>` element becomes.
pub fn set_default_int64(value: Option<i64>) {
    match value {
        Some(v) => {
            DEFAULT_INT64.store(v, Ordering::Relaxed);
            DEFAULT_INT64_SET.store(true, Ordering::Relaxed);
        }
        None => DEFAULT_INT64_SET.store(false, Ordering::Relaxed),
    }
}

pub fn default_int64() -> Option<i64> {
    if DEFAULT_INT64_SET.load(Ordering::Relaxed) {
        Some(DEFAULT_INT64.load(Ordering::Relaxed))
    } else {
        None
    }
}

/// Forces response-side omission of the `<string>` wrapper tag, producing
/// `<value>text</value>` instead of `<value><string>text</string></value>`.
pub fn set_omit_string_tag(omit: bool) {
    OMIT_STRING_TAG.store(omit, Ordering::Relaxed);
}

pub fn omit_string_tag() -> bool {
    OMIT_STRING_TAG.load(Ordering::Relaxed)
}

// Unit tests touching these globals run threaded within one binary; tests
// that write an option must hold this lock so unrelated assertions about the
// defaults don't interleave with a temporarily-set option.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_unset() {
        let _guard = test_lock();
        assert_eq!(default_int(), None);
        assert_eq!(default_int64(), None);
        assert!(!omit_string_tag());
    }

    #[test]
    fn set_and_clear() {
        let _guard = test_lock();
        set_default_int(Some(-7));
        set_default_int64(Some(1 << 40));
        assert_eq!(default_int(), Some(-7));
        assert_eq!(default_int64(), Some(1 << 40));
        set_default_int(None);
        set_default_int64(None);
        assert_eq!(default_int(), None);
        assert_eq!(default_int64(), None);
    }
}
