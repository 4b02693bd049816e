//! The HTTP framing layer and its process-wide response configuration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::Error;

pub(crate) mod header;
pub(crate) mod reader;
mod xheaders;

pub use self::header::VerificationLevel;
pub use self::xheaders::XHeaders;

const PACKAGE_SERVER: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

// Response-side configuration: bools and ints are atomic for lock-free
// reads, strings sit behind a mutex. Set once before worker threads start.
static HIDE_SERVER_VERSION: AtomicBool = AtomicBool::new(false);
static SERVER_HEADER: Mutex<String> = Mutex::new(String::new());
static HSTS_ENABLED: AtomicBool = AtomicBool::new(false);
static HSTS_MAX_AGE: AtomicU64 = AtomicU64::new(31_536_000);
static CSP_POLICY: Mutex<String> = Mutex::new(String::new());

/// Replaces the `Server` response header with a custom string.
pub fn set_server_header(header: &str) -> crate::Result<()> {
    if header.contains(['\r', '\n']) {
        return Err(Error::new_http_parse().with("Server header contains CRLF characters"));
    }
    *SERVER_HEADER.lock().expect("server header lock") = header.to_owned();
    Ok(())
}

/// Suppresses the `Server` response header entirely.
pub fn hide_server_version(hide: bool) {
    HIDE_SERVER_VERSION.store(hide, Ordering::Relaxed);
}

/// Enables `Strict-Transport-Security` on responses. Only meaningful for
/// TLS servers.
pub fn enable_hsts(enable: bool, max_age_secs: u64) {
    HSTS_ENABLED.store(enable, Ordering::Relaxed);
    HSTS_MAX_AGE.store(max_age_secs, Ordering::Relaxed);
}

/// Sets a `Content-Security-Policy` emitted on every response; empty clears.
pub fn set_content_security_policy(policy: &str) -> crate::Result<()> {
    if policy.contains(['\r', '\n']) {
        return Err(Error::new_http_parse().with("CSP policy contains CRLF characters"));
    }
    *CSP_POLICY.lock().expect("csp lock") = policy.to_owned();
    Ok(())
}

pub(crate) fn server_header_value() -> Option<String> {
    if HIDE_SERVER_VERSION.load(Ordering::Relaxed) {
        return None;
    }
    let custom = SERVER_HEADER.lock().expect("server header lock");
    if custom.is_empty() {
        Some(PACKAGE_SERVER.to_owned())
    } else {
        Some(custom.clone())
    }
}

pub(crate) fn hsts_max_age() -> Option<u64> {
    if HSTS_ENABLED.load(Ordering::Relaxed) {
        Some(HSTS_MAX_AGE.load(Ordering::Relaxed))
    } else {
        None
    }
}

pub(crate) fn csp_policy() -> Option<String> {
    let policy = CSP_POLICY.lock().expect("csp lock");
    if policy.is_empty() {
        None
    } else {
        Some(policy.clone())
    }
}

pub(crate) fn standard_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad request",
        401 => "Unauthorized",
        405 => "Method not allowed",
        411 => "Content-Length Required",
        413 => "Request Entity Too Large",
        415 => "Unsupported media type",
        417 => "Expectation Failed",
        _ => "Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_crlf() {
        assert!(set_server_header("my-server 1.0").is_ok());
        assert!(set_server_header("evil\r\nx-injected: 1").is_err());
        assert!(set_content_security_policy("default-src 'none'").is_ok());
        assert!(set_content_security_policy("bad\npolicy").is_err());
        set_server_header("").unwrap();
        set_content_security_policy("").unwrap();
    }
}
