//! Validated `X-*` passthrough headers.

use std::collections::BTreeMap;

use crate::error::Error;

/// A set of application-defined `X-*` headers carried alongside a call.
///
/// Names are lowercased on insertion, must begin with `x-`, and neither
/// names nor values may contain CR or LF.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XHeaders {
    map: BTreeMap<String, String>,
}

impl XHeaders {
    pub fn new() -> XHeaders {
        XHeaders::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) -> crate::Result<()> {
        if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
            return Err(Error::new_http_parse().with("X-header contains CRLF characters"));
        }
        let name = name.to_ascii_lowercase();
        if !Self::is_valid_name(&name) {
            return Err(Error::new_http_parse().with("X-header name must begin with 'x-'"));
        }
        self.map.insert(name, value.to_owned());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn is_valid_name(lowercased: &str) -> bool {
        lowercased.len() > 2 && lowercased.starts_with("x-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_lowercased_and_prefixed() {
        let mut xh = XHeaders::new();
        xh.insert("X-Trace-Id", "abc").unwrap();
        assert_eq!(xh.get("x-trace-id"), Some("abc"));
        assert_eq!(xh.get("X-TRACE-ID"), Some("abc"));

        assert!(xh.insert("trace-id", "abc").is_err());
        assert!(xh.insert("x-", "abc").is_err());
    }

    #[test]
    fn crlf_is_rejected() {
        let mut xh = XHeaders::new();
        assert!(xh.insert("x-a\r\nx-b", "v").is_err());
        assert!(xh.insert("x-a", "v\r\nset-cookie: pwned").is_err());
    }
}
