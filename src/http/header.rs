//! The HTTP envelope: header model, request/response heads, packets.
//!
//! Field names are case-insensitive on parse and lowercased on emit.
//! Every set validates name and value against CR/LF; three built-in
//! validators fire per verification level on admission from the wire.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::common::num;
use crate::error::{Direction, Error};
use crate::value::base64;

use super::{csp_policy, hsts_max_age, server_header_value, XHeaders};

pub(crate) const MAX_HEADERS: usize = 100;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

pub(crate) mod names {
    pub(crate) const CONTENT_LENGTH: &str = "content-length";
    pub(crate) const CONTENT_TYPE: &str = "content-type";
    pub(crate) const CONNECTION: &str = "connection";
    pub(crate) const HOST: &str = "host";
    pub(crate) const USER_AGENT: &str = "user-agent";
    pub(crate) const SERVER: &str = "server";
    pub(crate) const DATE: &str = "date";
    pub(crate) const AUTHORIZATION: &str = "authorization";
    pub(crate) const EXPECT: &str = "expect";
    pub(crate) const TRANSFER_ENCODING: &str = "transfer-encoding";
}

/// Strictness knob for header admission.
///
/// `Weak` tolerates unknown content types; `Strict` additionally requires a
/// `content-type` containing `text/xml`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerificationLevel {
    #[default]
    Weak,
    Strict,
}

#[derive(Debug)]
pub(crate) struct Header {
    fields: BTreeMap<String, String>,
    level: VerificationLevel,
}

impl Header {
    pub(crate) fn new(level: VerificationLevel) -> Header {
        let mut h = Header {
            fields: BTreeMap::new(),
            level,
        };
        h.fields
            .insert(names::CONNECTION.to_owned(), "close".to_owned());
        h
    }

    /// Sets a field, replacing any previous value.
    pub(crate) fn set(&mut self, name: &str, value: &str) -> crate::Result<()> {
        validate_crlf(name, value)?;
        self.fields
            .insert(name.to_ascii_lowercase(), value.to_owned());
        Ok(())
    }

    pub(crate) fn set_default(&mut self, name: &str, value: &str) {
        self.fields
            .entry(name.to_owned())
            .or_insert_with(|| value.to_owned());
    }

    /// Admits a field from the wire: runs the built-in validators for the
    /// configured verification level, then sets.
    pub(crate) fn set_checked(&mut self, name: String, value: String) -> crate::Result<()> {
        match name.as_str() {
            names::CONTENT_LENGTH => {
                if num::parse_u64(&value).is_none() {
                    return Err(Error::new_http_parse().with("bad format of numeric option"));
                }
            }
            names::EXPECT => {
                if !value.to_ascii_lowercase().starts_with("100-continue") {
                    return Err(Error::new_status(417));
                }
            }
            names::CONTENT_TYPE if self.level >= VerificationLevel::Strict => {
                if !value.to_ascii_lowercase().contains("text/xml") {
                    return Err(Error::new_status_msg(
                        415,
                        format!("Unsupported media type '{}'", sanitize_token(&value)),
                    ));
                }
            }
            _ => {}
        }
        validate_crlf(&name, &value)?;
        self.fields.insert(name, value);
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// The declared content length; its absence is a 411.
    pub(crate) fn content_length(&self) -> crate::Result<u64> {
        let raw = self.get(names::CONTENT_LENGTH).ok_or_else(|| {
            Error::new_status(411)
        })?;
        // admission already validated the format
        num::parse_u64(raw).ok_or_else(Error::new_http_parse)
    }

    pub(crate) fn set_content_length(&mut self, len: usize) {
        let mut buf = itoa::Buffer::new();
        self.fields
            .insert(names::CONTENT_LENGTH.to_owned(), buf.format(len).to_owned());
        if len > 0 {
            self.fields
                .insert(names::CONTENT_TYPE.to_owned(), "text/xml".to_owned());
        }
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.get(names::CONNECTION)
            .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"))
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.fields.insert(
            names::CONNECTION.to_owned(),
            if keep_alive { "keep-alive" } else { "close" }.to_owned(),
        );
    }

    pub(crate) fn expect_continue(&self) -> bool {
        self.contains(names::EXPECT)
    }

    /// True when the body uses chunked transfer coding. A transfer-encoding
    /// whose final coding is not `chunked` is malformed.
    pub(crate) fn chunked(&self) -> crate::Result<bool> {
        match self.get(names::TRANSFER_ENCODING) {
            None => Ok(false),
            Some(v) => match v.rsplit(',').next() {
                Some(last) if last.trim().eq_ignore_ascii_case("chunked") => Ok(true),
                _ => Err(Error::new_http_parse()
                    .with("transfer-encoding without final chunked coding")),
            },
        }
    }

    pub(crate) fn xheaders(&self) -> XHeaders {
        let mut out = XHeaders::new();
        for (name, value) in &self.fields {
            if XHeaders::is_valid_name(name) {
                // already lowercased and CRLF-free
                let _ = out.insert(name, value);
            }
        }
        out
    }

    pub(crate) fn set_xheaders(&mut self, xheaders: &XHeaders) -> crate::Result<()> {
        for (name, value) in xheaders.iter() {
            self.set(name, value)?;
        }
        Ok(())
    }

    pub(crate) fn dump_into(&self, out: &mut String) {
        // ~64 bytes per field is a decent estimate; skip on wraparound
        if let Ok(fields_size) = num::mul(self.fields.len(), 64) {
            if num::add(out.len(), fields_size).and_then(|n| num::add(n, 4)).is_ok() {
                out.reserve(fields_size + 4);
            }
        }
        for (name, value) in &self.fields {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }
}

fn validate_crlf(name: &str, value: &str) -> crate::Result<()> {
    if name.contains(['\r', '\n']) {
        return Err(Error::new_http_parse().with("header name contains CRLF characters"));
    }
    if value.contains(['\r', '\n']) {
        return Err(Error::new_http_parse().with("header value contains CRLF characters"));
    }
    Ok(())
}

// Printable ASCII only, capped, for echoing peer input in a phrase.
fn sanitize_token(s: &str) -> String {
    let mut out: String = s
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .take(64)
        .collect();
    if s.len() > 64 {
        out.push_str("...");
    }
    out
}

/// One side's message head; implemented by request and response heads so
/// the packet reader can stay generic over direction.
pub(crate) trait Head: Sized {
    const DIRECTION: Direction;

    /// Attempts to parse a complete head from the front of `buf`.
    /// `None` means more bytes are needed.
    fn parse(buf: &[u8], level: VerificationLevel) -> crate::Result<Option<(Self, usize)>>;

    fn header(&self) -> &Header;

    fn header_mut(&mut self) -> &mut Header;

    fn dump_head(&self) -> String;
}

#[derive(Debug)]
pub(crate) struct RequestHeader {
    head: Header,
    uri: String,
}

impl RequestHeader {
    pub(crate) fn new(uri: &str, vhost: &str, port: u16) -> RequestHeader {
        let mut head = Header::new(VerificationLevel::Weak);
        let mut host = String::with_capacity(vhost.len() + 6);
        host.push_str(vhost);
        host.push(':');
        let mut buf = itoa::Buffer::new();
        host.push_str(buf.format(port));
        head.fields.insert(names::HOST.to_owned(), host);
        head.fields
            .insert(names::USER_AGENT.to_owned(), USER_AGENT.to_owned());
        RequestHeader {
            head,
            uri: uri.to_owned(),
        }
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn set_authinfo(&mut self, user: &str, password: &str) -> crate::Result<()> {
        let mut plain = Vec::with_capacity(user.len() + password.len() + 1);
        plain.extend_from_slice(user.as_bytes());
        plain.push(b':');
        plain.extend_from_slice(password.as_bytes());
        let value = format!("Basic {}", base64::encode(&plain));
        self.head.set(names::AUTHORIZATION, &value)
    }

    pub(crate) fn has_authinfo(&self) -> bool {
        self.head.contains(names::AUTHORIZATION)
    }

    /// Decodes `Authorization: Basic` credentials. The user is everything
    /// before the first `:`, the password everything after.
    pub(crate) fn authinfo(&self) -> crate::Result<(String, String)> {
        let raw = self
            .head
            .get(names::AUTHORIZATION)
            .ok_or_else(|| Error::new_status(401))?;
        let mut it = raw.split_ascii_whitespace();
        let (scheme, payload) = match (it.next(), it.next(), it.next()) {
            (Some(s), Some(p), None) => (s, p),
            _ => return Err(Error::new_status(401)),
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(Error::new_status(401));
        }
        let decoded = base64::decode(payload.as_bytes()).map_err(|_| Error::new_status(401))?;
        let text = String::from_utf8(decoded).map_err(|_| Error::new_status(401))?;
        match text.find(':') {
            Some(pos) => Ok((text[..pos].to_owned(), text[pos + 1..].to_owned())),
            None => Ok((text, String::new())),
        }
    }
}

impl Head for RequestHeader {
    const DIRECTION: Direction = Direction::Request;

    fn parse(buf: &[u8], level: VerificationLevel) -> crate::Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let n = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::new_http_parse().with(e)),
        };

        if req.method != Some("POST") {
            return Err(Error::new_status(405));
        }
        let uri = req.path.unwrap_or("/").to_owned();

        let mut head = Header::new(level);
        for h in req.headers.iter() {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::new_http_parse().with("non-UTF-8 header value"))?;
            head.set_checked(h.name.to_ascii_lowercase(), value.to_owned())?;
        }
        head.set_default(names::HOST, "");
        head.set_default(names::USER_AGENT, "unknown");

        Ok(Some((RequestHeader { head, uri }, n)))
    }

    fn header(&self) -> &Header {
        &self.head
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.head
    }

    fn dump_head(&self) -> String {
        let mut out = String::with_capacity(self.uri.len() + 16);
        out.push_str("POST ");
        out.push_str(&self.uri);
        out.push_str(" HTTP/1.0\r\n");
        out
    }
}

#[derive(Debug)]
pub(crate) struct ResponseHeader {
    head: Header,
    code: u16,
    phrase: String,
}

impl ResponseHeader {
    /// Builds an outgoing response head with the standard security fields,
    /// a `Date`, and the configured `Server` header.
    pub(crate) fn new(code: u16, phrase: &str) -> ResponseHeader {
        let mut head = Header::new(VerificationLevel::Weak);
        head.fields.insert(
            names::DATE.to_owned(),
            httpdate::fmt_http_date(SystemTime::now()),
        );
        if let Some(server) = server_header_value() {
            head.fields.insert(names::SERVER.to_owned(), server);
        }
        head.fields
            .insert("x-content-type-options".to_owned(), "nosniff".to_owned());
        head.fields
            .insert("x-frame-options".to_owned(), "DENY".to_owned());
        head.fields
            .insert("cache-control".to_owned(), "no-store".to_owned());
        if let Some(max_age) = hsts_max_age() {
            let mut buf = itoa::Buffer::new();
            head.fields.insert(
                "strict-transport-security".to_owned(),
                format!("max-age={}", buf.format(max_age)),
            );
        }
        if let Some(policy) = csp_policy() {
            head.fields
                .insert("content-security-policy".to_owned(), policy);
        }
        ResponseHeader {
            head,
            code,
            phrase: phrase.to_owned(),
        }
    }

    pub(crate) fn code(&self) -> u16 {
        self.code
    }

    pub(crate) fn phrase(&self) -> &str {
        &self.phrase
    }
}

impl Head for ResponseHeader {
    const DIRECTION: Direction = Direction::Response;

    fn parse(buf: &[u8], level: VerificationLevel) -> crate::Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        let n = match resp.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::new_http_parse().with(e)),
        };

        let code = resp.code.ok_or_else(Error::new_http_parse)?;
        let phrase = resp.reason.unwrap_or("").to_owned();

        let mut head = Header::new(level);
        for h in resp.headers.iter() {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| Error::new_http_parse().with("non-UTF-8 header value"))?;
            head.set_checked(h.name.to_ascii_lowercase(), value.to_owned())?;
        }
        head.set_default(names::SERVER, "unknown");

        Ok(Some((ResponseHeader { head, code, phrase }, n)))
    }

    fn header(&self) -> &Header {
        &self.head
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.head
    }

    fn dump_head(&self) -> String {
        let mut buf = itoa::Buffer::new();
        let code = buf.format(self.code);
        let mut out = String::with_capacity(self.phrase.len() + 16);
        out.push_str("HTTP/1.1 ");
        out.push_str(code);
        out.push(' ');
        out.push_str(&self.phrase);
        out.push_str("\r\n");
        out
    }
}

/// A complete HTTP envelope: head plus body, with the body length recorded
/// in the head before the packet is handed anywhere.
#[derive(Debug)]
pub(crate) struct Packet<H> {
    pub(crate) head: H,
    pub(crate) body: Vec<u8>,
}

impl<H: Head> Packet<H> {
    pub(crate) fn new(mut head: H, body: Vec<u8>) -> Packet<H> {
        head.header_mut().set_content_length(body.len());
        Packet { head, body }
    }

    // For packets assembled by the reader, whose head already carries the
    // declared length.
    pub(crate) fn assembled(head: H, body: Vec<u8>) -> Packet<H> {
        Packet { head, body }
    }

    pub(crate) fn set_keep_alive(&mut self, keep_alive: bool) {
        self.head.header_mut().set_keep_alive(keep_alive);
    }

    pub(crate) fn dump(&self) -> Vec<u8> {
        let mut head = self.head.dump_head();
        self.head.header().dump_into(&mut head);
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}
