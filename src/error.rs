//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have xylo `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling XML-RPC streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// An HTTP-level error response (server will emit it; client saw it).
    Status(u16),
    /// A size cap was exceeded while reading a message.
    TooLarge(Direction),
    /// No dispatcher produced a method for the (sanitized) name.
    UnknownMethod(String),
    /// Method parameters did not match what the method expects.
    InvalidParams,
    /// Checked size arithmetic detected a wraparound.
    Overflow,
    /// A hostname failed address-value validation.
    Addr,
    /// An `io::Error` occurred on a network stream.
    Io,
    /// Error while establishing a client connection.
    Connect,
    /// Error creating the server listener.
    Listen,
    /// Error accepting a connection.
    Accept,
    /// Error in the TLS layer.
    Tls,
    /// A client call ran out of time.
    Timeout,
    /// The peer closed the connection before a message completed.
    Closed,
    /// A pending execution was dropped before producing a response.
    Canceled,
}

#[derive(Debug)]
pub(crate) enum Parse {
    /// The XML token stream itself was malformed.
    Xml,
    /// XML nesting exceeded the depth cap.
    Depth,
    /// The document exceeded the element-count cap.
    ElementCount,
    /// Well-formed XML that violates the XML-RPC grammar.
    Violation,
    /// Failure while serializing XML.
    Build,
    /// Malformed base64 payload.
    Base64,
    /// Malformed ISO-8601 datetime.
    DateTime,
    /// Malformed HTTP head.
    Http,
}

/// Whether a size cap tripped on the read (request) or write-back (response)
/// side; decides between HTTP 413 and a client-side `Response_too_large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Request,
    Response,
}

impl Error {
    /// Returns true if this error was caused by a message exceeding a size cap.
    pub fn is_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::TooLarge(_))
    }

    /// Returns true if an over-large *response* tripped the client's cap.
    pub fn is_response_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::TooLarge(Direction::Response))
    }

    /// Returns true if this was a parse error (XML or HTTP).
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if the peer closed the connection mid-message.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true for I/O errors on a network stream.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if a pending execution was dropped before completing.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true for errors raised while connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// The HTTP status code carried by this error, if any.
    ///
    /// For a client this is the non-200 code of an error response; for a
    /// server it is the code about to be emitted.
    pub fn status(&self) -> Option<u16> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            Kind::TooLarge(Direction::Request) => Some(413),
            Kind::Parse(Parse::Http) => Some(400),
            _ => None,
        }
    }

    /// The XML-RPC fault code a server maps this error to.
    pub fn fault_code(&self) -> i32 {
        match self.inner.kind {
            Kind::Parse(Parse::Xml)
            | Kind::Parse(Parse::Depth)
            | Kind::Parse(Parse::ElementCount) => -32700,
            Kind::Parse(Parse::Violation)
            | Kind::Parse(Parse::Base64)
            | Kind::Parse(Parse::DateTime) => -32600,
            Kind::Parse(Parse::Build) => -32705,
            Kind::UnknownMethod(_) => -32601,
            Kind::InvalidParams => -32602,
            _ => -32000,
        }
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_xml<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Parse(Parse::Xml)).with(cause)
    }

    pub(crate) fn new_depth(depth: usize, max: usize) -> Error {
        Error::new(Kind::Parse(Parse::Depth))
            .with(format!("maximum XML depth exceeded ({} > {})", depth, max))
    }

    pub(crate) fn new_element_count(count: usize, max: usize) -> Error {
        Error::new(Kind::Parse(Parse::ElementCount)).with(format!(
            "maximum XML element count exceeded ({} > {})",
            count, max
        ))
    }

    pub(crate) fn new_violation(context: String) -> Error {
        Error::new(Kind::Parse(Parse::Violation)).with(context)
    }

    pub(crate) fn new_build<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Parse(Parse::Build)).with(cause)
    }

    pub(crate) fn new_base64() -> Error {
        Error::new(Kind::Parse(Parse::Base64))
    }

    pub(crate) fn new_datetime() -> Error {
        Error::new(Kind::Parse(Parse::DateTime))
    }

    pub(crate) fn new_http_parse() -> Error {
        Error::new(Kind::Parse(Parse::Http))
    }

    pub(crate) fn new_status(code: u16) -> Error {
        Error::new(Kind::Status(code))
    }

    pub(crate) fn new_status_msg(code: u16, phrase: impl Into<String>) -> Error {
        Error::new(Kind::Status(code)).with(phrase.into())
    }

    pub(crate) fn new_too_large(dir: Direction) -> Error {
        Error::new(Kind::TooLarge(dir))
    }

    pub(crate) fn new_unknown_method(raw_name: &str) -> Error {
        Error::new(Kind::UnknownMethod(sanitize_method_name(raw_name)))
    }

    pub(crate) fn new_invalid_params() -> Error {
        Error::new(Kind::InvalidParams)
    }

    pub(crate) fn new_overflow() -> Error {
        Error::new(Kind::Overflow)
    }

    pub(crate) fn new_addr() -> Error {
        Error::new(Kind::Addr)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_connect<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_listen<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_tls<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Xml) => "invalid XML parsed",
            Kind::Parse(Parse::Depth) => "XML nesting depth cap exceeded",
            Kind::Parse(Parse::ElementCount) => "XML element count cap exceeded",
            Kind::Parse(Parse::Violation) => "XML-RPC violation",
            Kind::Parse(Parse::Build) => "XML build error",
            Kind::Parse(Parse::Base64) => "malformed base64 data",
            Kind::Parse(Parse::DateTime) => "malformed ISO-8601 datetime",
            Kind::Parse(Parse::Http) => "malformed HTTP packet",
            Kind::Status(_) => "HTTP error response",
            Kind::TooLarge(Direction::Request) => "request entity too large",
            Kind::TooLarge(Direction::Response) => "response entity too large",
            Kind::UnknownMethod(_) => "unknown method",
            Kind::InvalidParams => "invalid method parameters",
            Kind::Overflow => "integer overflow detected",
            Kind::Addr => "invalid network address",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            Kind::Listen => "error creating server listener",
            Kind::Accept => "error accepting connection",
            Kind::Tls => "TLS error",
            Kind::Timeout => "operation timed out",
            Kind::Closed => "connection closed before message completed",
            Kind::Canceled => "execution was canceled",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("xylo::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::UnknownMethod(ref name) => {
                return write!(f, "method '{}' not found", name);
            }
            Kind::Status(code) => {
                write!(f, "HTTP error {}", code)?;
            }
            _ => f.write_str(self.description())?,
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

/// Strips a method name down to something safe to echo in errors and logs.
///
/// Keeps alphanumerics, `.`, `_` and `:`, capped at 128 bytes with a trailing
/// ellipsis, so adversarial names cannot flow into logs verbatim.
pub(crate) fn sanitize_method_name(name: &str) -> String {
    const MAX_LEN: usize = 128;
    let mut out = String::with_capacity(name.len().min(MAX_LEN));
    for c in name.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == ':' {
            out.push(c);
        }
    }
    if name.len() > MAX_LEN {
        out.push_str("...");
    }
    out
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn fault_codes() {
        assert_eq!(Error::new_xml("boom").fault_code(), -32700);
        assert_eq!(Error::new_violation("/x".into()).fault_code(), -32600);
        assert_eq!(Error::new_unknown_method("nope").fault_code(), -32601);
        assert_eq!(Error::new_invalid_params().fault_code(), -32602);
        assert_eq!(Error::new_build("x").fault_code(), -32705);
        assert_eq!(Error::new_timeout().fault_code(), -32000);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Error::new_status(401).status(), Some(401));
        assert_eq!(Error::new_too_large(Direction::Request).status(), Some(413));
        assert_eq!(Error::new_too_large(Direction::Response).status(), None);
        assert_eq!(Error::new_http_parse().status(), Some(400));
        assert_eq!(Error::new_timeout().status(), None);
    }

    #[test]
    fn sanitize_strips_hostile_names() {
        assert_eq!(sanitize_method_name("echo"), "echo");
        assert_eq!(sanitize_method_name("a b\r\nc<d>"), "abcd");
        let long = "x".repeat(300);
        let out = sanitize_method_name(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.len(), 131);
    }
}
