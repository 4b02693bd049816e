//! XML-RPC messages: requests, responses and faults, plus the codec between
//! them and the wire payload.

use std::error::Error as StdError;
use std::fmt;

use crate::value::Value;

mod request;
mod response;
pub(crate) mod value_build;

pub use self::request::{dump_request, parse_request};
pub use self::response::{dump_response, parse_response};

/// Method names longer than this are rejected at parse time and again,
/// defensively, by the dispatcher.
pub(crate) const MAX_METHOD_NAME_LEN: usize = 256;

/// An ordered sequence of values, used for both request parameters and the
/// response payload.
pub type Params = Vec<Value>;

/// A decoded `methodCall`.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    name: String,
    params: Params,
}

impl Request {
    pub fn new(name: impl Into<String>, params: Params) -> Request {
        Request {
            name: name.into(),
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn into_parts(self) -> (String, Params) {
        (self.name, self.params)
    }
}

/// An application-level XML-RPC fault: integer code plus message.
///
/// Methods return `Err(Fault)` to produce a fault response with the user's
/// own code and message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    code: i32,
    message: String,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Fault {
        Fault {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault {}: {}", self.code, self.message)
    }
}

impl StdError for Fault {}

/// A decoded `methodResponse`: either a success value or a fault.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    result: Result<Value, Fault>,
}

impl Response {
    pub fn from_value(value: Value) -> Response {
        Response { result: Ok(value) }
    }

    pub fn from_fault(fault: Fault) -> Response {
        Response { result: Err(fault) }
    }

    pub fn is_fault(&self) -> bool {
        self.result.is_err()
    }

    /// The success value; `None` when this response is a fault.
    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.result.as_ref().err()
    }

    pub fn fault_code(&self) -> Option<i32> {
        self.fault().map(Fault::code)
    }

    pub fn fault_string(&self) -> Option<&str> {
        self.fault().map(Fault::message)
    }

    pub fn into_result(self) -> Result<Value, Fault> {
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_fault_access_is_typed() {
        let ok = Response::from_value(Value::from(1));
        assert!(!ok.is_fault());
        assert_eq!(ok.value(), Some(&Value::Int(1)));
        assert_eq!(ok.fault_code(), None);

        let fault = Response::from_fault(Fault::new(42, "nope"));
        assert!(fault.is_fault());
        assert_eq!(fault.value(), None);
        assert_eq!(fault.fault_code(), Some(42));
        assert_eq!(fault.fault_string(), Some("nope"));
    }
}
