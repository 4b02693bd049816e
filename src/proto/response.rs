//! `methodResponse` parsing and serialization.

use crate::error::Error;
use crate::value::{options, Struct, Value};
use crate::xml::writer::XmlWriter;
use crate::xml::{Event, Parser, StateMachine, Transition};

use super::value_build::{build_value, write_value};
use super::{Fault, Response};

const NONE: u8 = 0;
const RESP: u8 = 1;
const PARAMS: u8 = 2;
const PARAM: u8 = 3;
const OK_VALUE: u8 = 4;
const FAULT: u8 = 5;
const FAULT_VALUE: u8 = 6;

static TRANSITIONS: &[Transition] = &[
    Transition { from: NONE, to: RESP, tag: "methodResponse" },
    Transition { from: RESP, to: PARAMS, tag: "params" },
    Transition { from: PARAMS, to: PARAM, tag: "param" },
    Transition { from: PARAM, to: OK_VALUE, tag: "value" },
    Transition { from: RESP, to: FAULT, tag: "fault" },
    Transition { from: FAULT, to: FAULT_VALUE, tag: "value" },
];

/// Parses a `methodResponse` payload into a [`Response`].
pub fn parse_response(xml: &str) -> crate::Result<Response> {
    let mut p = Parser::new(xml)?;
    let mut sm = StateMachine::new(NONE, TRANSITIONS);
    let mut ok: Option<Value> = None;
    let mut fault: Option<Fault> = None;

    loop {
        match p.next_event()? {
            None => break,
            Some(Event::Open(tag)) => match sm.change(&tag, &p)? {
                OK_VALUE => ok = Some(build_value(&mut p)?),
                FAULT_VALUE => {
                    let value = build_value(&mut p)?;
                    fault = Some(fault_from_value(&p, value)?);
                }
                _ => {}
            },
            Some(Event::Close(tag)) => {
                if tag == "methodResponse" {
                    break;
                }
            }
            Some(Event::Text(_)) => {}
        }
    }

    match (ok, fault) {
        (Some(value), None) => Ok(Response::from_value(value)),
        (None, Some(fault)) => Ok(Response::from_fault(fault)),
        _ => Err(Error::new_violation(
            "methodResponse carries neither params nor fault".to_owned(),
        )),
    }
}

// fault ::= value(struct{faultCode: Int, faultString: String})
fn fault_from_value(p: &Parser<'_>, value: Value) -> crate::Result<Fault> {
    let s = value
        .as_struct()
        .ok_or_else(|| p.violation_at("fault value is not a struct"))?;
    let code = match s.get("faultCode") {
        Some(&Value::Int(c)) => c,
        Some(&Value::Int64(c)) if i32::try_from(c).is_ok() => c as i32,
        _ => return Err(p.violation_at("fault without integer faultCode")),
    };
    let message = s
        .get("faultString")
        .and_then(Value::as_str)
        .ok_or_else(|| p.violation_at("fault without string faultString"))?;
    Ok(Fault::new(code, message))
}

/// Serializes a [`Response`] into a `methodResponse` payload.
///
/// Honors the process-wide omit-`<string>` option on both the success and
/// the fault path.
pub fn dump_response(resp: &Response) -> crate::Result<String> {
    let omit = options::omit_string_tag();
    let mut w = XmlWriter::new();
    w.element("methodResponse", |w| {
        if let Some(fault) = resp.fault() {
            let mut s = Struct::new();
            s.insert("faultCode", fault.code());
            s.insert("faultString", fault.message());
            w.element("fault", |w| write_value(w, &Value::Struct(s), omit))
        } else {
            w.element("params", |w| {
                w.element("param", |w| {
                    write_value(w, resp.value().expect("non-fault response has value"), omit)
                })
            })
        }
    })?;
    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_round_trip() {
        let resp = Response::from_value(Value::from(vec![Value::from(1), Value::from("x")]));
        let xml = dump_response(&resp).unwrap();
        assert_eq!(parse_response(&xml).unwrap(), resp);
    }

    #[test]
    fn fault_round_trip() {
        let resp = Response::from_fault(Fault::new(42, "nope"));
        let xml = dump_response(&resp).unwrap();
        assert!(xml.contains("faultCode"));
        let back = parse_response(&xml).unwrap();
        assert!(back.is_fault());
        assert_eq!(back.fault_code(), Some(42));
        assert_eq!(back.fault_string(), Some("nope"));
    }

    #[test]
    fn fault_must_be_a_well_formed_struct() {
        let bad = "<methodResponse><fault><value><i4>1</i4></value></fault></methodResponse>";
        assert_eq!(parse_response(bad).unwrap_err().fault_code(), -32600);

        let missing_string = "<methodResponse><fault><value><struct>\
            <member><name>faultCode</name><value><i4>1</i4></value></member>\
            </struct></value></fault></methodResponse>";
        assert!(parse_response(missing_string).is_err());
    }

    #[test]
    fn empty_response_is_a_violation() {
        assert!(parse_response("<methodResponse></methodResponse>").is_err());
    }

    #[test]
    fn omit_string_tag_applies_to_responses() {
        let _guard = options::test_lock();
        let resp = Response::from_value(Value::from("text"));

        let tagged = dump_response(&resp).unwrap();
        assert!(tagged.contains("<value><string>text</string></value>"));

        options::set_omit_string_tag(true);
        let untagged = dump_response(&resp).unwrap();
        options::set_omit_string_tag(false);
        assert!(untagged.contains("<value>text</value>"));

        // both forms decode to the same value
        assert_eq!(parse_response(&untagged).unwrap(), resp);
    }
}
