//! `methodCall` parsing and serialization.

use crate::error::Error;
use crate::xml::writer::XmlWriter;
use crate::xml::{Event, Parser, StateMachine, Transition};

use super::value_build::{build_value, write_value};
use super::{Request, MAX_METHOD_NAME_LEN};

const NONE: u8 = 0;
const CALL: u8 = 1;
const NAME: u8 = 2;
const PARAMS: u8 = 3;
const PARAM: u8 = 4;
const VALUE: u8 = 5;

static TRANSITIONS: &[Transition] = &[
    Transition { from: NONE, to: CALL, tag: "methodCall" },
    Transition { from: CALL, to: NAME, tag: "methodName" },
    Transition { from: NAME, to: PARAMS, tag: "params" },
    Transition { from: PARAMS, to: PARAM, tag: "param" },
    Transition { from: PARAM, to: VALUE, tag: "value" },
];

/// Parses a `methodCall` payload into a [`Request`].
pub fn parse_request(xml: &str) -> crate::Result<Request> {
    let mut p = Parser::new(xml)?;
    let mut sm = StateMachine::new(NONE, TRANSITIONS);
    let mut name: Option<String> = None;
    let mut params = Vec::new();

    loop {
        match p.next_event()? {
            None => break,
            Some(Event::Open(tag)) => match sm.change(&tag, &p)? {
                NAME => {
                    let text = p.take_text()?.unwrap_or_default();
                    if text.len() > MAX_METHOD_NAME_LEN {
                        return Err(p.violation_at("method name too long"));
                    }
                    name = Some(text);
                }
                VALUE => params.push(build_value(&mut p)?),
                _ => {}
            },
            Some(Event::Close(tag)) => match tag.as_str() {
                "param" => sm.set_state(PARAMS),
                "methodCall" => break,
                _ => {}
            },
            Some(Event::Text(_)) => {}
        }
    }

    match name {
        Some(name) => Ok(Request::new(name, params)),
        None => Err(Error::new_violation(
            "methodCall without methodName".to_owned(),
        )),
    }
}

/// Serializes a [`Request`] into a `methodCall` payload.
pub fn dump_request(req: &Request) -> crate::Result<String> {
    let mut w = XmlWriter::new();
    w.element("methodCall", |w| {
        w.text_element("methodName", req.name())?;
        w.element("params", |w| {
            for value in req.params() {
                w.element("param", |w| write_value(w, value, false))?;
            }
            Ok(())
        })
    })?;
    Ok(w.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Struct, Value};

    #[test]
    fn round_trip_preserves_name_and_params() {
        let mut s = Struct::new();
        s.insert("a", 1);
        s.insert("b", "str");
        let req = Request::new("echo", vec![Value::from(s), Value::from(true)]);
        let xml = dump_request(&req).unwrap();
        let back = parse_request(&xml).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn request_without_params_parses() {
        let req =
            parse_request("<methodCall><methodName>system.listMethods</methodName></methodCall>")
                .unwrap();
        assert_eq!(req.name(), "system.listMethods");
        assert!(req.params().is_empty());
    }

    #[test]
    fn missing_method_name_is_a_violation() {
        let err = parse_request("<methodCall><params/></methodCall>").unwrap_err();
        assert_eq!(err.fault_code(), -32600);
    }

    #[test]
    fn method_name_length_cap() {
        let ok = format!(
            "<methodCall><methodName>{}</methodName></methodCall>",
            "m".repeat(256)
        );
        assert_eq!(parse_request(&ok).unwrap().name().len(), 256);

        let too_long = format!(
            "<methodCall><methodName>{}</methodName></methodCall>",
            "m".repeat(257)
        );
        assert!(parse_request(&too_long).is_err());
    }

    #[test]
    fn wrong_root_element_is_a_violation() {
        assert!(parse_request("<methodResponse><params/></methodResponse>").is_err());
    }

    #[test]
    fn namespaced_variant_round_trips() {
        let req = parse_request(
            "<x:methodCall><x:methodName>go</x:methodName>\
             <x:params><x:param><x:value><x:i4>9</x:i4></x:value></x:param></x:params>\
             </x:methodCall>",
        )
        .unwrap();
        assert_eq!(req.name(), "go");
        assert_eq!(req.params()[0], Value::Int(9));
    }
}
