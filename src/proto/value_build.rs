//! Builders turning the pull-parser token stream into [`Value`]s, and the
//! matching serializer. Each production carries its own transition table;
//! an unexpected tag is an XML-RPC violation with the parser's context.

use crate::error::Error;
use crate::value::{options, Binary, DateTime, Struct, Value};
use crate::xml::writer::XmlWriter;
use crate::xml::{Event, Parser, StateMachine, Transition};

const VALUE: u8 = 0;
const STRING: u8 = 1;
const INT: u8 = 2;
const INT64: u8 = 3;
const BOOL: u8 = 4;
const DOUBLE: u8 = 5;
const BINARY: u8 = 6;
const TIME: u8 = 7;
const STRUCT: u8 = 8;
const ARRAY: u8 = 9;
const NIL: u8 = 10;

static VALUE_TRANSITIONS: &[Transition] = &[
    Transition { from: VALUE, to: STRING, tag: "string" },
    Transition { from: VALUE, to: INT, tag: "int" },
    Transition { from: VALUE, to: INT, tag: "i4" },
    Transition { from: VALUE, to: INT64, tag: "i8" },
    Transition { from: VALUE, to: BOOL, tag: "boolean" },
    Transition { from: VALUE, to: DOUBLE, tag: "double" },
    Transition { from: VALUE, to: BINARY, tag: "base64" },
    Transition { from: VALUE, to: TIME, tag: "dateTime.iso8601" },
    Transition { from: VALUE, to: STRUCT, tag: "struct" },
    Transition { from: VALUE, to: ARRAY, tag: "array" },
    Transition { from: VALUE, to: NIL, tag: "nil" },
];

/// Builds one value; the opening `<value>` tag has already been consumed.
pub(crate) fn build_value(p: &mut Parser<'_>) -> crate::Result<Value> {
    let mut sm = StateMachine::new(VALUE, VALUE_TRANSITIONS);
    let mut out: Option<Value> = None;

    loop {
        match p.next_event()? {
            None => return Err(Error::new_xml("unexpected end of document")),
            Some(Event::Open(tag)) => match sm.change(&tag, p)? {
                STRUCT => out = Some(Value::Struct(build_struct(p)?)),
                ARRAY => out = Some(Value::Array(build_array(p)?)),
                NIL => out = Some(Value::Nil),
                // leaf types wait for text within <i4>...</i4>, etc.
                _ => {}
            },
            Some(Event::Text(text)) => {
                out = Some(leaf_from_text(p, sm.state(), text)?);
            }
            Some(Event::Close(tag)) => {
                if tag == "value" {
                    // an empty or untyped <value> is a string
                    return Ok(out.unwrap_or_else(|| Value::String(String::new())));
                }
                if out.is_none() {
                    out = Some(empty_leaf(p, sm.state())?);
                }
            }
        }
    }
}

fn leaf_from_text(p: &Parser<'_>, state: u8, text: String) -> crate::Result<Value> {
    Ok(match state {
        VALUE | STRING => Value::String(text),
        INT => Value::Int(
            text.parse()
                .map_err(|_| p.violation_at("bad integer value"))?,
        ),
        INT64 => Value::Int64(
            text.parse()
                .map_err(|_| p.violation_at("bad integer value"))?,
        ),
        BOOL => Value::Bool(
            text.parse::<i32>()
                .map_err(|_| p.violation_at("bad boolean value"))?
                != 0,
        ),
        DOUBLE => Value::Double(
            text.parse()
                .map_err(|_| p.violation_at("bad double value"))?,
        ),
        BINARY => Value::Binary(Binary::from_base64(&text)?),
        TIME => Value::DateTime(DateTime::parse(&text)?),
        _ => return Err(p.violation()),
    })
}

// A typed element closed without any text content.
fn empty_leaf(p: &Parser<'_>, state: u8) -> crate::Result<Value> {
    Ok(match state {
        STRING => Value::String(String::new()),
        INT => match options::default_int() {
            Some(v) => Value::Int(v),
            None => return Err(p.violation()),
        },
        INT64 => match options::default_int64() {
            Some(v) => Value::Int64(v),
            None => return Err(p.violation()),
        },
        BINARY => Value::Binary(Binary::from_data(Vec::new())),
        _ => return Err(p.violation()),
    })
}

const S_NONE: u8 = 0;
const S_MEMBER: u8 = 1;
const S_NAME_READ: u8 = 2;
const S_VALUE_READ: u8 = 3;

static STRUCT_TRANSITIONS: &[Transition] = &[
    Transition { from: S_NONE, to: S_MEMBER, tag: "member" },
    Transition { from: S_MEMBER, to: S_NAME_READ, tag: "name" },
    Transition { from: S_NAME_READ, to: S_VALUE_READ, tag: "value" },
];

fn build_struct(p: &mut Parser<'_>) -> crate::Result<Struct> {
    let mut sm = StateMachine::new(S_NONE, STRUCT_TRANSITIONS);
    let mut out = Struct::new();
    let mut name: Option<String> = None;
    let mut value: Option<Value> = None;

    loop {
        match p.next_event()? {
            None => return Err(Error::new_xml("unexpected end of document")),
            Some(Event::Open(tag)) => match sm.change(&tag, p)? {
                S_NAME_READ => name = Some(p.take_text()?.unwrap_or_default()),
                S_VALUE_READ => value = Some(build_value(p)?),
                _ => {}
            },
            Some(Event::Close(tag)) => match tag.as_str() {
                "member" => {
                    if sm.state() != S_VALUE_READ {
                        return Err(p.violation());
                    }
                    out.insert(name.take().unwrap_or_default(), value.take().unwrap());
                    sm.set_state(S_NONE);
                }
                "struct" => return Ok(out),
                _ => {}
            },
            Some(Event::Text(_)) => {}
        }
    }
}

const A_NONE: u8 = 0;
const A_DATA: u8 = 1;
const A_VALUES: u8 = 2;

static ARRAY_TRANSITIONS: &[Transition] = &[
    Transition { from: A_NONE, to: A_DATA, tag: "data" },
    Transition { from: A_DATA, to: A_VALUES, tag: "value" },
    Transition { from: A_VALUES, to: A_VALUES, tag: "value" },
];

fn build_array(p: &mut Parser<'_>) -> crate::Result<Vec<Value>> {
    let mut sm = StateMachine::new(A_NONE, ARRAY_TRANSITIONS);
    let mut out = Vec::new();

    loop {
        match p.next_event()? {
            None => return Err(Error::new_xml("unexpected end of document")),
            Some(Event::Open(tag)) => {
                if sm.change(&tag, p)? == A_VALUES {
                    out.push(build_value(p)?);
                }
            }
            Some(Event::Close(tag)) => {
                if tag == "array" {
                    return Ok(out);
                }
            }
            Some(Event::Text(_)) => {}
        }
    }
}

/// Serializes one `<value>` element.
///
/// `omit_string_tag` drops the `<string>` wrapper so responses can produce
/// `<value>text</value>`; requests always keep it.
pub(crate) fn write_value(
    w: &mut XmlWriter,
    value: &Value,
    omit_string_tag: bool,
) -> crate::Result<()> {
    w.element("value", |w| match *value {
        Value::Nil => w.element("nil", |_| Ok(())),
        Value::Int(i) => w.raw_element("i4", itoa::Buffer::new().format(i)),
        Value::Int64(i) => w.raw_element("i8", itoa::Buffer::new().format(i)),
        Value::Bool(b) => w.raw_element("boolean", if b { "1" } else { "0" }),
        Value::Double(d) => {
            if !d.is_finite() {
                return Err(Error::new_build("non-finite double cannot be serialized"));
            }
            w.raw_element("double", &d.to_string())
        }
        Value::String(ref s) => {
            if omit_string_tag {
                w.text(s);
                Ok(())
            } else {
                w.text_element("string", s)
            }
        }
        Value::Binary(ref b) => w.raw_element("base64", b.as_base64()),
        Value::DateTime(ref dt) => w.raw_element("dateTime.iso8601", dt.as_str()),
        Value::Array(ref items) => w.element("array", |w| {
            w.element("data", |w| {
                for item in items {
                    write_value(w, item, omit_string_tag)?;
                }
                Ok(())
            })
        }),
        Value::Struct(ref s) => w.element("struct", |w| {
            for (name, member) in s.iter() {
                w.element("member", |w| {
                    w.text_element("name", name)?;
                    write_value(w, member, omit_string_tag)
                })?;
            }
            Ok(())
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_value(xml: &str) -> crate::Result<Value> {
        let mut p = Parser::new(xml)?;
        match p.next_event()? {
            Some(Event::Open(tag)) if tag == "value" => build_value(&mut p),
            _ => panic!("test input must start with <value>"),
        }
    }

    fn dump_value(v: &Value) -> String {
        let mut w = XmlWriter::new();
        write_value(&mut w, v, false).unwrap();
        w.finish()
    }

    #[test]
    fn scalars_parse() {
        assert_eq!(parse_value("<value><i4>-5</i4></value>").unwrap(), Value::Int(-5));
        assert_eq!(parse_value("<value><int>7</int></value>").unwrap(), Value::Int(7));
        assert_eq!(
            parse_value("<value><i8>5000000000</i8></value>").unwrap(),
            Value::Int64(5_000_000_000)
        );
        assert_eq!(
            parse_value("<value><boolean>1</boolean></value>").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            parse_value("<value><double>-1.5</double></value>").unwrap(),
            Value::Double(-1.5)
        );
        assert_eq!(
            parse_value("<value><string>hi</string></value>").unwrap(),
            Value::String("hi".into())
        );
        assert_eq!(parse_value("<value><nil/></value>").unwrap(), Value::Nil);
    }

    #[test]
    fn untyped_and_empty_values_are_strings() {
        assert_eq!(
            parse_value("<value>plain</value>").unwrap(),
            Value::String("plain".into())
        );
        assert_eq!(
            parse_value("<value></value>").unwrap(),
            Value::String(String::new())
        );
        assert_eq!(
            parse_value("<value><string></string></value>").unwrap(),
            Value::String(String::new())
        );
    }

    #[test]
    fn empty_base64_is_empty_binary() {
        assert_eq!(
            parse_value("<value><base64></base64></value>").unwrap(),
            Value::Binary(Binary::from_data(Vec::new()))
        );
    }

    #[test]
    fn empty_numeric_uses_registered_default() {
        let _guard = options::test_lock();
        assert!(parse_value("<value><int></int></value>").is_err());
        assert!(parse_value("<value><i8></i8></value>").is_err());
        options::set_default_int(Some(33));
        options::set_default_int64(Some(-1));
        assert_eq!(parse_value("<value><int></int></value>").unwrap(), Value::Int(33));
        assert_eq!(parse_value("<value><i8></i8></value>").unwrap(), Value::Int64(-1));
        options::set_default_int(None);
        options::set_default_int64(None);
    }

    #[test]
    fn bad_scalar_text_is_a_violation() {
        assert_eq!(
            parse_value("<value><i4>abc</i4></value>").unwrap_err().fault_code(),
            -32600
        );
        assert_eq!(
            parse_value("<value><boolean>yes</boolean></value>")
                .unwrap_err()
                .fault_code(),
            -32600
        );
    }

    #[test]
    fn nested_structures_parse() {
        let v = parse_value(
            "<value><struct>\
               <member><name>a</name><value><i4>1</i4></value></member>\
               <member><name>list</name><value><array><data>\
                 <value><string>x</string></value><value><i4>2</i4></value>\
               </data></array></value></member>\
             </struct></value>",
        )
        .unwrap();
        assert_eq!(v.get("a").and_then(Value::as_i32), Some(1));
        let list = v.get("list").and_then(Value::as_array).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_str(), Some("x"));
    }

    #[test]
    fn unexpected_tag_is_a_violation_with_context() {
        let err = parse_value("<value><bogus>1</bogus></value>").unwrap_err();
        assert_eq!(err.fault_code(), -32600);
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn duplicate_struct_keys_last_write_wins() {
        let v = parse_value(
            "<value><struct>\
               <member><name>k</name><value><i4>1</i4></value></member>\
               <member><name>k</name><value><i4>2</i4></value></member>\
             </struct></value>",
        )
        .unwrap();
        assert_eq!(v.get("k").and_then(Value::as_i32), Some(2));
        assert_eq!(v.as_struct().unwrap().len(), 1);
    }

    #[test]
    fn encode_decode_encode_is_stable() {
        let mut s = Struct::new();
        s.insert("n", Value::Nil);
        s.insert("i", 42);
        s.insert("big", 1i64 << 40);
        s.insert("f", true);
        s.insert("d", 2.25);
        s.insert("s", "a<b&c");
        s.insert("bin", Value::Binary(Binary::from_data(&b"\x00\x01\xff"[..])));
        s.insert(
            "when",
            Value::DateTime(DateTime::parse("20240101T00:00:00").unwrap()),
        );
        s.insert("arr", vec![Value::from(1), Value::from("two")]);
        let v = Value::from(s);

        let once = dump_value(&v);
        let decoded = parse_value(strip_prolog(&once)).unwrap();
        assert_eq!(decoded, v);
        let twice = dump_value(&decoded);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_finite_double_fails_to_serialize() {
        let err = dump_value_err(&Value::Double(f64::NAN));
        assert_eq!(err.fault_code(), -32705);
    }

    fn dump_value_err(v: &Value) -> crate::Error {
        let mut w = XmlWriter::new();
        write_value(&mut w, v, false).unwrap_err()
    }

    fn strip_prolog(s: &str) -> &str {
        match s.find("?>") {
            Some(i) => s[i + 2..].trim_start(),
            None => s,
        }
    }
}
