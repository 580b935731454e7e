//! The slice of XML-RPC rTorrent speaks on its `RPC2` endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Double(f64),
    String(String),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.iter().find(|(key, _)| key == name).map(|(_, value)| value),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut body = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    body.push_str(&escape(method));
    body.push_str("</methodName><params>");
    for param in params {
        body.push_str("<param>");
        write_value(&mut body, param);
        body.push_str("</param>");
    }
    body.push_str("</params></methodCall>");
    body
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(value) => out.push_str(&format!("<i8>{value}</i8>")),
        Value::Bool(value) => out.push_str(&format!("<boolean>{}</boolean>", u8::from(*value))),
        Value::Double(value) => out.push_str(&format!("<double>{value}</double>")),
        Value::String(value) => out.push_str(&format!("<string>{}</string>", escape(value.as_str()))),
        Value::Base64(bytes) => out.push_str(&format!("<base64>{}</base64>", STANDARD.encode(bytes))),
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str(&format!("<member><name>{}</name>", escape(name.as_str())));
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::Api(format!("malformed XML-RPC response: {reason}"))
}

/// Open containers while walking a response.
enum Frame {
    Array(Vec<Value>),
    /// Members so far and the name of the member being read
    Struct(Vec<(String, Value)>, String),
}

fn deliver(frames: &mut [Frame], result: &mut Option<Value>, value: Value) {
    match frames.last_mut() {
        Some(Frame::Array(items)) => items.push(value),
        Some(Frame::Struct(members, name)) => members.push((std::mem::take(name), value)),
        None => *result = Some(value),
    }
}

fn scalar(tag: &[u8], text: &str) -> Result<Option<Value>> {
    let value = match tag {
        b"i4" | b"i8" | b"int" => Value::Int(
            text.trim()
                .parse()
                .map_err(|_| malformed(format!("bad integer '{text}'")))?,
        ),
        b"boolean" => Value::Bool(text.trim() == "1"),
        b"double" => Value::Double(
            text.trim()
                .parse()
                .map_err(|_| malformed(format!("bad double '{text}'")))?,
        ),
        b"string" => Value::String(text.to_owned()),
        b"base64" => Value::Base64(STANDARD.decode(text.trim()).map_err(malformed)?),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Decodes a `methodResponse`. A `fault` becomes [`Error::Api`].
pub fn parse_response(body: &str) -> Result<Value> {
    let mut reader = Reader::from_str(body);
    let mut frames: Vec<Frame> = Vec::new();
    let mut text = String::new();
    let mut pending: Option<Value> = None;
    let mut result = None;
    let mut fault = false;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(start) => match start.name().as_ref() {
                b"array" => frames.push(Frame::Array(Vec::new())),
                b"struct" => frames.push(Frame::Struct(Vec::new(), String::new())),
                b"fault" => fault = true,
                _ => text.clear(),
            },
            Event::Empty(empty) => match empty.name().as_ref() {
                b"value" => deliver(&mut frames, &mut result, Value::String(String::new())),
                b"string" => pending = Some(Value::String(String::new())),
                b"array" => pending = Some(Value::Array(Vec::new())),
                b"struct" => pending = Some(Value::Struct(Vec::new())),
                _ => {}
            },
            Event::Text(chunk) => text.push_str(&chunk.unescape().map_err(malformed)?),
            Event::End(end) => match end.name().as_ref() {
                b"value" => {
                    // untyped values are strings
                    let value = pending.take().unwrap_or_else(|| Value::String(std::mem::take(&mut text)));
                    deliver(&mut frames, &mut result, value);
                }
                b"name" => {
                    if let Some(Frame::Struct(_, name)) = frames.last_mut() {
                        *name = std::mem::take(&mut text);
                    }
                }
                b"array" => match frames.pop() {
                    Some(Frame::Array(items)) => pending = Some(Value::Array(items)),
                    _ => return Err(malformed("unbalanced array")),
                },
                b"struct" => match frames.pop() {
                    Some(Frame::Struct(members, _)) => pending = Some(Value::Struct(members)),
                    _ => return Err(malformed("unbalanced struct")),
                },
                tag => {
                    if let Some(value) = scalar(tag, &text)? {
                        pending = Some(value);
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }

    let value = result.ok_or_else(|| malformed("no value"))?;
    if fault {
        let code = value.member("faultCode").and_then(Value::as_i64).unwrap_or_default();
        let message = value.member("faultString").and_then(Value::as_str).unwrap_or_default();
        return Err(Error::Api(format!("XML-RPC fault {code}: {message}")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_nested_params() {
        let body = encode_call(
            "load.raw_start_verbose",
            &[
                Value::from(""),
                Value::Base64(b"d4:infoe".to_vec()),
                Value::Array(vec![Value::from(1), Value::from("a<b & \"c\"")]),
            ],
        );
        assert!(body.starts_with("<?xml version=\"1.0\"?><methodCall><methodName>load.raw_start_verbose</methodName>"));
        assert!(body.contains("<param><value><string></string></value></param>"));
        assert!(body.contains("<base64>ZDQ6aW5mb2U=</base64>"));
        assert!(body.contains(
            "<array><data><value><i8>1</i8></value><value><string>a&lt;b &amp; &quot;c&quot;</string></value></data></array>"
        ));
    }

    #[test]
    fn parses_a_multicall_answer() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<methodResponse>
<params>
<param><value><array><data>
<value><array><data>
<value><string>0123ABCD</string></value>
<value><string>Some &amp; Release</string></value>
<value><i8>1073741824</i8></value>
<value><string/></value>
<value>untyped</value>
</data></array></value>
</data></array></value></param>
</params>
</methodResponse>"#;
        let value = parse_response(body).expect("failed to parse");
        let rows = value.as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        let row = rows[0].as_array().expect("columns");
        assert_eq!(row[0].as_str(), Some("0123ABCD"));
        assert_eq!(row[1].as_str(), Some("Some & Release"));
        assert_eq!(row[2].as_i64(), Some(1_073_741_824));
        assert_eq!(row[3].as_str(), Some(""));
        assert_eq!(row[4].as_str(), Some("untyped"));
    }

    #[test]
    fn faults_become_api_errors() {
        let body = r#"<?xml version="1.0"?>
<methodResponse><fault><value><struct>
<member><name>faultCode</name><value><i4>-501</i4></value></member>
<member><name>faultString</name><value><string>Could not find info-hash.</string></value></member>
</struct></value></fault></methodResponse>"#;
        let err = parse_response(body).expect_err("fault expected");
        assert!(matches!(&err, Error::Api(message) if message.contains("-501") && message.contains("info-hash")));
    }

    #[test]
    fn truncated_bodies_are_rejected() {
        assert!(parse_response("<methodResponse><params>").is_err());
    }
}
