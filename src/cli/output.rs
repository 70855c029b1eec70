//! Hand-written JSONL output: one line per decoded record.

use asn1_schema_stream::value::{self, Value};
use asn1_schema_stream::{Field, FieldIssue, Node, NodeBody, Record, TypeTag};
use std::io::{self, Write};

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Quoted, escaped JSON string.
pub fn write_json_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(b"\"")?;
    let bytes = s.as_bytes();
    let mut plain = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let escaped: &[u8] = match b {
            b'"' => b"\\\"",
            b'\\' => b"\\\\",
            b'\n' => b"\\n",
            b'\r' => b"\\r",
            b'\t' => b"\\t",
            c if c < 0x20 => {
                w.write_all(&bytes[plain..i])?;
                w.write_all(&[b'\\', b'u', b'0', b'0', HEX[(c >> 4) as usize], HEX[(c & 0x0F) as usize]])?;
                plain = i + 1;
                continue;
            }
            _ => continue,
        };
        w.write_all(&bytes[plain..i])?;
        w.write_all(escaped)?;
        plain = i + 1;
    }
    w.write_all(&bytes[plain..])?;
    w.write_all(b"\"")
}

/// Lower-case hex of `bytes`, reusing `scratch`.
fn hex_into<'a>(bytes: &[u8], scratch: &'a mut Vec<u8>) -> &'a [u8] {
    scratch.clear();
    scratch.reserve(bytes.len() * 2);
    for &b in bytes {
        scratch.push(HEX[(b >> 4) as usize]);
        scratch.push(HEX[(b & 0x0F) as usize]);
    }
    scratch
}

pub fn write_hex_json<W: Write>(w: &mut W, data: &[u8], scratch: &mut Vec<u8>) -> io::Result<()> {
    w.write_all(b"\"")?;
    w.write_all(hex_into(data, scratch))?;
    w.write_all(b"\"")
}

/// Typed JSON value for a field; undecodable bytes fall back to hex.
pub fn write_value<W: Write>(
    w: &mut W,
    raw: Option<&[u8]>,
    ty: TypeTag,
    scratch: &mut Vec<u8>,
) -> io::Result<()> {
    let Some(raw) = raw else {
        return w.write_all(b"null");
    };
    let decoded = match value::decode(raw, ty) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("{}; writing hex", e);
            Value::Bytes(raw.to_vec())
        }
    };
    let mut num = itoa::Buffer::new();
    match decoded {
        Value::Integer(n) => w.write_all(num.format(n).as_bytes()),
        Value::Boolean(true) => w.write_all(b"true"),
        Value::Boolean(false) => w.write_all(b"false"),
        Value::Null => w.write_all(b"null"),
        Value::Text(s) | Value::Digits(s) | Value::Oid(s) => write_json_str(w, &s),
        Value::Bits { unused, bytes } => {
            w.write_all(b"{\"unused\":")?;
            w.write_all(num.format(unused).as_bytes())?;
            w.write_all(b",\"hex\":")?;
            write_hex_json(w, &bytes, scratch)?;
            w.write_all(b"}")
        }
        Value::Bytes(bytes) => write_hex_json(w, &bytes, scratch),
    }
}

fn write_header<W: Write>(w: &mut W, index: u64, offset: u64) -> io::Result<()> {
    let mut num = itoa::Buffer::new();
    w.write_all(b"{\"record\":")?;
    w.write_all(num.format(index).as_bytes())?;
    w.write_all(b",\"offset\":")?;
    w.write_all(num.format(offset).as_bytes())
}

fn write_issues<W: Write>(w: &mut W, issues: &[FieldIssue]) -> io::Result<()> {
    if issues.is_empty() {
        return Ok(());
    }
    let mut num = itoa::Buffer::new();
    w.write_all(b",\"issues\":[")?;
    for (i, issue) in issues.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"{\"path\":")?;
        write_json_str(w, &issue.path)?;
        w.write_all(b",\"offset\":")?;
        w.write_all(num.format(issue.offset).as_bytes())?;
        w.write_all(b",\"reason\":")?;
        write_json_str(w, &issue.reason)?;
        w.write_all(if issue.nulled { b",\"nulled\":true}" } else { b",\"nulled\":false}" })?;
    }
    w.write_all(b"]")
}

/// `{"record":0,"offset":0,"fields":[{"path":"msg.id","type":"INTEGER","value":5}]}`
pub fn write_fields_record<W: Write>(
    w: &mut W,
    record: &Record<Vec<Field>>,
    scratch: &mut Vec<u8>,
) -> io::Result<()> {
    write_header(w, record.index, record.offset)?;
    w.write_all(b",\"fields\":[")?;
    for (i, field) in record.content.iter().enumerate() {
        if i > 0 {
            w.write_all(b",")?;
        }
        w.write_all(b"{\"path\":")?;
        write_json_str(w, &field.path)?;
        w.write_all(b",\"type\":")?;
        write_json_str(w, field.declared_type.as_str())?;
        w.write_all(b",\"value\":")?;
        write_value(w, field.value.as_deref(), field.declared_type, scratch)?;
        w.write_all(b"}")?;
    }
    w.write_all(b"]")?;
    write_issues(w, &record.issues)?;
    w.write_all(b"}")
}

fn node_key(node: &Node) -> String {
    match (&node.name, node.tag) {
        (Some(name), _) => name.clone(),
        (None, Some(tag)) => tag.to_string(),
        (None, None) => "?".to_string(),
    }
}

fn write_node<W: Write>(w: &mut W, node: &Node, scratch: &mut Vec<u8>) -> io::Result<()> {
    match &node.body {
        NodeBody::Primitive(raw) => {
            let ty = node.declared_type.unwrap_or(TypeTag::OctetString);
            write_value(w, raw.as_deref(), ty, scratch)
        }
        NodeBody::Constructed(children) => {
            let as_list = matches!(node.declared_type, Some(TypeTag::SequenceOf | TypeTag::SetOf));
            w.write_all(if as_list { b"[" } else { b"{" })?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    w.write_all(b",")?;
                }
                if !as_list {
                    write_json_str(w, &node_key(child))?;
                    w.write_all(b":")?;
                }
                write_node(w, child, scratch)?;
            }
            w.write_all(if as_list { b"]" } else { b"}" })
        }
    }
}

/// `{"record":0,"offset":0,"tree":{"msg":{"id":5,"payload":"41"}}}`
pub fn write_tree_record<W: Write>(w: &mut W, record: &Record<Node>, scratch: &mut Vec<u8>) -> io::Result<()> {
    write_header(w, record.index, record.offset)?;
    w.write_all(b",\"tree\":{")?;
    write_json_str(w, &node_key(&record.content))?;
    w.write_all(b":")?;
    write_node(w, &record.content, scratch)?;
    w.write_all(b"}")?;
    write_issues(w, &record.issues)?;
    w.write_all(b"}")
}
