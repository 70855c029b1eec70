//! Typed decoding of primitive field values.
//!
//! The mapper only carries raw bytes and the declared type; turning them
//! into scalars is left to consumers such as the CLI. Types without a
//! dedicated decoder come back as [`Value::Bytes`].

use crate::schema::TypeTag;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Null,
    Text(String),
    /// Telephony digit string (TBCD).
    Digits(String),
    /// Dotted object identifier, e.g. `1.2.840.113549`.
    Oid(String),
    Bits {
        unused: u8,
        bytes: Vec<u8>,
    },
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode {ty}: {reason}")]
pub struct ValueError {
    pub ty: TypeTag,
    pub reason: String,
}

fn fail<T>(ty: TypeTag, reason: impl Into<String>) -> Result<T, ValueError> {
    Err(ValueError {
        ty,
        reason: reason.into(),
    })
}

/// Decode `raw` according to its declared type.
pub fn decode(raw: &[u8], ty: TypeTag) -> Result<Value, ValueError> {
    match ty {
        TypeTag::Integer | TypeTag::Enumerated => integer(raw, ty).map(Value::Integer),
        TypeTag::Boolean => match raw {
            [b] => Ok(Value::Boolean(*b != 0)),
            _ => fail(ty, format!("expected 1 octet, found {}", raw.len())),
        },
        TypeTag::Null if raw.is_empty() => Ok(Value::Null),
        TypeTag::Null => fail(ty, format!("expected no content, found {} octets", raw.len())),
        TypeTag::Ia5String
        | TypeTag::PrintableString
        | TypeTag::VisibleString
        | TypeTag::NumericString
        | TypeTag::UtcTime
        | TypeTag::GeneralizedTime => ascii(raw, ty).map(Value::Text),
        TypeTag::Utf8String | TypeTag::GraphicString | TypeTag::GeneralString => {
            match std::str::from_utf8(raw) {
                Ok(s) => Ok(Value::Text(s.to_string())),
                Err(e) => fail(ty, e.to_string()),
            }
        }
        TypeTag::BmpString => bmp(raw, ty).map(Value::Text),
        TypeTag::TbcdString => tbcd(raw, ty).map(Value::Digits),
        TypeTag::ObjectIdentifier => oid(raw, ty).map(Value::Oid),
        TypeTag::BitString => match raw.split_first() {
            None => fail(ty, "missing unused-bits octet"),
            Some((&unused, rest)) if unused > 7 || (rest.is_empty() && unused != 0) => {
                fail(ty, format!("invalid unused-bits count {}", unused))
            }
            Some((&unused, rest)) => Ok(Value::Bits {
                unused,
                bytes: rest.to_vec(),
            }),
        },
        _ => Ok(Value::Bytes(raw.to_vec())),
    }
}

fn integer(raw: &[u8], ty: TypeTag) -> Result<i64, ValueError> {
    let Some(&first) = raw.first() else {
        return fail(ty, "empty content");
    };
    // drop redundant sign octets so over-padded encodings still fit
    let mut bytes = raw;
    while bytes.len() > 8
        && ((bytes[0] == 0x00 && bytes[1] & 0x80 == 0) || (bytes[0] == 0xFF && bytes[1] & 0x80 != 0))
    {
        bytes = &bytes[1..];
    }
    if bytes.len() > 8 {
        return fail(ty, format!("{} octets do not fit in 64 bits", raw.len()));
    }
    let mut value: i64 = if first & 0x80 != 0 { -1 } else { 0 };
    for b in bytes {
        value = (value << 8) | *b as i64;
    }
    Ok(value)
}

fn ascii(raw: &[u8], ty: TypeTag) -> Result<String, ValueError> {
    if let Some(pos) = raw.iter().position(|b| !b.is_ascii()) {
        return fail(ty, format!("octet 0x{:02X} at {} is not 7-bit", raw[pos], pos));
    }
    Ok(raw.iter().map(|b| *b as char).collect())
}

fn bmp(raw: &[u8], ty: TypeTag) -> Result<String, ValueError> {
    if raw.len() % 2 != 0 {
        return fail(ty, "odd number of octets");
    }
    let units = raw.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .or_else(|e| fail(ty, e.to_string()))
}

fn tbcd_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        0xA => '*',
        0xB => '#',
        0xC => 'a',
        0xD => 'b',
        _ => 'c',
    }
}

fn tbcd(raw: &[u8], ty: TypeTag) -> Result<String, ValueError> {
    let mut out = String::with_capacity(raw.len() * 2);
    for (i, b) in raw.iter().enumerate() {
        let (low, high) = (b & 0x0F, b >> 4);
        let last = i + 1 == raw.len();
        if low == 0x0F {
            return fail(ty, format!("filler in low nibble of octet {}", i));
        }
        out.push(tbcd_digit(low));
        match high {
            0x0F if last => {}
            0x0F => return fail(ty, format!("filler before the last octet ({})", i)),
            _ => out.push(tbcd_digit(high)),
        }
    }
    Ok(out)
}

fn oid(raw: &[u8], ty: TypeTag) -> Result<String, ValueError> {
    if raw.is_empty() {
        return fail(ty, "empty content");
    }
    let mut arcs: Vec<u64> = Vec::new();
    let mut current: u64 = 0;
    let mut pending = false;
    for b in raw {
        if current > u64::MAX >> 7 {
            return fail(ty, "subidentifier too large");
        }
        current = (current << 7) | (b & 0x7F) as u64;
        pending = b & 0x80 != 0;
        if !pending {
            arcs.push(current);
            current = 0;
        }
    }
    if pending {
        return fail(ty, "truncated subidentifier");
    }

    let first = arcs[0];
    let (a, b) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    let mut out = format!("{}.{}", a, b);
    for arc in &arcs[1..] {
        out.push('.');
        out.push_str(&arc.to_string());
    }
    Ok(out)
}
