//! ASN.1 identifier octets: class, constructed bit and tag number.

use serde::{Deserialize, Serialize};
use std::fmt;

const CLASS_SHIFT: u8 = 6;
const CONSTRUCTED_FLAG: u8 = 0x20;
const LOW_NUMBER_MASK: u8 = 0x1F;
const CONTINUATION_FLAG: u8 = 0x80;

/// Longest multi-octet tag number accepted (4 octets, 28 bits).
pub const MAX_TAG_NUMBER_OCTETS: usize = 4;

/// Class of a BER tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => TagClass::Universal,
            0b01 => TagClass::Application,
            0b10 => TagClass::Context,
            _ => TagClass::Private,
        }
    }

    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0b00,
            TagClass::Application => 0b01,
            TagClass::Context => 0b10,
            TagClass::Private => 0b11,
        }
    }

    /// Class keyword as written inside `[...]` in a grammar.
    pub fn from_keyword(word: Option<&str>) -> Self {
        match word.map(|s| s.to_ascii_uppercase()) {
            Some(w) if w == "APPLICATION" => TagClass::Application,
            Some(w) if w == "UNIVERSAL" => TagClass::Universal,
            Some(w) if w == "PRIVATE" => TagClass::Private,
            // a bare number is context-specific
            _ => TagClass::Context,
        }
    }
}

impl fmt::Display for TagClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TagClass::Universal => "UNIVERSAL",
            TagClass::Application => "APPLICATION",
            TagClass::Context => "CONTEXT",
            TagClass::Private => "PRIVATE",
        })
    }
}

/// Whether tag numbers >= 31 (continuation octets) are accepted.
///
/// Single-octet tags are the baseline; schemas that need high tag numbers opt in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagEncoding {
    #[default]
    SingleOctet,
    MultiOctet,
}

/// A decoded identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    pub class: TagClass,
    pub constructed: bool,
    pub number: u32,
}

/// Lookup key: class and number, ignoring the constructed bit.
pub type TagKey = (TagClass, u32);

impl Tag {
    pub const BOOLEAN: Self = Self::universal(1);
    pub const INTEGER: Self = Self::universal(2);
    pub const BIT_STRING: Self = Self::universal(3);
    pub const OCTET_STRING: Self = Self::universal(4);
    pub const NULL: Self = Self::universal(5);
    pub const OBJECT_IDENTIFIER: Self = Self::universal(6);
    pub const SEQUENCE: Self = Self::universal(16).constructed();
    pub const SET: Self = Self::universal(17).constructed();

    pub const fn new(class: TagClass, constructed: bool, number: u32) -> Self {
        Self {
            class,
            constructed,
            number,
        }
    }

    pub const fn universal(number: u32) -> Self {
        Self::new(TagClass::Universal, false, number)
    }

    pub const fn application(number: u32) -> Self {
        Self::new(TagClass::Application, false, number)
    }

    pub const fn context(number: u32) -> Self {
        Self::new(TagClass::Context, false, number)
    }

    pub const fn private(number: u32) -> Self {
        Self::new(TagClass::Private, false, number)
    }

    pub const fn constructed(self) -> Self {
        Self::new(self.class, true, self.number)
    }

    pub fn key(&self) -> TagKey {
        (self.class, self.number)
    }

    pub fn matches(&self, other: &Tag) -> bool {
        self.key() == other.key()
    }

    /// Build a tag from a single identifier octet such as `0x30`.
    ///
    /// Returns `None` for the `0x1F` high-tag-number marker.
    pub fn from_octet(octet: u8) -> Option<Self> {
        let number = octet & LOW_NUMBER_MASK;
        if number == LOW_NUMBER_MASK {
            return None;
        }
        Some(Self::new(
            TagClass::from_bits(octet >> CLASS_SHIFT),
            octet & CONSTRUCTED_FLAG != 0,
            number as u32,
        ))
    }

    /// Serialise the identifier octets.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut first = self.class.bits() << CLASS_SHIFT;
        if self.constructed {
            first |= CONSTRUCTED_FLAG;
        }
        if self.number < LOW_NUMBER_MASK as u32 {
            out.push(first | self.number as u8);
            return;
        }
        out.push(first | LOW_NUMBER_MASK);
        let mut groups = [0u8; 5];
        let mut n = self.number;
        let mut len = 0;
        loop {
            groups[len] = (n & 0x7F) as u8;
            len += 1;
            n >>= 7;
            if n == 0 {
                break;
            }
        }
        for i in (0..len).rev() {
            let flag = if i == 0 { 0 } else { CONTINUATION_FLAG };
            out.push(groups[i] | flag);
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.class, self.number)
    }
}

/// Outcome of feeding one identifier octet to a [`TagParser`].
pub(crate) enum TagStep {
    Done(Tag),
    NeedMore,
}

/// Incremental identifier parser; one octet at a time so the reader can
/// check its length bound between octets.
pub(crate) struct TagParser {
    encoding: TagEncoding,
    first: Option<u8>,
    number: u32,
    octets: usize,
}

impl TagParser {
    pub(crate) fn new(encoding: TagEncoding) -> Self {
        Self {
            encoding,
            first: None,
            number: 0,
            octets: 0,
        }
    }

    /// Feed the next octet; `Err` carries the reason the identifier is invalid.
    pub(crate) fn push(&mut self, octet: u8) -> std::result::Result<TagStep, String> {
        let Some(first) = self.first else {
            if let Some(tag) = Tag::from_octet(octet) {
                return Ok(TagStep::Done(tag));
            }
            if self.encoding == TagEncoding::SingleOctet {
                return Err(format!(
                    "multi-octet tag number (identifier 0x{:02X}) not enabled",
                    octet
                ));
            }
            self.first = Some(octet);
            return Ok(TagStep::NeedMore);
        };

        if self.octets == 0 && octet == CONTINUATION_FLAG {
            return Err("tag number has a leading zero continuation octet".to_string());
        }
        self.octets += 1;
        if self.octets > MAX_TAG_NUMBER_OCTETS {
            return Err(format!(
                "tag number longer than {} octets",
                MAX_TAG_NUMBER_OCTETS
            ));
        }
        self.number = (self.number << 7) | (octet & 0x7F) as u32;
        if octet & CONTINUATION_FLAG != 0 {
            return Ok(TagStep::NeedMore);
        }
        Ok(TagStep::Done(Tag::new(
            TagClass::from_bits(first >> CLASS_SHIFT),
            first & CONSTRUCTED_FLAG != 0,
            self.number,
        )))
    }
}

/// Append a definite-form DER length.
pub fn encode_length(length: u32, out: &mut Vec<u8>) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (4 - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}
