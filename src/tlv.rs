//! Streaming structural TLV reader.
//!
//! [`TlvReader`] pulls identifier, length and value octets from any
//! [`std::io::Read`] source and drives a [`TlvVisitor`] with a well-nested
//! sequence of start / value / end events. It knows nothing about schemas.
//!
//! Lengths must be definite: the indefinite form (`0x80`) and length fields
//! longer than four octets are rejected as corrupt structure.

use crate::error::{Error, Result};
use crate::tag::{encode_length, Tag, TagEncoding, TagParser, TagStep};
use log::trace;
use std::io::{self, Read};

/// Nesting deeper than this is treated as corrupt input.
pub const DEFAULT_MAX_DEPTH: usize = 64;

const MAX_LENGTH_OCTETS: usize = 4;
/// Identifier with a full u32 tag number (5 base-128 octets) plus the
/// longest definite length form. The reader itself stops at
/// `MAX_TAG_NUMBER_OCTETS` continuation octets.
const MAX_HEADER_OCTETS: usize = 1 + 5 + 1 + MAX_LENGTH_OCTETS;
const SKIP_CHUNK: usize = 64 * 1024;

/// Identifier and length of one element, as read from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: Tag,
    /// Declared length of the value octets.
    pub length: u32,
    /// Stream offset of the first identifier octet.
    pub offset: u64,
    /// Identifier plus length octets.
    pub header_len: u32,
    /// The identifier and length octets exactly as they appeared.
    raw: [u8; MAX_HEADER_OCTETS],
}

impl Header {
    /// Header with DER (minimal) identifier and length octets.
    pub fn new(tag: Tag, length: u32, offset: u64) -> Self {
        let mut octets = Vec::with_capacity(MAX_HEADER_OCTETS);
        tag.encode(&mut octets);
        encode_length(length, &mut octets);
        let mut raw = [0u8; MAX_HEADER_OCTETS];
        raw[..octets.len()].copy_from_slice(&octets);
        Self {
            tag,
            length,
            offset,
            header_len: octets.len() as u32,
            raw,
        }
    }

    /// Identifier and length octets as read, non-minimal BER forms included.
    pub fn octets(&self) -> &[u8] {
        &self.raw[..self.header_len as usize]
    }

    pub fn is_constructed(&self) -> bool {
        self.tag.constructed
    }

    pub fn content_start(&self) -> u64 {
        self.offset + self.header_len as u64
    }

    pub fn end(&self) -> u64 {
        self.content_start() + self.length as u64
    }
}

/// Receiver of structural events.
///
/// Implemented by the semantic mapper, the tree builder and the plain
/// event recorder; the reader never knows which one it is driving.
pub trait TlvVisitor {
    fn start_element(&mut self, header: &Header) -> Result<()>;
    fn primitive_value(&mut self, value: &[u8]) -> Result<()>;
    fn end_element(&mut self, tag: Tag) -> Result<()>;
}

/// Owned form of a structural event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralEvent {
    ElementStart {
        tag: Tag,
        length: u32,
        constructed: bool,
        offset: u64,
    },
    PrimitiveValue(Vec<u8>),
    ElementEnd(Tag),
}

impl TlvVisitor for Vec<StructuralEvent> {
    fn start_element(&mut self, header: &Header) -> Result<()> {
        self.push(StructuralEvent::ElementStart {
            tag: header.tag,
            length: header.length,
            constructed: header.is_constructed(),
            offset: header.offset,
        });
        Ok(())
    }

    fn primitive_value(&mut self, value: &[u8]) -> Result<()> {
        self.push(StructuralEvent::PrimitiveValue(value.to_vec()));
        Ok(())
    }

    fn end_element(&mut self, tag: Tag) -> Result<()> {
        self.push(StructuralEvent::ElementEnd(tag));
        Ok(())
    }
}

/// Recursive, bounded reader over a byte source.
pub struct TlvReader<R> {
    source: R,
    offset: u64,
    tag_encoding: TagEncoding,
    max_depth: usize,
    value: Vec<u8>,
    /// Top-level element currently being read, kept for resynchronisation.
    current: Option<Header>,
}

impl<R: Read> TlvReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            offset: 0,
            tag_encoding: TagEncoding::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            value: Vec::new(),
            current: None,
        }
    }

    pub fn with_tag_encoding(mut self, encoding: TagEncoding) -> Self {
        self.tag_encoding = encoding;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Header of the top-level element being read, if one is open.
    pub fn current_element(&self) -> Option<&Header> {
        self.current.as_ref()
    }

    /// Drive `visitor` until the source is exhausted.
    pub fn process<V: TlvVisitor>(&mut self, visitor: &mut V) -> Result<()> {
        while self.next_element(visitor)?.is_some() {}
        Ok(())
    }

    /// Read exactly one top-level element.
    ///
    /// Returns `Ok(None)` when the source ends cleanly on an element boundary.
    pub fn next_element<V: TlvVisitor>(&mut self, visitor: &mut V) -> Result<Option<Header>> {
        self.current = None;
        let header = self.read_element(visitor, None, 0)?;
        self.current = None;
        Ok(header)
    }

    /// Discard what is left of the current top-level element after a failure.
    ///
    /// Returns `false` when resynchronisation is impossible: the top-level
    /// header itself never parsed, or the source ended first.
    pub fn skip_current_element(&mut self) -> Result<bool> {
        let Some(header) = self.current.take() else {
            return Ok(false);
        };
        let end = header.end();
        if self.offset > end {
            return Ok(false);
        }
        let mut remaining = end - self.offset;
        let mut scratch = vec![0u8; SKIP_CHUNK.min(remaining as usize)];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let got = self.read_some(&mut scratch[..want])?;
            if got == 0 {
                return Ok(false);
            }
            remaining -= got as u64;
        }
        trace!("resynchronised at byte {}", self.offset);
        Ok(true)
    }

    fn read_element<V: TlvVisitor>(
        &mut self,
        visitor: &mut V,
        parent: Option<&Header>,
        depth: usize,
    ) -> Result<Option<Header>> {
        let Some(header) = self.read_header(parent)? else {
            return Ok(None);
        };
        if parent.is_none() {
            self.current = Some(header);
        }
        if let Some(parent) = parent {
            if header.end() > parent.end() {
                return Err(overrun(parent, &header));
            }
        }
        if depth >= self.max_depth {
            return Err(Error::corrupt(
                header.offset,
                parent.map(|p| p.offset),
                format!("nesting deeper than {} levels", self.max_depth),
            ));
        }

        trace!(
            "start {} len={} at {}",
            header.tag,
            header.length,
            header.offset
        );
        visitor.start_element(&header)?;

        if header.is_constructed() {
            let end = header.end();
            while self.offset < end {
                self.read_element(visitor, Some(&header), depth + 1)?;
            }
            if self.offset != end {
                return Err(Error::corrupt(
                    self.offset,
                    Some(header.offset),
                    format!(
                        "declared length {} but children occupy {} bytes",
                        header.length,
                        self.offset - header.content_start()
                    ),
                ));
            }
        } else {
            self.read_value(&header)?;
            visitor.primitive_value(&self.value)?;
        }

        visitor.end_element(header.tag)?;
        Ok(Some(header))
    }

    fn read_header(&mut self, parent: Option<&Header>) -> Result<Option<Header>> {
        let start = self.offset;
        let mut raw = [0u8; MAX_HEADER_OCTETS];
        let mut keep = |octet: u8, at: u64| {
            if let Some(slot) = raw.get_mut((at - start) as usize) {
                *slot = octet;
            }
        };

        let mut parser = TagParser::new(self.tag_encoding);
        let tag = loop {
            let first = self.offset == start;
            let Some(octet) = self.header_octet(parent, start, first)? else {
                return Ok(None);
            };
            keep(octet, self.offset - 1);
            match parser.push(octet) {
                Ok(TagStep::Done(tag)) => break tag,
                Ok(TagStep::NeedMore) => continue,
                Err(reason) => return Err(self.corrupt_at(start, parent, reason)),
            }
        };

        let first_len = self.required_header_octet(parent, start)?;
        keep(first_len, self.offset - 1);
        let length = if first_len & 0x80 == 0 {
            first_len as u32
        } else {
            let count = (first_len & 0x7F) as usize;
            if count == 0 {
                return Err(self.corrupt_at(start, parent, "indefinite length not supported"));
            }
            if count > MAX_LENGTH_OCTETS {
                return Err(self.corrupt_at(
                    start,
                    parent,
                    format!("length field of {} octets not supported", count),
                ));
            }
            let mut length: u32 = 0;
            for _ in 0..count {
                let octet = self.required_header_octet(parent, start)?;
                keep(octet, self.offset - 1);
                length = (length << 8) | octet as u32;
            }
            length
        };

        Ok(Some(Header {
            tag,
            length,
            offset: start,
            header_len: (self.offset - start) as u32,
            raw,
        }))
    }

    fn required_header_octet(&mut self, parent: Option<&Header>, start: u64) -> Result<u8> {
        match self.header_octet(parent, start, false)? {
            Some(octet) => Ok(octet),
            None => Err(self.corrupt_at(start, parent, "source ended inside an element header")),
        }
    }

    /// Next header octet, honouring the enclosing element's bound.
    ///
    /// `None` means a clean end of source before the first octet of a
    /// top-level element.
    fn header_octet(
        &mut self,
        parent: Option<&Header>,
        start: u64,
        first: bool,
    ) -> Result<Option<u8>> {
        if let Some(parent) = parent {
            if self.offset >= parent.end() {
                return Err(Error::corrupt(
                    start,
                    Some(parent.offset),
                    format!(
                        "declared length {} but children occupy more than {} bytes",
                        parent.length,
                        self.offset - parent.content_start()
                    ),
                ));
            }
        }
        let mut byte = [0u8; 1];
        if self.read_some(&mut byte)? == 0 {
            if first && parent.is_none() {
                return Ok(None);
            }
            return Err(Error::corrupt(
                self.offset,
                parent.map(|p| p.offset),
                "unexpected end of source",
            ));
        }
        Ok(Some(byte[0]))
    }

    fn read_value(&mut self, header: &Header) -> Result<()> {
        self.value.clear();
        let wanted = header.length as u64;
        let got = (&mut self.source).take(wanted).read_to_end(&mut self.value)?;
        self.offset += got as u64;
        if (got as u64) < wanted {
            return Err(Error::corrupt(
                self.offset,
                Some(header.offset),
                format!(
                    "expected {} value bytes for {}, source ended after {}",
                    wanted, header.tag, got
                ),
            ));
        }
        Ok(())
    }

    /// One read call, retried on interruption; 0 means exhausted.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.source.read(buf) {
                Ok(n) => {
                    self.offset += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn corrupt_at(&self, start: u64, parent: Option<&Header>, reason: impl Into<String>) -> Error {
        Error::corrupt(start, parent.map(|p| p.offset), reason)
    }
}

fn overrun(parent: &Header, child: &Header) -> Error {
    Error::corrupt(
        child.offset,
        Some(parent.offset),
        format!(
            "declared length {} but children occupy {} bytes",
            parent.length,
            child.end() - parent.content_start()
        ),
    )
}

/// Read a whole source into an event list.
pub fn read_events<R: Read>(source: R, encoding: TagEncoding) -> Result<Vec<StructuralEvent>> {
    let mut events = Vec::new();
    TlvReader::new(source)
        .with_tag_encoding(encoding)
        .process(&mut events)?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    /// Hands out at most `chunk` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        chunk: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn events(data: &[u8]) -> Result<Vec<StructuralEvent>> {
        read_events(data, TagEncoding::SingleOctet)
    }

    fn corrupt_offsets(err: Error) -> (u64, Option<u64>, String) {
        match err {
            Error::CorruptStructure {
                offset,
                element_offset,
                reason,
                ..
            } => (offset, element_offset, reason),
            other => panic!("expected corrupt structure, got {other}"),
        }
    }

    #[test]
    fn nested_sequence_events() {
        let evs = events(&hex!("30 06 02 01 05 04 01 41")).unwrap();
        assert_eq!(
            evs,
            vec![
                StructuralEvent::ElementStart {
                    tag: Tag::SEQUENCE,
                    length: 6,
                    constructed: true,
                    offset: 0
                },
                StructuralEvent::ElementStart {
                    tag: Tag::INTEGER,
                    length: 1,
                    constructed: false,
                    offset: 2
                },
                StructuralEvent::PrimitiveValue(vec![0x05]),
                StructuralEvent::ElementEnd(Tag::INTEGER),
                StructuralEvent::ElementStart {
                    tag: Tag::OCTET_STRING,
                    length: 1,
                    constructed: false,
                    offset: 5
                },
                StructuralEvent::PrimitiveValue(vec![0x41]),
                StructuralEvent::ElementEnd(Tag::OCTET_STRING),
                StructuralEvent::ElementEnd(Tag::SEQUENCE),
            ]
        );
    }

    #[test]
    fn empty_source_yields_nothing() {
        assert!(events(&[]).unwrap().is_empty());
    }

    #[test]
    fn zero_length_primitive() {
        let evs = events(&hex!("05 00")).unwrap();
        assert_eq!(evs[1], StructuralEvent::PrimitiveValue(Vec::new()));
        assert_eq!(evs.len(), 3);
    }

    #[test]
    fn long_form_length() {
        let mut data = hex!("04 81 80").to_vec();
        data.extend(std::iter::repeat(0xAB).take(0x80));
        let evs = events(&data).unwrap();
        match &evs[1] {
            StructuralEvent::PrimitiveValue(v) => assert_eq!(v.len(), 0x80),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn headers_keep_their_original_octets() {
        struct Headers(Vec<Header>);
        impl TlvVisitor for Headers {
            fn start_element(&mut self, header: &Header) -> Result<()> {
                self.0.push(*header);
                Ok(())
            }
            fn primitive_value(&mut self, _: &[u8]) -> Result<()> {
                Ok(())
            }
            fn end_element(&mut self, _: Tag) -> Result<()> {
                Ok(())
            }
        }

        let data = hex!("30 82 00 05 9F 1F 81 01 41");
        let mut headers = Headers(Vec::new());
        TlvReader::new(&data[..])
            .with_tag_encoding(TagEncoding::MultiOctet)
            .process(&mut headers)
            .unwrap();
        assert_eq!(headers.0[0].octets(), hex!("30 82 00 05"));
        assert_eq!(headers.0[1].octets(), hex!("9F 1F 81 01"));
        assert_eq!(headers.0[1].header_len, 4);

        let der = Header::new(Tag::context(31), 1, 0);
        assert_eq!(der.octets(), hex!("9F 1F 01"));
    }

    #[test]
    fn indefinite_length_rejected() {
        let (offset, _, reason) = corrupt_offsets(events(&hex!("30 80 02 01 05 00 00")).unwrap_err());
        assert_eq!(offset, 0);
        assert!(reason.contains("indefinite"));
    }

    #[test]
    fn oversized_length_field_rejected() {
        let (_, _, reason) = corrupt_offsets(events(&hex!("04 85 00 00 00 00 01 00")).unwrap_err());
        assert!(reason.contains("5 octets"));
    }

    #[test]
    fn truncated_value_reports_current_offset() {
        let (offset, element, _) = corrupt_offsets(events(&hex!("04 05 41 42")).unwrap_err());
        assert_eq!(offset, 4);
        assert_eq!(element, Some(0));
    }

    #[test]
    fn truncated_children_report_enclosing_element() {
        let (offset, element, _) = corrupt_offsets(events(&hex!("30 06 02 01 05 04 01")).unwrap_err());
        assert_eq!(offset, 7);
        assert_eq!(element, Some(5));

        let (_, element, _) = corrupt_offsets(events(&hex!("30 06 02 01 05")).unwrap_err());
        assert_eq!(element, Some(0));
    }

    #[test]
    fn padded_children_report_enclosing_element() {
        let (_, element, reason) =
            corrupt_offsets(events(&hex!("30 07 02 01 05 04 01 41 00")).unwrap_err());
        assert_eq!(element, Some(0));
        assert!(reason.contains("declared length 7"));
    }

    #[test]
    fn child_overrunning_parent_is_rejected() {
        let (offset, element, reason) =
            corrupt_offsets(events(&hex!("30 03 04 05 41 42 43 44 45")).unwrap_err());
        assert_eq!(offset, 2);
        assert_eq!(element, Some(0));
        assert!(reason.contains("children occupy 7"));
    }

    #[test]
    fn partial_reads_are_retried() {
        let data = hex!("30 06 02 01 05 04 01 41 02 01 07");
        let slow = read_events(Trickle { data: &data, chunk: 1 }, TagEncoding::SingleOctet).unwrap();
        assert_eq!(slow, events(&data).unwrap());
    }

    #[test]
    fn multi_octet_tags_need_opt_in() {
        let data = hex!("9F 1F 01 2A");
        assert!(events(&data).is_err());
        let evs = read_events(&data[..], TagEncoding::MultiOctet).unwrap();
        assert_eq!(
            evs[0],
            StructuralEvent::ElementStart {
                tag: Tag::context(31),
                length: 1,
                constructed: false,
                offset: 0
            }
        );
    }

    #[test]
    fn depth_limit() {
        let data = hex!("30 04 30 02 30 00");
        let mut sink = Vec::new();
        let err = TlvReader::new(&data[..])
            .with_max_depth(2)
            .process(&mut sink)
            .unwrap_err();
        assert!(err.to_string().contains("nesting deeper"));
    }

    #[test]
    fn skip_resynchronises_on_top_level_boundary() {
        struct FailOnValue;
        impl TlvVisitor for FailOnValue {
            fn start_element(&mut self, _: &Header) -> Result<()> {
                Ok(())
            }
            fn primitive_value(&mut self, value: &[u8]) -> Result<()> {
                if value == [0xFF] {
                    return Err(Error::state("", "boom"));
                }
                Ok(())
            }
            fn end_element(&mut self, _: Tag) -> Result<()> {
                Ok(())
            }
        }

        let data = hex!("30 06 02 01 FF 04 01 41 02 01 07");
        let mut reader = TlvReader::new(&data[..]);
        assert!(reader.next_element(&mut FailOnValue).is_err());
        assert!(reader.skip_current_element().unwrap());
        assert_eq!(reader.offset(), 8);
        let next = reader.next_element(&mut FailOnValue).unwrap().unwrap();
        assert_eq!(next.tag, Tag::INTEGER);
        assert!(reader.next_element(&mut FailOnValue).unwrap().is_none());
    }
}
