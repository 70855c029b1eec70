//! Schema-driven semantic mapper.
//!
//! [`SemanticMapper`] sits between the [`TlvReader`](crate::TlvReader) and a
//! [`SemanticSink`]. It keeps a frame stack that mirrors the reader's nesting,
//! resolves every tag against the [`Schema`], and turns primitive values into
//! path-qualified field events such as `("msg.id", [0x05], INTEGER)`.
//!
//! ANY DEFINED BY elements are captured lazily: their content octets,
//! nested headers included as they appeared on the wire, are handed to the
//! sink as one field when the element closes, leaving type selection to
//! whoever holds the whole record.

use crate::error::{Error, Result};
use crate::schema::{Schema, TypeDefinition, TypeKind, TypeTag};
use crate::tag::Tag;
use crate::tlv::{Header, TlvVisitor};
use log::{trace, warn};
use std::sync::Arc;

/// Upper bound on the up-front reservation for an ANY capture; the
/// declared length is untrusted until the bytes arrive.
const CAPTURE_RESERVE: usize = 64 * 1024;

/// One primitive field, borrowed from the mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldEvent<'a> {
    pub path: &'a str,
    /// `None` when the field was nulled by skip-field recovery.
    pub value: Option<&'a [u8]>,
    pub declared_type: TypeTag,
    pub offset: u64,
}

/// Owned copy of a [`FieldEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub path: String,
    pub value: Option<Vec<u8>>,
    pub declared_type: TypeTag,
    pub offset: u64,
}

impl From<FieldEvent<'_>> for Field {
    fn from(event: FieldEvent<'_>) -> Self {
        Field {
            path: event.path.to_string(),
            value: event.value.map(<[u8]>::to_vec),
            declared_type: event.declared_type,
            offset: event.offset,
        }
    }
}

/// A field that was nulled or dropped instead of failing the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub path: String,
    pub offset: u64,
    pub reason: String,
    /// A null field was emitted in its place; `false` when the element
    /// was skipped without one.
    pub nulled: bool,
}

/// Consumer of semantic events.
pub trait SemanticSink {
    /// An element resolved to `def` was opened.
    fn enter(&mut self, _def: &TypeDefinition, _header: &Header) -> Result<()> {
        Ok(())
    }

    fn field(&mut self, field: FieldEvent<'_>) -> Result<()>;

    /// The most recently entered element closed.
    fn leave(&mut self) -> Result<()> {
        Ok(())
    }

    /// A mandatory component never appeared and was substituted with null.
    ///
    /// Called when the enclosing element closes, so the null follows the
    /// siblings that did appear rather than sitting in document order.
    fn missing(&mut self, def: &TypeDefinition, path: &str, offset: u64) -> Result<()> {
        self.field(FieldEvent {
            path,
            value: None,
            declared_type: def.declared_type(),
            offset,
        })
    }

    fn issue(&mut self, _issue: FieldIssue) {}
}

/// Adapts a closure to [`SemanticSink`].
pub struct FieldFn<F>(pub F);

impl<F> SemanticSink for FieldFn<F>
where
    F: FnMut(FieldEvent<'_>) -> Result<()>,
{
    fn field(&mut self, field: FieldEvent<'_>) -> Result<()> {
        (self.0)(field)
    }
}

/// Collects owned fields and recovery issues.
#[derive(Debug, Default)]
pub struct FieldCollector {
    pub fields: Vec<Field>,
    pub issues: Vec<FieldIssue>,
}

impl SemanticSink for FieldCollector {
    fn field(&mut self, field: FieldEvent<'_>) -> Result<()> {
        self.fields.push(field.into());
        Ok(())
    }

    fn issue(&mut self, issue: FieldIssue) {
        self.issues.push(issue);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameMode {
    Normal,
    /// Subtree swallowed by skip-field recovery.
    Ignored,
    /// Inside an ANY capture.
    Opaque,
}

#[derive(Debug)]
struct Frame {
    def: Option<Arc<TypeDefinition>>,
    tag: Tag,
    constructed: bool,
    offset: u64,
    mode: FrameMode,
    /// Components of a SEQUENCE/SET that have appeared.
    seen: Vec<bool>,
    /// Resolved children; a CHOICE wrapper must end with exactly one.
    children: usize,
    /// Path length before this frame's name was appended.
    path_mark: usize,
}

#[derive(Debug)]
struct Capture {
    depth: usize,
    bytes: Vec<u8>,
}

/// Validating bridge from structural events to semantic events.
pub struct SemanticMapper<'s, S> {
    schema: &'s Schema,
    sink: S,
    frames: Vec<Frame>,
    path: String,
    capture: Option<Capture>,
    recover_fields: bool,
    enforce_mandatory: bool,
}

impl<'s, S: SemanticSink> SemanticMapper<'s, S> {
    pub fn new(schema: &'s Schema, sink: S) -> Self {
        Self {
            schema,
            sink,
            frames: Vec::new(),
            path: String::new(),
            capture: None,
            recover_fields: false,
            enforce_mandatory: true,
        }
    }

    /// Null out leaf mismatches instead of failing (skip-field mode).
    pub fn with_field_recovery(mut self, enabled: bool) -> Self {
        self.recover_fields = enabled;
        self
    }

    /// Check that non-OPTIONAL components appeared when a SEQUENCE closes.
    pub fn with_mandatory_check(mut self, enabled: bool) -> Self {
        self.enforce_mandatory = enabled;
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Dot-path of the innermost open schema element.
    pub fn current_path(&self) -> &str {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True between top-level elements.
    pub fn is_idle(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop all per-element state after a failed record.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.path.clear();
        self.capture = None;
    }

    fn push(&mut self, def: Option<Arc<TypeDefinition>>, header: &Header, mode: FrameMode) {
        let path_mark = self.path.len();
        if let (Some(def), FrameMode::Normal | FrameMode::Ignored) = (&def, mode) {
            if !self.path.is_empty() {
                self.path.push('.');
            }
            self.path.push_str(def.name());
        }
        let seen = match def.as_deref().and_then(TypeDefinition::components) {
            Some(components) if mode == FrameMode::Normal => vec![false; components.len()],
            _ => Vec::new(),
        };
        self.frames.push(Frame {
            def,
            tag: header.tag,
            constructed: header.is_constructed(),
            offset: header.offset,
            mode,
            seen,
            children: 0,
            path_mark,
        });
    }

    fn mismatch(
        &self,
        offset: u64,
        expected: impl Into<String>,
        actual: impl Into<String>,
        reason: impl Into<String>,
        field_local: bool,
    ) -> Error {
        Error::GrammarMismatch {
            offset,
            path: self.path.clone(),
            expected: expected.into(),
            actual: actual.into(),
            reason: reason.into(),
            field_local,
        }
    }

    fn report(&mut self, path: String, offset: u64, err: &Error, nulled: bool) {
        if nulled {
            warn!("nulling field {} at byte {}: {}", path, offset, err);
        } else {
            warn!("skipping element {} at byte {}: {}", path, offset, err);
        }
        self.sink.issue(FieldIssue {
            path,
            offset,
            reason: err.to_string(),
            nulled,
        });
    }

    fn resolve(&mut self, header: &Header) -> Result<Option<Arc<TypeDefinition>>> {
        let tag = header.tag;
        let Some(parent) = self.frames.last() else {
            return match self.schema.resolve_top_level(&tag) {
                Some(def) => Ok(Some(Arc::clone(def))),
                None => Err(self.mismatch(
                    header.offset,
                    "a top-level type",
                    tag.to_string(),
                    "unknown top-level tag",
                    false,
                )),
            };
        };

        let parent_def = parent
            .def
            .clone()
            .ok_or_else(|| Error::state(self.path.clone(), "open element has no definition"))?;
        if parent_def.expects_constructed() != Some(true) || !parent.constructed {
            return Err(self.mismatch(
                header.offset,
                format!("primitive {}", parent_def.declared_type()),
                tag.to_string(),
                "nested element where primitive expected",
                false,
            ));
        }

        let chosen = parent.children;
        match parent_def.child_with_index(&tag)? {
            Some((_, def)) if chosen > 0 && matches!(parent_def.kind(), TypeKind::Choice(_)) => {
                let err = self.mismatch(
                    header.offset,
                    format!("one alternative of {}", parent_def.name()),
                    format!("a second alternative {}", tag),
                    format!("more than one alternative within {}", parent_def.name()),
                    !header.is_constructed(),
                );
                if self.recover_fields && err.is_field_local() {
                    let path = format!("{}.{}", self.path, def.name());
                    self.report(path, header.offset, &err, false);
                    return Ok(None);
                }
                Err(err)
            }
            Some((index, def)) => {
                let def = Arc::clone(def);
                if let Some(frame) = self.frames.last_mut() {
                    frame.children += 1;
                    if let Some(seen) = index.and_then(|i| frame.seen.get_mut(i)) {
                        *seen = true;
                    }
                }
                Ok(Some(def))
            }
            None => {
                let err = self.mismatch(
                    header.offset,
                    format!("a component of {}", parent_def.name()),
                    tag.to_string(),
                    format!("unknown nested tag within {}", parent_def.name()),
                    !header.is_constructed(),
                );
                if self.recover_fields && err.is_field_local() {
                    let path = format!("{}.{}", self.path, tag);
                    self.report(path, header.offset, &err, false);
                    return Ok(None);
                }
                Err(err)
            }
        }
    }

    fn close_sequence(&mut self, frame: &Frame) -> Result<()> {
        let Some(def) = &frame.def else {
            return Ok(());
        };
        let Some(components) = def.components() else {
            return Ok(());
        };
        for (component, seen) in components.iter().zip(&frame.seen) {
            if *seen || component.is_optional() {
                continue;
            }
            let path = format!("{}.{}", self.path, component.name());
            let err = Error::GrammarMismatch {
                offset: frame.offset,
                path: path.clone(),
                expected: format!("component {}", component.name()),
                actual: format!("end of {}", def.name()),
                reason: "missing mandatory component".to_string(),
                field_local: true,
            };
            if !self.recover_fields {
                return Err(err);
            }
            self.report(path.clone(), frame.offset, &err, true);
            self.sink.missing(component, &path, frame.offset)?;
        }
        Ok(())
    }

    /// A tagged CHOICE wrapper that closed without any alternative.
    fn close_choice(&mut self, frame: &Frame) -> Result<()> {
        let Some(def) = &frame.def else {
            return Ok(());
        };
        if frame.children > 0 || !matches!(def.kind(), TypeKind::Choice(_)) {
            return Ok(());
        }
        let err = Error::GrammarMismatch {
            offset: frame.offset,
            path: self.path.clone(),
            expected: format!("one alternative of {}", def.name()),
            actual: format!("empty {}", frame.tag),
            reason: "CHOICE holds no alternative".to_string(),
            field_local: true,
        };
        if !self.recover_fields {
            return Err(err);
        }
        let path = self.path.clone();
        self.report(path, frame.offset, &err, false);
        Ok(())
    }
}

impl<S: SemanticSink> TlvVisitor for SemanticMapper<'_, S> {
    fn start_element(&mut self, header: &Header) -> Result<()> {
        if let Some(capture) = &mut self.capture {
            capture.bytes.extend_from_slice(header.octets());
            self.push(None, header, FrameMode::Opaque);
            return Ok(());
        }
        if matches!(self.frames.last(), Some(f) if f.mode == FrameMode::Ignored) {
            self.push(None, header, FrameMode::Ignored);
            return Ok(());
        }

        let Some(def) = self.resolve(header)? else {
            self.push(None, header, FrameMode::Ignored);
            return Ok(());
        };

        if let Some(expected) = def.expects_constructed() {
            if expected != header.is_constructed() {
                let form = |c: bool| if c { "constructed" } else { "primitive" };
                let top_level = self.frames.is_empty();
                self.push(Some(Arc::clone(&def)), header, FrameMode::Ignored);
                let err = self.mismatch(
                    header.offset,
                    format!("{} {}", form(expected), def.declared_type()),
                    format!("{} {}", form(header.is_constructed()), header.tag),
                    "primitive/constructed mismatch",
                    !top_level,
                );
                if !(self.recover_fields && err.is_field_local()) {
                    return Err(err);
                }
                let path = self.path.clone();
                self.report(path, header.offset, &err, true);
                self.sink.enter(&def, header)?;
                self.sink.field(FieldEvent {
                    path: &self.path,
                    value: None,
                    declared_type: def.declared_type(),
                    offset: header.offset,
                })?;
                return Ok(());
            }
        }

        trace!("enter {} ({}) at {}", def.name(), header.tag, header.offset);
        self.push(Some(Arc::clone(&def)), header, FrameMode::Normal);
        self.sink.enter(&def, header)?;
        if def.is_any() && header.is_constructed() {
            self.capture = Some(Capture {
                depth: self.frames.len(),
                bytes: Vec::with_capacity((header.length as usize).min(CAPTURE_RESERVE)),
            });
        }
        Ok(())
    }

    fn primitive_value(&mut self, value: &[u8]) -> Result<()> {
        let Some(top) = self.frames.last() else {
            return Err(Error::state("", "value with empty state"));
        };
        if top.constructed {
            return Err(Error::state(
                self.path.clone(),
                "primitive value for constructed element",
            ));
        }
        match top.mode {
            FrameMode::Opaque => {
                if let Some(capture) = &mut self.capture {
                    capture.bytes.extend_from_slice(value);
                }
                return Ok(());
            }
            FrameMode::Ignored => return Ok(()),
            FrameMode::Normal => {}
        }
        let Some(def) = &top.def else {
            return Err(Error::state(self.path.clone(), "open element has no definition"));
        };
        self.sink.field(FieldEvent {
            path: &self.path,
            value: Some(value),
            declared_type: def.declared_type(),
            offset: top.offset,
        })
    }

    fn end_element(&mut self, tag: Tag) -> Result<()> {
        let Some(frame) = self.frames.pop() else {
            return Err(Error::state(
                "",
                format!("mismatched end tag {} with no open element", tag),
            ));
        };
        if frame.tag != tag {
            let path = self.path.clone();
            self.frames.push(frame);
            return Err(Error::state(path, format!("end tag {} does not match open element", tag)));
        }

        match frame.mode {
            FrameMode::Opaque => {}
            FrameMode::Ignored => {
                if frame.def.is_some() {
                    self.sink.leave()?;
                }
            }
            FrameMode::Normal => {
                let capture_closes = matches!(&self.capture, Some(c) if c.depth == self.frames.len() + 1);
                if capture_closes {
                    if let Some(capture) = self.capture.take() {
                        self.sink.field(FieldEvent {
                            path: &self.path,
                            value: Some(&capture.bytes),
                            declared_type: TypeTag::Any,
                            offset: frame.offset,
                        })?;
                    }
                }
                self.close_choice(&frame)?;
                if self.enforce_mandatory {
                    self.close_sequence(&frame)?;
                }
                self.sink.leave()?;
                if let Some(def) = &frame.def {
                    trace!("leave {}", def.name());
                }
            }
        }
        self.path.truncate(frame.path_mark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagEncoding;
    use crate::tlv::TlvReader;
    use hex_literal::hex;

    fn msg_schema() -> Schema {
        Schema::builder()
            .root(
                TypeDefinition::sequence(
                    "msg",
                    vec![
                        TypeDefinition::primitive("id", TypeTag::Integer),
                        TypeDefinition::primitive("payload", TypeTag::OctetString).optional(),
                    ],
                )
                .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn map(schema: &Schema, data: &[u8], recover: bool) -> (Result<()>, FieldCollector) {
        let mut mapper =
            SemanticMapper::new(schema, FieldCollector::default()).with_field_recovery(recover);
        let result = TlvReader::new(data)
            .with_tag_encoding(TagEncoding::SingleOctet)
            .process(&mut mapper);
        (result, mapper.into_sink())
    }

    fn paths(collector: &FieldCollector) -> Vec<&str> {
        collector.fields.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn emits_path_qualified_fields() {
        let schema = msg_schema();
        let (result, out) = map(&schema, &hex!("30 06 02 01 05 04 01 41"), false);
        result.unwrap();
        assert_eq!(
            out.fields,
            vec![
                Field {
                    path: "msg.id".into(),
                    value: Some(vec![0x05]),
                    declared_type: TypeTag::Integer,
                    offset: 2,
                },
                Field {
                    path: "msg.payload".into(),
                    value: Some(vec![0x41]),
                    declared_type: TypeTag::OctetString,
                    offset: 5,
                },
            ]
        );
    }

    #[test]
    fn unknown_top_level_tag() {
        let schema = msg_schema();
        let (result, _) = map(&schema, &hex!("31 00"), false);
        match result.unwrap_err() {
            Error::GrammarMismatch { offset, path, reason, .. } => {
                assert_eq!(offset, 0);
                assert!(path.is_empty());
                assert_eq!(reason, "unknown top-level tag");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn unknown_nested_tag_names_parent() {
        let schema = msg_schema();
        let (result, _) = map(&schema, &hex!("30 06 02 01 05 01 01 FF"), false);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unknown nested tag within msg"));
        assert_eq!(err.path(), "msg");
        assert_eq!(err.offset(), Some(5));
    }

    #[test]
    fn unknown_leaf_is_dropped_under_field_recovery() {
        let schema = msg_schema();
        let (result, out) = map(&schema, &hex!("30 09 02 01 05 01 01 FF 04 01 41"), true);
        result.unwrap();
        assert_eq!(paths(&out), ["msg.id", "msg.payload"]);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].path, "msg.[UNIVERSAL 1]");
    }

    #[test]
    fn constructed_where_primitive_expected() {
        let schema = msg_schema();
        let data = hex!("30 07 22 03 02 01 05 04 00");
        let (result, _) = map(&schema, &data, false);
        assert!(result.unwrap_err().to_string().contains("primitive/constructed mismatch"));

        let (result, out) = map(&schema, &data, true);
        result.unwrap();
        assert_eq!(out.fields[0].path, "msg.id");
        assert_eq!(out.fields[0].value, None);
        assert_eq!(out.fields[1].value, Some(vec![]));
    }

    #[test]
    fn missing_mandatory_component() {
        let schema = msg_schema();
        let (result, _) = map(&schema, &hex!("30 03 04 01 41"), false);
        let err = result.unwrap_err();
        assert!(err.is_field_local());
        assert_eq!(err.path(), "msg.id");

        let (result, out) = map(&schema, &hex!("30 03 04 01 41"), true);
        result.unwrap();
        assert_eq!(paths(&out), ["msg.payload", "msg.id"]);
        assert_eq!(out.fields[1].value, None);
    }

    #[test]
    fn mandatory_check_can_be_disabled() {
        let schema = msg_schema();
        let mut mapper =
            SemanticMapper::new(&schema, FieldCollector::default()).with_mandatory_check(false);
        TlvReader::new(&hex!("30 03 04 01 41")[..]).process(&mut mapper).unwrap();
        assert_eq!(mapper.sink().fields.len(), 1);
    }

    #[test]
    fn nested_paths_and_choices() {
        let header = TypeDefinition::sequence(
            "header",
            vec![TypeDefinition::primitive("version", TypeTag::Integer).with_tag(Tag::context(0))],
        )
        .unwrap()
        .with_tag(Tag::context(1));
        let body = TypeDefinition::choice(
            "body",
            vec![
                TypeDefinition::primitive("text", TypeTag::Utf8String).with_tag(Tag::context(0)),
                TypeDefinition::primitive("flag", TypeTag::Boolean).with_tag(Tag::context(1)),
            ],
        )
        .unwrap()
        .with_tag(Tag::context(2));
        let schema = Schema::builder()
            .root(TypeDefinition::sequence("record", vec![header, body]).unwrap())
            .build()
            .unwrap();

        let data = hex!("30 0A A1 03 80 01 02 A2 03 81 01 FF");
        let (result, out) = map(&schema, &data, false);
        result.unwrap();
        assert_eq!(paths(&out), ["record.header.version", "record.body.flag"]);
        assert_eq!(out.fields[1].declared_type, TypeTag::Boolean);
    }

    #[test]
    fn any_defined_by_is_captured_whole() {
        let schema = Schema::builder()
            .root(
                TypeDefinition::sequence(
                    "param",
                    vec![
                        TypeDefinition::primitive("kind", TypeTag::Integer),
                        TypeDefinition::any_defined_by("value", "kind"),
                    ],
                )
                .unwrap(),
            )
            .build()
            .unwrap();
        let data = hex!("30 0B 02 01 01 A0 06 04 01 41 01 01 FF");
        let (result, out) = map(&schema, &data, false);
        result.unwrap();
        assert_eq!(paths(&out), ["param.kind", "param.value"]);
        assert_eq!(out.fields[1].declared_type, TypeTag::Any);
        assert_eq!(out.fields[1].value, Some(hex!("04 01 41 01 01 FF").to_vec()));

        // long-form length on a nested header survives the capture
        let data = hex!("30 0C 02 01 01 A0 07 04 81 01 41 01 01 FF");
        let (result, out) = map(&schema, &data, false);
        result.unwrap();
        assert_eq!(out.fields[1].value, Some(hex!("04 81 01 41 01 01 FF").to_vec()));
    }

    #[test]
    fn capture_reserve_is_bounded_by_declared_length() {
        let schema = Schema::builder()
            .root(
                TypeDefinition::sequence(
                    "param",
                    vec![
                        TypeDefinition::primitive("kind", TypeTag::Integer),
                        TypeDefinition::any_defined_by("value", "kind"),
                    ],
                )
                .unwrap(),
            )
            .build()
            .unwrap();
        let mut mapper = SemanticMapper::new(&schema, FieldCollector::default());
        mapper.start_element(&Header::new(Tag::SEQUENCE, 0x7FFF_FFFF, 0)).unwrap();
        mapper.start_element(&Header::new(Tag::INTEGER, 1, 6)).unwrap();
        mapper.primitive_value(&[1]).unwrap();
        mapper.end_element(Tag::INTEGER).unwrap();
        mapper.start_element(&Header::new(Tag::context(0).constructed(), 0x7FFF_FFF0, 9)).unwrap();
        let capture = mapper.capture.as_ref().unwrap();
        assert!(capture.bytes.capacity() <= CAPTURE_RESERVE);

        // a truncated stream with the same declared lengths fails cleanly
        let (result, _) = map(&schema, &hex!("30 84 7F FF FF FF 02 01 01 A0 84 7F FF FF F0 04 01"), false);
        assert!(result.unwrap_err().is_structural());
    }

    fn choice_schema() -> Schema {
        let body = TypeDefinition::choice(
            "body",
            vec![
                TypeDefinition::primitive("text", TypeTag::Utf8String).with_tag(Tag::context(0)),
                TypeDefinition::primitive("flag", TypeTag::Boolean).with_tag(Tag::context(1)),
            ],
        )
        .unwrap()
        .with_tag(Tag::context(2));
        Schema::builder()
            .root(
                TypeDefinition::sequence(
                    "record",
                    vec![TypeDefinition::primitive("id", TypeTag::Integer), body],
                )
                .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn empty_choice_wrapper() {
        let schema = choice_schema();
        let data = hex!("30 05 02 01 01 A2 00");
        let (result, _) = map(&schema, &data, false);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("CHOICE holds no alternative"));
        assert_eq!(err.path(), "record.body");
        assert_eq!(err.offset(), Some(5));

        let (result, out) = map(&schema, &data, true);
        result.unwrap();
        assert_eq!(paths(&out), ["record.id"]);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].path, "record.body");
        assert!(!out.issues[0].nulled);
    }

    #[test]
    fn choice_wrapper_with_two_alternatives() {
        let schema = choice_schema();
        let data = hex!("30 0B 02 01 01 A2 06 80 01 41 81 01 FF");
        let (result, out) = map(&schema, &data, false);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("more than one alternative within body"));
        assert_eq!(err.offset(), Some(10));
        assert_eq!(paths(&out), ["record.id", "record.body.text"]);

        let (result, out) = map(&schema, &data, true);
        result.unwrap();
        assert_eq!(paths(&out), ["record.id", "record.body.text"]);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].path, "record.body.flag");
        assert!(!out.issues[0].nulled);
    }

    #[test]
    fn primitive_any_passes_bytes_through() {
        let schema = Schema::builder()
            .root(
                TypeDefinition::sequence(
                    "param",
                    vec![
                        TypeDefinition::primitive("kind", TypeTag::Integer),
                        TypeDefinition::any_defined_by("value", "kind"),
                    ],
                )
                .unwrap(),
            )
            .build()
            .unwrap();
        let (result, out) = map(&schema, &hex!("30 06 02 01 02 1A 01 5A"), false);
        result.unwrap();
        assert_eq!(out.fields[1].value, Some(vec![0x5A]));
        assert_eq!(out.fields[1].declared_type, TypeTag::Any);
    }

    #[test]
    fn unbalanced_events_are_state_errors() {
        let schema = msg_schema();
        let mut mapper = SemanticMapper::new(&schema, FieldCollector::default());
        assert!(mapper.primitive_value(&[1]).unwrap_err().is_fatal());
        assert!(mapper.end_element(Tag::SEQUENCE).unwrap_err().is_fatal());
    }

    #[test]
    fn reset_returns_to_idle() {
        let schema = msg_schema();
        let mut mapper = SemanticMapper::new(&schema, FieldCollector::default());
        let header = Header::new(Tag::SEQUENCE, 3, 0);
        mapper.start_element(&header).unwrap();
        assert_eq!(mapper.current_path(), "msg");
        assert!(!mapper.is_idle());
        mapper.reset();
        assert!(mapper.is_idle());
        assert_eq!(mapper.current_path(), "");
    }

    #[test]
    fn closure_sink() {
        let schema = msg_schema();
        let mut seen = Vec::new();
        {
            let sink = FieldFn(|f: FieldEvent<'_>| {
                seen.push((f.path.to_string(), f.declared_type));
                Ok::<(), Error>(())
            });
            let mut mapper = SemanticMapper::new(&schema, sink);
            TlvReader::new(&hex!("30 03 02 01 07")[..]).process(&mut mapper).unwrap();
        }
        assert_eq!(seen, vec![("msg.id".to_string(), TypeTag::Integer)]);
    }
}
