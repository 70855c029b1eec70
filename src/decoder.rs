//! Record driver: wires the TLV reader, the semantic mapper and an
//! assembler together and applies the configured error mode per
//! top-level element.

use crate::error::{Error, Result};
use crate::mapper::{Field, FieldCollector, FieldEvent, FieldIssue, SemanticMapper, SemanticSink};
use crate::schema::{Schema, TypeDefinition};
use crate::tlv::{Header, TlvReader, DEFAULT_MAX_DEPTH};
use crate::tree::{Node, TreeBuilder};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::mem;
use std::str::FromStr;

/// What to do when a top-level element fails to decode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorMode {
    /// Stop at the first error.
    #[default]
    FailFast,
    /// Drop the failing element and resume at the next one.
    SkipRecord,
    /// Null leaf fields that do not match the schema; otherwise as `SkipRecord`.
    SkipField,
}

impl ErrorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorMode::FailFast => "fail-fast",
            ErrorMode::SkipRecord => "skip-record",
            ErrorMode::SkipField => "skip-field",
        }
    }
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail-fast" => Ok(ErrorMode::FailFast),
            "skip-record" => Ok(ErrorMode::SkipRecord),
            "skip-field" => Ok(ErrorMode::SkipField),
            other => Err(format!(
                "unknown error mode '{}' (expected fail-fast, skip-record or skip-field)",
                other
            )),
        }
    }
}

/// Decoder settings, fixed before processing begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
    #[serde(default)]
    pub error_mode: ErrorMode,

    /// Report non-OPTIONAL SEQUENCE components that never appeared
    #[serde(default = "default_true")]
    pub enforce_mandatory: bool,

    /// Nesting limit for the TLV reader
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            error_mode: ErrorMode::default(),
            enforce_mandatory: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl DecodeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    pub fn with_mandatory_check(mut self, enabled: bool) -> Self {
        self.enforce_mandatory = enabled;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

/// One successfully decoded top-level element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<T = Vec<Field>> {
    /// Position among the top-level elements of the stream, from 0.
    pub index: u64,
    pub offset: u64,
    pub content: T,
    /// Fields nulled or dropped under skip-field.
    pub issues: Vec<FieldIssue>,
}

/// A top-level element given up on under skip-record or skip-field.
#[derive(Debug)]
pub struct DroppedRecord {
    pub index: u64,
    pub offset: u64,
    pub error: Error,
}

#[derive(Debug)]
pub enum RecordOutcome<T = Vec<Field>> {
    Decoded(Record<T>),
    Dropped(DroppedRecord),
}

/// Turns the semantic events of one top-level element into a value.
pub trait RecordAssembler: SemanticSink {
    type Output;

    /// Called after a top-level element closed without error.
    fn finish(&mut self) -> Option<Self::Output>;

    /// Called after a failed element; drop anything partial.
    fn discard(&mut self);
}

impl RecordAssembler for FieldCollector {
    type Output = Vec<Field>;

    fn finish(&mut self) -> Option<Self::Output> {
        self.issues.clear();
        Some(mem::take(&mut self.fields))
    }

    fn discard(&mut self) {
        self.fields.clear();
        self.issues.clear();
    }
}

impl RecordAssembler for TreeBuilder {
    type Output = Node;

    fn finish(&mut self) -> Option<Self::Output> {
        self.take_root()
    }

    fn discard(&mut self) {
        TreeBuilder::discard(self);
        self.take_roots();
    }
}

/// Keeps the issues of the element in flight next to the assembler.
struct Recording<A> {
    inner: A,
    issues: Vec<FieldIssue>,
}

impl<A: SemanticSink> SemanticSink for Recording<A> {
    fn enter(&mut self, def: &TypeDefinition, header: &Header) -> Result<()> {
        self.inner.enter(def, header)
    }

    fn field(&mut self, field: FieldEvent<'_>) -> Result<()> {
        self.inner.field(field)
    }

    fn leave(&mut self) -> Result<()> {
        self.inner.leave()
    }

    fn missing(&mut self, def: &TypeDefinition, path: &str, offset: u64) -> Result<()> {
        self.inner.missing(def, path, offset)
    }

    fn issue(&mut self, issue: FieldIssue) {
        self.issues.push(issue.clone());
        self.inner.issue(issue);
    }
}

/// Counts for one decoded stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub decoded: u64,
    pub dropped: u64,
    /// Fields replaced by null under skip-field.
    pub nulled: u64,
    /// Elements skipped under skip-field without a null in their place.
    pub skipped: u64,
}

impl DecodeSummary {
    pub fn record<T>(&mut self, outcome: &RecordOutcome<T>) {
        match outcome {
            RecordOutcome::Decoded(record) => {
                self.decoded += 1;
                let nulled = record.issues.iter().filter(|i| i.nulled).count() as u64;
                self.nulled += nulled;
                self.skipped += record.issues.len() as u64 - nulled;
            }
            RecordOutcome::Dropped(_) => self.dropped += 1,
        }
    }
}

/// Everything [`Asn1Decoder::decode_all`] found in a stream.
#[derive(Debug, Default)]
pub struct DecodeReport {
    pub records: Vec<Record>,
    pub dropped: Vec<DroppedRecord>,
    pub summary: DecodeSummary,
}

/// Schema-driven decoder for a stream of concatenated top-level elements.
///
/// The decoder only borrows the schema, so one schema can back any number
/// of decoders on different threads.
#[derive(Debug, Clone)]
pub struct Asn1Decoder<'s> {
    schema: &'s Schema,
    options: DecodeOptions,
}

impl<'s> Asn1Decoder<'s> {
    pub fn new(schema: &'s Schema) -> Self {
        Self {
            schema,
            options: DecodeOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// Flattened field records, one per top-level element.
    pub fn records<R: Read>(&self, source: R) -> Records<'s, R, FieldCollector> {
        self.assemble(source, FieldCollector::default())
    }

    /// Typed trees, one per top-level element.
    pub fn trees<R: Read>(&self, source: R) -> Records<'s, R, TreeBuilder> {
        self.assemble(source, TreeBuilder::new())
    }

    /// Drive a custom assembler.
    pub fn assemble<R: Read, A: RecordAssembler>(&self, source: R, assembler: A) -> Records<'s, R, A> {
        let reader = TlvReader::new(source)
            .with_tag_encoding(self.schema.tag_encoding())
            .with_max_depth(self.options.max_depth);
        let sink = Recording {
            inner: assembler,
            issues: Vec::new(),
        };
        let mapper = SemanticMapper::new(self.schema, sink)
            .with_field_recovery(self.options.error_mode == ErrorMode::SkipField)
            .with_mandatory_check(self.options.enforce_mandatory);
        Records {
            reader,
            mapper,
            mode: self.options.error_mode,
            index: 0,
            done: false,
        }
    }

    /// Decode a whole stream into memory.
    ///
    /// Under fail-fast the first error is returned; otherwise dropped
    /// elements are reported alongside the decoded ones.
    pub fn decode_all<R: Read>(&self, source: R) -> Result<DecodeReport> {
        let mut report = DecodeReport::default();
        for outcome in self.records(source) {
            let outcome = outcome?;
            report.summary.record(&outcome);
            match outcome {
                RecordOutcome::Decoded(record) => report.records.push(record),
                RecordOutcome::Dropped(dropped) => report.dropped.push(dropped),
            }
        }
        Ok(report)
    }
}

/// Lazy iterator over the top-level elements of one stream.
///
/// Yields `Err` once for a fail-fast error or a fatal error, then ends.
pub struct Records<'s, R, A> {
    reader: TlvReader<R>,
    mapper: SemanticMapper<'s, Recording<A>>,
    mode: ErrorMode,
    index: u64,
    done: bool,
}

impl<R: Read, A: RecordAssembler> Records<'_, R, A> {
    /// Bytes consumed from the source so far.
    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }

    fn fail(&mut self, index: u64, offset: u64, err: Error) -> Option<Result<RecordOutcome<A::Output>>> {
        let err = err.with_path(self.mapper.current_path());
        self.mapper.reset();
        let sink = self.mapper.sink_mut();
        sink.inner.discard();
        sink.issues.clear();

        if err.is_fatal() || self.mode == ErrorMode::FailFast {
            self.done = true;
            return Some(Err(err));
        }

        warn!("dropping record {} at byte {}: {}", index, offset, err);
        match self.reader.skip_current_element() {
            Ok(true) => debug!("resumed at byte {}", self.reader.offset()),
            Ok(false) => {
                debug!("cannot resynchronise after record {}; ending stream", index);
                self.done = true;
            }
            Err(e) => {
                warn!("source failed while skipping record {}: {}", index, e);
                self.done = true;
            }
        }
        Some(Ok(RecordOutcome::Dropped(DroppedRecord {
            index,
            offset,
            error: err,
        })))
    }
}

impl<R: Read, A: RecordAssembler> Iterator for Records<'_, R, A> {
    type Item = Result<RecordOutcome<A::Output>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let index = self.index;
        let offset = self.reader.offset();
        match self.reader.next_element(&mut self.mapper) {
            Ok(None) => {
                self.done = true;
                None
            }
            Ok(Some(header)) => {
                self.index += 1;
                let sink = self.mapper.sink_mut();
                let issues = mem::take(&mut sink.issues);
                let Some(content) = sink.inner.finish() else {
                    let err = Error::state("", "element closed without producing a record");
                    return self.fail(index, offset, err);
                };
                debug!("record {} decoded ({} bytes at {})", index, header.end() - header.offset, header.offset);
                Some(Ok(RecordOutcome::Decoded(Record {
                    index,
                    offset: header.offset,
                    content,
                    issues,
                })))
            }
            Err(err) => {
                self.index += 1;
                self.fail(index, offset, err)
            }
        }
    }
}
