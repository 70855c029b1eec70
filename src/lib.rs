//! Schema-driven streaming decoder for BER/DER encoded ASN.1 records.
//!
//! The crate is organised as a pipeline:
//! - [`TlvReader`] reads identifier/length/value octets from any
//!   [`std::io::Read`] and emits well-nested structural events
//! - [`SemanticMapper`] resolves each tag against an immutable [`Schema`]
//!   and turns primitive values into dot-path field events
//! - [`Asn1Decoder`] drives both per top-level element and applies the
//!   configured [`ErrorMode`], yielding flat field records or [`Node`] trees
//!
//! Schemas are built programmatically with [`TypeDefinition`] or loaded
//! from ASN.1 module text with [`grammar::parse`].
//!
//! # Example
//!
//! ```
//! use asn1_schema_stream::{Asn1Decoder, RecordOutcome, Schema, TypeDefinition, TypeTag};
//!
//! let schema = Schema::builder()
//!     .root(TypeDefinition::sequence("msg", vec![
//!         TypeDefinition::primitive("id", TypeTag::Integer),
//!         TypeDefinition::primitive("payload", TypeTag::OctetString),
//!     ]).unwrap())
//!     .build()
//!     .unwrap();
//!
//! let data = [0x30, 0x06, 0x02, 0x01, 0x05, 0x04, 0x01, 0x41];
//! for outcome in Asn1Decoder::new(&schema).records(&data[..]) {
//!     if let RecordOutcome::Decoded(record) = outcome.unwrap() {
//!         assert_eq!(record.content[0].path, "msg.id");
//!         assert_eq!(record.content[1].path, "msg.payload");
//!     }
//! }
//! ```

pub mod decoder;
pub mod error;
pub mod grammar;
pub mod mapper;
pub mod schema;
pub mod tag;
pub mod tlv;
pub mod tree;
pub mod value;

pub use decoder::{
    Asn1Decoder, DecodeOptions, DecodeReport, DecodeSummary, DroppedRecord, ErrorMode, Record,
    RecordAssembler, RecordOutcome, Records,
};
pub use error::{Error, Result, SchemaError};
pub use mapper::{Field, FieldCollector, FieldEvent, FieldFn, FieldIssue, SemanticMapper, SemanticSink};
pub use schema::{Schema, SchemaBuilder, TypeDefinition, TypeKind, TypeTag};
pub use tag::{Tag, TagClass, TagEncoding};
pub use tlv::{read_events, Header, StructuralEvent, TlvReader, TlvVisitor};
pub use tree::{read_trees, Node, NodeBody, TreeBuilder};
pub use value::{Value, ValueError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
