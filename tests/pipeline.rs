use asn1_schema_stream::value::{self, Value};
use asn1_schema_stream::{
    grammar, read_events, read_trees, Asn1Decoder, DecodeOptions, ErrorMode, Field, RecordOutcome,
    Schema, StructuralEvent, Tag, TagEncoding, TypeDefinition, TypeTag,
};
use hex_literal::hex;
use std::sync::Arc;
use std::thread;

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

fn decoded_fields(schema: &Schema, data: &[u8], mode: ErrorMode) -> Vec<Vec<Field>> {
    Asn1Decoder::new(schema)
        .with_options(DecodeOptions::new().with_error_mode(mode))
        .records(data)
        .filter_map(|outcome| match outcome.unwrap() {
            RecordOutcome::Decoded(record) => Some(record.content),
            RecordOutcome::Dropped(_) => None,
        })
        .collect()
}

#[test]
fn sequence_fields_carry_paths_types_and_offsets() {
    let schema = msg_schema();
    let records = decoded_fields(&schema, &hex!("30 06 02 01 05 04 01 41"), ErrorMode::FailFast);
    assert_eq!(records.len(), 1);
    let fields = &records[0];
    assert_eq!(fields.len(), 2);

    assert_eq!(fields[0].path, "msg.id");
    assert_eq!(fields[0].declared_type, TypeTag::Integer);
    assert_eq!(fields[0].value.as_deref(), Some(&[0x05][..]));
    assert_eq!(fields[0].offset, 2);

    assert_eq!(fields[1].path, "msg.payload");
    assert_eq!(fields[1].declared_type, TypeTag::OctetString);
    assert_eq!(fields[1].value.as_deref(), Some(&[0x41][..]));
    assert_eq!(fields[1].offset, 5);
}

#[test]
fn corrupt_record_does_not_affect_neighbours() {
    let schema = msg_schema();
    // middle element declares a 9-octet INTEGER inside a 5-octet SEQUENCE
    let data = hex!("30 03 02 01 01  30 05 02 09 00 00 00  30 03 02 01 03");

    let report = Asn1Decoder::new(&schema)
        .with_options(DecodeOptions::new().with_error_mode(ErrorMode::SkipRecord))
        .decode_all(&data[..])
        .unwrap();
    assert_eq!(report.summary.decoded, 2);
    assert_eq!(report.summary.dropped, 1);
    assert_eq!(report.dropped[0].index, 1);
    assert_eq!(report.dropped[0].offset, 5);
    assert!(report.dropped[0].error.is_structural());
    assert_eq!(report.records[1].offset, 12);
    assert_eq!(report.records[1].content[0].value.as_deref(), Some(&[0x03][..]));

    let err = Asn1Decoder::new(&schema).decode_all(&data[..]).unwrap_err();
    assert!(err.is_structural());

    let mut fail_fast = Asn1Decoder::new(&schema).records(&data[..]);
    assert!(matches!(fail_fast.next(), Some(Ok(RecordOutcome::Decoded(_)))));
    assert!(matches!(fail_fast.next(), Some(Err(_))));
    assert!(fail_fast.next().is_none());
}

#[test]
fn paths_depend_on_names_not_tags() {
    let tagged = Schema::builder()
        .root(
            TypeDefinition::sequence(
                "msg",
                vec![TypeDefinition::primitive("id", TypeTag::Integer).with_tag(Tag::context(0))],
            )
            .unwrap()
            .with_tag(Tag::application(3)),
        )
        .build()
        .unwrap();
    let untagged = msg_schema();

    let a = decoded_fields(&tagged, &hex!("63 03 80 01 05"), ErrorMode::FailFast);
    let b = decoded_fields(&untagged, &hex!("30 03 02 01 05"), ErrorMode::FailFast);
    assert_eq!(a[0][0].path, "msg.id");
    assert_eq!(a[0][0].path, b[0][0].path);
    assert_eq!(a[0][0].value, b[0][0].value);
}

#[test]
fn start_and_end_events_balance() {
    let data = hex!("30 0B 02 01 05 30 03 04 01 41 01 01 FF  04 02 AA BB");
    let events = read_events(&data[..], TagEncoding::SingleOctet).unwrap();

    let mut depth: i32 = 0;
    let mut max_depth = 0;
    let mut values = 0;
    for event in &events {
        match event {
            StructuralEvent::ElementStart { .. } => depth += 1,
            StructuralEvent::ElementEnd(_) => depth -= 1,
            StructuralEvent::PrimitiveValue(_) => values += 1,
        }
        assert!(depth >= 0);
        max_depth = max_depth.max(depth);
    }
    assert_eq!(depth, 0);
    assert_eq!(max_depth, 3);
    assert_eq!(values, 4);
}

#[test]
fn empty_input_yields_nothing() {
    assert!(read_events(&[][..], TagEncoding::SingleOctet).unwrap().is_empty());
    assert!(read_trees(&[][..], TagEncoding::SingleOctet).unwrap().is_empty());

    let schema = msg_schema();
    assert_eq!(Asn1Decoder::new(&schema).records(&[][..]).count(), 0);
    let report = Asn1Decoder::new(&schema).decode_all(&[][..]).unwrap();
    assert_eq!(report.summary.decoded + report.summary.dropped, 0);
}

#[test]
fn skip_field_nulls_only_the_offending_leaf() {
    let schema = msg_schema();
    // id arrives constructed
    let data = hex!("30 07 22 03 02 01 05 04 00  30 03 02 01 09");
    let decoder = Asn1Decoder::new(&schema)
        .with_options(DecodeOptions::new().with_error_mode(ErrorMode::SkipField));
    let report = decoder.decode_all(&data[..]).unwrap();

    assert_eq!(report.summary.decoded, 2);
    assert_eq!(report.summary.nulled, 1);
    assert_eq!(report.summary.skipped, 0);
    let first = &report.records[0];
    assert_eq!(first.issues[0].path, "msg.id");
    assert_eq!(first.content[0].path, "msg.id");
    assert_eq!(first.content[0].value, None);
    assert_eq!(first.content[1].path, "msg.payload");
    assert_eq!(first.content[1].value.as_deref(), Some(&[][..]));
    assert!(report.records[1].issues.is_empty());
}

#[test]
fn one_schema_serves_many_threads() {
    let schema = Arc::new(msg_schema());
    let data: Arc<[u8]> = Arc::from(&hex!("30 03 02 01 01  30 03 02 01 02  30 03 02 01 03")[..]);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let schema = Arc::clone(&schema);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                let report = Asn1Decoder::new(&schema).decode_all(&data[..]).unwrap();
                report
                    .records
                    .iter()
                    .map(|r| r.content[0].value.clone().unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![vec![1], vec![2], vec![3]]);
    }
}

const CDR: &str = r#"
    Demo DEFINITIONS IMPLICIT TAGS ::=
    BEGIN

    CallRecord ::= [APPLICATION 1] SEQUENCE {
        recordType      [0] RecordType,
        servedMSISDN    [1] MSISDN OPTIONAL,
        duration        [2] INTEGER,
        location        [3] Location OPTIONAL,
        services        [4] SEQUENCE OF ServiceCode OPTIONAL
    }

    RecordType ::= ENUMERATED { moCall (0), mtCall (1) }
    MSISDN ::= TBCD-STRING
    ServiceCode ::= OCTET STRING

    Location ::= CHOICE {
        cellId  [0] OCTET STRING,
        lai     [1] OCTET STRING
    }

    END
"#;

#[test]
fn module_text_to_typed_values() {
    let schema = grammar::parse(CDR, &["CallRecord"], TagEncoding::SingleOctet).unwrap();
    let data = hex!(
        "61 14
            80 01 01
            81 02 21 F3
            82 01 3C
            A3 03 80 01 AA
            A4 03 04 01 07"
    );

    let records = decoded_fields(&schema, &data, ErrorMode::FailFast);
    let paths: Vec<_> = records[0].iter().map(|f| f.path.as_str()).collect();
    assert_eq!(
        paths,
        [
            "CallRecord.recordType",
            "CallRecord.servedMSISDN",
            "CallRecord.duration",
            "CallRecord.location.cellId",
            "CallRecord.services.ServiceCode",
        ]
    );

    let typed: Vec<Value> = records[0]
        .iter()
        .map(|f| value::decode(f.value.as_deref().unwrap(), f.declared_type).unwrap())
        .collect();
    assert_eq!(typed[0], Value::Integer(1));
    assert_eq!(typed[1], Value::Digits("123".into()));
    assert_eq!(typed[2], Value::Integer(60));
    assert_eq!(typed[3], Value::Bytes(vec![0xAA]));

    let trees: Vec<_> = Asn1Decoder::new(&schema)
        .trees(&data[..])
        .map(|outcome| match outcome.unwrap() {
            RecordOutcome::Decoded(record) => record.content,
            RecordOutcome::Dropped(d) => panic!("dropped: {}", d.error),
        })
        .collect();
    let root = &trees[0];
    assert_eq!(root.name.as_deref(), Some("CallRecord"));
    assert_eq!(root.child("services").unwrap().children().len(), 1);
    assert_eq!(root.child("location").unwrap().child("cellId").unwrap().value(), Some(&[0xAA][..]));
}
