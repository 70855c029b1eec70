//! Command-line front end: schema loading, input discovery and JSONL output.

pub mod config;
pub mod output;

use anyhow::{anyhow, Context, Result};
use asn1_schema_stream::{
    grammar, Asn1Decoder, DecodeSummary, ErrorMode, Record, RecordOutcome, Schema,
};
use clap::{Parser, ValueEnum};
use config::{load_config, AppConfig, Settings};
use log::{error, info, warn};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "asn1-schema-stream",
    version,
    about = "Schema-driven ASN.1 BER/DER decoder -> JSONL",
    long_about = None
)]
pub struct Args {
    /// ASN.1 module describing the records
    #[arg(long = "schema", value_name = "FILE")]
    pub schema: Option<PathBuf>,

    /// Top-level type expected in the input (repeatable; defaults to the first assignment)
    #[arg(long = "root-type", value_name = "TYPE")]
    pub root_type: Vec<String>,

    #[arg(long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Comma-separated extensions to pick up when walking directories
    #[arg(long = "ext")]
    pub ext: Option<String>,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// fail-fast, skip-record or skip-field
    #[arg(long = "error-mode", value_name = "MODE")]
    pub error_mode: Option<ErrorMode>,

    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Accept tag numbers >= 31
    #[arg(long = "multi-octet-tags")]
    pub multi_octet_tags: bool,

    /// Do not report missing non-OPTIONAL components
    #[arg(long = "no-mandatory-check")]
    pub no_mandatory_check: bool,

    #[arg(long = "max-depth", value_name = "N")]
    pub max_depth: Option<usize>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only report errors
    #[arg(short, long)]
    pub quiet: bool,

    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

/// Shape of each output line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One entry per leaf, keyed by dot-path
    #[default]
    Fields,
    /// Nested objects mirroring the record structure
    Tree,
}

pub fn run(args: Args) -> Result<()> {
    let started = Instant::now();

    let file_config = match &args.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    let settings = Settings::resolve(&args, file_config)?;

    info!("Parsing schema from {:?}", settings.schema);
    let schema_text = fs::read_to_string(&settings.schema)
        .with_context(|| format!("Failed to read schema file {:?}", settings.schema))?;
    let roots: Vec<&str> = settings.root_types.iter().map(String::as_str).collect();
    let schema = grammar::parse(&schema_text, &roots, settings.tag_encoding)
        .with_context(|| format!("Failed to load schema {:?}", settings.schema))?;
    info!(
        "Schema ready: {} types, {} top-level tag(s), error mode {}",
        schema.type_count(),
        schema.roots().len(),
        settings.decode.error_mode
    );

    fs::create_dir_all(&settings.output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", settings.output_dir))?;

    let files = collect_inputs(&args.inputs, settings.extensions.as_ref())
        .context("Failed to expand input files/directories")?;
    if files.is_empty() {
        warn!("No input files found.");
        return Ok(());
    }
    info!("Found {} input files", files.len());

    let mut total = DecodeSummary::default();
    let mut failed = 0usize;
    for path in &files {
        match process_file(&settings, &schema, path) {
            Ok(summary) => {
                info!(
                    "{:?}: {} decoded, {} dropped, {} nulled, {} skipped",
                    path, summary.decoded, summary.dropped, summary.nulled, summary.skipped
                );
                total.decoded += summary.decoded;
                total.dropped += summary.dropped;
                total.nulled += summary.nulled;
                total.skipped += summary.skipped;
            }
            Err(e) => {
                error!("Decoding failed for {:?}: {:#}", path, e);
                failed += 1;
            }
        }
    }

    info!(
        "Total: {} decoded, {} dropped, {} nulled, {} skipped across {} files in {:.2?}",
        total.decoded,
        total.dropped,
        total.nulled,
        total.skipped,
        files.len(),
        started.elapsed()
    );
    if failed > 0 {
        return Err(anyhow!("{} of {} input files failed", failed, files.len()));
    }
    Ok(())
}

/// Files named directly plus every file under named directories, sorted and deduplicated.
pub fn collect_inputs(inputs: &[PathBuf], extensions: Option<&HashSet<String>>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            if has_allowed_extension(input, extensions) {
                files.push(input.clone());
            }
        } else if input.is_dir() {
            for entry in WalkDir::new(input).follow_links(false) {
                let entry = entry?;
                if entry.file_type().is_file() && has_allowed_extension(entry.path(), extensions) {
                    files.push(entry.into_path());
                }
            }
        } else {
            return Err(anyhow!("Input path is not a file or directory: {:?}", input));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn has_allowed_extension(path: &Path, extensions: Option<&HashSet<String>>) -> bool {
    match extensions {
        None => true,
        Some(set) => path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| set.contains(&e.to_ascii_lowercase())),
    }
}

/// Decode one input into `<output-dir>/<file name>.jsonl`.
fn process_file(settings: &Settings, schema: &Schema, in_path: &Path) -> Result<DecodeSummary> {
    let file = File::open(in_path).with_context(|| format!("Failed to open input file {:?}", in_path))?;
    let mmap = unsafe { Mmap::map(&file)? };
    let data: &[u8] = &mmap;

    let file_name = in_path
        .file_name()
        .ok_or_else(|| anyhow!("Input path has no filename: {:?}", in_path))?
        .to_string_lossy();
    let out_path = settings.output_dir.join(format!("{}.jsonl", file_name));
    let out_file =
        File::create(&out_path).with_context(|| format!("Failed to create output file {:?}", out_path))?;
    let mut writer = BufWriter::with_capacity(8 * 1024 * 1024, out_file);
    let mut scratch = Vec::with_capacity(64 * 1024);

    let decoder = Asn1Decoder::new(schema).with_options(settings.decode.clone());
    let summary = match settings.format {
        OutputFormat::Fields => write_records(in_path, decoder.records(data), &mut writer, |w, r| {
            output::write_fields_record(w, r, &mut scratch)
        })?,
        OutputFormat::Tree => write_records(in_path, decoder.trees(data), &mut writer, |w, r| {
            output::write_tree_record(w, r, &mut scratch)
        })?,
    };

    writer.flush()?;
    Ok(summary)
}

fn write_records<T, I, W, F>(in_path: &Path, outcomes: I, writer: &mut W, mut emit: F) -> Result<DecodeSummary>
where
    I: Iterator<Item = asn1_schema_stream::Result<RecordOutcome<T>>>,
    W: Write,
    F: FnMut(&mut W, &Record<T>) -> io::Result<()>,
{
    let mut summary = DecodeSummary::default();
    for outcome in outcomes {
        let outcome = outcome?;
        summary.record(&outcome);
        match outcome {
            RecordOutcome::Decoded(record) => {
                emit(writer, &record)?;
                writer.write_all(b"\n")?;
            }
            RecordOutcome::Dropped(dropped) => warn!(
                "{:?}: dropped record {} at offset {}: {}",
                in_path, dropped.index, dropped.offset, dropped.error
            ),
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("day1");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("a.BER"), b"").unwrap();
        fs::write(nested.join("b.ber"), b"").unwrap();
        fs::write(nested.join("notes.txt"), b"").unwrap();

        let exts: HashSet<String> = ["ber".to_string()].into_iter().collect();
        let files = collect_inputs(&[dir.path().to_path_buf()], Some(&exts)).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap().eq_ignore_ascii_case("ber")));

        let all = collect_inputs(&[dir.path().to_path_buf()], None).unwrap();
        assert_eq!(all.len(), 3);

        assert!(collect_inputs(&[dir.path().join("missing")], None).is_err());
    }

    #[test]
    fn run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("msg.asn");
        fs::write(
            &schema,
            "Demo DEFINITIONS ::= BEGIN\n\
             Msg ::= SEQUENCE { id INTEGER, payload OCTET STRING OPTIONAL }\n\
             END\n",
        )
        .unwrap();
        let input = dir.path().join("calls.ber");
        // second element overruns its parent and is dropped under skip-record
        fs::write(
            &input,
            [0x30, 0x03, 0x02, 0x01, 0x05, 0x30, 0x03, 0x02, 0x05, 0x01, 0x30, 0x03, 0x02, 0x01, 0x07],
        )
        .unwrap();
        let out_dir = dir.path().join("out");

        let args = Args::parse_from([
            "asn1-schema-stream",
            "--schema",
            schema.to_str().unwrap(),
            "--output-dir",
            out_dir.to_str().unwrap(),
            "--error-mode",
            "skip-record",
            input.to_str().unwrap(),
        ]);
        run(args).unwrap();

        let text = fs::read_to_string(out_dir.join("calls.ber.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""path":"Msg.id","type":"INTEGER","value":5"#));
        assert!(lines[1].contains(r#""value":7"#));
    }
}
