//! TOML configuration file and its merge with command-line flags.

use super::{Args, OutputFormat};
use anyhow::{anyhow, Context, Result};
use asn1_schema_stream::{DecodeOptions, TagEncoding};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Contents of a `--config` file. Every key is optional.
///
/// ```toml
/// schema = "cdr.asn"
/// root_types = ["CallEventRecord"]
/// output_dir = "out"
/// ext = ["ber", "dat"]
/// format = "fields"
/// multi_octet_tags = false
///
/// [decode]
/// error_mode = "skip-record"
/// enforce_mandatory = true
/// max_depth = 64
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub schema: Option<PathBuf>,

    #[serde(default)]
    pub root_types: Vec<String>,

    pub output_dir: Option<PathBuf>,

    pub ext: Option<Vec<String>>,

    pub format: Option<OutputFormat>,

    #[serde(default)]
    pub multi_octet_tags: bool,

    #[serde(default)]
    pub decode: DecodeOptions,
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse config file: {:?}", path))
}

/// Effective run settings: flags first, then the config file, then defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub schema: PathBuf,
    pub root_types: Vec<String>,
    pub output_dir: PathBuf,
    pub extensions: Option<HashSet<String>>,
    pub format: OutputFormat,
    pub tag_encoding: TagEncoding,
    pub decode: DecodeOptions,
}

fn normalize_ext(ext: &str) -> Option<String> {
    let ext = ext.trim().trim_start_matches('.');
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

impl Settings {
    pub fn resolve(args: &Args, file: AppConfig) -> Result<Self> {
        let schema = args
            .schema
            .clone()
            .or(file.schema)
            .ok_or_else(|| anyhow!("no schema given: pass --schema or set `schema` in the config file"))?;
        let output_dir = args
            .output_dir
            .clone()
            .or(file.output_dir)
            .ok_or_else(|| anyhow!("no output directory given: pass --output-dir or set `output_dir`"))?;

        let root_types = if args.root_type.is_empty() {
            file.root_types
        } else {
            args.root_type.clone()
        };

        let extensions = match &args.ext {
            Some(list) => Some(list.split(',').filter_map(normalize_ext).collect()),
            None => file
                .ext
                .map(|list| list.iter().filter_map(|e| normalize_ext(e)).collect()),
        };

        let tag_encoding = if args.multi_octet_tags || file.multi_octet_tags {
            TagEncoding::MultiOctet
        } else {
            TagEncoding::SingleOctet
        };

        let mut decode = file.decode;
        if let Some(mode) = args.error_mode {
            decode = decode.with_error_mode(mode);
        }
        if let Some(depth) = args.max_depth {
            decode = decode.with_max_depth(depth);
        }
        if args.no_mandatory_check {
            decode = decode.with_mandatory_check(false);
        }

        Ok(Self {
            schema,
            root_types,
            output_dir,
            extensions,
            format: args.format.or(file.format).unwrap_or_default(),
            tag_encoding,
            decode,
        })
    }
}
