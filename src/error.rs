//! Error taxonomy shared by the TLV reader, the schema model and the mapper.

use std::fmt;

/// Result type for decoding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building a [`Schema`](crate::Schema).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate tag {tag} in {parent}: '{first}' and '{second}'")]
    DuplicateTag {
        parent: String,
        tag: String,
        first: String,
        second: String,
    },

    #[error("type '{name}' has no tag and none can be derived")]
    MissingTag { name: String },

    #[error("unknown type '{name}' referenced from '{from}'")]
    UnknownType { name: String, from: String },

    #[error("recursive type definition through '{name}'")]
    RecursiveType { name: String },

    #[error("root type '{name}' not found in schema")]
    UnknownRoot { name: String },

    #[error("'{name}' is not constructed; child lookup is not defined for it")]
    NotConstructed { name: String },

    #[error("grammar syntax: {0}")]
    Syntax(String),
}

/// Errors that can occur while decoding a TLV stream against a schema
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream violates TLV well-formedness.
    #[error("corrupt structure at byte {offset}{}: {reason} (path: {})", ElementAt(.element_offset), PathDisplay(.path))]
    CorruptStructure {
        offset: u64,
        element_offset: Option<u64>,
        path: String,
        reason: String,
    },

    /// The stream is well formed but does not follow the schema.
    #[error("grammar mismatch at byte {offset}: {reason}; expected {expected}, found {actual} (path: {})", PathDisplay(.path))]
    GrammarMismatch {
        offset: u64,
        path: String,
        expected: String,
        actual: String,
        reason: String,
        /// Set when the mismatch is confined to one leaf field.
        field_local: bool,
    },

    /// Unbalanced events; a bug in whatever produced them.
    #[error("state consistency violated: {reason} (path: {})", PathDisplay(.path))]
    StateConsistency { path: String, reason: String },

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corrupt(offset: u64, element_offset: Option<u64>, reason: impl Into<String>) -> Self {
        Error::CorruptStructure {
            offset,
            element_offset,
            path: String::new(),
            reason: reason.into(),
        }
    }

    pub(crate) fn state(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::StateConsistency {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Byte offset carried by the error, if any.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Error::CorruptStructure { offset, .. } | Error::GrammarMismatch { offset, .. } => {
                Some(*offset)
            }
            _ => None,
        }
    }

    /// Dot-path carried by the error; empty when raised outside any element.
    pub fn path(&self) -> &str {
        match self {
            Error::CorruptStructure { path, .. }
            | Error::GrammarMismatch { path, .. }
            | Error::StateConsistency { path, .. } => path,
            _ => "",
        }
    }

    /// Fill in the tag-path when the layer raising the error did not know it.
    pub(crate) fn with_path(mut self, current: &str) -> Self {
        if let Error::CorruptStructure { path, .. } = &mut self {
            if path.is_empty() {
                *path = current.to_string();
            }
        }
        self
    }

    /// The byte stream itself is broken; never downgraded below record level.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::CorruptStructure { .. } | Error::Io(_))
    }

    /// Mismatch limited to a single leaf, eligible for null substitution.
    pub fn is_field_local(&self) -> bool {
        matches!(
            self,
            Error::GrammarMismatch {
                field_local: true,
                ..
            }
        )
    }

    /// Errors that abort the run under every error mode.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StateConsistency { .. } | Error::Schema(_))
    }
}

struct PathDisplay<'a>(&'a str);

impl fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<root>")
        } else {
            f.write_str(self.0)
        }
    }
}

struct ElementAt<'a>(&'a Option<u64>);

impl fmt::Display for ElementAt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(offset) => write!(f, " in element at byte {}", offset),
            None => Ok(()),
        }
    }
}
