//! Error types for the deck-building pipeline.
//!
//! Errors fall in two groups. Fatal ones ([`ConfigError`], [`AssemblyError`],
//! and the top-level [`DeckBuildError`]) abort a build. Everything that goes
//! wrong for a single entry ends up as a [`RowError`] record and is returned
//! next to the rows that succeeded.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::encoder::EncodingError;
use crate::mixer::MixError;
use crate::synthesis::SynthesisError;

/// Configuration-level failure, raised before any row is processed.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("input file not readable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown text encoding '{0}'")]
    UnknownEncoding(String),
    #[error("input is not valid {0} text")]
    Undecodable(String),
    #[error("delimiter {0:?} must be a single ASCII character")]
    InvalidDelimiter(char),
    #[error("input has no header row")]
    NoHeader,
    #[error("required column '{header}' (for {field}) not found in header")]
    MissingColumn { field: &'static str, header: String },
    #[error("voice sample not found: {0}")]
    VoiceSampleMissing(PathBuf),
    #[error("text must not be empty")]
    EmptyText,
    #[error("malformed input: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid config file {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a row did not make it into the deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RowErrorReason {
    /// A required field is empty after trimming.
    MissingField,
    /// The record does not fit the header.
    Malformed,
    /// The TTS engine failed for this entry.
    Synthesis,
    /// Voice and ambience could not be mixed.
    Mixing,
    /// The mixed clip could not be written in the target format.
    Encoding,
    /// The entry's media filename is already used by a different clip.
    MediaConflict,
    /// The entry's media file was missing at assembly time.
    MediaUnresolved,
}

impl fmt::Display for RowErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingField => "missing field",
            Self::Malformed => "malformed row",
            Self::Synthesis => "synthesis failed",
            Self::Mixing => "mixing failed",
            Self::Encoding => "encoding failed",
            Self::MediaConflict => "media name conflict",
            Self::MediaUnresolved => "media unresolved",
        };
        f.write_str(s)
    }
}

/// A recovered, per-row failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowError {
    /// 1-based data row number (the header is not counted).
    pub row: usize,
    /// Logical or header column names involved.
    pub columns: Vec<String>,
    pub reason: RowErrorReason,
    /// Human readable detail.
    pub detail: String,
    /// Snapshot of the raw row as `(header, value)` pairs.
    pub raw: Vec<(String, String)>,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.row, self.reason)?;
        if !self.columns.is_empty() {
            write!(f, " [{}]", self.columns.join(", "))?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

/// Fatal failure while packaging.
#[derive(thiserror::Error, Debug)]
pub enum AssemblyError {
    #[error("no entries survived processing; nothing to package")]
    NoEntries,
    #[error("package database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("package archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("package serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("package I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid package: {0}")]
    Invalid(String),
}

/// Top-level error of a build invocation.
#[derive(thiserror::Error, Debug)]
pub enum DeckBuildError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncodingError),
    /// Only raised for single clips; in a deck build this is a row error.
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    /// Only raised for single clips; in a deck build this is a row error.
    #[error("mixing failed: {0}")]
    Mixing(#[from] MixError),
    #[error("assembly failed: {source}")]
    Assembly {
        #[source]
        source: AssemblyError,
        /// Row errors collected before the failure.
        row_errors: Vec<RowError>,
    },
    #[error("build cancelled after {completed} of {total} rows")]
    Cancelled { completed: usize, total: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeckBuildError {
    /// Row errors gathered before a fatal failure, if any.
    pub fn row_errors(&self) -> &[RowError] {
        match self {
            Self::Assembly { row_errors, .. } => row_errors,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_error_display_names_row_reason_and_columns() {
        let err = RowError {
            row: 2,
            columns: vec!["Indo".to_string()],
            reason: RowErrorReason::MissingField,
            detail: "required value is empty".to_string(),
            raw: vec![],
        };
        assert_eq!(
            err.to_string(),
            "row 2: missing field [Indo]: required value is empty"
        );
    }
}
