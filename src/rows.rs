//! Tabular vocabulary input.
//!
//! Input bytes are decoded with an explicit encoding, split into records with
//! an explicit delimiter, and matched against a [`ColumnMapping`] that is
//! resolved once into column indices. From then on every row is validated on
//! its own: a bad row becomes a [`RowError`] and parsing carries on.

use encoding_rs::{Encoding, UTF_8};

use crate::config::{ColumnMapping, DeckBuildConfig};
use crate::error::{ConfigError, RowError, RowErrorReason};

/// One raw input record as `(header, value)` pairs, values cleaned.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 1-based data row number.
    pub row: usize,
    pub cells: Vec<(String, String)>,
}

/// A validated vocabulary entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VocabEntry {
    /// 1-based data row number this entry came from.
    pub row: usize,
    pub characters: String,
    pub phonetic: String,
    pub translation: String,
    pub literal: String,
    pub grammar: String,
    /// Caller-chosen media filename.
    pub audio: Option<String>,
    pub tags: Vec<String>,
    /// Stable note identity, if the input provides one.
    pub uid: Option<String>,
    pub enable_reading: String,
    pub enable_listening: String,
    pub enable_production: String,
    /// The record this entry was built from.
    pub source: SourceRow,
}

/// Result of parsing a whole input: entries in file order plus row errors.
#[derive(Debug, Default)]
pub struct ParsedRows {
    pub entries: Vec<VocabEntry>,
    pub errors: Vec<RowError>,
}

impl ParsedRows {
    /// Number of data rows seen.
    pub fn total(&self) -> usize {
        self.entries.len() + self.errors.len()
    }
}

#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub delimiter: char,
    /// WHATWG label, or `utf-8-sig`.
    pub encoding: String,
    pub columns: ColumnMapping,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            delimiter: ';',
            encoding: "utf-8-sig".to_string(),
            columns: ColumnMapping::default(),
        }
    }
}

impl ParseOptions {
    pub fn from_config(config: &DeckBuildConfig) -> Self {
        Self {
            delimiter: config.delimiter,
            encoding: config.encoding.clone(),
            columns: config.columns.clone(),
        }
    }
}

/// Column indices for each logical field.
#[derive(Debug, Clone, Copy)]
struct ResolvedColumns {
    characters: usize,
    phonetic: usize,
    translation: usize,
    literal: Option<usize>,
    grammar: Option<usize>,
    audio: Option<usize>,
    tags: Option<usize>,
    uid: Option<usize>,
    enable_reading: Option<usize>,
    enable_listening: Option<usize>,
    enable_production: Option<usize>,
}

impl ResolvedColumns {
    fn resolve(headers: &[String], mapping: &ColumnMapping) -> Result<Self, ConfigError> {
        let find = |header: &str| headers.iter().position(|h| h == header);
        let required = |field: &'static str, header: &str| {
            find(header).ok_or_else(|| ConfigError::MissingColumn {
                field,
                header: header.to_string(),
            })
        };

        Ok(Self {
            characters: required("characters", &mapping.characters)?,
            phonetic: required("phonetic transcription", &mapping.phonetic)?,
            translation: required("primary translation", &mapping.translation)?,
            literal: find(&mapping.literal),
            grammar: find(&mapping.grammar),
            audio: find(&mapping.audio),
            tags: find(&mapping.tags),
            uid: find(&mapping.uid),
            enable_reading: find(&mapping.enable_reading),
            enable_listening: find(&mapping.enable_listening),
            enable_production: find(&mapping.enable_production),
        })
    }
}

/// Reads vocabulary rows.
pub struct RowParser {
    options: ParseOptions,
}

impl RowParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    /// Decode and parse `raw`.
    ///
    /// Fails only on configuration problems: unknown encoding, undecodable
    /// bytes, bad delimiter, no header, or a required column missing from
    /// the header. Everything row-specific is returned in
    /// [`ParsedRows::errors`].
    pub fn parse(&self, raw: &[u8]) -> Result<ParsedRows, ConfigError> {
        let delimiter = self.options.delimiter;
        if !delimiter.is_ascii() {
            return Err(ConfigError::InvalidDelimiter(delimiter));
        }
        let text = decode(raw, &self.options.encoding)?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter as u8)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader.headers()?.iter().map(clean).collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(ConfigError::NoHeader);
        }
        let columns = ResolvedColumns::resolve(&headers, &self.options.columns)?;
        let mapping = &self.options.columns;

        let mut parsed = ParsedRows::default();
        for (i, record) in reader.records().enumerate() {
            let row = i + 1;
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    parsed.errors.push(RowError {
                        row,
                        columns: Vec::new(),
                        reason: RowErrorReason::Malformed,
                        detail: e.to_string(),
                        raw: Vec::new(),
                    });
                    continue;
                }
            };

            let values: Vec<String> = record.iter().map(clean).collect();
            let source = snapshot(row, &headers, &values);

            if values.len() > headers.len() {
                parsed.errors.push(RowError {
                    row,
                    columns: Vec::new(),
                    reason: RowErrorReason::Malformed,
                    detail: format!(
                        "{} cells but header has {} columns",
                        values.len(),
                        headers.len()
                    ),
                    raw: source.cells,
                });
                continue;
            }
            if values.len() < headers.len() {
                log::debug!(
                    "Row {row}: {} of {} cells present, padding with empty values",
                    values.len(),
                    headers.len()
                );
            }

            let get = |idx: usize| values.get(idx).cloned().unwrap_or_default();
            let opt = |idx: Option<usize>| idx.map(get).unwrap_or_default();
            let flag = |idx: Option<usize>| {
                let v = opt(idx);
                if v.is_empty() {
                    "1".to_string()
                } else {
                    v
                }
            };

            let characters = get(columns.characters);
            let phonetic = get(columns.phonetic);
            let translation = get(columns.translation);

            let missing: Vec<String> = [
                (&characters, &mapping.characters),
                (&phonetic, &mapping.phonetic),
                (&translation, &mapping.translation),
            ]
            .into_iter()
            .filter(|(value, _)| value.is_empty())
            .map(|(_, header)| header.clone())
            .collect();

            if !missing.is_empty() {
                parsed.errors.push(RowError {
                    row,
                    columns: missing,
                    reason: RowErrorReason::MissingField,
                    detail: "required value is empty".to_string(),
                    raw: source.cells,
                });
                continue;
            }

            let audio = opt(columns.audio);
            let uid = opt(columns.uid);
            parsed.entries.push(VocabEntry {
                row,
                characters,
                phonetic,
                translation,
                literal: opt(columns.literal),
                grammar: opt(columns.grammar),
                audio: (!audio.is_empty()).then_some(audio),
                tags: opt(columns.tags)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                uid: (!uid.is_empty()).then_some(uid),
                enable_reading: flag(columns.enable_reading),
                enable_listening: flag(columns.enable_listening),
                enable_production: flag(columns.enable_production),
                source,
            });
        }

        log::info!(
            "Parsed {} rows: {} entries, {} rejected",
            parsed.total(),
            parsed.entries.len(),
            parsed.errors.len()
        );
        Ok(parsed)
    }
}

/// Strip byte-order marks and zero-width spaces, then trim.
pub fn clean(value: &str) -> String {
    value.replace(['\u{feff}', '\u{200b}'], "").trim().to_string()
}

/// Decode `raw` with the encoding named by `label`.
///
/// `utf-8-sig` (and any label resolving to UTF-8) accepts an optional BOM.
pub fn decode(raw: &[u8], label: &str) -> Result<String, ConfigError> {
    let label = label.trim();
    let encoding = if label.eq_ignore_ascii_case("utf-8-sig") || label.eq_ignore_ascii_case("utf_8_sig")
    {
        UTF_8
    } else {
        Encoding::for_label(label.as_bytes())
            .ok_or_else(|| ConfigError::UnknownEncoding(label.to_string()))?
    };

    let (text, actual, had_errors) = encoding.decode(raw);
    if had_errors {
        return Err(ConfigError::Undecodable(actual.name().to_string()));
    }
    Ok(text.into_owned())
}

fn snapshot(row: usize, headers: &[String], values: &[String]) -> SourceRow {
    let cells = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let header = headers.get(i).cloned().unwrap_or_else(|| format!("#{}", i + 1));
            (header, v.clone())
        })
        .collect();
    SourceRow { row, cells }
}
