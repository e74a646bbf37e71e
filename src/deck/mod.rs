//! Turning processed entries into an Anki deck.
//!
//! [`DeckAssembler`] hands out media names while rows are processed, then
//! builds the final [`AssembledDeck`] from the surviving
//! [`CardMediaBundle`]s. [`package`] writes and reads the `.apkg` file.

pub mod package;
pub mod template;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::cache::SynthesisFingerprint;
use crate::config::AudioFormat;
use crate::error::{AssemblyError, RowError, RowErrorReason};
use crate::rows::VocabEntry;

pub use package::{read_package, write_package, PackageContents};

/// A validated entry with its note fields, its rendered cards and the media
/// file that voices it.
#[derive(Debug, Clone)]
pub struct CardMediaBundle {
    pub entry: VocabEntry,
    /// Values in [`template::FIELD_NAMES`] order.
    pub fields: Vec<String>,
    /// One face pair per [`template::TEMPLATES`] entry.
    pub faces: Vec<CardFace>,
    pub tags: Vec<String>,
    pub media_name: String,
    pub media_path: PathBuf,
    pub fingerprint: SynthesisFingerprint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardFace {
    pub template: &'static str,
    pub front: String,
    pub back: String,
}

/// Outcome of claiming a media name.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaClaim {
    pub name: String,
    pub path: PathBuf,
    /// Another entry with the same fingerprint already claimed this name.
    pub shared: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// Row the note came from.
    pub row: usize,
    pub guid: String,
    /// Values in [`template::FIELD_NAMES`] order.
    pub fields: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub name: String,
    pub path: PathBuf,
}

/// Everything needed to write a package.
#[derive(Debug, Clone)]
pub struct AssembledDeck {
    pub title: String,
    pub model_id: i64,
    pub deck_id: i64,
    /// Build time in milliseconds; note and card ids count up from here.
    pub created_ms: i64,
    pub notes: Vec<Note>,
    /// Distinct media files, in first-use order.
    pub media: Vec<MediaFile>,
}

impl AssembledDeck {
    pub fn card_count(&self) -> usize {
        self.notes.len() * template::TEMPLATES.len()
    }
}

pub struct DeckAssembler {
    deck_name: String,
    base_name: String,
    timestamp_tag: String,
    media_dir: PathBuf,
    format: AudioFormat,
    literal_linebreaks: bool,
    claimed: HashMap<String, SynthesisFingerprint>,
}

impl DeckAssembler {
    pub fn new(
        deck_name: &str,
        base_name: &str,
        timestamp_tag: &str,
        media_dir: &Path,
        format: AudioFormat,
        literal_linebreaks: bool,
    ) -> Self {
        Self {
            deck_name: deck_name.to_string(),
            base_name: base_name.to_string(),
            timestamp_tag: timestamp_tag.to_string(),
            media_dir: media_dir.to_path_buf(),
            format,
            literal_linebreaks,
            claimed: HashMap::new(),
        }
    }

    /// `"{deck_name} ({base}) - {timestamp_tag}"`.
    pub fn title(&self) -> String {
        format!("{} ({}) - {}", self.deck_name, self.base_name, self.timestamp_tag)
    }

    /// `"{base}_{timestamp_tag}.apkg"`.
    pub fn package_file_name(&self) -> String {
        format!("{}_{}.apkg", self.base_name, self.timestamp_tag)
    }

    /// Media filename for `entry`: its own `audio` value with the extension
    /// forced to the output format, or a name derived from the fingerprint.
    /// Directory parts of `audio` are ignored; a value with no usable file
    /// stem falls back to the derived name.
    pub fn media_name(&self, entry: &VocabEntry, fp: &SynthesisFingerprint) -> String {
        let ext = self.format.extension();
        match entry.audio.as_deref().and_then(plain_stem) {
            Some(stem) => format!("{stem}.{ext}"),
            None => format!("{}_{}.{ext}", self.base_name.to_lowercase(), fp.short(12)),
        }
    }

    /// Reserve the media name for `entry`.
    ///
    /// A name already held by a different fingerprint is a
    /// [`RowErrorReason::MediaConflict`] for this entry.
    pub fn claim(&mut self, entry: &VocabEntry, fp: &SynthesisFingerprint) -> Result<MediaClaim, RowError> {
        let name = self.media_name(entry, fp);
        let path = self.media_dir.join(&name);
        match self.claimed.get(&name) {
            Some(owner) if owner == fp => Ok(MediaClaim {
                name,
                path,
                shared: true,
            }),
            Some(_) => Err(RowError {
                row: entry.row,
                columns: Vec::new(),
                reason: RowErrorReason::MediaConflict,
                detail: format!("media name '{name}' is already used by different audio"),
                raw: entry.source.cells.clone(),
            }),
            None => {
                self.claimed.insert(name.clone(), fp.clone());
                Ok(MediaClaim {
                    name,
                    path,
                    shared: false,
                })
            }
        }
    }

    /// Give up a name claimed by `fp`, e.g. because its audio could not be
    /// produced. Shared claims and names held by other fingerprints are left
    /// alone.
    pub fn release(&mut self, name: &str, fp: &SynthesisFingerprint) {
        if self.claimed.get(name) == Some(fp) {
            self.claimed.remove(name);
        }
    }

    /// Split `bundles` into those whose media file exists and is non-empty,
    /// and a [`RowErrorReason::MediaUnresolved`] error for each of the rest.
    pub fn resolve_media(&self, bundles: Vec<CardMediaBundle>) -> (Vec<CardMediaBundle>, Vec<RowError>) {
        let mut errors = Vec::new();
        let resolved = bundles
            .into_iter()
            .filter(|bundle| {
                let present = std::fs::metadata(&bundle.media_path).is_ok_and(|m| m.len() > 0);
                if !present {
                    log::warn!(
                        "Row {}: media {} missing at assembly, dropping entry",
                        bundle.entry.row,
                        bundle.media_path.display()
                    );
                    errors.push(RowError {
                        row: bundle.entry.row,
                        columns: Vec::new(),
                        reason: RowErrorReason::MediaUnresolved,
                        detail: format!("{} is missing or empty", bundle.media_path.display()),
                        raw: bundle.entry.source.cells.clone(),
                    });
                }
                present
            })
            .collect();
        (resolved, errors)
    }

    /// Build the deck from `bundles`, in the given order.
    ///
    /// Bundles are expected to have gone through [`Self::resolve_media`];
    /// any whose media vanished since are dropped with a warning.
    pub fn assemble(&self, bundles: Vec<CardMediaBundle>, created_ms: i64) -> Result<AssembledDeck, AssemblyError> {
        let (bundles, dropped) = self.resolve_media(bundles);
        if !dropped.is_empty() {
            log::warn!("{} entries lost their media before assembly", dropped.len());
        }
        if bundles.is_empty() {
            return Err(AssemblyError::NoEntries);
        }

        let mut media: Vec<MediaFile> = Vec::new();
        let mut notes = Vec::with_capacity(bundles.len());
        for bundle in &bundles {
            if !media.iter().any(|m| m.name == bundle.media_name) {
                media.push(MediaFile {
                    name: bundle.media_name.clone(),
                    path: bundle.media_path.clone(),
                });
            }
            notes.push(self.note(bundle));
        }

        log::info!(
            "Assembled {} notes ({} cards, {} media files)",
            notes.len(),
            notes.len() * template::TEMPLATES.len(),
            media.len()
        );
        Ok(AssembledDeck {
            title: self.title(),
            model_id: stable_id(&format!("model:{}", self.base_name)),
            deck_id: stable_id(&format!("deck:{}", self.base_name)),
            created_ms,
            notes,
            media,
        })
    }

    /// Fill in note fields and card faces for an entry whose media name
    /// has been claimed.
    pub fn bundle(&self, entry: VocabEntry, claim: MediaClaim, fingerprint: SynthesisFingerprint) -> CardMediaBundle {
        let uid = entry
            .uid
            .clone()
            .unwrap_or_else(|| format!("{}-{:04}", self.base_name, entry.row));
        let literal_br = if self.literal_linebreaks {
            template::literal_to_br(&entry.literal)
        } else {
            entry.literal.clone()
        };
        let mut tags = entry.tags.clone();
        tags.push(self.timestamp_tag.clone());

        let fields = vec![
            entry.characters.clone(),
            entry.phonetic.clone(),
            entry.translation.clone(),
            entry.literal.clone(),
            literal_br,
            entry.grammar.clone(),
            claim.name.clone(),
            format!("[sound:{}]", claim.name),
            entry.enable_reading.clone(),
            entry.enable_listening.clone(),
            entry.enable_production.clone(),
            tags.join(" "),
            uid,
        ];

        let values: HashMap<&str, &str> = template::FIELD_NAMES
            .iter()
            .copied()
            .zip(fields.iter().map(String::as_str))
            .collect();
        let faces = template::TEMPLATES
            .iter()
            .map(|t| {
                let front = template::render(t.front, &values, None);
                let back = template::render(t.back, &values, Some(&front));
                CardFace {
                    template: t.name,
                    front,
                    back,
                }
            })
            .collect();

        CardMediaBundle {
            entry,
            fields,
            faces,
            tags,
            media_name: claim.name,
            media_path: claim.path,
            fingerprint,
        }
    }

    fn note(&self, bundle: &CardMediaBundle) -> Note {
        let uid = bundle.fields.last().map(String::as_str).unwrap_or_default();
        Note {
            row: bundle.entry.row,
            guid: guid_for(uid),
            fields: bundle.fields.clone(),
            tags: bundle.tags.clone(),
        }
    }
}

/// File stem of the last component of `value`, if it is a plain name.
fn plain_stem(value: &str) -> Option<String> {
    let file_name = Path::new(value).file_name()?.to_str()?;
    let stem = Path::new(file_name).file_stem()?.to_str()?.trim();
    if stem.is_empty() || stem.starts_with('.') || stem.contains(['/', '\\']) {
        return None;
    }
    Some(stem.to_string())
}

/// Id in `[2^30, 2^31)` derived from `key`.
pub fn stable_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (1i64 << 30) + (n as i64 % (1i64 << 30))
}

/// Note guid: 10 base91 characters of a hash of the note's UID, the shape
/// Anki itself generates.
pub fn guid_for(uid: &str) -> String {
    const TABLE: &[u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!#$%&()*+,-./:;<=>?@[]^_`{|}~";
    let digest = Sha256::digest(uid.as_bytes());
    let mut n = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let mut out = Vec::new();
    while n > 0 {
        out.push(TABLE[(n % TABLE.len() as u64) as usize]);
        n /= TABLE.len() as u64;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
