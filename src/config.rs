//! Build configuration.
//!
//! [`DeckBuildConfig`] can be assembled in code through the generated
//! [`DeckBuildConfigBuilder`] or loaded from a JSON file. Every option has a
//! default, so a config file only needs the keys it changes:
//!
//! ```json
//! {
//!   "input": "lesson1.csv",
//!   "output_dir": "out",
//!   "delimiter": ",",
//!   "columns": { "translation": "English" },
//!   "gain": { "voice_db": -3.0 }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::synthesis::Device;

/// Header names for each logical field of a vocabulary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub characters: String,
    pub phonetic: String,
    pub translation: String,
    pub literal: String,
    pub grammar: String,
    pub audio: String,
    pub tags: String,
    pub uid: String,
    pub enable_reading: String,
    pub enable_listening: String,
    pub enable_production: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            characters: "Hanzi".to_string(),
            phonetic: "Pinyin".to_string(),
            translation: "Indo".to_string(),
            literal: "Literal".to_string(),
            grammar: "Grammar".to_string(),
            audio: "Audio".to_string(),
            tags: "Tags".to_string(),
            uid: "UID".to_string(),
            enable_reading: "Enable_RM".to_string(),
            enable_listening: "Enable_LT".to_string(),
            enable_production: "Enable_MP".to_string(),
        }
    }
}

impl ColumnMapping {
    /// Apply overrides keyed by either the logical field name
    /// (`"translation"`) or the default header it replaces (`"Indo"`).
    ///
    /// Empty override values keep the default. Unknown keys are ignored with
    /// a warning.
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for (key, header) in overrides {
            let header = header.trim();
            if header.is_empty() {
                continue;
            }
            let slot = match key.as_str() {
                "characters" | "Hanzi" => &mut self.characters,
                "phonetic" | "Pinyin" => &mut self.phonetic,
                "translation" | "Indo" => &mut self.translation,
                "literal" | "Literal" => &mut self.literal,
                "grammar" | "Grammar" => &mut self.grammar,
                "audio" | "Audio" => &mut self.audio,
                "tags" | "Tags" => &mut self.tags,
                "uid" | "UID" => &mut self.uid,
                "enable_reading" | "Enable_RM" => &mut self.enable_reading,
                "enable_listening" | "Enable_LT" => &mut self.enable_listening,
                "enable_production" | "Enable_MP" => &mut self.enable_production,
                other => {
                    log::warn!("Ignoring unknown column mapping key '{other}'");
                    continue;
                }
            };
            *slot = header.to_string();
        }
        self
    }
}

/// Container format of the per-entry audio files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Compressed, needs an external encoder.
    #[default]
    Mp3,
    /// Uncompressed PCM, always available.
    Wav,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp3" | "compressed" => Ok(Self::Mp3),
            "wav" | "uncompressed" => Ok(Self::Wav),
            other => Err(format!("unknown audio format '{other}' (expected mp3 or wav)")),
        }
    }
}

/// What to do when the compressed format is requested but no encoder runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderFallback {
    /// Write WAV files instead and record a warning.
    #[default]
    Uncompressed,
    /// Abort the build.
    Fail,
}

/// How the audio cache is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Serve hits, store misses.
    #[default]
    ReadWrite,
    /// Never serve hits, but store fresh results (forces re-synthesis).
    Refresh,
    /// No cache at all.
    Disabled,
}

/// Mixing levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainSettings {
    /// Gain applied to the voice clip before summation, in dB.
    pub voice_db: f32,
    /// Gain applied to the ambience clip before summation, in dB.
    pub ambience_db: f32,
    /// Peak ceiling after summation, linear in `(0, 1]`.
    pub ceiling: f32,
}

impl Default for GainSettings {
    fn default() -> Self {
        Self {
            voice_db: -6.0,
            ambience_db: -38.0,
            ceiling: 0.98,
        }
    }
}

/// Complete configuration of one deck build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[builder(default, setter(into), build_fn(validate = "Self::validate"))]
pub struct DeckBuildConfig {
    /// Tabular vocabulary file.
    pub input: PathBuf,
    /// Directory receiving the package and its media files.
    pub output_dir: PathBuf,
    /// Human readable deck name; the title also carries the input file stem
    /// and the timestamp tag.
    pub deck_name: String,
    pub delimiter: char,
    /// WHATWG encoding label; `utf-8-sig` accepts an optional BOM.
    pub encoding: String,
    pub columns: ColumnMapping,

    /// Reference recording for voice-cloning engines.
    #[builder(setter(into, strip_option))]
    pub voice_sample: Option<PathBuf>,
    /// Named voice for engines with built-in voices.
    pub voice_name: String,
    /// Engine language code.
    pub language: String,
    pub speed: f32,
    /// Execution devices to try, in order.
    pub device_preference: Vec<Device>,

    #[builder(setter(into, strip_option))]
    pub ffmpeg_path: Option<PathBuf>,
    pub audio_format: AudioFormat,
    pub encoder_fallback: EncoderFallback,
    /// Target bitrate for compressed output, ffmpeg syntax.
    pub bitrate: String,

    pub ambience_enabled: bool,
    #[builder(setter(into, strip_option))]
    pub ambience: Option<PathBuf>,
    pub gain: GainSettings,

    /// Cache location; defaults to `<output_dir>/.audio-cache`.
    #[builder(setter(into, strip_option))]
    pub cache_dir: Option<PathBuf>,
    pub cache_mode: CacheMode,

    /// Split literal translations on `，,；;` into separate lines.
    pub use_literal_linebreaks: bool,
    /// Fixed tag instead of `deck_%Y%m%d_%H%M%S`; makes rebuilds reproducible.
    #[builder(setter(into, strip_option))]
    pub timestamp_tag: Option<String>,
    /// Directory holding `speaker.wav` and `ambient.wav` used when no sample
    /// or ambience is configured.
    #[builder(setter(into, strip_option))]
    pub default_media_dir: Option<PathBuf>,
}

impl Default for DeckBuildConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("vocab.csv"),
            output_dir: PathBuf::from("output"),
            deck_name: "Mandarin Grammar".to_string(),
            delimiter: ';',
            encoding: "utf-8-sig".to_string(),
            columns: ColumnMapping::default(),
            voice_sample: None,
            voice_name: "default".to_string(),
            language: "zh-cn".to_string(),
            speed: 1.0,
            device_preference: vec![Device::Cuda, Device::Cpu],
            ffmpeg_path: None,
            audio_format: AudioFormat::Mp3,
            encoder_fallback: EncoderFallback::Uncompressed,
            bitrate: "192k".to_string(),
            ambience_enabled: true,
            ambience: None,
            gain: GainSettings::default(),
            cache_dir: None,
            cache_mode: CacheMode::ReadWrite,
            use_literal_linebreaks: true,
            timestamp_tag: None,
            default_media_dir: None,
        }
    }
}

impl DeckBuildConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(d) = self.delimiter {
            check_delimiter(d)?;
        }
        if let Some(speed) = self.speed {
            check_speed(speed)?;
        }
        if let Some(gain) = &self.gain {
            check_ceiling(gain.ceiling)?;
        }
        if let Some(devices) = &self.device_preference {
            if devices.is_empty() {
                return Err("device_preference must name at least one device".to_string());
            }
        }
        Ok(())
    }
}

impl DeckBuildConfig {
    /// Load a configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| ConfigError::ConfigFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Same checks the builder runs, for configs built any other way.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.delimiter.is_ascii() {
            return Err(ConfigError::InvalidDelimiter(self.delimiter));
        }
        check_speed(self.speed).map_err(ConfigError::Invalid)?;
        check_ceiling(self.gain.ceiling).map_err(ConfigError::Invalid)?;
        if self.device_preference.is_empty() {
            return Err(ConfigError::Invalid(
                "device_preference must name at least one device".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache directory in effect, or `None` when caching is off.
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        if self.cache_mode == CacheMode::Disabled {
            return None;
        }
        Some(
            self.cache_dir
                .clone()
                .unwrap_or_else(|| self.output_dir.join(".audio-cache")),
        )
    }

    /// Input file stem with spaces replaced, used in titles and media names.
    pub fn deck_base_name(&self) -> String {
        self.input
            .file_stem()
            .map(|s| s.to_string_lossy().replace(' ', "_"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "deck".to_string())
    }

    /// Voice sample in effect: the configured one, else the bundled default.
    pub fn resolve_voice_sample(&self) -> Result<Option<PathBuf>, ConfigError> {
        match &self.voice_sample {
            Some(path) if path.exists() => Ok(Some(path.clone())),
            Some(path) => Err(ConfigError::VoiceSampleMissing(path.clone())),
            None => Ok(self.default_media("speaker.wav")),
        }
    }

    /// Ambience track in effect, plus a warning when a configured track is
    /// missing.
    pub fn resolve_ambience(&self) -> (Option<PathBuf>, Option<String>) {
        if !self.ambience_enabled {
            return (None, None);
        }
        match &self.ambience {
            Some(path) if path.exists() => (Some(path.clone()), None),
            Some(path) => (
                None,
                Some(format!(
                    "ambience file {} not found; building without ambience",
                    path.display()
                )),
            ),
            None => (self.default_media("ambient.wav"), None),
        }
    }

    fn default_media(&self, name: &str) -> Option<PathBuf> {
        self.default_media_dir
            .as_ref()
            .map(|dir| dir.join(name))
            .filter(|p| p.exists())
    }
}

fn check_delimiter(d: char) -> Result<(), String> {
    if d.is_ascii() {
        Ok(())
    } else {
        Err(format!("delimiter {d:?} must be a single ASCII character"))
    }
}

fn check_speed(speed: f32) -> Result<(), String> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(format!("speed must be positive, got {speed}"))
    }
}

fn check_ceiling(ceiling: f32) -> Result<(), String> {
    if ceiling > 0.0 && ceiling <= 1.0 {
        Ok(())
    } else {
        Err(format!("gain ceiling must be in (0, 1], got {ceiling}"))
    }
}
