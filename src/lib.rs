//! # vocab-deck
//!
//! Build importable Anki decks from a tabular vocabulary list, with a
//! synthesized audio clip for every entry.
//!
//! ## Features
//!
//! - **Tolerant input parsing**: configurable delimiter, encoding and column
//!   mapping; bad rows are reported, never fatal
//! - **Audio cache**: synthesized clips are stored by content fingerprint, so
//!   rebuilding an unchanged deck never calls the TTS engine again
//! - **Pluggable TTS**: any [`SynthesisEngine`]; an external command engine is
//!   always available, Kokoro (ONNX) behind the `kokoro` feature
//! - **Deterministic packaging**: three cards per entry, stable media names
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! vocab-deck = "2026.10"
//! ```
//!
//! ```ignore
//! use std::path::PathBuf;
//! use vocab_deck::{config::DeckBuildConfigBuilder, engines::command::CommandEngine, DeckBuilder};
//!
//! let config = DeckBuildConfigBuilder::default()
//!     .input("lesson1.csv")
//!     .output_dir("out")
//!     .build()?;
//! let engine = CommandEngine::coqui("tts_models/multilingual/multi-dataset/xtts_v2");
//!
//! let result = DeckBuilder::new(config, engine).build()?;
//! println!("wrote {}", result.package_path.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cache;
pub mod config;
pub mod deck;
pub mod encoder;
pub mod engines;
pub mod error;
pub mod mixer;
pub mod pipeline;
pub mod rows;
pub mod synthesis;

use std::path::Path;

pub use error::{DeckBuildError, RowError, RowErrorReason};
pub use pipeline::{
    generate_clip, CancelToken, DeckBuildResult, DeckBuilder, GeneratedClip, PipelineState, ProgressEvent, Stage,
};
pub use synthesis::{Device, SynthesisParams, VoiceProfile};

/// A block of PCM audio.
///
/// Samples are interleaved `f32` values in `[-1.0, 1.0]`. A clip is handed
/// from stage to stage by value; no stage keeps a reference to a clip it has
/// passed on.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Interleaved samples
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved channels
    pub channels: u16,
}

impl AudioClip {
    /// A single-channel clip.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Write the audio to a 32-bit float WAV file.
    ///
    /// Float output keeps every sample bit-identical, which the audio cache
    /// relies on.
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Read a WAV file of any integer or float sample format.
    pub fn read_wav(path: &Path) -> Result<Self, hound::Error> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let samples = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Common interface for text-to-speech synthesis engines.
///
/// The deck builder only needs three things from an engine: a stable
/// identifier for cache keys, a way to bind it to an execution device, and
/// synthesis of a single piece of text.
pub trait SynthesisEngine {
    /// Identifier of the engine and model, folded into cache fingerprints.
    /// Two engines that can produce different audio for the same input must
    /// return different ids.
    fn id(&self) -> String;

    /// Prepare the engine to run on `device`.
    ///
    /// Called lazily before the first synthesis, once per device in the
    /// configured preference order until one succeeds.
    fn initialize(&mut self, device: Device) -> Result<(), Box<dyn std::error::Error>>;

    /// Synthesize speech from the given text.
    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<AudioClip, Box<dyn std::error::Error>>;

    /// Synthesize speech from the given text and write to a WAV file.
    ///
    /// Default implementation calls `synthesize()` then `AudioClip::write_wav()`.
    fn synthesize_to_file(
        &mut self,
        text: &str,
        wav_path: &Path,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.synthesize(text, voice, params)?.write_wav(wav_path)?;
        Ok(())
    }
}

impl<E: SynthesisEngine + ?Sized> SynthesisEngine for Box<E> {
    fn id(&self) -> String {
        (**self).id()
    }

    fn initialize(&mut self, device: Device) -> Result<(), Box<dyn std::error::Error>> {
        (**self).initialize(device)
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<AudioClip, Box<dyn std::error::Error>> {
        (**self).synthesize(text, voice, params)
    }
}

impl<E: SynthesisEngine + ?Sized> SynthesisEngine for &mut E {
    fn id(&self) -> String {
        (**self).id()
    }

    fn initialize(&mut self, device: Device) -> Result<(), Box<dyn std::error::Error>> {
        (**self).initialize(device)
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<AudioClip, Box<dyn std::error::Error>> {
        (**self).synthesize(text, voice, params)
    }
}
