//! Driving a [`SynthesisEngine`] for a whole deck.
//!
//! [`SynthesisAdapter`] owns the engine and everything that is constant for a
//! build (voice, parameters, device preference, cache). It initializes the
//! engine lazily on the first cache miss, walking the device preference list
//! until one device works, and counts every call that reaches the engine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::{normalize_text, AudioCache, SynthesisFingerprint};
use crate::{AudioClip, SynthesisEngine};

/// Execution device an engine can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    CoreMl,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cuda => "cuda",
            Self::CoreMl => "coreml",
            Self::Cpu => "cpu",
        })
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown device '{other}'")),
        }
    }
}

/// The voice to speak with: a named built-in voice and/or a reference
/// recording for voice-cloning engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    pub name: String,
    pub sample: Option<PathBuf>,
    /// SHA-256 of the sample file contents.
    sample_digest: Option<String>,
}

impl VoiceProfile {
    /// A built-in voice without a reference recording.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sample: None,
            sample_digest: None,
        }
    }

    /// A voice with a reference recording. The recording's bytes are hashed
    /// so that replacing the file invalidates cached clips.
    pub fn with_sample(name: impl Into<String>, sample: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(sample)?;
        Ok(Self {
            name: name.into(),
            sample: Some(sample.to_path_buf()),
            sample_digest: Some(hex::encode(Sha256::digest(&bytes))),
        })
    }

    /// Identifier folded into cache fingerprints.
    pub fn id(&self) -> String {
        match &self.sample_digest {
            Some(digest) => format!("{}#{digest}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Per-request synthesis parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams {
    /// Engine language code (e.g. `"zh-cn"`).
    pub language: String,
    /// Speech speed multiplier.
    pub speed: f32,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            language: "zh-cn".to_string(),
            speed: 1.0,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("synthesis failed for row {row}: {cause}")]
pub struct SynthesisError {
    pub row: usize,
    pub cause: String,
}

/// A synthesized (or cached) voice clip with the key it is stored under.
#[derive(Debug)]
pub struct SynthesizedClip {
    pub clip: AudioClip,
    pub fingerprint: SynthesisFingerprint,
    pub from_cache: bool,
}

enum EngineState {
    Uninitialized,
    Ready(Device),
    Failed(String),
}

pub struct SynthesisAdapter<E> {
    engine: E,
    voice: VoiceProfile,
    params: SynthesisParams,
    devices: Vec<Device>,
    state: EngineState,
    cache: AudioCache,
    external_calls: usize,
    warnings: Vec<String>,
}

impl<E: SynthesisEngine> SynthesisAdapter<E> {
    pub fn new(
        engine: E,
        voice: VoiceProfile,
        params: SynthesisParams,
        devices: Vec<Device>,
        cache: AudioCache,
    ) -> Self {
        Self {
            engine,
            voice,
            params,
            devices,
            state: EngineState::Uninitialized,
            cache,
            external_calls: 0,
            warnings: Vec::new(),
        }
    }

    pub fn fingerprint(&self, text: &str) -> SynthesisFingerprint {
        SynthesisFingerprint::compute(text, &self.engine.id(), &self.voice, &self.params)
    }

    /// Produce the voice clip for `text`, from the cache when possible.
    ///
    /// `row` only labels the error.
    pub fn synthesize(&mut self, text: &str, row: usize) -> Result<SynthesizedClip, SynthesisError> {
        let fingerprint = self.fingerprint(text);

        match self.cache.get(&fingerprint) {
            Ok(Some(clip)) => {
                log::debug!("Row {row}: cache hit {}", fingerprint.short(12));
                return Ok(SynthesizedClip {
                    clip,
                    fingerprint,
                    from_cache: true,
                });
            }
            Ok(None) => {}
            Err(e) => self.warn(format!("{e}; synthesizing again")),
        }

        self.ensure_ready().map_err(|cause| SynthesisError { row, cause })?;

        let normalized = normalize_text(text);
        self.external_calls += 1;
        let clip = self
            .engine
            .synthesize(&normalized, &self.voice, &self.params)
            .map_err(|e| SynthesisError {
                row,
                cause: e.to_string(),
            })?;
        if clip.is_empty() {
            return Err(SynthesisError {
                row,
                cause: "engine returned no audio".to_string(),
            });
        }

        if let Err(e) = self.cache.put(&fingerprint, &clip) {
            self.warn(format!("{e}; audio cache disabled for the rest of this build"));
            self.cache = AudioCache::disabled();
        }

        Ok(SynthesizedClip {
            clip,
            fingerprint,
            from_cache: false,
        })
    }

    /// Bind the engine to the first device that initializes.
    fn ensure_ready(&mut self) -> Result<Device, String> {
        match &self.state {
            EngineState::Ready(device) => return Ok(*device),
            EngineState::Failed(cause) => return Err(cause.clone()),
            EngineState::Uninitialized => {}
        }

        let devices = self.devices.clone();
        let mut failures = Vec::new();
        for device in devices {
            match self.engine.initialize(device) {
                Ok(()) => {
                    if !failures.is_empty() {
                        let msg = format!(
                            "TTS engine fell back to {device} ({})",
                            failures.join("; ")
                        );
                        self.warn(msg);
                    }
                    log::info!("TTS engine {} ready on {device}", self.engine.id());
                    self.state = EngineState::Ready(device);
                    return Ok(device);
                }
                Err(e) => {
                    log::warn!("TTS engine could not start on {device}: {e}");
                    failures.push(format!("{device}: {e}"));
                }
            }
        }

        let cause = if failures.is_empty() {
            "no execution device configured".to_string()
        } else {
            format!("engine unavailable on every device ({})", failures.join("; "))
        };
        self.state = EngineState::Failed(cause.clone());
        Err(cause)
    }

    fn warn(&mut self, msg: String) {
        log::warn!("{msg}");
        self.warnings.push(msg);
    }

    /// Number of requests that reached the engine.
    pub fn external_calls(&self) -> usize {
        self.external_calls
    }

    pub fn active_device(&self) -> Option<Device> {
        match self.state {
            EngineState::Ready(device) => Some(device),
            _ => None,
        }
    }

    pub fn voice(&self) -> &VoiceProfile {
        &self.voice
    }

    /// Warnings recorded since the last call.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    pub fn into_engine(self) -> E {
        self.engine
    }
}
