use std::path::{Path, PathBuf};

use crate::{AudioClip, Device, SynthesisEngine, SynthesisParams, VoiceProfile};

use super::model::{KokoroError, KokoroModel, SAMPLE_RATE};
use super::phonemizer::{espeak_language, Espeak};

/// Kokoro text-to-speech engine.
///
/// The model is loaded by [`SynthesisEngine::initialize`], bound to the
/// requested execution device.
pub struct KokoroEngine {
    model_dir: PathBuf,
    threads: Option<usize>,
    espeak: Espeak,
    model: Option<KokoroModel>,
    warned_sample: bool,
}

impl KokoroEngine {
    pub fn new(model_dir: &Path) -> Self {
        Self {
            model_dir: model_dir.to_path_buf(),
            threads: None,
            espeak: Espeak::default(),
            model: None,
            warned_sample: false,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Use a bundled espeak-ng binary instead of the one on `PATH`.
    pub fn with_espeak(mut self, binary: PathBuf, data_dir: Option<PathBuf>) -> Self {
        self.espeak = Espeak {
            binary,
            data_dir,
        };
        self
    }

    /// Voice names in the loaded archive; empty before initialization.
    pub fn voices(&self) -> Vec<&str> {
        self.model.as_ref().map(|m| m.voices()).unwrap_or_default()
    }
}

impl SynthesisEngine for KokoroEngine {
    fn id(&self) -> String {
        let name = self
            .model_dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "kokoro".to_string());
        format!("kokoro:{name}")
    }

    fn initialize(&mut self, device: Device) -> Result<(), Box<dyn std::error::Error>> {
        self.model = Some(KokoroModel::load(&self.model_dir, device, self.threads)?);
        Ok(())
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<AudioClip, Box<dyn std::error::Error>> {
        if voice.sample.is_some() && !self.warned_sample {
            log::warn!("Kokoro has no voice cloning; ignoring the reference sample");
            self.warned_sample = true;
        }
        let model = self.model.as_mut().ok_or(KokoroError::NotLoaded)?;
        let language = espeak_language(&params.language, &voice.name);
        let samples = model.synthesize(text, &voice.name, language, params.speed, &self.espeak)?;
        Ok(AudioClip::mono(samples, SAMPLE_RATE))
    }
}
