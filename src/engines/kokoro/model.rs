use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;

use super::phonemizer::{phonemize, Espeak};
use super::voices::{VoiceStore, STYLE_DIM};
use crate::Device;

/// Output sample rate of the model.
pub const SAMPLE_RATE: u32 = 24_000;

/// Token budget per inference call, excluding the two boundary pads.
const MAX_TOKENS: usize = 510;

/// 10 ms at 24 kHz.
const JOIN_FADE: usize = 240;

#[derive(thiserror::Error, Debug)]
pub enum KokoroError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("missing model file: {0}")]
    MissingFile(PathBuf),
    #[error("invalid config.json: {0}")]
    Config(String),
    #[error("espeak-ng not found; install it (apt install espeak-ng / brew install espeak-ng)")]
    EspeakNotFound,
    #[error("phonemization failed: {0}")]
    Phonemizer(String),
    #[error("voice '{0}' is not in the voice archive")]
    UnknownVoice(String),
    #[error("bad voice archive: {0}")]
    VoiceArchive(String),
    #[error("model not loaded; initialize the engine first")]
    NotLoaded,
}

#[derive(Deserialize)]
struct ModelConfig {
    vocab: HashMap<String, i64>,
}

/// Phoneme vocabulary from the model's `config.json`.
pub fn load_vocab(config_path: &Path) -> Result<HashMap<char, i64>, KokoroError> {
    let text = std::fs::read_to_string(config_path)?;
    let config: ModelConfig =
        serde_json::from_str(&text).map_err(|e| KokoroError::Config(e.to_string()))?;
    config
        .vocab
        .into_iter()
        .map(|(key, id)| {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(ch), None) => Ok((ch, id)),
                _ => Err(KokoroError::Config(format!(
                    "vocab key {key:?} is not a single character"
                ))),
            }
        })
        .collect()
}

pub struct KokoroModel {
    session: Session,
    voices: VoiceStore,
    vocab: HashMap<char, i64>,
    tokens_input: String,
    int_speed: bool,
}

impl KokoroModel {
    pub fn load(dir: &Path, device: Device, threads: Option<usize>) -> Result<Self, KokoroError> {
        let onnx = find_onnx(dir)?;
        let voices_path = dir.join("voices-v1.0.bin");
        let config_path = dir.join("config.json");
        for required in [&voices_path, &config_path] {
            if !required.exists() {
                return Err(KokoroError::MissingFile(required.clone()));
            }
        }

        log::info!("Loading Kokoro model {} on {device}", onnx.display());
        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers([provider(device)])?;
        if let Some(n) = threads {
            builder = builder.with_intra_threads(n)?;
        }
        let session = builder.commit_from_file(&onnx)?;

        let (tokens_input, int_speed) = input_layout(&session);
        log::debug!("Kokoro inputs: tokens='{tokens_input}', int speed={int_speed}");

        Ok(Self {
            session,
            voices: VoiceStore::load(&voices_path)?,
            vocab: load_vocab(&config_path)?,
            tokens_input,
            int_speed,
        })
    }

    pub fn voices(&self) -> Vec<&str> {
        self.voices.names()
    }

    pub fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        language: &str,
        speed: f32,
        espeak: &Espeak,
    ) -> Result<Vec<f32>, KokoroError> {
        let tokens = phonemize(text, language, &self.vocab, espeak)?;
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        // One style row for the whole text keeps prosody even across chunks.
        let style = self.voices.style(voice, tokens.len())?;

        let mut audio: Vec<f32> = Vec::new();
        for chunk in tokens.chunks(MAX_TOKENS) {
            let part = self.infer(chunk, &style, speed)?;
            crossfade_into(&mut audio, &part);
        }
        Ok(audio)
    }

    fn infer(
        &mut self,
        tokens: &[i64],
        style: &[f32; STYLE_DIM],
        speed: f32,
    ) -> Result<Vec<f32>, KokoroError> {
        let padded: Vec<i64> = std::iter::once(0)
            .chain(tokens.iter().copied())
            .chain(std::iter::once(0))
            .collect();
        let tokens = Array2::from_shape_vec((1, padded.len()), padded)?;
        let style = Array2::from_shape_vec((1, STYLE_DIM), style.to_vec())?;

        let outputs = if self.int_speed {
            let speed = Array1::from_vec(vec![speed.round() as i32]);
            self.session.run(inputs![
                self.tokens_input.as_str() => TensorRef::from_array_view(tokens.view())?,
                "style" => TensorRef::from_array_view(style.view())?,
                "speed" => TensorRef::from_array_view(speed.view())?,
            ])?
        } else {
            let speed = Array1::from_vec(vec![speed]);
            self.session.run(inputs![
                self.tokens_input.as_str() => TensorRef::from_array_view(tokens.view())?,
                "style" => TensorRef::from_array_view(style.view())?,
                "speed" => TensorRef::from_array_view(speed.view())?,
            ])?
        };

        let (_, waveform) = outputs
            .iter()
            .next()
            .ok_or_else(|| KokoroError::Ort(ort::Error::new("model produced no output")))?;
        Ok(waveform.try_extract_array::<f32>()?.iter().copied().collect())
    }
}

fn provider(device: Device) -> ExecutionProviderDispatch {
    match device {
        Device::Cuda => CUDAExecutionProvider::default().build().error_on_failure(),
        Device::CoreMl => CoreMLExecutionProvider::default().build().error_on_failure(),
        Device::Cpu => CPUExecutionProvider::default().build(),
    }
}

/// Name of the token input and whether `speed` is an int32 tensor.
fn input_layout(session: &Session) -> (String, bool) {
    let mut tokens = "input_ids".to_string();
    let mut int_speed = true;
    for input in session.inputs() {
        match input.name() {
            "input_ids" | "tokens" => tokens = input.name().to_string(),
            "speed" => int_speed = format!("{:?}", input.dtype()).to_lowercase().contains("int32"),
            _ => {}
        }
    }
    (tokens, int_speed)
}

fn find_onnx(dir: &Path) -> Result<PathBuf, KokoroError> {
    let preferred = dir.join("kokoro-quant-convinteger.onnx");
    if preferred.exists() {
        return Ok(preferred);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "onnx"))
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| KokoroError::MissingFile(dir.join("*.onnx")))
}

/// Append `next`, blending the seam linearly over [`JOIN_FADE`] samples.
fn crossfade_into(audio: &mut Vec<f32>, next: &[f32]) {
    let overlap = JOIN_FADE.min(audio.len()).min(next.len());
    let start = audio.len() - overlap;
    for (i, &incoming) in next[..overlap].iter().enumerate() {
        let t = (i + 1) as f32 / (overlap + 1) as f32;
        audio[start + i] = audio[start + i] * (1.0 - t) + incoming * t;
    }
    audio.extend_from_slice(&next[overlap..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossfade_blends_only_the_seam() {
        let mut audio = vec![1.0; 300];
        crossfade_into(&mut audio, &[0.0; 300]);
        assert_eq!(audio.len(), 360);
        assert_eq!(audio[0], 1.0);
        assert!(audio[100] < 1.0 && audio[100] > 0.0);
        assert_eq!(audio[359], 0.0);
    }

    #[test]
    fn first_chunk_is_copied_verbatim() {
        let mut audio = Vec::new();
        crossfade_into(&mut audio, &[0.5, 0.25]);
        assert_eq!(audio, vec![0.5, 0.25]);
    }

    #[test]
    fn vocab_keys_must_be_single_characters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{"vocab": {"a": 43, "ə": 83}, "n_token": 178}"#).unwrap();
        let vocab = load_vocab(&path).unwrap();
        assert_eq!(vocab[&'ə'], 83);

        std::fs::write(&path, r#"{"vocab": {"ab": 1}}"#).unwrap();
        assert!(matches!(load_vocab(&path), Err(KokoroError::Config(_))));
    }

    #[test]
    fn missing_files_are_named() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"").unwrap();
        let err = KokoroModel::load(dir.path(), Device::Cpu, None).err().unwrap();
        assert!(matches!(err, KokoroError::MissingFile(p) if p.ends_with("voices-v1.0.bin")));
    }
}
