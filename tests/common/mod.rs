//! Shared fixtures: a scripted engine and a throwaway workspace.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vocab_deck::config::{AudioFormat, DeckBuildConfig, DeckBuildConfigBuilder};
use vocab_deck::{AudioClip, Device, SynthesisEngine, SynthesisParams, VoiceProfile};

/// Engine that renders a short tone per character and counts its calls.
#[derive(Clone, Default)]
pub struct FakeEngine {
    pub calls: Arc<AtomicUsize>,
    /// Texts containing this substring fail to synthesize.
    pub fail_on: Option<String>,
}

impl FakeEngine {
    pub fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SynthesisEngine for FakeEngine {
    fn id(&self) -> String {
        "fake-tone".to_string()
    }

    fn initialize(&mut self, _device: Device) -> Result<(), Box<dyn std::error::Error>> {
        Ok(())
    }

    fn synthesize(
        &mut self,
        text: &str,
        _voice: &VoiceProfile,
        _params: &SynthesisParams,
    ) -> Result<AudioClip, Box<dyn std::error::Error>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(bad) = &self.fail_on {
            if text.contains(bad.as_str()) {
                return Err(format!("cannot pronounce '{text}'").into());
            }
        }
        let n = 800 * text.chars().count();
        let samples = (0..n)
            .map(|i| 0.5 * (i as f32 * 440.0 * std::f32::consts::TAU / 16_000.0).sin())
            .collect();
        Ok(AudioClip::mono(samples, 16_000))
    }
}

pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_input(&self, content: &str) -> PathBuf {
        let path = self.path().join("Lesson 1.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    /// WAV output, a cache inside the workspace and a fixed timestamp tag.
    pub fn config(&self) -> DeckBuildConfigBuilder {
        let mut builder = DeckBuildConfigBuilder::default();
        builder
            .input(self.path().join("Lesson 1.csv"))
            .output_dir(self.path().join("out"))
            .cache_dir(self.path().join("cache"))
            .audio_format(AudioFormat::Wav)
            .timestamp_tag("deck_20260101_000000");
        builder
    }

    pub fn default_config(&self) -> DeckBuildConfig {
        self.config().build().unwrap()
    }

    pub fn write_wav(&self, name: &str, clip: &AudioClip) -> PathBuf {
        let path = self.path().join(name);
        clip.write_wav(&path).unwrap();
        path
    }
}

pub const THREE_ROWS: &str = "\
Hanzi;Pinyin;Indo;Literal;Grammar
我喜欢喝茶。;wǒ xǐhuan hē chá.;Saya suka minum teh.;saya, suka, minum teh;喜欢 + V
他在哪儿？;tā zài nǎr?;;dia, di, mana;在 + tempat
谢谢你！;xièxie nǐ!;Terima kasih!;terima kasih, kamu;
";
