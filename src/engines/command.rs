//! Synthesis through an external TTS command.
//!
//! The command is described by an argument template. Each invocation
//! substitutes the placeholders below, runs the program, and reads back the
//! WAV file it wrote to `{out}`.
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{text}` | text to speak |
//! | `{voice}` | voice name |
//! | `{speaker}` | reference recording path |
//! | `{language}` | language code |
//! | `{speed}` | speed multiplier |
//! | `{model}` | model identifier |
//! | `{out}` | WAV file the command must write |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::cache::tmp_path;
use crate::{AudioClip, Device, SynthesisEngine, SynthesisParams, VoiceProfile};

#[derive(thiserror::Error, Debug)]
pub enum CommandEngineError {
    #[error("TTS program '{program}' not found: {reason}")]
    ProgramNotFound { program: String, reason: String },
    #[error("'{program}' has no {device} mode configured")]
    DeviceUnsupported { program: String, device: Device },
    #[error("engine not initialized")]
    NotInitialized,
    #[error("voice '{0}' has no reference sample but the command needs {{speaker}}")]
    MissingSpeaker(String),
    #[error("'{program}' exited with code {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unreadable output audio: {0}")]
    Output(#[from] hound::Error),
}

/// A TTS engine run as a child process, once per clip.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    model: String,
    args: Vec<String>,
    /// Arguments appended only when the voice carries a reference recording.
    speaker_args: Vec<String>,
    device_args: HashMap<Device, Vec<String>>,
    resolved: Option<(PathBuf, Device)>,
}

impl CommandEngine {
    /// A command with no device-specific arguments; runs on CPU only.
    pub fn new(program: impl Into<String>, model: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            args,
            speaker_args: Vec::new(),
            device_args: HashMap::from([(Device::Cpu, Vec::new())]),
            resolved: None,
        }
    }

    /// The Coqui `tts` CLI with a multilingual voice-cloning model.
    pub fn coqui(model: impl Into<String>) -> Self {
        let args = [
            "--text",
            "{text}",
            "--model_name",
            "{model}",
            "--language_idx",
            "{language}",
            "--out_path",
            "{out}",
        ];
        Self::new("tts", model, args.iter().map(|s| s.to_string()).collect())
            .with_speaker_args(vec!["--speaker_wav".to_string(), "{speaker}".to_string()])
            .with_device_args(Device::Cuda, vec!["--use_cuda".to_string(), "true".to_string()])
    }

    pub fn with_speaker_args(mut self, args: Vec<String>) -> Self {
        self.speaker_args = args;
        self
    }

    /// Enable `device`, passing `args` on every invocation that runs on it.
    pub fn with_device_args(mut self, device: Device, args: Vec<String>) -> Self {
        self.device_args.insert(device, args);
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self.resolved = None;
        self
    }

    /// Device the engine was initialized on.
    pub fn device(&self) -> Option<Device> {
        self.resolved.as_ref().map(|(_, d)| *d)
    }

    fn render_args(
        &self,
        device: Device,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
        out: &Path,
    ) -> Result<Vec<String>, CommandEngineError> {
        let speaker = voice.sample.as_ref().map(|p| p.display().to_string());
        let mut template: Vec<&String> = self.args.iter().collect();
        if speaker.is_some() {
            template.extend(self.speaker_args.iter());
        }
        if let Some(extra) = self.device_args.get(&device) {
            template.extend(extra.iter());
        }

        let out = out.display().to_string();
        let speed = format!("{}", params.speed);
        template
            .into_iter()
            .map(|arg| {
                if arg.contains("{speaker}") && speaker.is_none() {
                    return Err(CommandEngineError::MissingSpeaker(voice.name.clone()));
                }
                Ok(arg
                    .replace("{text}", text)
                    .replace("{voice}", &voice.name)
                    .replace("{speaker}", speaker.as_deref().unwrap_or_default())
                    .replace("{language}", &params.language)
                    .replace("{speed}", &speed)
                    .replace("{model}", &self.model)
                    .replace("{out}", &out))
            })
            .collect()
    }

    fn run(
        &self,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<AudioClip, CommandEngineError> {
        let (program, device) = self
            .resolved
            .as_ref()
            .ok_or(CommandEngineError::NotInitialized)?;

        let out = tmp_path(&std::env::temp_dir().join("vocab-deck-tts.wav"));
        let args = self.render_args(*device, text, voice, params, &out)?;
        log::debug!("Running {} {:?}", program.display(), args);

        let output = Command::new(program).args(&args).output();
        let result = match output {
            Err(e) => Err(CommandEngineError::Io(e)),
            Ok(output) if !output.status.success() => Err(CommandEngineError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(_) => AudioClip::read_wav(&out).map_err(CommandEngineError::from),
        };
        let _ = std::fs::remove_file(&out);
        result
    }
}

impl SynthesisEngine for CommandEngine {
    fn id(&self) -> String {
        format!("command:{}:{}", self.program, self.model)
    }

    fn initialize(&mut self, device: Device) -> Result<(), Box<dyn std::error::Error>> {
        if !self.device_args.contains_key(&device) {
            return Err(CommandEngineError::DeviceUnsupported {
                program: self.program.clone(),
                device,
            }
            .into());
        }
        let path = which::which(&self.program).map_err(|e| CommandEngineError::ProgramNotFound {
            program: self.program.clone(),
            reason: e.to_string(),
        })?;
        log::info!("Using {} on {device}", path.display());
        self.resolved = Some((path, device));
        Ok(())
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Result<AudioClip, Box<dyn std::error::Error>> {
        Ok(self.run(text, voice, params)?)
    }
}
