//! Writing mixed clips to their final container.
//!
//! WAV is written directly with hound. MP3 is produced by an external
//! `ffmpeg`, located once per build by [`Encoder::probe`]. When ffmpeg cannot
//! be used the [`EncoderFallback`] policy decides between writing WAV instead
//! (with a warning) and failing the build.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::cache::tmp_path;
use crate::config::{AudioFormat, DeckBuildConfig, EncoderFallback};
use crate::AudioClip;

#[derive(thiserror::Error, Debug)]
pub enum EncodingError {
    #[error("no usable encoder for {format:?}: {reason}")]
    Unavailable { format: AudioFormat, reason: String },
    #[error("encoder rejected {path}: {message}")]
    Rejected { path: PathBuf, message: String },
    #[error("could not write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("WAV export failed: {0}")]
    Wav(#[from] hound::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub format: AudioFormat,
    /// Explicit ffmpeg executable; `None` searches `PATH`.
    pub ffmpeg_path: Option<PathBuf>,
    pub bitrate: String,
    pub fallback: EncoderFallback,
}

impl EncoderSettings {
    pub fn from_config(config: &DeckBuildConfig) -> Self {
        Self {
            format: config.audio_format,
            ffmpeg_path: config.ffmpeg_path.clone(),
            bitrate: config.bitrate.clone(),
            fallback: config.encoder_fallback,
        }
    }
}

/// An encoder whose output format has been settled.
#[derive(Debug, Clone)]
pub struct Encoder {
    format: AudioFormat,
    ffmpeg: Option<PathBuf>,
    bitrate: String,
}

impl Encoder {
    /// Settle the output format for a build.
    ///
    /// Returns the encoder and, when the requested format had to be given up,
    /// a warning describing the fallback.
    pub fn probe(settings: &EncoderSettings) -> Result<(Self, Option<String>), EncodingError> {
        match settings.format {
            AudioFormat::Wav => Ok((Self::wav(), None)),
            AudioFormat::Mp3 => match locate_ffmpeg(settings.ffmpeg_path.as_deref()) {
                Ok(ffmpeg) => {
                    log::info!("Encoding MP3 with {}", ffmpeg.display());
                    Ok((
                        Self {
                            format: AudioFormat::Mp3,
                            ffmpeg: Some(ffmpeg),
                            bitrate: settings.bitrate.clone(),
                        },
                        None,
                    ))
                }
                Err(reason) => match settings.fallback {
                    EncoderFallback::Uncompressed => {
                        let warning = format!("{reason}; writing WAV audio instead of MP3");
                        log::warn!("{warning}");
                        Ok((Self::wav(), Some(warning)))
                    }
                    EncoderFallback::Fail => Err(EncodingError::Unavailable {
                        format: AudioFormat::Mp3,
                        reason,
                    }),
                },
            },
        }
    }

    /// An encoder writing uncompressed WAV.
    pub fn wav() -> Self {
        Self {
            format: AudioFormat::Wav,
            ffmpeg: None,
            bitrate: String::new(),
        }
    }

    /// Format actually produced.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Write `clip` to `dest`. The file appears atomically.
    pub fn encode(&self, clip: &AudioClip, dest: &Path) -> Result<(), EncodingError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|source| EncodingError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let staged = tmp_path(dest);
        let result = match (&self.format, &self.ffmpeg) {
            (AudioFormat::Mp3, Some(ffmpeg)) => self.encode_mp3(ffmpeg, clip, &staged, dest),
            _ => write_pcm16(clip, &staged),
        };
        if let Err(e) = result {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }

        std::fs::rename(&staged, dest).map_err(|source| EncodingError::Io {
            path: dest.to_path_buf(),
            source,
        })
    }

    /// Encode into `out`; errors name `dest`, the file the caller asked for.
    fn encode_mp3(
        &self,
        ffmpeg: &Path,
        clip: &AudioClip,
        out: &Path,
        dest: &Path,
    ) -> Result<(), EncodingError> {
        let pcm = out.with_extension("src.wav");
        write_pcm16(clip, &pcm)?;

        let output = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(&pcm)
            .args(["-codec:a", "libmp3lame", "-b:a", &self.bitrate, "-f", "mp3"])
            .arg(out)
            .output();
        let _ = std::fs::remove_file(&pcm);

        let output = output.map_err(|source| EncodingError::Io {
            path: ffmpeg.to_path_buf(),
            source,
        })?;
        if !output.status.success() {
            return Err(EncodingError::Rejected {
                path: dest.to_path_buf(),
                message: format!(
                    "ffmpeg exited with code {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Write 16-bit PCM, the most widely playable WAV flavour.
fn write_pcm16(clip: &AudioClip, path: &Path) -> Result<(), EncodingError> {
    let spec = hound::WavSpec {
        channels: clip.channels,
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in &clip.samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Resolve a runnable ffmpeg: the explicit path only, or `ffmpeg` on `PATH`.
fn locate_ffmpeg(explicit: Option<&Path>) -> Result<PathBuf, String> {
    let candidate = match explicit {
        Some(path) => path.to_path_buf(),
        None => which::which("ffmpeg").map_err(|e| format!("ffmpeg not found on PATH: {e}"))?,
    };

    let output = Command::new(&candidate)
        .arg("-version")
        .output()
        .map_err(|e| format!("cannot run ffmpeg at {}: {e}", candidate.display()))?;
    if !output.status.success() {
        return Err(format!(
            "ffmpeg at {} exited with code {:?}",
            candidate.display(),
            output.status.code()
        ));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(format: AudioFormat, ffmpeg: Option<&str>, fallback: EncoderFallback) -> EncoderSettings {
        EncoderSettings {
            format,
            ffmpeg_path: ffmpeg.map(PathBuf::from),
            bitrate: "192k".to_string(),
            fallback,
        }
    }

    #[test]
    fn invalid_ffmpeg_path_falls_back_to_wav_with_warning() {
        let (encoder, warning) = Encoder::probe(&settings(
            AudioFormat::Mp3,
            Some("/no/such/ffmpeg"),
            EncoderFallback::Uncompressed,
        ))
        .unwrap();
        assert_eq!(encoder.format(), AudioFormat::Wav);
        assert!(warning.unwrap().contains("/no/such/ffmpeg"));
    }

    #[test]
    fn invalid_ffmpeg_path_fails_under_strict_policy() {
        let err = Encoder::probe(&settings(
            AudioFormat::Mp3,
            Some("/no/such/ffmpeg"),
            EncoderFallback::Fail,
        ))
        .unwrap_err();
        assert!(matches!(err, EncodingError::Unavailable { .. }));
    }

    #[test]
    fn wav_needs_no_external_tool() {
        let (encoder, warning) = Encoder::probe(&settings(
            AudioFormat::Wav,
            Some("/no/such/ffmpeg"),
            EncoderFallback::Fail,
        ))
        .unwrap();
        assert_eq!(encoder.format(), AudioFormat::Wav);
        assert!(warning.is_none());
    }

    #[test]
    fn wav_output_is_clamped_pcm16() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("media").join("clip.wav");
        let clip = AudioClip::mono(vec![0.5, -2.0, 0.0], 22_050);

        Encoder::wav().encode(&clip, &dest).unwrap();

        let reader = hound::WavReader::open(&dest).unwrap();
        assert_eq!(reader.spec().bits_per_sample, 16);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![16_384, -i16::MAX, 0]);
        let siblings = std::fs::read_dir(dest.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1);
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_failure_is_rejected_and_names_the_destination() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(
            &ffmpeg,
            "#!/bin/sh\n[ \"$1\" = \"-version\" ] && exit 0\necho nope >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (encoder, warning) = Encoder::probe(&settings(
            AudioFormat::Mp3,
            ffmpeg.to_str(),
            EncoderFallback::Fail,
        ))
        .unwrap();
        assert!(warning.is_none());

        let media = dir.path().join("media");
        let dest = media.join("clip.mp3");
        let err = encoder
            .encode(&AudioClip::mono(vec![0.1; 100], 8_000), &dest)
            .unwrap_err();
        match err {
            EncodingError::Rejected { path, message } => {
                assert_eq!(path, dest);
                assert!(message.contains("nope"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_dir(&media).unwrap().count(), 0);
    }

    #[test]
    fn mp3_encoding_with_ffmpeg_on_path() {
        // Skip when ffmpeg is unavailable in the execution environment.
        let Ok((encoder, None)) =
            Encoder::probe(&settings(AudioFormat::Mp3, None, EncoderFallback::Fail))
        else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.mp3");
        let clip = AudioClip::mono((0..24_000).map(|i| (i as f32 * 0.05).sin() * 0.3).collect(), 24_000);

        encoder.encode(&clip, &dest).unwrap();
        assert!(std::fs::metadata(&dest).unwrap().len() > 0);
    }
}
