//! Content-addressed cache of synthesized voice clips.
//!
//! Entries live at `<root>/<fp[0..2]>/<fp>.wav` as 32-bit float WAV, so a hit
//! returns exactly the samples that were stored. Keys are
//! [`SynthesisFingerprint`]s: any change in text, voice or parameters yields a
//! different key, so entries never go stale and nothing is evicted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};

use crate::config::CacheMode;
use crate::rows::clean;
use crate::synthesis::{SynthesisParams, VoiceProfile};
use crate::AudioClip;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt cache entry {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
}

/// Cache key: SHA-256 over everything that influences synthesized audio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SynthesisFingerprint(String);

impl SynthesisFingerprint {
    pub fn compute(
        text: &str,
        engine_id: &str,
        voice: &VoiceProfile,
        params: &SynthesisParams,
    ) -> Self {
        let text = normalize_text(text);
        let voice_id = voice.id();
        let speed = format!("{:.4}", params.speed);

        let mut hasher = Sha256::new();
        // Unit separators keep field boundaries unambiguous.
        for part in [
            text.as_str(),
            engine_id,
            voice_id.as_str(),
            params.language.as_str(),
            speed.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` hex characters, for human-facing names.
    pub fn short(&self, n: usize) -> &str {
        &self.0[..n.min(self.0.len())]
    }
}

impl std::fmt::Display for SynthesisFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text as it is fed to the engine: cleaned, inner whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    clean(text).split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct AudioCache {
    root: Option<PathBuf>,
    mode: CacheMode,
}

impl AudioCache {
    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self {
            root: None,
            mode: CacheMode::Disabled,
        }
    }

    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: &Path, mode: CacheMode) -> Result<Self, CacheError> {
        if mode == CacheMode::Disabled {
            return Ok(Self::disabled());
        }
        std::fs::create_dir_all(dir).map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        log::info!("Audio cache at {} ({mode:?})", dir.display());
        Ok(Self {
            root: Some(dir.to_path_buf()),
            mode,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.root.is_some()
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Where the entry for `fp` is (or would be) stored.
    pub fn entry_path(&self, fp: &SynthesisFingerprint) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|root| root.join(fp.short(2)).join(format!("{}.wav", fp.as_str())))
    }

    /// Look up a clip. Always `None` when disabled or in refresh mode.
    pub fn get(&self, fp: &SynthesisFingerprint) -> Result<Option<AudioClip>, CacheError> {
        if self.mode != CacheMode::ReadWrite {
            return Ok(None);
        }
        let Some(path) = self.entry_path(fp) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        AudioClip::read_wav(&path)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { path, source })
    }

    /// Store a clip. The entry becomes visible in one `rename`, so readers
    /// never observe a partial file; concurrent stores of the same key are
    /// last-write-wins.
    pub fn put(&self, fp: &SynthesisFingerprint, clip: &AudioClip) -> Result<(), CacheError> {
        let Some(path) = self.entry_path(fp) else {
            return Ok(());
        };
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| CacheError::Io { path, source }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp = tmp_path(&path);
        if let Err(e) = clip.write_wav(&tmp) {
            let _ = std::fs::remove_file(&tmp);
            return Err(match e {
                hound::Error::IoError(source) => CacheError::Io { path: tmp, source },
                other => CacheError::Corrupt {
                    path: tmp,
                    source: other,
                },
            });
        }
        std::fs::rename(&tmp, &path).map_err(io_err(&path))?;
        log::debug!("Cached clip {}", fp.short(12));
        Ok(())
    }
}

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Unique sibling temp path, so concurrent writers never share a file.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "entry".to_string());
    path.with_file_name(format!(".{file_name}.{}-{n}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice() -> VoiceProfile {
        VoiceProfile::named("serena")
    }

    fn params() -> SynthesisParams {
        SynthesisParams {
            language: "zh-cn".to_string(),
            speed: 1.0,
        }
    }

    fn fp(text: &str) -> SynthesisFingerprint {
        SynthesisFingerprint::compute(text, "test-engine", &voice(), &params())
    }

    #[test]
    fn fingerprint_ignores_surrounding_and_repeated_whitespace() {
        assert_eq!(fp("你好  世界"), fp(" \u{feff}你好 世界\n"));
        assert_ne!(fp("你好"), fp("您好"));
    }

    #[test]
    fn fingerprint_changes_with_voice_engine_and_params() {
        let base = fp("你好");
        let other_voice =
            SynthesisFingerprint::compute("你好", "test-engine", &VoiceProfile::named("b"), &params());
        let other_engine = SynthesisFingerprint::compute("你好", "other", &voice(), &params());
        let faster = SynthesisFingerprint::compute(
            "你好",
            "test-engine",
            &voice(),
            &SynthesisParams {
                speed: 1.2,
                ..params()
            },
        );
        assert_ne!(base, other_voice);
        assert_ne!(base, other_engine);
        assert_ne!(base, faster);
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn hit_returns_stored_clip_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), CacheMode::ReadWrite).unwrap();
        let key = fp("谢谢");
        let clip = AudioClip::mono(vec![0.1, -0.2, 0.300_000_01], 24_000);

        assert_eq!(cache.get(&key).unwrap(), None);
        cache.put(&key, &clip).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(clip));

        let path = cache.entry_path(&key).unwrap();
        assert!(path.starts_with(dir.path().join(key.short(2))));
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn refresh_mode_stores_but_never_hits() {
        let dir = tempfile::tempdir().unwrap();
        let key = fp("再见");
        let clip = AudioClip::mono(vec![0.5; 8], 16_000);

        let refresh = AudioCache::open(dir.path(), CacheMode::Refresh).unwrap();
        refresh.put(&key, &clip).unwrap();
        assert_eq!(refresh.get(&key).unwrap(), None);

        let normal = AudioCache::open(dir.path(), CacheMode::ReadWrite).unwrap();
        assert_eq!(normal.get(&key).unwrap(), Some(clip));
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = AudioCache::disabled();
        let key = fp("你好");
        cache.put(&key, &AudioClip::mono(vec![0.0], 8_000)).unwrap();
        assert!(!cache.is_enabled());
        assert_eq!(cache.get(&key).unwrap(), None);
    }

    #[test]
    fn corrupt_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::open(dir.path(), CacheMode::ReadWrite).unwrap();
        let key = fp("坏");
        let path = cache.entry_path(&key).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a wav").unwrap();
        assert!(matches!(cache.get(&key), Err(CacheError::Corrupt { .. })));
    }
}
