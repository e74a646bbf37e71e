//! The deck build, end to end.
//!
//! [`DeckBuilder`] parses the input, voices every entry through the
//! [`SynthesisAdapter`], mixes and encodes the clips, and writes a single
//! package. Problems with individual rows are collected and returned next to
//! the package; only configuration and packaging problems abort a build.
//!
//! ```ignore
//! let mut builder = DeckBuilder::new(config, engine)
//!     .on_progress(Box::new(|e| println!("{}/{}", e.completed, e.total)));
//! let result = builder.build()?;
//! for err in &result.row_errors {
//!     eprintln!("{err}");
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::AudioCache;
use crate::config::{AudioFormat, DeckBuildConfig};
use crate::deck::{write_package, CardMediaBundle, DeckAssembler};
use crate::encoder::{Encoder, EncoderSettings};
use crate::error::{ConfigError, DeckBuildError, RowError, RowErrorReason};
use crate::mixer;
use crate::rows::{ParseOptions, RowParser, VocabEntry};
use crate::synthesis::{Device, SynthesisAdapter, SynthesisParams, VoiceProfile};
use crate::{AudioClip, SynthesisEngine};

/// Where a build is when it reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    /// Input parsed and audio set up; `total` is known.
    Init,
    /// One more row has been processed.
    Row,
    /// All rows done, package being written.
    Assembling,
    /// Package written.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
    pub message: String,
}

pub type ProgressCallback = Box<dyn FnMut(&ProgressEvent)>;

/// Lifecycle of a [`DeckBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Parsing,
    Processing,
    Assembling,
    Done,
    Failed,
}

/// Cooperative cancellation flag, checked after every row.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct DeckBuildResult {
    pub package_path: PathBuf,
    pub deck_title: String,
    /// Entries that made it into the package.
    pub processed: usize,
    /// Data rows that did not.
    pub skipped: usize,
    pub card_count: usize,
    /// Every recovered row problem, ordered by row.
    pub row_errors: Vec<RowError>,
    pub warnings: Vec<String>,
    /// Media files referenced by the package.
    pub media_files: Vec<PathBuf>,
    /// Requests that reached the TTS engine (cache hits excluded).
    pub synthesis_calls: usize,
    /// Format actually written, after any encoder fallback.
    pub audio_format: AudioFormat,
    /// Device the engine ran on; `None` when every clip came from the cache.
    pub device: Option<Device>,
}

/// Audio-side setup shared by deck builds and single clips.
struct AudioSetup {
    encoder: Encoder,
    ambience: Option<AudioClip>,
    voice: VoiceProfile,
    cache: AudioCache,
    warnings: Vec<String>,
}

impl AudioSetup {
    fn prepare(config: &DeckBuildConfig) -> Result<Self, DeckBuildError> {
        let mut warnings = Vec::new();

        let voice = match config.resolve_voice_sample()? {
            Some(sample) => {
                log::info!("Voice sample: {}", sample.display());
                VoiceProfile::with_sample(config.voice_name.clone(), &sample).map_err(|source| {
                    ConfigError::Unreadable {
                        path: sample.clone(),
                        source,
                    }
                })?
            }
            None => VoiceProfile::named(config.voice_name.clone()),
        };

        let (encoder, warning) = Encoder::probe(&EncoderSettings::from_config(config))?;
        warnings.extend(warning);

        let (ambience_path, warning) = config.resolve_ambience();
        if let Some(w) = warning {
            log::warn!("{w}");
            warnings.push(w);
        }
        let ambience = ambience_path.and_then(|path| match AudioClip::read_wav(&path) {
            Ok(clip) if !clip.is_empty() => {
                log::info!(
                    "Ambience: {} ({:.1}s)",
                    path.display(),
                    clip.duration_secs()
                );
                Some(clip)
            }
            Ok(_) => {
                let w = format!("ambience file {} is empty; building without ambience", path.display());
                log::warn!("{w}");
                warnings.push(w);
                None
            }
            Err(e) => {
                let w = format!(
                    "ambience file {} unreadable ({e}); building without ambience",
                    path.display()
                );
                log::warn!("{w}");
                warnings.push(w);
                None
            }
        });

        let cache = match config.effective_cache_dir() {
            Some(dir) => AudioCache::open(&dir, config.cache_mode).unwrap_or_else(|e| {
                let w = format!("{e}; audio cache disabled");
                log::warn!("{w}");
                warnings.push(w);
                AudioCache::disabled()
            }),
            None => AudioCache::disabled(),
        };

        Ok(Self {
            encoder,
            ambience,
            voice,
            cache,
            warnings,
        })
    }
}

fn synthesis_params(config: &DeckBuildConfig) -> SynthesisParams {
    SynthesisParams {
        language: config.language.clone(),
        speed: config.speed,
    }
}

/// Builds one deck from one configuration.
pub struct DeckBuilder<E> {
    config: DeckBuildConfig,
    engine: Option<E>,
    progress: Option<ProgressCallback>,
    cancel: CancelToken,
    state: PipelineState,
}

impl<E: SynthesisEngine> DeckBuilder<E> {
    pub fn new(config: DeckBuildConfig, engine: E) -> Self {
        Self {
            config,
            engine: Some(engine),
            progress: None,
            cancel: CancelToken::new(),
            state: PipelineState::Idle,
        }
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &DeckBuildConfig {
        &self.config
    }

    /// Give back the engine, e.g. to reuse a loaded model.
    pub fn into_engine(self) -> Option<E> {
        self.engine
    }

    /// Run the build.
    ///
    /// Row-level failures never abort; they are returned in
    /// [`DeckBuildResult::row_errors`]. On cancellation no package is
    /// written.
    pub fn build(&mut self) -> Result<DeckBuildResult, DeckBuildError> {
        let engine = self.engine.take().ok_or_else(|| {
            ConfigError::Invalid("the engine was lost by an earlier build".to_string())
        })?;

        let (engine, outcome) = self.run(engine);
        self.engine = Some(engine);

        match &outcome {
            Ok(result) => {
                log::info!(
                    "Built {} ({} entries, {} skipped)",
                    result.package_path.display(),
                    result.processed,
                    result.skipped
                );
                self.transition(PipelineState::Done);
            }
            Err(e) => {
                log::error!("Deck build failed: {e}");
                self.transition(PipelineState::Failed);
            }
        }
        outcome
    }

    fn run(&mut self, engine: E) -> (E, Result<DeckBuildResult, DeckBuildError>) {
        self.transition(PipelineState::Parsing);
        let prepared = self.config.validate().map_err(DeckBuildError::from).and_then(|()| {
            let raw = std::fs::read(&self.config.input).map_err(|source| ConfigError::Unreadable {
                path: self.config.input.clone(),
                source,
            })?;
            let parsed = RowParser::new(ParseOptions::from_config(&self.config)).parse(&raw)?;
            let setup = AudioSetup::prepare(&self.config)?;
            std::fs::create_dir_all(&self.config.output_dir)?;
            Ok((parsed, setup))
        });
        let (parsed, setup) = match prepared {
            Ok(p) => p,
            Err(e) => return (engine, Err(e)),
        };

        let AudioSetup {
            encoder,
            ambience,
            voice,
            cache,
            mut warnings,
        } = setup;
        let mut adapter = SynthesisAdapter::new(
            engine,
            voice,
            synthesis_params(&self.config),
            self.config.device_preference.clone(),
            cache,
        );

        let total_rows = parsed.total();
        let entries = parsed.entries;
        let mut row_errors = parsed.errors;
        let total = entries.len();

        let timestamp_tag = self
            .config
            .timestamp_tag
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("deck_%Y%m%d_%H%M%S").to_string());
        let mut assembler = DeckAssembler::new(
            &self.config.deck_name,
            &self.config.deck_base_name(),
            &timestamp_tag,
            &self.config.output_dir.join("media"),
            encoder.format(),
            self.config.use_literal_linebreaks,
        );

        self.emit(
            Stage::Init,
            0,
            total,
            format!("{total} entries to voice, {} rows rejected", row_errors.len()),
        );
        self.transition(PipelineState::Processing);

        let mut bundles: Vec<CardMediaBundle> = Vec::with_capacity(total);
        for (i, entry) in entries.into_iter().enumerate() {
            let row = entry.row;
            match self.process_entry(&mut adapter, &mut assembler, &encoder, ambience.as_ref(), entry) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => {
                    log::warn!("{e}");
                    row_errors.push(e);
                }
            }
            warnings.extend(adapter.take_warnings());

            let completed = i + 1;
            self.emit(Stage::Row, completed, total, format!("row {row}"));
            if self.cancel.is_cancelled() {
                log::info!("Build cancelled after {completed} of {total} entries");
                return (adapter.into_engine(), Err(DeckBuildError::Cancelled { completed, total }));
            }
        }

        self.transition(PipelineState::Assembling);
        self.emit(Stage::Assembling, total, total, "writing package".to_string());

        let (bundles, unresolved) = assembler.resolve_media(bundles);
        row_errors.extend(unresolved);
        row_errors.sort_by_key(|e| e.row);

        let created_ms = chrono::Utc::now().timestamp_millis();
        let package_path = self.config.output_dir.join(assembler.package_file_name());
        let written = assembler
            .assemble(bundles, created_ms)
            .and_then(|deck| write_package(&deck, &package_path).map(|()| deck));
        let deck = match written {
            Ok(deck) => deck,
            Err(source) => {
                return (
                    adapter.into_engine(),
                    Err(DeckBuildError::Assembly { source, row_errors }),
                )
            }
        };

        let result = DeckBuildResult {
            package_path,
            deck_title: deck.title.clone(),
            processed: deck.notes.len(),
            skipped: total_rows - deck.notes.len(),
            card_count: deck.card_count(),
            row_errors,
            warnings,
            media_files: deck.media.iter().map(|m| m.path.clone()).collect(),
            synthesis_calls: adapter.external_calls(),
            audio_format: encoder.format(),
            device: adapter.active_device(),
        };
        self.emit(
            Stage::Complete,
            total,
            total,
            format!("{} cards", result.card_count),
        );
        (adapter.into_engine(), Ok(result))
    }

    /// Voice one entry and hand back its bundle. Audio already written for
    /// an identical entry earlier in this build is reused.
    fn process_entry(
        &self,
        adapter: &mut SynthesisAdapter<E>,
        assembler: &mut DeckAssembler,
        encoder: &Encoder,
        ambience: Option<&AudioClip>,
        entry: VocabEntry,
    ) -> Result<CardMediaBundle, RowError> {
        let fingerprint = adapter.fingerprint(&entry.characters);
        let claim = assembler.claim(&entry, &fingerprint).map_err(|mut e| {
            if entry.audio.is_some() {
                e.columns = vec![self.config.columns.audio.clone()];
            }
            e
        })?;

        if claim.shared && has_content(&claim.path) {
            log::debug!("Row {}: reusing {}", entry.row, claim.name);
        } else {
            match self.voice(adapter, encoder, ambience, &entry, &claim.path) {
                Ok(from_cache) => log::debug!(
                    "Row {}: wrote {} ({})",
                    entry.row,
                    claim.name,
                    if from_cache { "cached" } else { "synthesized" }
                ),
                Err(e) => {
                    // Nothing was written, so a later entry may use the name.
                    if !claim.shared {
                        assembler.release(&claim.name, &fingerprint);
                    }
                    return Err(e);
                }
            }
        }

        Ok(assembler.bundle(entry, claim, fingerprint))
    }

    /// Synthesize, mix and encode `entry` to `dest`. Returns whether the
    /// voice came from the cache.
    fn voice(
        &self,
        adapter: &mut SynthesisAdapter<E>,
        encoder: &Encoder,
        ambience: Option<&AudioClip>,
        entry: &VocabEntry,
        dest: &Path,
    ) -> Result<bool, RowError> {
        let voiced = adapter
            .synthesize(&entry.characters, entry.row)
            .map_err(|e| self.row_error(entry, RowErrorReason::Synthesis, e.cause))?;
        let mixed = mixer::mix(voiced.clip, ambience, &self.config.gain)
            .map_err(|e| self.row_error(entry, RowErrorReason::Mixing, e.to_string()))?;
        encoder
            .encode(&mixed, dest)
            .map_err(|e| self.row_error(entry, RowErrorReason::Encoding, e.to_string()))?;
        Ok(voiced.from_cache)
    }

    fn row_error(&self, entry: &VocabEntry, reason: RowErrorReason, detail: String) -> RowError {
        RowError {
            row: entry.row,
            columns: vec![self.config.columns.characters.clone()],
            reason,
            detail,
            raw: entry.source.cells.clone(),
        }
    }

    fn emit(&mut self, stage: Stage, completed: usize, total: usize, message: String) {
        if let Some(callback) = self.progress.as_mut() {
            callback(&ProgressEvent {
                stage,
                completed,
                total,
                message,
            });
        }
    }

    fn transition(&mut self, to: PipelineState) {
        log::info!("Pipeline {:?} -> {:?}", self.state, to);
        self.state = to;
    }
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.len() > 0)
}

/// A single clip written by [`generate_clip`].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedClip {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub warnings: Vec<String>,
}

/// Synthesize, mix and encode one piece of text outside of a deck.
///
/// The extension of `dest` is replaced to match the format actually
/// written. Pass `&mut engine` to keep the engine afterwards.
pub fn generate_clip<E: SynthesisEngine>(
    config: &DeckBuildConfig,
    engine: E,
    text: &str,
    dest: &Path,
) -> Result<GeneratedClip, DeckBuildError> {
    if text.trim().is_empty() {
        return Err(ConfigError::EmptyText.into());
    }
    config.validate()?;

    let AudioSetup {
        encoder,
        ambience,
        voice,
        cache,
        mut warnings,
    } = AudioSetup::prepare(config)?;
    let mut adapter = SynthesisAdapter::new(
        engine,
        voice,
        synthesis_params(config),
        config.device_preference.clone(),
        cache,
    );

    let voiced = adapter.synthesize(text, 0)?;
    warnings.extend(adapter.take_warnings());
    let mixed = mixer::mix(voiced.clip, ambience.as_ref(), &config.gain)?;

    let path = dest.with_extension(encoder.format().extension());
    encoder.encode(&mixed, &path)?;
    log::info!("Wrote {}", path.display());

    Ok(GeneratedClip {
        path,
        format: encoder.format(),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeckBuildConfigBuilder;

    struct Tone;

    impl SynthesisEngine for Tone {
        fn id(&self) -> String {
            "tone".to_string()
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
            Ok(AudioClip::mono(vec![0.25; 80 * text.chars().count()], 8_000))
        }
    }

    fn config(dir: &Path) -> DeckBuildConfig {
        DeckBuildConfigBuilder::default()
            .input(dir.join("lesson.csv"))
            .output_dir(dir.join("out"))
            .audio_format(AudioFormat::Wav)
            .cache_mode(crate::config::CacheMode::Disabled)
            .timestamp_tag("deck_test")
            .build()
            .unwrap()
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn single_clip_gets_extension_of_written_format() {
        let dir = tempfile::tempdir().unwrap();
        let clip = generate_clip(&config(dir.path()), Tone, "你好", &dir.path().join("hello.mp3")).unwrap();

        assert_eq!(clip.path, dir.path().join("hello.wav"));
        assert_eq!(clip.format, AudioFormat::Wav);
        let written = AudioClip::read_wav(&clip.path).unwrap();
        assert_eq!(written.frames(), 160);
    }

    #[test]
    fn single_clip_rejects_blank_text() {
        let dir = tempfile::tempdir().unwrap();
        let err = generate_clip(&config(dir.path()), Tone, "  ", &dir.path().join("x.wav")).unwrap_err();
        assert!(matches!(err, DeckBuildError::Config(ConfigError::EmptyText)));
    }

    #[test]
    fn unreadable_input_fails_in_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = DeckBuilder::new(config(dir.path()), Tone);
        assert_eq!(builder.state(), PipelineState::Idle);

        let err = builder.build().unwrap_err();
        assert!(matches!(err, DeckBuildError::Config(ConfigError::Unreadable { .. })));
        assert_eq!(builder.state(), PipelineState::Failed);
        assert!(builder.into_engine().is_some());
    }

    #[test]
    fn progress_reports_every_stage_in_order() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lesson.csv"),
            "Hanzi;Pinyin;Indo\n你好;nǐ hǎo;halo\n谢谢;xièxie;terima kasih\n",
        )
        .unwrap();

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        let mut builder = DeckBuilder::new(config(dir.path()), Tone)
            .on_progress(Box::new(move |e| sink.borrow_mut().push((e.stage, e.completed, e.total))));
        let result = builder.build().unwrap();

        assert_eq!(builder.state(), PipelineState::Done);
        assert_eq!(result.card_count, 6);
        assert_eq!(result.synthesis_calls, 2);
        assert_eq!(result.device, Some(Device::Cuda));
        assert_eq!(
            *events.borrow(),
            vec![
                (Stage::Init, 0, 2),
                (Stage::Row, 1, 2),
                (Stage::Row, 2, 2),
                (Stage::Assembling, 2, 2),
                (Stage::Complete, 2, 2),
            ]
        );
    }
}
