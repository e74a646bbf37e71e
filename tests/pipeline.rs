mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{FakeEngine, Workspace, THREE_ROWS};
use vocab_deck::config::{AudioFormat, CacheMode, EncoderFallback, GainSettings};
use vocab_deck::deck::read_package;
use vocab_deck::encoder::EncodingError;
use vocab_deck::error::{AssemblyError, ConfigError};
use vocab_deck::pipeline::PipelineState;
use vocab_deck::{AudioClip, CancelToken, DeckBuildError, DeckBuilder, RowErrorReason, Stage};

fn file_names(paths: &[std::path::PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn row_with_empty_translation_is_reported_and_the_rest_packaged() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let engine = FakeEngine::default();

    let result = DeckBuilder::new(ws.default_config(), engine.clone()).build().unwrap();

    assert_eq!(result.card_count, 6);
    assert_eq!(result.processed, 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(result.row_errors.len(), 1);
    let err = &result.row_errors[0];
    assert_eq!(err.row, 2);
    assert_eq!(err.reason, RowErrorReason::MissingField);
    assert_eq!(err.columns, vec!["Indo"]);

    assert_eq!(engine.calls(), 2);
    assert_eq!(result.deck_title, "Mandarin Grammar (Lesson_1) - deck_20260101_000000");
    assert_eq!(
        result.package_path,
        ws.path().join("out").join("Lesson_1_deck_20260101_000000.apkg")
    );

    let contents = read_package(&result.package_path).unwrap();
    assert_eq!(contents.notes.len(), 2);
    assert_eq!(contents.cards.len(), 6);
    assert_eq!(contents.media.len(), 2);
    assert!(contents.dangling_media().is_empty());
    assert_eq!(contents.notes[0].fields[0], "我喜欢喝茶。");
    assert_eq!(contents.notes[1].fields[0], "谢谢你！");
    assert_eq!(contents.notes[0].fields[4], "saya<br>suka<br>minum teh");
    assert_eq!(contents.notes[0].tags, vec!["deck_20260101_000000"]);
}

#[test]
fn rebuild_with_warm_cache_never_calls_the_engine() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);

    let first = DeckBuilder::new(ws.default_config(), FakeEngine::default())
        .build()
        .unwrap();
    assert_eq!(first.synthesis_calls, 2);

    let engine = FakeEngine::default();
    let second = DeckBuilder::new(ws.default_config(), engine.clone()).build().unwrap();

    assert_eq!(engine.calls(), 0);
    assert_eq!(second.synthesis_calls, 0);
    assert_eq!(second.device, None);
    assert_eq!(file_names(&second.media_files), file_names(&first.media_files));
}

#[test]
fn refresh_mode_synthesizes_again() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    DeckBuilder::new(ws.default_config(), FakeEngine::default())
        .build()
        .unwrap();

    let engine = FakeEngine::default();
    let config = ws.config().cache_mode(CacheMode::Refresh).build().unwrap();
    let result = DeckBuilder::new(config, engine.clone()).build().unwrap();
    assert_eq!(engine.calls(), 2);
    assert_eq!(result.synthesis_calls, 2);
}

#[test]
fn unusable_ffmpeg_falls_back_to_wav_with_a_warning() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let config = ws
        .config()
        .audio_format(AudioFormat::Mp3)
        .ffmpeg_path(ws.path().join("no-such-ffmpeg"))
        .build()
        .unwrap();

    let result = DeckBuilder::new(config, FakeEngine::default()).build().unwrap();

    assert_eq!(result.audio_format, AudioFormat::Wav);
    assert!(result.warnings.iter().any(|w| w.contains("WAV")));
    assert!(file_names(&result.media_files).iter().all(|n| n.ends_with(".wav")));
    let contents = read_package(&result.package_path).unwrap();
    assert!(contents.dangling_media().is_empty());
}

#[test]
fn unusable_ffmpeg_aborts_under_fail_policy() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let config = ws
        .config()
        .audio_format(AudioFormat::Mp3)
        .ffmpeg_path(ws.path().join("no-such-ffmpeg"))
        .encoder_fallback(EncoderFallback::Fail)
        .build()
        .unwrap();

    let mut builder = DeckBuilder::new(config, FakeEngine::default());
    let err = builder.build().unwrap_err();
    assert!(matches!(err, DeckBuildError::Encoder(EncodingError::Unavailable { .. })));
    assert_eq!(builder.state(), PipelineState::Failed);
}

#[test]
fn identical_text_is_synthesized_once_and_shares_media() {
    let ws = Workspace::new();
    ws.write_input(
        "Hanzi;Pinyin;Indo\n\
         你好;nǐ hǎo;halo\n\
         你好;nǐ hǎo;apa kabar\n",
    );
    let config = ws.config().cache_mode(CacheMode::Disabled).build().unwrap();
    let engine = FakeEngine::default();

    let result = DeckBuilder::new(config, engine.clone()).build().unwrap();

    assert_eq!(engine.calls(), 1);
    assert_eq!(result.processed, 2);
    assert_eq!(result.media_files.len(), 1);
    let contents = read_package(&result.package_path).unwrap();
    assert_eq!(contents.notes[0].fields[6], contents.notes[1].fields[6]);
    assert_ne!(contents.notes[0].guid, contents.notes[1].guid);
}

#[test]
fn explicit_media_name_taken_by_other_audio_is_a_conflict() {
    let ws = Workspace::new();
    ws.write_input(
        "Hanzi;Pinyin;Indo;Audio\n\
         你好;nǐ hǎo;halo;greeting.mp3\n\
         再见;zàijiàn;sampai jumpa;greeting.mp3\n",
    );

    let result = DeckBuilder::new(ws.default_config(), FakeEngine::default())
        .build()
        .unwrap();

    assert_eq!(result.processed, 1);
    assert_eq!(file_names(&result.media_files), vec!["greeting.wav"]);
    assert_eq!(result.row_errors.len(), 1);
    assert_eq!(result.row_errors[0].row, 2);
    assert_eq!(result.row_errors[0].reason, RowErrorReason::MediaConflict);
    assert_eq!(result.row_errors[0].columns, vec!["Audio"]);
}

#[test]
fn failed_row_does_not_keep_its_media_name() {
    let ws = Workspace::new();
    ws.write_input(
        "Hanzi;Pinyin;Indo;Audio\n\
         你好;nǐ hǎo;halo;greeting.mp3\n\
         再见;zàijiàn;sampai jumpa;greeting.mp3\n",
    );

    let result = DeckBuilder::new(ws.default_config(), FakeEngine::failing_on("你好"))
        .build()
        .unwrap();

    assert_eq!(result.processed, 1);
    assert_eq!(file_names(&result.media_files), vec!["greeting.wav"]);
    let reasons: Vec<_> = result.row_errors.iter().map(|e| (e.row, e.reason)).collect();
    assert_eq!(reasons, vec![(1, RowErrorReason::Synthesis)]);
    let contents = read_package(&result.package_path).unwrap();
    assert_eq!(contents.notes[0].fields[0], "再见");
}

#[test]
fn audio_value_without_a_file_name_stays_in_media_dir() {
    let ws = Workspace::new();
    ws.write_input("Hanzi;Pinyin;Indo;Audio\n你好;nǐ hǎo;halo;/\n");

    let result = DeckBuilder::new(ws.default_config(), FakeEngine::default())
        .build()
        .unwrap();

    let media_dir = ws.path().join("out").join("media");
    assert_eq!(result.media_files.len(), 1);
    assert_eq!(result.media_files[0].parent(), Some(media_dir.as_path()));
    assert!(file_names(&result.media_files)[0].starts_with("lesson_1_"));
    assert!(read_package(&result.package_path).unwrap().dangling_media().is_empty());
}

#[cfg(unix)]
#[test]
fn ffmpeg_rejecting_every_clip_fails_each_row() {
    use std::os::unix::fs::PermissionsExt;

    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let ffmpeg = ws.path().join("ffmpeg");
    std::fs::write(
        &ffmpeg,
        "#!/bin/sh\n[ \"$1\" = \"-version\" ] && exit 0\necho nope >&2\nexit 1\n",
    )
    .unwrap();
    std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();
    let config = ws
        .config()
        .audio_format(AudioFormat::Mp3)
        .ffmpeg_path(ffmpeg)
        .build()
        .unwrap();

    let err = DeckBuilder::new(config, FakeEngine::default())
        .build()
        .unwrap_err();

    assert!(matches!(
        err,
        DeckBuildError::Assembly {
            source: AssemblyError::NoEntries,
            ..
        }
    ));
    let encoding: Vec<_> = err
        .row_errors()
        .iter()
        .filter(|e| e.reason == RowErrorReason::Encoding)
        .map(|e| e.row)
        .collect();
    assert_eq!(encoding, vec![1, 3]);
    for e in err.row_errors().iter().filter(|e| e.reason == RowErrorReason::Encoding) {
        assert!(e.detail.contains("nope"), "{}", e.detail);
        assert!(e.detail.contains(".mp3: "), "{}", e.detail);
    }
}

#[test]
fn engine_failure_skips_only_that_row() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);

    let result = DeckBuilder::new(ws.default_config(), FakeEngine::failing_on("谢谢"))
        .build()
        .unwrap();

    assert_eq!(result.processed, 1);
    let reasons: Vec<_> = result.row_errors.iter().map(|e| (e.row, e.reason)).collect();
    assert_eq!(
        reasons,
        vec![(2, RowErrorReason::MissingField), (3, RowErrorReason::Synthesis)]
    );
    assert!(result.row_errors[1].detail.contains("cannot pronounce"));
}

#[test]
fn cancelling_mid_build_writes_no_package() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let token = CancelToken::new();
    let trigger = token.clone();
    let rows_seen = Rc::new(Cell::new(0));
    let seen = Rc::clone(&rows_seen);

    let mut builder = DeckBuilder::new(ws.default_config(), FakeEngine::default())
        .with_cancel(token)
        .on_progress(Box::new(move |event| {
            if event.stage == Stage::Row {
                seen.set(seen.get() + 1);
                trigger.cancel();
            }
        }));
    let err = builder.build().unwrap_err();

    assert!(matches!(err, DeckBuildError::Cancelled { completed: 1, total: 2 }));
    assert_eq!(rows_seen.get(), 1);
    let packages = std::fs::read_dir(ws.path().join("out"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == "apkg"))
        .count();
    assert_eq!(packages, 0);
}

#[test]
fn no_surviving_entries_fails_assembly_with_row_errors() {
    let ws = Workspace::new();
    ws.write_input("Hanzi;Pinyin;Indo\n你好;;halo\n");

    let mut builder = DeckBuilder::new(ws.default_config(), FakeEngine::default());
    let err = builder.build().unwrap_err();

    assert!(matches!(
        err,
        DeckBuildError::Assembly {
            source: AssemblyError::NoEntries,
            ..
        }
    ));
    assert_eq!(err.row_errors().len(), 1);
    assert_eq!(builder.state(), PipelineState::Failed);
}

#[test]
fn header_only_input_has_nothing_to_package() {
    let ws = Workspace::new();
    ws.write_input("Hanzi;Pinyin;Indo\n");

    let err = DeckBuilder::new(ws.default_config(), FakeEngine::default())
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        DeckBuildError::Assembly {
            source: AssemblyError::NoEntries,
            ..
        }
    ));
}

#[test]
fn missing_required_column_aborts_before_synthesis() {
    let ws = Workspace::new();
    ws.write_input("Hanzi;Pinyin\n你好;nǐ hǎo\n");
    let engine = FakeEngine::default();

    let err = DeckBuilder::new(ws.default_config(), engine.clone())
        .build()
        .unwrap_err();

    match err {
        DeckBuildError::Config(ConfigError::MissingColumn { header, .. }) => assert_eq!(header, "Indo"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.calls(), 0);
}

#[test]
fn configured_voice_sample_must_exist() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let config = ws
        .config()
        .voice_sample(ws.path().join("speaker.wav"))
        .build()
        .unwrap();

    let err = DeckBuilder::new(config, FakeEngine::default())
        .build()
        .unwrap_err();
    assert!(matches!(err, DeckBuildError::Config(ConfigError::VoiceSampleMissing(_))));
}

#[test]
fn default_ambience_is_mixed_under_the_ceiling() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let media = ws.path().join("defaults");
    std::fs::create_dir_all(&media).unwrap();
    AudioClip::mono(vec![0.9, -0.9, 0.9, -0.9], 8_000)
        .write_wav(&media.join("ambient.wav"))
        .unwrap();

    let config = ws
        .config()
        .default_media_dir(media)
        .gain(GainSettings {
            voice_db: 6.0,
            ambience_db: 0.0,
            ceiling: 0.5,
        })
        .build()
        .unwrap();
    let result = DeckBuilder::new(config, FakeEngine::default()).build().unwrap();

    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    for path in &result.media_files {
        let clip = AudioClip::read_wav(path).unwrap();
        assert_eq!(clip.sample_rate, 16_000);
        assert!(clip.peak() <= 0.5 + 1e-3, "{} peaks at {}", path.display(), clip.peak());
    }
}

#[test]
fn missing_configured_ambience_is_only_a_warning() {
    let ws = Workspace::new();
    ws.write_input(THREE_ROWS);
    let config = ws
        .config()
        .ambience(ws.path().join("rain.wav"))
        .build()
        .unwrap();

    let result = DeckBuilder::new(config, FakeEngine::default()).build().unwrap();
    assert_eq!(result.processed, 2);
    assert!(result.warnings.iter().any(|w| w.contains("rain.wav")));
}
