//! Command line front end: build a deck, or inspect one.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use vocab_deck::config::{AudioFormat, CacheMode, DeckBuildConfig};
use vocab_deck::deck::read_package;
use vocab_deck::engines::command::CommandEngine;
use vocab_deck::{DeckBuilder, Device, Stage, SynthesisEngine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an .apkg deck from a vocabulary file
    Build(BuildCommand),

    /// List the notes, cards and media of an .apkg deck
    Inspect(InspectCommand),
}

#[derive(Parser, Debug)]
struct BuildCommand {
    /// Vocabulary file (delimited text with a header row)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Directory for the package and its media
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ffmpeg executable used for MP3 output
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Audio format (mp3, wav)
    #[arg(long)]
    format: Option<AudioFormat>,

    /// Do not mix an ambience bed under the voice
    #[arg(long)]
    no_ambience: bool,

    /// Audio cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Disable the audio cache
    #[arg(long, conflicts_with = "refresh_cache")]
    no_cache: bool,

    /// Synthesize every clip again, refreshing the cache
    #[arg(long)]
    refresh_cache: bool,

    /// Reference recording for voice cloning
    #[arg(long)]
    voice_sample: Option<PathBuf>,

    /// Execution devices to try in order (cuda, cpu, coreml)
    #[arg(long, value_delimiter = ',')]
    device: Vec<Device>,

    /// Coqui-compatible TTS executable
    #[arg(long, default_value = "tts")]
    tts_program: String,

    /// Model passed to the TTS executable
    #[arg(long, default_value = "tts_models/multilingual/multi-dataset/xtts_v2")]
    model: String,

    /// Kokoro model directory; uses the built-in Kokoro engine instead of
    /// an external program
    #[cfg(feature = "kokoro")]
    #[arg(long)]
    kokoro_dir: Option<PathBuf>,

    /// Print the build result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct InspectCommand {
    /// Package to read
    package: PathBuf,

    /// Print rendered card faces
    #[arg(long)]
    render: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        Commands::Build(cmd) => build(cmd),
        Commands::Inspect(cmd) => inspect(cmd),
    }
}

fn load_config(cmd: &BuildCommand) -> Result<DeckBuildConfig, Box<dyn std::error::Error>> {
    let mut config = match &cmd.config {
        Some(path) => DeckBuildConfig::from_json_file(path)?,
        None => DeckBuildConfig::default(),
    };
    if let Some(input) = &cmd.input {
        config.input = input.clone();
    }
    if let Some(output) = &cmd.output {
        config.output_dir = output.clone();
    }
    if let Some(ffmpeg) = &cmd.ffmpeg {
        config.ffmpeg_path = Some(ffmpeg.clone());
    }
    if let Some(format) = cmd.format {
        config.audio_format = format;
    }
    if cmd.no_ambience {
        config.ambience_enabled = false;
    }
    if let Some(dir) = &cmd.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if cmd.no_cache {
        config.cache_mode = CacheMode::Disabled;
    } else if cmd.refresh_cache {
        config.cache_mode = CacheMode::Refresh;
    }
    if let Some(sample) = &cmd.voice_sample {
        config.voice_sample = Some(sample.clone());
    }
    if !cmd.device.is_empty() {
        config.device_preference = cmd.device.clone();
    }
    config.validate()?;
    Ok(config)
}

fn engine(cmd: &BuildCommand) -> Box<dyn SynthesisEngine> {
    #[cfg(feature = "kokoro")]
    {
        if let Some(dir) = &cmd.kokoro_dir {
            return Box::new(vocab_deck::engines::kokoro::KokoroEngine::new(dir));
        }
    }
    Box::new(CommandEngine::coqui(cmd.model.clone()).with_program(cmd.tts_program.clone()))
}

fn build(cmd: BuildCommand) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cmd)?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let progress = bar.clone();

    let mut builder = DeckBuilder::new(config, engine(&cmd)).on_progress(Box::new(move |event| {
        match event.stage {
            Stage::Init => progress.set_length(event.total as u64),
            Stage::Row => progress.set_position(event.completed as u64),
            Stage::Assembling => progress.set_message("writing package"),
            Stage::Complete => progress.finish_with_message(event.message.clone()),
        }
    }));
    let outcome = builder.build();
    bar.finish_and_clear();
    let result = outcome?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Deck:     {}", result.deck_title);
    println!("Package:  {}", result.package_path.display());
    println!(
        "Entries:  {} processed, {} skipped ({} cards)",
        result.processed, result.skipped, result.card_count
    );
    println!(
        "Audio:    {} files as {:?}, {} synthesized",
        result.media_files.len(),
        result.audio_format,
        result.synthesis_calls
    );
    for err in &result.row_errors {
        println!("  {err}");
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn inspect(cmd: InspectCommand) -> Result<(), Box<dyn std::error::Error>> {
    let contents = read_package(&cmd.package)?;

    let mut decks: Vec<_> = contents.decks.iter().collect();
    decks.sort();
    for (id, name) in decks {
        println!("deck {id}: {name}");
    }
    for model in &contents.models {
        println!(
            "note type {}: {} fields, {} templates",
            model.name,
            model.fields.len(),
            model.templates.len()
        );
    }
    println!(
        "{} notes, {} cards, {} media files",
        contents.notes.len(),
        contents.cards.len(),
        contents.media.len()
    );

    let dangling = contents.dangling_media();
    if dangling.is_empty() {
        println!("all sound references resolve");
    } else {
        for name in &dangling {
            println!("missing media: {name}");
        }
    }

    if cmd.render {
        for card in contents.render_cards() {
            println!("\n--- {} / {} (card {})", card.deck_name, card.template_name, card.card_id);
            println!("front: {}", card.front);
            println!("back:  {}", card.back);
        }
    }
    Ok(())
}
