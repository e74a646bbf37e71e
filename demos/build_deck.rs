//! Build a deck from a vocabulary file with an external TTS command.
//!
//! ```sh
//! cargo run --example build_deck -- lesson1.csv out/
//! ```

use std::path::PathBuf;

use vocab_deck::{config::DeckBuildConfigBuilder, engines::command::CommandEngine, DeckBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let input = PathBuf::from(args.next().unwrap_or_else(|| "vocab.csv".to_string()));
    let output = PathBuf::from(args.next().unwrap_or_else(|| "output".to_string()));

    let config = DeckBuildConfigBuilder::default()
        .input(input)
        .output_dir(output)
        .default_media_dir("media")
        .build()?;
    let engine = CommandEngine::coqui("tts_models/multilingual/multi-dataset/xtts_v2");

    let mut builder = DeckBuilder::new(config, engine).on_progress(Box::new(|event| {
        println!("[{:?}] {}/{} {}", event.stage, event.completed, event.total, event.message);
    }));
    let result = builder.build()?;

    println!("Deck: {}", result.deck_title);
    println!("Package: {}", result.package_path.display());
    println!(
        "{} entries, {} cards, {} skipped, {} TTS calls",
        result.processed, result.card_count, result.skipped, result.synthesis_calls
    );
    for err in &result.row_errors {
        println!("  {err}");
    }
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}
