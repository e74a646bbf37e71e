use std::path::PathBuf;
use std::time::Instant;

use vocab_deck::{
    config::DeckBuildConfigBuilder, engines::kokoro::KokoroEngine, generate_clip, Device,
    SynthesisEngine, SynthesisParams, VoiceProfile,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let model_dir = PathBuf::from("models/kokoro");
    let mut engine = KokoroEngine::new(&model_dir);

    let load_start = Instant::now();
    engine.initialize(Device::Cpu)?;
    println!("Model loaded in {:.2?}", load_start.elapsed());
    println!("Available voices: {:?}", engine.voices());

    let text = "我们明天一起去图书馆学习，好吗？";
    let voice = VoiceProfile::named("zf_xiaobei");
    let params = SynthesisParams::default();

    let synth_start = Instant::now();
    let clip = engine.synthesize(text, &voice, &params)?;
    let synth_dur = synth_start.elapsed();
    println!(
        "Synthesized {:.2}s audio in {:.2?} ({:.1}x real-time)",
        clip.duration_secs(),
        synth_dur,
        clip.duration_secs() / synth_dur.as_secs_f64()
    );

    // Same text through the full audio chain: ambience, limiter, encoder.
    let config = DeckBuildConfigBuilder::default()
        .voice_name("zf_xiaobei")
        .device_preference(vec![Device::Cpu])
        .default_media_dir("media")
        .build()?;
    let written = generate_clip(&config, &mut engine, text, &PathBuf::from("output.mp3"))?;
    for warning in &written.warnings {
        println!("warning: {warning}");
    }
    println!("Saved to {}", written.path.display());
    Ok(())
}
