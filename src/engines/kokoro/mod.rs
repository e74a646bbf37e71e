//! Kokoro-82M engine (ONNX).
//!
//! Kokoro has built-in voices only, so [`VoiceProfile::name`] selects a voice
//! from the archive and reference recordings are ignored. Mandarin voices are
//! `zf_*` / `zm_*`.
//!
//! **espeak-ng** must be installed for phonemization.
//!
//! # Model Directory Layout
//!
//! ```text
//! models/kokoro/
//! ├── kokoro-quant-convinteger.onnx   # any *.onnx is accepted
//! ├── voices-v1.0.bin                 # voice archive (.npz)
//! └── config.json                     # phoneme vocabulary
//! ```
//!
//! ```rust,no_run
//! use std::path::Path;
//! use vocab_deck::{engines::kokoro::KokoroEngine, Device, SynthesisEngine, SynthesisParams, VoiceProfile};
//!
//! let mut engine = KokoroEngine::new(Path::new("models/kokoro"));
//! engine.initialize(Device::Cpu)?;
//! let clip = engine.synthesize("你好", &VoiceProfile::named("zf_xiaobei"), &SynthesisParams::default())?;
//! println!("{:.2}s", clip.duration_secs());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`VoiceProfile::name`]: crate::VoiceProfile

pub mod engine;
pub mod model;
pub mod phonemizer;
pub mod voices;

pub use engine::KokoroEngine;
pub use model::KokoroError;
