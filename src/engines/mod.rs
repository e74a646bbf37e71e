//! Speech synthesis engines.
//!
//! # Available Engines
//!
//! - [`command::CommandEngine`] - any TTS command-line tool that writes a WAV
//!   file (Coqui `tts` preset included); always compiled
//! - `kokoro` - Kokoro-82M (ONNX, espeak-ng required); enable the `kokoro`
//!   Cargo feature

pub mod command;

#[cfg(feature = "kokoro")]
pub mod kokoro;
