//! Mixing synthesized speech with an ambience bed.

use crate::config::GainSettings;
use crate::AudioClip;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum MixError {
    #[error("ambience track contains no audio")]
    EmptyAmbience,
    #[error("voice clip has an invalid format: {0}")]
    InvalidFormat(String),
}

/// Convert decibels to a linear amplitude factor.
pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Mix `voice` over `ambience`.
///
/// Without ambience the voice is returned untouched. Otherwise both gains are
/// applied, the ambience is conformed to the voice's channel layout and
/// sample rate, looped or cut to the voice's length, summed, and the result
/// is scaled down if its peak exceeds `gain.ceiling`.
pub fn mix(
    voice: AudioClip,
    ambience: Option<&AudioClip>,
    gain: &GainSettings,
) -> Result<AudioClip, MixError> {
    let Some(ambience) = ambience else {
        return Ok(voice);
    };
    if voice.channels == 0 || voice.sample_rate == 0 {
        return Err(MixError::InvalidFormat(format!(
            "{} channels at {} Hz",
            voice.channels, voice.sample_rate
        )));
    }
    if ambience.is_empty() || ambience.channels == 0 || ambience.sample_rate == 0 {
        return Err(MixError::EmptyAmbience);
    }

    let bed = conform(ambience, voice.channels, voice.sample_rate);
    if bed.is_empty() {
        return Err(MixError::EmptyAmbience);
    }

    let voice_gain = db_to_gain(gain.voice_db);
    let bed_gain = db_to_gain(gain.ambience_db);
    let AudioClip {
        mut samples,
        sample_rate,
        channels,
    } = voice;
    for (i, s) in samples.iter_mut().enumerate() {
        *s = *s * voice_gain + bed[i % bed.len()] * bed_gain;
    }
    limit_peak(&mut samples, gain.ceiling);

    Ok(AudioClip {
        samples,
        sample_rate,
        channels,
    })
}

/// Scale `samples` down uniformly so no sample exceeds `ceiling`.
pub fn limit_peak(samples: &mut [f32], ceiling: f32) {
    let peak = samples.iter().fold(0.0f32, |p, s| p.max(s.abs()));
    if peak > ceiling && peak > 0.0 {
        let scale = ceiling / peak;
        log::debug!("Limiting mix peak {peak:.3} to {ceiling:.3}");
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}

/// Interleaved samples of `clip` with `channels` channels at `rate` Hz.
fn conform(clip: &AudioClip, channels: u16, rate: u32) -> Vec<f32> {
    let src = clip.channels as usize;
    let dst = channels as usize;
    let frames = clip.frames();

    let mut remapped = Vec::with_capacity(frames * dst);
    for frame in clip.samples.chunks_exact(src) {
        if dst == 1 {
            remapped.push(frame.iter().sum::<f32>() / src as f32);
        } else {
            remapped.extend((0..dst).map(|c| frame[c % src]));
        }
    }

    if clip.sample_rate == rate || remapped.is_empty() {
        return remapped;
    }
    resample_linear(&remapped, dst, clip.sample_rate, rate)
}

fn resample_linear(samples: &[f32], channels: usize, from: u32, to: u32) -> Vec<f32> {
    let in_frames = samples.len() / channels;
    let out_frames = ((in_frames as u64 * to as u64) / from as u64).max(1) as usize;
    let step = from as f64 / to as f64;

    let mut out = Vec::with_capacity(out_frames * channels);
    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = (pos.floor() as usize).min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);
        let frac = (pos - idx as f64) as f32;
        for c in 0..channels {
            let a = samples[idx * channels + c];
            let b = samples[next * channels + c];
            out.push(a + (b - a) * frac);
        }
    }
    out
}
