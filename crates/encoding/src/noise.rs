//! Low-amplitude filler samples for audio gaps.
//!
//! When the capture thread falls far enough behind real time, the missed span
//! is bridged with noise instead of letting playback fast-forward through it.
//! Generating samples on demand would be too slow for the capture thread, so
//! one chunk's worth of waveform is precomputed up front and `fill` only
//! copies a window of it.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reel_media_info::AudioInfo;

/// Peak amplitude of the filler waveform, out of `i16::MAX`.
const AMPLITUDE: f64 = 10.0;

pub(crate) struct AudioNoise {
    cycle: Vec<u8>,
    frame_align: usize,
    rng: SmallRng,
}

impl AudioNoise {
    pub fn new(info: &AudioInfo) -> Self {
        let len = info.chunk_size();
        let samples = len / AudioInfo::SAMPLE_SIZE;
        // The waveform completes half a period over the chunk, so repeated
        // fills never produce a discontinuity louder than the signal itself.
        let step = std::f64::consts::PI / samples as f64;

        let mut cycle = vec![0u8; len];
        for (i, sample) in cycle.chunks_exact_mut(AudioInfo::SAMPLE_SIZE).enumerate() {
            let value = (((i + 1) as f64 * step).sin() * AMPLITUDE) as i16;
            sample.copy_from_slice(&value.to_ne_bytes());
        }

        Self {
            cycle,
            frame_align: AudioInfo::SAMPLE_SIZE * usize::from(info.channels),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Copies filler samples into `out`. Allocation-free; `out` must not be
    /// larger than one chunk.
    pub fn fill(&mut self, out: &mut [u8]) {
        if out.len() >= self.cycle.len() {
            out[..self.cycle.len()].copy_from_slice(&self.cycle);
            out[self.cycle.len()..].fill(0);
            return;
        }

        // Pick a frame-aligned window so channels stay in phase.
        let span = self.cycle.len() - out.len();
        let offset = self.rng.gen_range(0..span) & !(self.frame_align - 1);
        out.copy_from_slice(&self.cycle[offset..offset + out.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_media_info::AUDIO_AAC;

    fn info() -> AudioInfo {
        AudioInfo::new(AUDIO_AAC, 44_100, 1, 64_000).unwrap()
    }

    fn samples(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
    }

    #[test]
    fn full_chunk_fill_is_the_precomputed_cycle() {
        let info = info();
        let mut noise = AudioNoise::new(&info);

        let mut out = vec![0xffu8; info.chunk_size()];
        noise.fill(&mut out);

        assert_eq!(out, noise.cycle);
    }

    #[test]
    fn filler_stays_below_the_amplitude_ceiling() {
        let info = info();
        let mut noise = AudioNoise::new(&info);

        let mut out = vec![0u8; info.chunk_size()];
        noise.fill(&mut out);

        assert!(samples(&out).all(|s| s.unsigned_abs() <= AMPLITUDE as u16));
        assert!(samples(&out).any(|s| s != 0));
    }

    #[test]
    fn partial_fills_take_a_window_of_the_cycle() {
        let info = info();
        let mut noise = AudioNoise::new(&info);

        let mut out = vec![0u8; 512];
        for _ in 0..50 {
            noise.fill(&mut out);
            assert!(samples(&out).all(|s| s.unsigned_abs() <= AMPLITUDE as u16));
        }
    }
}
