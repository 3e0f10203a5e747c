//! Interleaved sine test tone

use std::f32::consts::TAU;

/// Phase-continuous sine generator
///
/// Consecutive buffers join without a click.
pub struct ToneGenerator {
    phase: f32,
    step: f32,
    amplitude: f32,
    channels: usize,
}

impl ToneGenerator {
    pub fn new(frequency: f32, amplitude: f32, sample_rate: u32, channels: u16) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
            amplitude: amplitude.clamp(0.0, 1.0),
            channels: channels.max(1) as usize,
        }
    }

    /// Next `frames` frames, same sample on every channel
    pub fn next_buffer(&mut self, frames: usize) -> Vec<i16> {
        let mut samples = Vec::with_capacity(frames * self.channels);
        for _ in 0..frames {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16;
            samples.extend(std::iter::repeat(value).take(self.channels));
            self.phase = (self.phase + self.step) % TAU;
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_shape_and_level() {
        let mut tone = ToneGenerator::new(1000.0, 0.5, 48000, 2);
        let buffer = tone.next_buffer(480);

        assert_eq!(buffer.len(), 960);
        assert!(buffer.chunks(2).all(|frame| frame[0] == frame[1]));
        let peak = buffer.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak <= (i16::MAX / 2) as u16 + 1);
        assert!(peak > (i16::MAX / 4) as u16);
    }

    #[test]
    fn test_phase_continues_across_buffers() {
        let mut split = ToneGenerator::new(440.0, 1.0, 48000, 1);
        let mut whole = ToneGenerator::new(440.0, 1.0, 48000, 1);

        let mut joined = split.next_buffer(100);
        joined.extend(split.next_buffer(100));
        let reference = whole.next_buffer(200);

        for (a, b) in joined.iter().zip(&reference) {
            assert!((*a as i32 - *b as i32).abs() <= 1);
        }
    }
}
