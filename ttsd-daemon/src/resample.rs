//! Output-side sample-rate conversion: an engine agent's synthesized
//! audio may not be at the output device's native rate, so the player
//! converts before handing samples to the sink. Uses rubato's
//! `FastFixedIn`, with a zero-copy passthrough when rates already match.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    input_buf: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Self {
        if source_rate == target_rate {
            return Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            };
        }

        let ratio = target_rate as f64 / source_rate as f64;
        match FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1) {
            Ok(resampler) => {
                let max_out = resampler.output_frames_max();
                Self {
                    output_buf: vec![vec![0f32; max_out]; 1],
                    resampler: Some(resampler),
                    input_buf: Vec::new(),
                    chunk_size,
                }
            }
            Err(e) => {
                error!("resampler init failed, falling back to passthrough: {e}");
                Self {
                    resampler: None,
                    input_buf: Vec::new(),
                    chunk_size,
                    output_buf: Vec::new(),
                }
            }
        }
    }

    /// Any samples left in the accumulation buffer (shorter than a full
    /// rubato chunk) are carried over to the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_rates_match() {
        let mut rc = RateConverter::new(16_000, 16_000, 960);
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn upsamples_16k_to_48k_with_roughly_triple_length() {
        let mut rc = RateConverter::new(16_000, 48_000, 960);
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 960]);
        let expected = 2880usize;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 30,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn partial_chunk_buffers_until_full() {
        let mut rc = RateConverter::new(16_000, 48_000, 960);
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }
}
