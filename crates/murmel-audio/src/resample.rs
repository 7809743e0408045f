//! Linear sample-rate conversion between the codec rate and device rates.

/// Streaming linear interpolator. Good enough for the small ratios between
/// 44.1/48/96 kHz device rates and the 48 kHz pipeline.
pub struct LinearResampler {
    /// Input samples consumed per output sample.
    ratio: f64,
    /// Fractional read position, relative to the start of the next input
    /// buffer; -1.0 points at `last`.
    pos: f64,
    last: f32,
    identity: bool,
}

impl LinearResampler {
    pub fn new(from_hz: u32, to_hz: u32) -> Self {
        Self {
            ratio: f64::from(from_hz) / f64::from(to_hz),
            pos: 0.0,
            last: 0.0,
            identity: from_hz == to_hz,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Convert `input`, appending to `out`. State carries across calls so
    /// buffers can be fed back to back.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.identity {
            out.extend_from_slice(input);
            return;
        }
        let n = input.len();
        if n == 0 {
            return;
        }

        let mut pos = self.pos;
        while pos < (n - 1) as f64 {
            let base = pos.floor();
            let frac = (pos - base) as f32;
            let i = base as isize;
            let s0 = if i < 0 { self.last } else { input[i as usize] };
            let s1 = input[(i + 1) as usize];
            out.push(s0 + (s1 - s0) * frac);
            pos += self.ratio;
        }
        self.pos = pos - n as f64;
        self.last = input[n - 1];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passthrough() {
        let mut rs = LinearResampler::new(48_000, 48_000);
        let input = vec![0.25f32; 480];
        let mut out = Vec::new();
        rs.process(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn downsample_rate_is_proportional() {
        let mut rs = LinearResampler::new(48_000, 16_000);
        let input = vec![0.5f32; 4800];
        let mut out = Vec::new();
        rs.process(&input, &mut out);
        let expected = 4800 / 3;
        assert!((out.len() as i64 - expected as i64).abs() <= 2, "{}", out.len());
    }

    #[test]
    fn upsample_rate_is_proportional() {
        let mut rs = LinearResampler::new(16_000, 48_000);
        let input: Vec<f32> = (0..1600).map(|i| (i as f32 / 50.0).sin()).collect();
        let mut out = Vec::new();
        rs.process(&input, &mut out);
        assert!((out.len() as i64 - 4800).abs() <= 4, "{}", out.len());
    }

    #[test]
    fn streaming_matches_oneshot() {
        let input: Vec<f32> = (0..960).map(|i| (i as f32 / 30.0).sin()).collect();

        let mut whole = Vec::new();
        LinearResampler::new(48_000, 44_100).process(&input, &mut whole);

        let mut chunked = Vec::new();
        let mut rs = LinearResampler::new(48_000, 44_100);
        for chunk in input.chunks(100) {
            rs.process(chunk, &mut chunked);
        }
        assert_eq!(whole.len(), chunked.len());
        for (a, b) in whole.iter().zip(&chunked) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn interpolates_between_samples() {
        let mut rs = LinearResampler::new(24_000, 48_000);
        let mut out = Vec::new();
        rs.process(&[0.0, 1.0], &mut out);
        // Midpoint sample between 0.0 and 1.0.
        assert!(out.iter().any(|&s| (s - 0.5).abs() < 1e-6));
    }
}
