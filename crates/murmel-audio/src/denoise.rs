//! RNNoise preprocessor for the capture path.
//!
//! Operates on exactly one 10 ms frame at a time, which is also RNNoise's
//! native frame size. The model has no strength control, so the configured
//! suppression in dB maps to a dry/wet blend of the processed frame.

use nnnoiseless::DenoiseState;

use crate::FRAME_SIZE;

pub struct Denoiser {
    state: Box<DenoiseState<'static>>,
    /// Wet fraction in [0, 1] derived from the suppression setting.
    mix: f32,
    input_buf: [f32; FRAME_SIZE],
    output_buf: [f32; FRAME_SIZE],
}

impl Denoiser {
    /// `suppression_db` is the configured strength, e.g. -30.
    pub fn new(suppression_db: i32) -> Self {
        Self {
            state: DenoiseState::new(),
            mix: mix_from_db(suppression_db),
            input_buf: [0.0; FRAME_SIZE],
            output_buf: [0.0; FRAME_SIZE],
        }
    }

    pub fn set_suppression_db(&mut self, suppression_db: i32) {
        self.mix = mix_from_db(suppression_db);
    }

    /// Process one frame in place. Samples are f32 in [-1, 1]; RNNoise wants
    /// the i16 range, so scale in and back out. Returns the model's speech
    /// probability for this frame.
    pub fn process(&mut self, frame: &mut [f32]) -> f32 {
        assert_eq!(frame.len(), FRAME_SIZE, "one 10 ms frame at a time");

        for (dst, &src) in self.input_buf.iter_mut().zip(frame.iter()) {
            *dst = src * 32767.0;
        }
        let speech_probability = self.state.process_frame(&mut self.output_buf, &self.input_buf);

        let wet = self.mix;
        for (sample, &processed) in frame.iter_mut().zip(self.output_buf.iter()) {
            let denoised = processed / 32767.0;
            *sample = denoised * wet + *sample * (1.0 - wet);
        }
        speech_probability
    }
}

/// -60 dB or stronger is fully wet; 0 dB is a passthrough.
fn mix_from_db(suppression_db: i32) -> f32 {
    (suppression_db.abs() as f32 / 60.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_stays_near_silent() {
        let mut denoiser = Denoiser::new(-60);
        let mut frame = vec![0.0f32; FRAME_SIZE];
        let probability = denoiser.process(&mut frame);
        assert!((0.0..=1.0).contains(&probability));
        for &s in &frame {
            assert!(s.abs() < 0.01, "expected near-silence, got {s}");
        }
    }

    #[test]
    fn zero_suppression_is_passthrough() {
        let mut denoiser = Denoiser::new(0);
        let original: Vec<f32> = (0..FRAME_SIZE).map(|i| (i as f32 / 40.0).sin() * 0.3).collect();
        let mut frame = original.clone();
        denoiser.process(&mut frame);
        for (a, b) in frame.iter().zip(&original) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn mix_mapping() {
        assert_eq!(mix_from_db(0), 0.0);
        assert_eq!(mix_from_db(-60), 1.0);
        assert_eq!(mix_from_db(-90), 1.0);
        assert!((mix_from_db(-30) - 0.5).abs() < 1e-6);
    }
}
