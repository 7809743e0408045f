//! The transmit gate: per-frame speech metric plus hysteresis.

use crate::config::VadKind;
use crate::FRAME_MILLIS;

/// Floor for dB conversions; treated as silence.
const DB_FLOOR: f32 = -96.0;

/// Voice gate with hysteresis.
///
/// Each 10 ms frame yields a metric in [0, 1]. The gate opens when the
/// metric exceeds `vad_max` and closes only after the metric has stayed
/// below `vad_min` for the configured release time; values between the two
/// thresholds keep the current state and reset the release timer.
pub struct VoiceGate {
    kind: VadKind,
    vad_min: f32,
    vad_max: f32,
    release_frames: u32,
    below_run: u32,
    speaking: bool,
    last_metric: f32,
    /// Smoothed noise-floor energy for the signal-to-noise fallback.
    noise_energy: f32,
}

impl VoiceGate {
    pub fn new(kind: VadKind, vad_min: f32, vad_max: f32, release_seconds: f32) -> Self {
        let release_frames = (release_seconds.max(0.0) * 1000.0 / FRAME_MILLIS as f32) as u32;
        Self {
            kind,
            vad_min: vad_min.clamp(0.0, 1.0),
            vad_max: vad_max.clamp(vad_min.clamp(0.0, 1.0), 1.0),
            release_frames,
            below_run: 0,
            speaking: false,
            last_metric: 0.0,
            noise_energy: 1e-6,
        }
    }

    /// Feed one frame. `speech_probability` is the preprocessor's estimate
    /// when it ran; the signal-to-noise mode prefers it over the built-in
    /// noise-floor estimate.
    pub fn process(&mut self, samples: &[f32], speech_probability: Option<f32>) -> bool {
        let metric = match self.kind {
            VadKind::Amplitude => amplitude_metric(samples),
            VadKind::SignalToNoise => match speech_probability {
                Some(p) => p.clamp(0.0, 1.0),
                None => self.snr_metric(samples),
            },
        };
        self.last_metric = metric;

        if metric > self.vad_max {
            self.speaking = true;
            self.below_run = 0;
        } else if metric < self.vad_min {
            if self.speaking {
                self.below_run += 1;
                if self.below_run > self.release_frames {
                    self.speaking = false;
                    self.below_run = 0;
                }
            }
        } else {
            // Hysteresis band: hold state, restart the release countdown.
            self.below_run = 0;
        }

        self.speaking
    }

    /// The most recent metric, for level meters.
    pub fn metric(&self) -> f32 {
        self.last_metric
    }

    pub fn set_thresholds(&mut self, vad_min: f32, vad_max: f32) {
        self.vad_min = vad_min.clamp(0.0, 1.0);
        self.vad_max = vad_max.clamp(self.vad_min, 1.0);
    }

    fn snr_metric(&mut self, samples: &[f32]) -> f32 {
        let energy = mean_energy(samples).max(1e-10);
        // Track the floor: fast to fall, slow to rise, so speech does not
        // drag the estimate up.
        if energy < self.noise_energy {
            self.noise_energy = energy;
        } else {
            self.noise_energy += (energy - self.noise_energy) * 0.01;
        }
        let snr_db = 10.0 * (energy / self.noise_energy.max(1e-10)).log10();
        (snr_db / 30.0).clamp(0.0, 1.0)
    }
}

fn mean_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32
}

/// RMS level mapped onto [0, 1] over a 96 dB range.
fn amplitude_metric(samples: &[f32]) -> f32 {
    let rms = mean_energy(samples).sqrt();
    let db = if rms <= 0.0 {
        DB_FLOOR
    } else {
        (20.0 * rms.log10()).max(DB_FLOOR)
    };
    (db - DB_FLOOR) / -DB_FLOOR
}
