use serde::{Deserialize, Serialize};

/// Preferred voice codec, honored when the server's vote allows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecChoice {
    Speex,
    Celt,
    Opus,
}

/// How transmission is gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmitMode {
    /// Voice activity detection decides.
    VoiceActivity,
    /// Only while the caller holds the transmit toggle.
    Toggle,
    /// Always transmitting.
    Continuous,
}

/// Which per-frame metric feeds the voice gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadKind {
    SignalToNoise,
    Amplitude,
}

/// Everything the audio pipeline consumes from user settings, loaded the
/// same way as any other settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_codec")]
    pub codec: CodecChoice,

    #[serde(default = "default_transmit")]
    pub transmit: TransmitMode,

    #[serde(default = "default_vad_kind")]
    pub vad_kind: VadKind,

    /// Release threshold of the voice gate, in [0, 1].
    #[serde(default = "default_vad_min")]
    pub vad_min: f32,

    /// Attack threshold of the voice gate, in [0, 1]. Must be >= `vad_min`.
    #[serde(default = "default_vad_max")]
    pub vad_max: f32,

    /// How long the metric must stay below `vad_min` before the gate closes.
    #[serde(default = "default_vad_gate_seconds")]
    pub vad_gate_seconds: f32,

    /// Target encoder bitrate in bits per second.
    #[serde(default = "default_quality")]
    pub quality: i32,

    /// 10 ms frames per outgoing packet. Opus packets are rounded up to the
    /// nearest encodable duration (1, 2, 4 or 6 frames).
    #[serde(default = "default_audio_per_packet")]
    pub audio_per_packet: usize,

    /// Preprocessor suppression strength in (negative) dB.
    #[serde(default = "default_noise_suppression")]
    pub noise_suppression_db: i32,

    #[serde(default = "default_gain")]
    pub amplification: f32,

    #[serde(default = "default_gain")]
    pub mic_boost: f32,

    /// Maximum milliseconds buffered per speaker.
    #[serde(default = "default_jitter_buffer_ms")]
    pub jitter_buffer_ms: u32,

    #[serde(default = "default_gain")]
    pub volume: f32,

    /// Sidetone mix gain; zero disables the sidetone entirely.
    #[serde(default)]
    pub sidetone_volume: f32,

    /// Extra output latency in 10 ms frames.
    #[serde(default)]
    pub output_delay_frames: u32,

    #[serde(default = "default_true")]
    pub enable_preprocessor: bool,

    #[serde(default)]
    pub enable_echo_cancellation: bool,

    /// Fill concealment gaps with low-level noise instead of silence.
    #[serde(default)]
    pub enable_comfort_noise: bool,

    /// Linear amplitude of the comfort-noise fill.
    #[serde(default = "default_comfort_noise_level")]
    pub comfort_noise_level: f32,

    /// Pin the Opus encoder to its CELT mode.
    #[serde(default)]
    pub opus_force_celt: bool,

    /// Tunnel all voice through the control channel.
    #[serde(default)]
    pub force_tcp: bool,
}

fn default_codec() -> CodecChoice {
    CodecChoice::Opus
}
fn default_transmit() -> TransmitMode {
    TransmitMode::VoiceActivity
}
fn default_vad_kind() -> VadKind {
    VadKind::SignalToNoise
}
fn default_vad_min() -> f32 {
    0.55
}
fn default_vad_max() -> f32 {
    0.75
}
fn default_vad_gate_seconds() -> f32 {
    0.25
}
fn default_quality() -> i32 {
    40_000
}
fn default_audio_per_packet() -> usize {
    2
}
fn default_noise_suppression() -> i32 {
    -30
}
fn default_gain() -> f32 {
    1.0
}
fn default_jitter_buffer_ms() -> u32 {
    100
}
fn default_comfort_noise_level() -> f32 {
    0.01
}
fn default_true() -> bool {
    true
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            transmit: default_transmit(),
            vad_kind: default_vad_kind(),
            vad_min: default_vad_min(),
            vad_max: default_vad_max(),
            vad_gate_seconds: default_vad_gate_seconds(),
            quality: default_quality(),
            audio_per_packet: default_audio_per_packet(),
            noise_suppression_db: default_noise_suppression(),
            amplification: default_gain(),
            mic_boost: default_gain(),
            jitter_buffer_ms: default_jitter_buffer_ms(),
            volume: default_gain(),
            sidetone_volume: 0.0,
            output_delay_frames: 0,
            enable_preprocessor: true,
            enable_echo_cancellation: false,
            enable_comfort_noise: false,
            comfort_noise_level: default_comfort_noise_level(),
            opus_force_celt: false,
            force_tcp: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AudioConfig::default();
        assert!(cfg.vad_min <= cfg.vad_max);
        assert!((1..=6).contains(&cfg.audio_per_packet));
        assert_eq!(cfg.codec, CodecChoice::Opus);
        assert!(!cfg.force_tcp);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: AudioConfig =
            serde_json::from_str(r#"{"transmit":"continuous","quality":72000}"#).unwrap();
        assert_eq!(cfg.transmit, TransmitMode::Continuous);
        assert_eq!(cfg.quality, 72_000);
        assert_eq!(cfg.jitter_buffer_ms, 100);
        assert!(cfg.enable_preprocessor);
    }
}
