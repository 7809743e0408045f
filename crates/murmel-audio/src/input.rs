//! The capture-side pipeline: gain, preprocessing, the transmit gate,
//! encoding and packetization.
//!
//! [`InputPipeline`] is synchronous; the owning task feeds it raw 48 kHz
//! PCM from the capture ring and collects ready-to-encrypt voice datagrams.
//! The sequence counter runs for the whole session and advances by the
//! number of 10 ms frames in each packet, so receivers can reason about
//! wall-clock position.

use anyhow::Result;
use bytes::Bytes;
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::warn;

use murmel_proto::voice::{encode_voice, VoiceDatagram, VoicePayload, TARGET_NORMAL};

use crate::codec::{OpusVoiceEncoder, VoiceEncoder};
use crate::config::{AudioConfig, TransmitMode};
use crate::denoise::Denoiser;
use crate::vad::VoiceGate;
use crate::FRAME_SIZE;

/// Sidetone ring capacity: ~200 ms.
const SIDETONE_BUFFER: usize = 48_000 / 5;

pub struct InputPipeline {
    config: AudioConfig,
    encoder: Box<dyn VoiceEncoder>,
    gate: VoiceGate,
    denoiser: Option<Denoiser>,
    sequence: u64,
    /// Residual samples shorter than a frame.
    carry: Vec<f32>,
    /// Whole processed frames awaiting packetization.
    packet_pcm: Vec<f32>,
    transmitting: bool,
    force_transmit: bool,
    target: u8,
    position: Option<[f32; 3]>,
    sidetone: HeapProd<f32>,
}

impl InputPipeline {
    /// Build the pipeline with an Opus encoder. Returns the sidetone
    /// consumer for the mixer.
    pub fn new(config: AudioConfig) -> Result<(Self, HeapCons<f32>)> {
        let encoder = OpusVoiceEncoder::new(config.quality, config.opus_force_celt)?;
        Ok(Self::with_encoder(config, Box::new(encoder)))
    }

    /// Build with a caller-supplied encoder.
    pub fn with_encoder(
        config: AudioConfig,
        encoder: Box<dyn VoiceEncoder>,
    ) -> (Self, HeapCons<f32>) {
        let (sidetone, consumer) = HeapRb::<f32>::new(SIDETONE_BUFFER).split();
        let gate = VoiceGate::new(
            config.vad_kind,
            config.vad_min,
            config.vad_max,
            config.vad_gate_seconds,
        );
        let denoiser = config
            .enable_preprocessor
            .then(|| Denoiser::new(config.noise_suppression_db));
        let pipeline = Self {
            gate,
            denoiser,
            encoder,
            sequence: 0,
            carry: Vec::with_capacity(FRAME_SIZE * 2),
            packet_pcm: Vec::with_capacity(FRAME_SIZE * 6),
            transmitting: false,
            force_transmit: false,
            target: TARGET_NORMAL,
            position: None,
            sidetone,
            config,
        };
        (pipeline, consumer)
    }

    /// Push-to-talk; forces transmission in the vad and toggle modes.
    pub fn set_force_transmit(&mut self, force: bool) {
        self.force_transmit = force;
    }

    /// Voice target for subsequent packets: [`TARGET_NORMAL`], a whisper
    /// slot (2..=30), or [`murmel_proto::voice::TARGET_DIRECT`].
    pub fn set_target(&mut self, target: u8) {
        self.target = target & 0x1F;
    }

    /// Positional vector appended to outgoing packets, passed through
    /// without interpretation.
    pub fn set_position(&mut self, position: Option<[f32; 3]>) {
        self.position = position;
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    /// Gate metric of the most recent frame, for level meters.
    pub fn metric(&self) -> f32 {
        self.gate.metric()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Feed captured PCM. Complete encoded datagrams (plaintext, ready for
    /// the crypto channel) are appended to `out`.
    pub fn push_samples(&mut self, samples: &[f32], out: &mut Vec<Vec<u8>>) -> Result<()> {
        self.carry.extend_from_slice(samples);

        while self.carry.len() >= FRAME_SIZE {
            let mut frame = [0.0f32; FRAME_SIZE];
            for (dst, src) in frame.iter_mut().zip(self.carry.drain(..FRAME_SIZE)) {
                *dst = src;
            }
            self.process_frame(&mut frame, out)?;
        }
        Ok(())
    }

    /// Flush any buffered speech and close the utterance, e.g. on mute or
    /// disconnect.
    pub fn flush(&mut self, out: &mut Vec<Vec<u8>>) -> Result<()> {
        if self.transmitting {
            self.emit_packet(out, true)?;
            self.transmitting = false;
        }
        Ok(())
    }

    fn process_frame(&mut self, frame: &mut [f32; FRAME_SIZE], out: &mut Vec<Vec<u8>>) -> Result<()> {
        let gain = self.config.mic_boost * self.config.amplification;
        if gain != 1.0 {
            for sample in frame.iter_mut() {
                *sample = (*sample * gain).clamp(-1.0, 1.0);
            }
        }

        let speech_probability = self.denoiser.as_mut().map(|d| d.process(frame));

        if self.config.sidetone_volume > 0.0 {
            // Lossy on overrun; the local echo is best-effort.
            let _ = self.sidetone.push_slice(frame);
        }

        let voice_detected = self.gate.process(frame, speech_probability);
        let transmit = match self.config.transmit {
            TransmitMode::Continuous => true,
            TransmitMode::Toggle => self.force_transmit,
            TransmitMode::VoiceActivity => voice_detected || self.force_transmit,
        };

        if transmit {
            self.transmitting = true;
            self.packet_pcm.extend_from_slice(frame);
            if self.packet_pcm.len() >= self.packet_frames() * FRAME_SIZE {
                self.emit_packet(out, false)?;
            }
        } else if self.transmitting {
            self.emit_packet(out, true)?;
            self.transmitting = false;
        }
        Ok(())
    }

    /// Frames per packet, rounded up to an encodable Opus duration.
    fn packet_frames(&self) -> usize {
        opus_frame_count(self.config.audio_per_packet.clamp(1, 6))
    }

    /// Encode and emit what is buffered. With nothing buffered and the
    /// terminator set, a bare end-of-utterance packet goes out.
    fn emit_packet(&mut self, out: &mut Vec<Vec<u8>>, terminator: bool) -> Result<()> {
        let buffered = self.packet_pcm.len() / FRAME_SIZE;
        let (frame, frames) = if buffered == 0 {
            if !terminator {
                return Ok(());
            }
            (Bytes::new(), 0)
        } else {
            // Pad the tail packet up to an encodable duration.
            let padded = opus_frame_count(buffered);
            self.packet_pcm.resize(padded * FRAME_SIZE, 0.0);
            match self.encoder.encode(&self.packet_pcm) {
                Ok(encoded) => (Bytes::from(encoded), padded as u64),
                Err(error) => {
                    // A failed frame is dropped; the stream continues.
                    warn!(%error, "voice encode failed");
                    self.packet_pcm.clear();
                    return Ok(());
                }
            }
        };

        let datagram = VoiceDatagram {
            target: self.target,
            session: None,
            sequence: self.sequence,
            payload: VoicePayload::Opus { frame, terminator },
            position: self.position,
        };
        out.push(encode_voice(&datagram));
        self.sequence += frames;
        self.packet_pcm.clear();
        Ok(())
    }
}

/// Smallest encodable Opus frame count that fits `frames` (10 ms units).
fn opus_frame_count(frames: usize) -> usize {
    match frames {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VadKind;
    use murmel_proto::voice::{decode, UdpPacket};

    /// Encoder stub: one byte payload recording how many frames went in.
    struct StubEncoder;

    impl VoiceEncoder for StubEncoder {
        fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>> {
            Ok(vec![(pcm.len() / FRAME_SIZE) as u8])
        }

        fn set_bitrate(&mut self, _bits_per_second: i32) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(transmit: TransmitMode) -> AudioConfig {
        AudioConfig {
            transmit,
            enable_preprocessor: false,
            vad_kind: VadKind::Amplitude,
            vad_min: 0.3,
            vad_max: 0.6,
            vad_gate_seconds: 0.0,
            audio_per_packet: 2,
            ..AudioConfig::default()
        }
    }

    fn pipeline(transmit: TransmitMode) -> InputPipeline {
        InputPipeline::with_encoder(test_config(transmit), Box::new(StubEncoder)).0
    }

    fn decode_voice_packet(bytes: &[u8]) -> VoiceDatagram {
        match decode(bytes, false).unwrap() {
            UdpPacket::Voice(d) => d,
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn continuous_mode_packs_two_frames_per_packet() {
        let mut input = pipeline(TransmitMode::Continuous);
        let mut out = Vec::new();
        input
            .push_samples(&vec![0.1f32; FRAME_SIZE * 4], &mut out)
            .unwrap();

        assert_eq!(out.len(), 2);
        let first = decode_voice_packet(&out[0]);
        let second = decode_voice_packet(&out[1]);
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 2, "sequence counts frames, not packets");
        assert!(!first.payload.is_terminator());
    }

    #[test]
    fn toggle_mode_follows_force_transmit() {
        let mut input = pipeline(TransmitMode::Toggle);
        let mut out = Vec::new();

        input
            .push_samples(&vec![0.5f32; FRAME_SIZE * 2], &mut out)
            .unwrap();
        assert!(out.is_empty(), "toggle released: nothing transmits");

        input.set_force_transmit(true);
        input
            .push_samples(&vec![0.5f32; FRAME_SIZE * 2], &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn releasing_toggle_sends_terminator() {
        let mut input = pipeline(TransmitMode::Toggle);
        let mut out = Vec::new();

        input.set_force_transmit(true);
        // Three frames: one full packet plus one buffered frame.
        input
            .push_samples(&vec![0.5f32; FRAME_SIZE * 3], &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);

        input.set_force_transmit(false);
        input
            .push_samples(&vec![0.0f32; FRAME_SIZE], &mut out)
            .unwrap();
        assert_eq!(out.len(), 2);

        let tail = decode_voice_packet(&out[1]);
        assert!(tail.payload.is_terminator());
        assert_eq!(tail.sequence, 2);
    }

    #[test]
    fn bare_terminator_after_exact_packet_boundary() {
        let mut input = pipeline(TransmitMode::Toggle);
        let mut out = Vec::new();

        input.set_force_transmit(true);
        input
            .push_samples(&vec![0.5f32; FRAME_SIZE * 2], &mut out)
            .unwrap();
        input.set_force_transmit(false);
        input
            .push_samples(&vec![0.0f32; FRAME_SIZE], &mut out)
            .unwrap();

        assert_eq!(out.len(), 2);
        let tail = decode_voice_packet(&out[1]);
        match &tail.payload {
            VoicePayload::Opus { frame, terminator } => {
                assert!(frame.is_empty());
                assert!(terminator);
            }
            other => panic!("{other:?}"),
        }
        // An empty terminator consumes no sequence space.
        assert_eq!(input.sequence(), 2);
    }

    #[test]
    fn vad_gates_silence() {
        let mut input = pipeline(TransmitMode::VoiceActivity);
        let mut out = Vec::new();

        input
            .push_samples(&vec![0.0f32; FRAME_SIZE * 6], &mut out)
            .unwrap();
        assert!(out.is_empty(), "silence never opens the gate");

        // Loud speech opens it.
        input
            .push_samples(&vec![0.5f32; FRAME_SIZE * 2], &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn position_rides_along() {
        let mut input = pipeline(TransmitMode::Continuous);
        input.set_position(Some([4.0, 5.0, 6.0]));
        let mut out = Vec::new();
        input
            .push_samples(&vec![0.1f32; FRAME_SIZE * 2], &mut out)
            .unwrap();
        let datagram = decode_voice_packet(&out[0]);
        assert_eq!(datagram.position, Some([4.0, 5.0, 6.0]));
    }

    #[test]
    fn whisper_target_is_carried() {
        let mut input = pipeline(TransmitMode::Continuous);
        input.set_target(5);
        let mut out = Vec::new();
        input
            .push_samples(&vec![0.1f32; FRAME_SIZE * 2], &mut out)
            .unwrap();
        assert_eq!(decode_voice_packet(&out[0]).target, 5);
    }

    #[test]
    fn flush_closes_the_utterance() {
        let mut input = pipeline(TransmitMode::Continuous);
        let mut out = Vec::new();
        input
            .push_samples(&vec![0.1f32; FRAME_SIZE], &mut out)
            .unwrap();
        assert!(out.is_empty(), "one frame is still buffered");

        input.flush(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        let tail = decode_voice_packet(&out[0]);
        assert!(tail.payload.is_terminator());
    }

    #[test]
    fn odd_tail_is_padded_to_encodable_size() {
        let mut config = test_config(TransmitMode::Toggle);
        config.audio_per_packet = 4;
        let mut input = InputPipeline::with_encoder(config, Box::new(StubEncoder)).0;

        let mut out = Vec::new();
        input.set_force_transmit(true);
        // 7 frames: one 4-frame packet, 3 buffered.
        input
            .push_samples(&vec![0.5f32; FRAME_SIZE * 7], &mut out)
            .unwrap();
        input.set_force_transmit(false);
        input
            .push_samples(&vec![0.0f32; FRAME_SIZE], &mut out)
            .unwrap();

        assert_eq!(out.len(), 2);
        let tail = decode_voice_packet(&out[1]);
        match &tail.payload {
            VoicePayload::Opus { frame, .. } => {
                // The stub records the padded frame count: 3 → 4.
                assert_eq!(frame[0], 4);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(input.sequence(), 8);
    }

    #[test]
    fn sidetone_receives_processed_audio() {
        use ringbuf::traits::Consumer;

        let mut config = test_config(TransmitMode::Continuous);
        config.sidetone_volume = 0.5;
        let (mut input, mut sidetone) =
            InputPipeline::with_encoder(config, Box::new(StubEncoder));

        let mut out = Vec::new();
        input
            .push_samples(&vec![0.25f32; FRAME_SIZE], &mut out)
            .unwrap();

        let mut buf = vec![0.0f32; FRAME_SIZE];
        assert_eq!(sidetone.pop_slice(&mut buf), FRAME_SIZE);
        assert!((buf[0] - 0.25).abs() < 1e-6);
    }
}
