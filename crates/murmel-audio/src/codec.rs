//! Codec seams for the send and receive paths.
//!
//! Opus is the implementation that ships; CELT and Speex payloads are
//! parsed on the wire but a decoder for them has to be plugged in through
//! [`VoiceDecoder`]. A speaker whose codec has no decoder conceals every
//! frame, which keeps a single bad stream from affecting the rest.

use anyhow::Result;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::packet::Packet;
use audiopus::{Application, Bitrate, Channels, MutSignals, SampleRate, Signal};

use crate::FRAME_SIZE;

/// Largest decodable packet duration: 60 ms at 48 kHz.
pub const MAX_DECODE_SAMPLES: usize = 6 * FRAME_SIZE;

/// Encodes 48 kHz mono float PCM into codec frames.
pub trait VoiceEncoder: Send {
    /// Encode a buffer of whole 10 ms frames into one codec frame.
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>>;

    fn set_bitrate(&mut self, bits_per_second: i32) -> Result<()>;
}

/// Decodes codec frames into 48 kHz mono float PCM.
pub trait VoiceDecoder: Send {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>>;

    /// Synthesize one 10 ms frame of loss concealment.
    fn conceal(&mut self) -> Result<Vec<f32>>;
}

pub struct OpusVoiceEncoder {
    inner: OpusEncoder,
}

impl OpusVoiceEncoder {
    /// An encoder tuned for live speech.
    ///
    /// `force_celt` selects the restricted-low-delay application, which pins
    /// libopus to its CELT mode.
    pub fn new(bitrate: i32, force_celt: bool) -> Result<Self> {
        let application = if force_celt {
            Application::LowDelay
        } else {
            Application::Voip
        };
        let mut encoder = OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, application)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(bitrate))?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(15)?;
        if !force_celt {
            encoder.set_signal(Signal::Voice)?;
        }
        Ok(Self { inner: encoder })
    }
}

impl VoiceEncoder for OpusVoiceEncoder {
    fn encode(&mut self, pcm: &[f32]) -> Result<Vec<u8>> {
        debug_assert_eq!(pcm.len() % FRAME_SIZE, 0, "whole frames only");
        let mut output = vec![0u8; 4000];
        let len = self.inner.encode_float(pcm, &mut output)?;
        output.truncate(len);
        Ok(output)
    }

    fn set_bitrate(&mut self, bits_per_second: i32) -> Result<()> {
        self.inner
            .set_bitrate(Bitrate::BitsPerSecond(bits_per_second))?;
        Ok(())
    }
}

/// One decoder instance per remote speaker.
pub struct OpusVoiceDecoder {
    inner: OpusDecoder,
}

impl OpusVoiceDecoder {
    pub fn new() -> Result<Self> {
        let decoder = OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)?;
        Ok(Self { inner: decoder })
    }
}

impl VoiceDecoder for OpusVoiceDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        let mut output = vec![0.0f32; MAX_DECODE_SAMPLES];
        let packet = Packet::try_from(packet)?;
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.inner.decode_float(Some(packet), signals, false)?;
        output.truncate(samples);
        Ok(output)
    }

    fn conceal(&mut self) -> Result<Vec<f32>> {
        let mut output = vec![0.0f32; FRAME_SIZE];
        let signals = MutSignals::try_from(&mut output)?;
        let samples = self.inner.decode_float(None, signals, false)?;
        output.truncate(samples);
        Ok(output)
    }
}
