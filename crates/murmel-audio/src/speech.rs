//! Per-speaker receive state: jitter buffer, decoder, loss concealment and
//! talk-state bookkeeping.
//!
//! The network task enqueues datagrams; the device callback pulls one 10 ms
//! frame per tick through [`Speaker::next_frame`]. The two sides share a
//! short-held lock; the callback never allocates beyond the decoder's own
//! scratch buffers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use murmel_proto::voice::{
    VoiceDatagram, VoiceKind, VoicePayload, TARGET_DIRECT, TARGET_LOOPBACK, TARGET_NORMAL,
};

use crate::codec::{OpusVoiceDecoder, VoiceDecoder};
use crate::jitter::{JitterBuffer, JitterFetch};
use crate::FRAME_SIZE;

/// Consecutive concealment frames before a speaker goes quiet.
const MAX_CONCEAL_FRAMES: u32 = 10;

/// What a user sounds like right now. Derived from the target field of
/// their datagrams; `Passive` once the stream drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TalkState {
    Passive = 0,
    Talking = 1,
    Whispering = 2,
    Shouting = 3,
}

impl TalkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Talking,
            2 => Self::Whispering,
            3 => Self::Shouting,
            _ => Self::Passive,
        }
    }

    /// Clientbound target → talk state. Normal speech and the server's
    /// loopback of our own speech read as Talking; direct server-addressed
    /// speech as Shouting; the whisper slots as Whispering. A channel shout
    /// and a user whisper share the slot range and cannot be told apart on
    /// the wire.
    fn from_target(target: u8) -> Self {
        match target {
            TARGET_NORMAL | TARGET_LOOPBACK => Self::Talking,
            TARGET_DIRECT => Self::Shouting,
            _ => Self::Whispering,
        }
    }
}

struct SpeakerInner {
    jitter: JitterBuffer,
    decoder: Option<Box<dyn VoiceDecoder>>,
    decoder_kind: Option<VoiceKind>,
    /// Decoded samples not yet handed to the mixer.
    pending: VecDeque<f32>,
    conceal_run: u32,
    /// The current utterance has seen its terminator.
    terminated: bool,
    /// Playback produced at least one frame since the last drain.
    started: bool,
    /// Last received positional vector, passed through untouched.
    position: Option<[f32; 3]>,
    comfort_noise: Option<ComfortNoise>,
}

/// One remote speaker.
pub struct Speaker {
    session: u32,
    inner: Mutex<SpeakerInner>,
    talk: AtomicU8,
    /// Per-speaker gain as f32 bits.
    volume: AtomicU32,
}

impl Speaker {
    /// `jitter_packets` bounds the buffer, `reserve_packets` sets the
    /// initial buffering depth (output delay folds in here).
    pub fn new(
        session: u32,
        jitter_packets: usize,
        reserve_packets: usize,
        comfort_noise: Option<f32>,
    ) -> Self {
        Self {
            session,
            inner: Mutex::new(SpeakerInner {
                jitter: JitterBuffer::new(jitter_packets, reserve_packets),
                decoder: None,
                decoder_kind: None,
                pending: VecDeque::with_capacity(crate::codec::MAX_DECODE_SAMPLES),
                conceal_run: 0,
                terminated: false,
                started: false,
                position: None,
                comfort_noise: comfort_noise.map(ComfortNoise::new),
            }),
            talk: AtomicU8::new(TalkState::Passive as u8),
            volume: AtomicU32::new(1.0f32.to_bits()),
        }
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn talk_state(&self) -> TalkState {
        TalkState::from_u8(self.talk.load(Ordering::Relaxed))
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn position(&self) -> Option<[f32; 3]> {
        self.inner.lock().position
    }

    /// Enqueue a datagram from the network task. Returns the talk state the
    /// datagram implies so the caller can surface a change event.
    pub fn enqueue(&self, datagram: VoiceDatagram) -> TalkState {
        let mut inner = self.inner.lock();

        let kind = datagram.payload.kind();
        if inner.decoder_kind != Some(kind) {
            inner.decoder = decoder_for(kind);
            inner.decoder_kind = Some(kind);
            if inner.decoder.is_none() {
                debug!(session = self.session, ?kind, "no decoder for codec");
            }
        }

        inner.position = datagram.position.or(inner.position);
        inner.terminated = false;
        inner
            .jitter
            .push(datagram.sequence, datagram.payload);
        drop(inner);

        let state = TalkState::from_target(datagram.target);
        self.talk.store(state as u8, Ordering::Relaxed);
        state
    }

    /// Pull one 10 ms frame. Returns false (and an untouched buffer) when
    /// the speaker has nothing to contribute.
    pub fn next_frame(&self, out: &mut [f32; FRAME_SIZE]) -> bool {
        let mut inner = self.inner.lock();

        loop {
            if inner.pending.len() >= FRAME_SIZE {
                for sample in out.iter_mut() {
                    // Queue length checked above.
                    *sample = inner.pending.pop_front().unwrap_or(0.0);
                }
                inner.started = true;
                return true;
            }

            match inner.jitter.pop() {
                Some(JitterFetch::Packet { sequence, payload }) => {
                    inner.conceal_run = 0;
                    if payload.is_terminator() {
                        inner.terminated = true;
                    }
                    let frames = decode_payload(&mut inner, &payload);
                    inner.jitter.advance(sequence, frames.max(1));
                    if inner.pending.is_empty() && inner.terminated {
                        // Bare terminator: the utterance is over.
                        self.drain(&mut inner);
                        return false;
                    }
                }
                Some(JitterFetch::Lost) => {
                    if !self.conceal_one(&mut inner) {
                        return false;
                    }
                }
                None => {
                    if !inner.started {
                        return false;
                    }
                    if inner.terminated {
                        self.drain(&mut inner);
                        return false;
                    }
                    // Mid-stream underrun: conceal, and skip the slot so a
                    // stale retransmission is not played later.
                    inner.jitter.note_missing();
                    if !self.conceal_one(&mut inner) {
                        return false;
                    }
                }
            }
        }
    }

    /// Append one concealment frame, or give up after the run limit.
    fn conceal_one(&self, inner: &mut SpeakerInner) -> bool {
        if inner.conceal_run >= MAX_CONCEAL_FRAMES {
            if inner.jitter.is_empty() {
                self.drain(inner);
                return false;
            }
            // Data is queued beyond the gap; resynchronize onto it.
            trace!(session = self.session, "resync past a long loss run");
            inner.jitter.skip_to_earliest();
            inner.conceal_run = 0;
            return true;
        }
        inner.conceal_run += 1;

        let concealed = match inner.decoder.as_mut() {
            Some(decoder) => decoder.conceal().ok(),
            None => None,
        };
        match concealed {
            Some(samples) => inner.pending.extend(samples),
            None => match inner.comfort_noise.as_mut() {
                Some(noise) => {
                    for _ in 0..FRAME_SIZE {
                        let sample = noise.next_sample();
                        inner.pending.push_back(sample);
                    }
                }
                None => inner.pending.extend(std::iter::repeat(0.0).take(FRAME_SIZE)),
            },
        }
        true
    }

    fn drain(&self, inner: &mut SpeakerInner) {
        inner.started = false;
        inner.conceal_run = 0;
        inner.terminated = false;
        inner.jitter.reset();
        inner.pending.clear();
        self.talk.store(TalkState::Passive as u8, Ordering::Relaxed);
    }
}

/// Decode into the pending queue; returns how many 10 ms frames came out.
fn decode_payload(inner: &mut SpeakerInner, payload: &VoicePayload) -> u64 {
    let mut produced = 0usize;
    match payload {
        VoicePayload::Opus { frame, .. } => {
            if !frame.is_empty() {
                if let Some(decoder) = inner.decoder.as_mut() {
                    match decoder.decode(frame) {
                        Ok(samples) => {
                            produced = samples.len();
                            inner.pending.extend(samples);
                        }
                        Err(error) => {
                            trace!(%error, "opus decode failed, concealing");
                            if let Ok(samples) = decoder.conceal() {
                                produced = samples.len();
                                inner.pending.extend(samples);
                            }
                        }
                    }
                }
            }
        }
        VoicePayload::CeltAlpha(frames)
        | VoicePayload::CeltBeta(frames)
        | VoicePayload::Speex(frames) => {
            for frame in frames.iter().filter(|f| !f.is_empty()) {
                if let Some(decoder) = inner.decoder.as_mut() {
                    if let Ok(samples) = decoder.decode(frame) {
                        produced += samples.len();
                        inner.pending.extend(samples);
                    }
                }
            }
        }
    }
    (produced / FRAME_SIZE) as u64
}

fn decoder_for(kind: VoiceKind) -> Option<Box<dyn VoiceDecoder>> {
    match kind {
        VoiceKind::Opus => OpusVoiceDecoder::new()
            .ok()
            .map(|d| Box::new(d) as Box<dyn VoiceDecoder>),
        // No maintained decoder implementations; frames conceal instead.
        VoiceKind::CeltAlpha | VoiceKind::CeltBeta | VoiceKind::Speex => None,
        VoiceKind::Ping => None,
    }
}

/// Cheap white-noise source for concealment fill. Plain xorshift so the
/// callback never touches a real RNG.
struct ComfortNoise {
    level: f32,
    state: u32,
}

impl ComfortNoise {
    fn new(level: f32) -> Self {
        Self {
            level,
            state: 0x2545_F491,
        }
    }

    fn next_sample(&mut self) -> f32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        (x as f32 / u32::MAX as f32 - 0.5) * 2.0 * self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// A stub decoder used instead of Opus so tests can assert exact PCM.
    struct StubDecoder;

    impl VoiceDecoder for StubDecoder {
        fn decode(&mut self, packet: &[u8]) -> anyhow::Result<Vec<f32>> {
            // One frame filled with the first payload byte as amplitude.
            Ok(vec![packet[0] as f32; FRAME_SIZE])
        }

        fn conceal(&mut self) -> anyhow::Result<Vec<f32>> {
            Ok(vec![-1.0; FRAME_SIZE])
        }
    }

    fn speaker_with_stub() -> Speaker {
        let speaker = Speaker::new(42, 10, 2, None);
        {
            let mut inner = speaker.inner.lock();
            inner.decoder = Some(Box::new(StubDecoder));
            inner.decoder_kind = Some(VoiceKind::Opus);
        }
        speaker
    }

    fn voice(sequence: u64, tag: u8, terminator: bool) -> VoiceDatagram {
        VoiceDatagram {
            target: 0,
            session: Some(42),
            sequence,
            payload: VoicePayload::Opus {
                frame: Bytes::copy_from_slice(&[tag]),
                terminator,
            },
            position: None,
        }
    }

    /// Enqueue without letting `enqueue` swap in a real Opus decoder.
    fn push(speaker: &Speaker, datagram: VoiceDatagram) {
        let mut inner = speaker.inner.lock();
        inner.terminated = false;
        inner.position = datagram.position.or(inner.position);
        inner.jitter.push(datagram.sequence, datagram.payload);
        drop(inner);
        speaker
            .talk
            .store(TalkState::from_target(datagram.target) as u8, Ordering::Relaxed);
    }

    #[test]
    fn frames_come_out_in_sequence_order() {
        let speaker = speaker_with_stub();
        // Out-of-order delivery: 0, 2, 1, 3.
        for (seq, tag) in [(0u64, 10u8), (2, 12), (1, 11), (3, 13)] {
            push(&speaker, voice(seq, tag, false));
        }

        let mut out = [0.0f32; FRAME_SIZE];
        for expected in [10.0f32, 11.0, 12.0, 13.0] {
            assert!(speaker.next_frame(&mut out));
            assert_eq!(out[0], expected);
            assert_ne!(out[0], -1.0, "no concealment expected");
        }
    }

    #[test]
    fn gap_is_concealed_and_talk_state_holds() {
        let speaker = speaker_with_stub();
        push(&speaker, voice(0, 10, false));
        push(&speaker, voice(3, 13, false));

        let mut out = [0.0f32; FRAME_SIZE];
        assert!(speaker.next_frame(&mut out));
        assert_eq!(out[0], 10.0);

        // Two concealment frames bridge sequences 1 and 2.
        assert!(speaker.next_frame(&mut out));
        assert_eq!(out[0], -1.0);
        assert!(speaker.next_frame(&mut out));
        assert_eq!(out[0], -1.0);

        assert!(speaker.next_frame(&mut out));
        assert_eq!(out[0], 13.0);
        assert_eq!(speaker.talk_state(), TalkState::Talking);
    }

    #[test]
    fn terminator_drains_to_passive() {
        let speaker = speaker_with_stub();
        push(&speaker, voice(0, 10, false));
        push(&speaker, voice(1, 11, true));

        let mut out = [0.0f32; FRAME_SIZE];
        assert!(speaker.next_frame(&mut out));
        assert!(speaker.next_frame(&mut out));
        // Buffer drained after the terminator: speaker goes passive.
        assert!(!speaker.next_frame(&mut out));
        assert_eq!(speaker.talk_state(), TalkState::Passive);
    }

    #[test]
    fn long_loss_run_goes_quiet() {
        let speaker = speaker_with_stub();
        push(&speaker, voice(0, 10, false));
        push(&speaker, voice(1, 11, false));

        let mut out = [0.0f32; FRAME_SIZE];
        assert!(speaker.next_frame(&mut out));
        assert!(speaker.next_frame(&mut out));

        // Underrun: concealment for a while, then silence.
        let mut concealed = 0;
        while speaker.next_frame(&mut out) {
            concealed += 1;
            assert!(concealed <= MAX_CONCEAL_FRAMES, "must give up eventually");
        }
        assert_eq!(concealed, MAX_CONCEAL_FRAMES);
        assert_eq!(speaker.talk_state(), TalkState::Passive);
    }

    #[test]
    fn talk_state_follows_target() {
        let speaker = speaker_with_stub();
        let mut whisper = voice(0, 1, false);
        whisper.target = 5;
        assert_eq!(speaker.enqueue(whisper), TalkState::Whispering);

        let mut direct = voice(1, 1, false);
        direct.target = TARGET_DIRECT;
        assert_eq!(speaker.enqueue(direct), TalkState::Shouting);

        let mut loopback = voice(2, 1, false);
        loopback.target = TARGET_LOOPBACK;
        assert_eq!(speaker.enqueue(loopback), TalkState::Talking);

        let mut normal = voice(3, 1, false);
        normal.target = TARGET_NORMAL;
        assert_eq!(speaker.enqueue(normal), TalkState::Talking);
    }

    #[test]
    fn position_is_passed_through() {
        let speaker = speaker_with_stub();
        let mut datagram = voice(0, 1, false);
        datagram.position = Some([1.0, 2.0, 3.0]);
        speaker.enqueue(datagram);
        assert_eq!(speaker.position(), Some([1.0, 2.0, 3.0]));
    }

    #[test]
    fn unsupported_codec_conceals_with_silence() {
        let speaker = Speaker::new(1, 10, 1, None);
        let datagram = VoiceDatagram {
            target: 0,
            session: Some(1),
            sequence: 0,
            payload: VoicePayload::Speex(vec![Bytes::copy_from_slice(&[1, 2, 3])]),
            position: None,
        };
        speaker.enqueue(datagram);

        let mut out = [9.0f32; FRAME_SIZE];
        // Nothing decodable: the packet produces no PCM and the stream
        // ends up silent rather than erroring.
        let _ = speaker.next_frame(&mut out);
    }
}
