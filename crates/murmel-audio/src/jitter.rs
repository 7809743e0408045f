//! Per-speaker reorder buffer.
//!
//! Packets are keyed by their sequence number, which counts 10 ms frames
//! (a packet holding several frames occupies the sequence of its first
//! one). Playback starts once a small initial reserve has accumulated;
//! afterwards the buffer hands packets out in order and reports gaps so the
//! caller can conceal them.

use std::collections::BTreeMap;

use murmel_proto::voice::VoicePayload;

/// A sequence this far behind the playback head is a session restart.
const RESTART_GAP: u64 = 128;

/// What the buffer has for the next playback slot.
#[derive(Debug)]
pub enum JitterFetch {
    /// The expected packet, ready for decoding.
    Packet { sequence: u64, payload: VoicePayload },
    /// The expected frame is missing but later data exists; conceal one
    /// frame. The head has already advanced past it.
    Lost,
}

pub struct JitterBuffer {
    entries: BTreeMap<u64, VoicePayload>,
    /// Next sequence to hand out; `None` until playback starts.
    head: Option<u64>,
    /// Packets to accumulate before playback begins.
    reserve: usize,
    buffering: bool,
    /// Maximum buffered packets.
    capacity: usize,
}

impl JitterBuffer {
    /// `capacity` bounds the buffered packets; `reserve` is the initial
    /// buffering depth (also in packets).
    pub fn new(capacity: usize, reserve: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: BTreeMap::new(),
            head: None,
            reserve: reserve.clamp(1, capacity),
            buffering: true,
            capacity,
        }
    }

    /// Insert an arriving packet.
    pub fn push(&mut self, sequence: u64, payload: VoicePayload) {
        if let Some(head) = self.head {
            if sequence.wrapping_add(RESTART_GAP) <= head {
                // Far behind the head: the sender restarted its counter.
                self.entries.clear();
                self.head = Some(sequence);
            } else if sequence < head {
                // Played past this slot already.
                return;
            }
        }

        self.entries.insert(sequence, payload);

        while self.entries.len() > self.capacity {
            self.entries.pop_first();
            // Whatever was dropped can no longer be played; keep the head
            // on buffered data.
            if let Some((&first, _)) = self.entries.first_key_value() {
                if self.head.is_some_and(|h| h < first) {
                    self.head = Some(first);
                }
            }
        }
    }

    /// Fetch for the next playback slot. `None` means nothing to play
    /// (still buffering, or underrun).
    pub fn pop(&mut self) -> Option<JitterFetch> {
        if self.buffering {
            if self.entries.len() < self.reserve {
                return None;
            }
            self.buffering = false;
            if self.head.is_none() {
                self.head = self.entries.first_key_value().map(|(&k, _)| k);
            }
        }

        let head = self.head?;
        if let Some(payload) = self.entries.remove(&head) {
            Some(JitterFetch::Packet {
                sequence: head,
                payload,
            })
        } else if !self.entries.is_empty() {
            self.head = Some(head + 1);
            Some(JitterFetch::Lost)
        } else {
            None
        }
    }

    /// The caller decoded a packet spanning `frames` slots; advance past it.
    pub fn advance(&mut self, sequence: u64, frames: u64) {
        self.head = Some(sequence + frames.max(1));
    }

    /// An underrun slot was concealed without data; move the head forward so
    /// a stale arrival for it is not played later.
    pub fn note_missing(&mut self) {
        if let Some(head) = self.head {
            self.head = Some(head + 1);
        }
    }

    /// Jump the head to the earliest buffered packet (resync after a long
    /// silent gap).
    pub fn skip_to_earliest(&mut self) {
        if let Some((&first, _)) = self.entries.first_key_value() {
            self.head = Some(first);
        }
    }

    /// Drop everything and buffer anew (end of utterance).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.head = None;
        self.buffering = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn opus(tag: u8) -> VoicePayload {
        VoicePayload::Opus {
            frame: Bytes::copy_from_slice(&[tag]),
            terminator: false,
        }
    }

    fn expect_packet(fetch: Option<JitterFetch>, sequence: u64, tag: u8) {
        match fetch {
            Some(JitterFetch::Packet {
                sequence: s,
                payload: VoicePayload::Opus { frame, .. },
            }) => {
                assert_eq!(s, sequence);
                assert_eq!(frame[0], tag);
            }
            other => panic!("expected packet {sequence}, got {other:?}"),
        }
    }

    #[test]
    fn in_order_delivery_after_reserve() {
        let mut jb = JitterBuffer::new(10, 2);
        jb.push(0, opus(10));
        assert!(jb.pop().is_none(), "still buffering");

        jb.push(1, opus(11));
        expect_packet(jb.pop(), 0, 10);
        jb.advance(0, 1);
        expect_packet(jb.pop(), 1, 11);
        jb.advance(1, 1);
        assert!(jb.pop().is_none());
    }

    #[test]
    fn reorders_out_of_order_arrivals() {
        let mut jb = JitterBuffer::new(10, 2);
        jb.push(0, opus(0));
        jb.push(2, opus(2));
        jb.push(1, opus(1));
        jb.push(3, opus(3));

        for seq in 0..4u64 {
            expect_packet(jb.pop(), seq, seq as u8);
            jb.advance(seq, 1);
        }
    }

    #[test]
    fn gap_reports_lost_then_resumes() {
        let mut jb = JitterBuffer::new(10, 2);
        jb.push(0, opus(0));
        jb.push(3, opus(3));

        expect_packet(jb.pop(), 0, 0);
        jb.advance(0, 1);
        assert!(matches!(jb.pop(), Some(JitterFetch::Lost)));
        assert!(matches!(jb.pop(), Some(JitterFetch::Lost)));
        expect_packet(jb.pop(), 3, 3);
    }

    #[test]
    fn multi_frame_packets_advance_by_frame_count() {
        let mut jb = JitterBuffer::new(10, 2);
        // Two-frame packets: sequences 0, 2, 4.
        jb.push(0, opus(0));
        jb.push(2, opus(2));
        jb.push(4, opus(4));

        expect_packet(jb.pop(), 0, 0);
        jb.advance(0, 2);
        expect_packet(jb.pop(), 2, 2);
        jb.advance(2, 2);
        expect_packet(jb.pop(), 4, 4);
    }

    #[test]
    fn stale_arrival_is_dropped() {
        let mut jb = JitterBuffer::new(10, 1);
        jb.push(5, opus(5));
        expect_packet(jb.pop(), 5, 5);
        jb.advance(5, 1);

        jb.push(4, opus(4));
        assert!(jb.pop().is_none());
    }

    #[test]
    fn far_backward_jump_restarts_session() {
        let mut jb = JitterBuffer::new(10, 1);
        jb.push(1000, opus(1));
        expect_packet(jb.pop(), 1000, 1);
        jb.advance(1000, 1);

        // 128+ behind the head: flush and reseed.
        jb.push(0, opus(2));
        expect_packet(jb.pop(), 0, 2);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut jb = JitterBuffer::new(4, 1);
        for seq in 0..20u64 {
            jb.push(seq, opus(seq as u8));
        }
        assert!(jb.len() <= 4);
        // The oldest surviving packet is what plays next.
        expect_packet(jb.pop(), 16, 16);
    }

    #[test]
    fn reset_returns_to_buffering() {
        let mut jb = JitterBuffer::new(10, 2);
        jb.push(0, opus(0));
        jb.push(1, opus(1));
        expect_packet(jb.pop(), 0, 0);
        jb.reset();
        assert!(jb.is_empty());
        jb.push(50, opus(5));
        assert!(jb.pop().is_none(), "buffering again after reset");
        jb.push(51, opus(6));
        expect_packet(jb.pop(), 50, 5);
    }

    #[test]
    fn note_missing_skips_the_slot() {
        let mut jb = JitterBuffer::new(10, 1);
        jb.push(0, opus(0));
        expect_packet(jb.pop(), 0, 0);
        jb.advance(0, 1);

        // Underrun for slot 1, concealed by the caller.
        assert!(jb.pop().is_none());
        jb.note_missing();

        // A stale arrival for slot 1 no longer plays...
        jb.push(1, opus(1));
        assert!(jb.pop().is_none());
        // ...but slot 2 does.
        jb.push(2, opus(2));
        expect_packet(jb.pop(), 2, 2);
    }
}
