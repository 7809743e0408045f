//! Summing mixer, driven from the output-device callback.
//!
//! Speakers live in a map guarded by a lock that only the device callback
//! and the model task (adding/removing sessions) touch. Per-speaker state
//! has its own short lock inside [`Speaker`], so enqueueing voice from the
//! network never stalls the render path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::Consumer;
use ringbuf::HeapCons;

use crate::speech::{Speaker, TalkState};
use crate::FRAME_SIZE;

pub struct Mixer {
    speakers: Mutex<HashMap<u32, Arc<Speaker>>>,
    /// Sidetone feed from the input pipeline, drained at render time.
    sidetone: Mutex<Option<HeapCons<f32>>>,
    /// Master gain as f32 bits.
    volume: AtomicU32,
    sidetone_volume: AtomicU32,
}

impl Mixer {
    pub fn new(volume: f32, sidetone_volume: f32) -> Self {
        Self {
            speakers: Mutex::new(HashMap::new()),
            sidetone: Mutex::new(None),
            volume: AtomicU32::new(volume.to_bits()),
            sidetone_volume: AtomicU32::new(sidetone_volume.to_bits()),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_sidetone_volume(&self, volume: f32) {
        self.sidetone_volume
            .store(volume.max(0.0).to_bits(), Ordering::Relaxed);
    }

    /// Attach the sidetone ring written by the input pipeline.
    pub fn set_sidetone_source(&self, consumer: HeapCons<f32>) {
        *self.sidetone.lock() = Some(consumer);
    }

    pub fn insert_speaker(&self, speaker: Arc<Speaker>) {
        self.speakers.lock().insert(speaker.session(), speaker);
    }

    pub fn speaker(&self, session: u32) -> Option<Arc<Speaker>> {
        self.speakers.lock().get(&session).cloned()
    }

    pub fn remove_speaker(&self, session: u32) -> Option<Arc<Speaker>> {
        self.speakers.lock().remove(&session)
    }

    pub fn clear(&self) {
        self.speakers.lock().clear();
    }

    /// Current talk state per session, for the model task's event sweep.
    pub fn talk_states(&self) -> Vec<(u32, TalkState)> {
        self.speakers
            .lock()
            .values()
            .map(|s| (s.session(), s.talk_state()))
            .collect()
    }

    /// Render one 10 ms frame at the pipeline rate into `out`.
    ///
    /// Runs on the device callback thread: fixed-size stack scratch, brief
    /// locks, no allocation.
    pub fn render(&self, out: &mut [f32; FRAME_SIZE]) {
        out.fill(0.0);
        let mut scratch = [0.0f32; FRAME_SIZE];

        {
            let speakers = self.speakers.lock();
            for speaker in speakers.values() {
                if speaker.next_frame(&mut scratch) {
                    let gain = speaker.volume();
                    for (acc, &sample) in out.iter_mut().zip(scratch.iter()) {
                        *acc += sample * gain;
                    }
                }
            }
        }

        let sidetone_gain = f32::from_bits(self.sidetone_volume.load(Ordering::Relaxed));
        if sidetone_gain > 0.0 {
            if let Some(consumer) = self.sidetone.lock().as_mut() {
                let popped = consumer.pop_slice(&mut scratch);
                for (acc, &sample) in out.iter_mut().zip(scratch[..popped].iter()) {
                    *acc += sample * sidetone_gain;
                }
            }
        }

        let master = f32::from_bits(self.volume.load(Ordering::Relaxed));
        for sample in out.iter_mut() {
            *sample = (*sample * master).clamp(-1.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::{Producer, Split};
    use ringbuf::HeapRb;

    #[test]
    fn empty_mixer_renders_silence() {
        let mixer = Mixer::new(1.0, 0.0);
        let mut out = [1.0f32; FRAME_SIZE];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn sidetone_mixes_with_gain() {
        let mixer = Mixer::new(1.0, 0.5);
        let rb = HeapRb::<f32>::new(FRAME_SIZE * 4);
        let (mut producer, consumer) = rb.split();
        mixer.set_sidetone_source(consumer);

        let tone = vec![0.8f32; FRAME_SIZE];
        producer.push_slice(&tone);

        let mut out = [0.0f32; FRAME_SIZE];
        mixer.render(&mut out);
        assert!((out[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn master_volume_clamps() {
        let mixer = Mixer::new(4.0, 1.0);
        let rb = HeapRb::<f32>::new(FRAME_SIZE * 4);
        let (mut producer, consumer) = rb.split();
        mixer.set_sidetone_source(consumer);
        mixer.set_sidetone_volume(1.0);
        producer.push_slice(&vec![0.9f32; FRAME_SIZE]);

        let mut out = [0.0f32; FRAME_SIZE];
        mixer.render(&mut out);
        assert_eq!(out[0], 1.0, "clamped to full scale");
    }

    #[test]
    fn speaker_membership() {
        let mixer = Mixer::new(1.0, 0.0);
        let speaker = Arc::new(Speaker::new(7, 10, 1, None));
        mixer.insert_speaker(speaker);
        assert!(mixer.speaker(7).is_some());
        assert_eq!(mixer.talk_states().len(), 1);
        assert!(mixer.remove_speaker(7).is_some());
        assert!(mixer.speaker(7).is_none());
    }
}
