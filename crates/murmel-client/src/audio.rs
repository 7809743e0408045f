//! Wiring between the devices, the input pipeline and the connection.
//!
//! The capture callback only writes into its ring; this module's task
//! drains it, runs the encode pipeline and hands finished datagrams to the
//! connection's voice sender. Playback needs no task: the device callback
//! pulls from the mixer directly.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer};
use ringbuf::HeapCons;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use murmel_audio::capture::{self, CaptureStream};
use murmel_audio::config::AudioConfig;
use murmel_audio::input::InputPipeline;
use murmel_audio::playback::{self, PlaybackStream};
use murmel_audio::resample::LinearResampler;
use murmel_audio::SAMPLE_RATE;

use crate::connection::Connection;
use crate::error::ClientError;

/// Capture drain cadence; half a frame keeps latency low without spinning.
const PUMP_INTERVAL: Duration = Duration::from_millis(5);

/// Live transmit controls shared with the input task.
struct InputControl {
    force_transmit: AtomicBool,
    target: AtomicU8,
    position: Mutex<Option<[f32; 3]>>,
}

/// Holds the running audio devices and the input task for one connection.
pub struct AudioBridge {
    capture: CaptureStream,
    #[allow(dead_code)] // held to keep the output stream alive
    playback: PlaybackStream,
    control: Arc<InputControl>,
    task: JoinHandle<()>,
}

impl AudioBridge {
    /// Open both devices and start feeding the connection.
    pub fn start(
        connection: &Connection,
        audio: &AudioConfig,
        input_device: Option<&str>,
        output_device: Option<&str>,
    ) -> Result<Self> {
        let voice_tx = connection
            .voice_sender()
            .ok_or(ClientError::Closed)
            .map_err(anyhow::Error::from)?;

        if audio.enable_echo_cancellation {
            warn!("echo cancellation has no backend in this build");
        }

        let (pipeline, sidetone) = InputPipeline::new(audio.clone())?;
        let mixer = connection.mixer();
        mixer.set_sidetone_source(sidetone);

        let (capture, consumer) = capture::start_capture(input_device)?;
        let playback = playback::start_playback(output_device, mixer)?;

        let resampler = (capture.sample_rate() != SAMPLE_RATE)
            .then(|| LinearResampler::new(capture.sample_rate(), SAMPLE_RATE));

        let control = Arc::new(InputControl {
            force_transmit: AtomicBool::new(false),
            target: AtomicU8::new(0),
            position: Mutex::new(None),
        });

        let task = tokio::spawn(input_task(
            consumer,
            pipeline,
            resampler,
            voice_tx,
            control.clone(),
        ));

        Ok(Self {
            capture,
            playback,
            control,
            task,
        })
    }

    /// Push-to-talk state.
    pub fn set_force_transmit(&self, force: bool) {
        self.control.force_transmit.store(force, Ordering::Relaxed);
    }

    /// Voice target for outgoing speech (0 normal, 1..=30 whisper slots).
    pub fn set_target(&self, target: u8) {
        self.control.target.store(target & 0x1F, Ordering::Relaxed);
    }

    /// Positional vector attached to outgoing packets.
    pub fn set_position(&self, position: Option<[f32; 3]>) {
        *self.control.position.lock() = position;
    }

    pub fn pause_capture(&self) -> Result<()> {
        self.capture.pause()
    }

    pub fn resume_capture(&self) -> Result<()> {
        self.capture.resume()
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drains the capture ring, encodes, and forwards finished datagrams.
async fn input_task(
    mut consumer: HeapCons<f32>,
    mut pipeline: InputPipeline,
    mut resampler: Option<LinearResampler>,
    voice_tx: mpsc::Sender<Vec<u8>>,
    control: Arc<InputControl>,
) {
    let mut interval = tokio::time::interval(PUMP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut raw = vec![0.0f32; SAMPLE_RATE as usize / 10];
    let mut resampled = Vec::with_capacity(SAMPLE_RATE as usize / 10);
    let mut packets: Vec<Vec<u8>> = Vec::new();

    loop {
        interval.tick().await;
        if consumer.is_empty() {
            continue;
        }
        let count = consumer.pop_slice(&mut raw);

        pipeline.set_force_transmit(control.force_transmit.load(Ordering::Relaxed));
        pipeline.set_target(control.target.load(Ordering::Relaxed));
        pipeline.set_position(*control.position.lock());

        let samples: &[f32] = match resampler.as_mut() {
            Some(resampler) => {
                resampled.clear();
                resampler.process(&raw[..count], &mut resampled);
                &resampled
            }
            None => &raw[..count],
        };

        if let Err(error) = pipeline.push_samples(samples, &mut packets) {
            warn!(%error, "input pipeline failed on a chunk");
            packets.clear();
            continue;
        }
        for packet in packets.drain(..) {
            if voice_tx.send(packet).await.is_err() {
                // Connection torn down.
                return;
            }
        }
    }
}
