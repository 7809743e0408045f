//! Output device glue: the cpal callback drives the mixer directly.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tracing::{error, info};

use crate::device;
use crate::mixer::Mixer;
use crate::resample::LinearResampler;
use crate::{FRAME_SIZE, SAMPLE_RATE};

pub struct PlaybackStream {
    #[allow(dead_code)] // held to keep the stream alive
    stream: cpal::Stream,
    sample_rate: u32,
}

// Hold-only handle; see CaptureStream.
unsafe impl Send for PlaybackStream {}

impl PlaybackStream {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Per-callback mixing state. Buffers are sized up front so the callback
/// does not allocate once warm.
struct RenderState {
    mixer: Arc<Mixer>,
    resampler: LinearResampler,
    frame: [f32; FRAME_SIZE],
    resampled: Vec<f32>,
    queue: VecDeque<f32>,
}

impl RenderState {
    fn new(mixer: Arc<Mixer>, device_rate: u32) -> Self {
        Self {
            mixer,
            resampler: LinearResampler::new(SAMPLE_RATE, device_rate),
            frame: [0.0; FRAME_SIZE],
            resampled: Vec::with_capacity(FRAME_SIZE * 4),
            queue: VecDeque::with_capacity(FRAME_SIZE * 8),
        }
    }

    /// Fill `data`, mono duplicated across device channels.
    fn fill<T, F: Fn(f32) -> T>(&mut self, data: &mut [T], channels: usize, convert: F) {
        let frames_needed = data.len() / channels.max(1);
        while self.queue.len() < frames_needed {
            self.mixer.render(&mut self.frame);
            self.resampled.clear();
            self.resampler.process(&self.frame, &mut self.resampled);
            self.queue.extend(self.resampled.iter().copied());
        }
        for chunk in data.chunks_mut(channels.max(1)) {
            let sample = self.queue.pop_front().unwrap_or(0.0);
            for out in chunk {
                *out = convert(sample);
            }
        }
    }
}

/// Open the playback device; every callback pulls freshly mixed audio.
pub fn start_playback(device_name: Option<&str>, mixer: Arc<Mixer>) -> Result<PlaybackStream> {
    let device = device::find_output(device_name)?;
    let supported = device.default_output_config()?;
    let channels = supported.channels() as usize;

    // Prefer the pipeline rate; any other rate goes through the resampler.
    let preferred = StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let probe = device.build_output_stream(
        &preferred,
        |_: &mut [f32], _: &cpal::OutputCallbackInfo| {},
        |_| {},
        None,
    );
    let (config, sample_rate) = match probe {
        Ok(_probe_stream) => (preferred, SAMPLE_RATE),
        Err(_) => (
            StreamConfig {
                channels: supported.channels(),
                sample_rate: supported.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            supported.sample_rate().0,
        ),
    };

    info!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "starting playback"
    );

    let mut state = RenderState::new(mixer, sample_rate);
    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                state.fill(data, channels, |s| s);
            },
            |err| error!("playback stream error: {err}"),
            None,
        )?,
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                state.fill(data, channels, |s| (s * i16::MAX as f32) as i16);
            },
            |err| error!("playback stream error: {err}"),
            None,
        )?,
        format => anyhow::bail!("unsupported playback sample format: {format:?}"),
    };
    stream.play()?;

    Ok(PlaybackStream { stream, sample_rate })
}
