//! Microphone capture into a lock-free ring the input task drains.

use anyhow::Result;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{error, info, warn};

use crate::device;
use crate::SAMPLE_RATE;

/// Capture ring capacity: ~200 ms at the pipeline rate.
const CAPTURE_BUFFER: usize = SAMPLE_RATE as usize / 5;

/// Handle keeping the capture stream alive.
pub struct CaptureStream {
    stream: cpal::Stream,
    sample_rate: u32,
}

// The stream handle is only held (and paused/resumed), never shared between
// threads mid-call; cpal's !Send marker is stricter than this usage needs.
unsafe impl Send for CaptureStream {}

impl CaptureStream {
    /// The rate samples actually arrive at. When this differs from the
    /// pipeline rate the input task must resample.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn pause(&self) -> Result<()> {
        self.stream.pause()?;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }
}

/// Open the capture device and start filling the returned ring with mono
/// f32 samples. Prefers the pipeline rate, falling back to the device
/// default when 48 kHz is unsupported.
pub fn start_capture(device_name: Option<&str>) -> Result<(CaptureStream, HeapCons<f32>)> {
    let device = device::find_input(device_name)?;
    let supported = device.default_input_config()?;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();

    // Probe 48 kHz support with a throwaway stream.
    let preferred = StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let probe = device.build_input_stream(
        &preferred,
        |_: &[f32], _: &cpal::InputCallbackInfo| {},
        |_| {},
        None,
    );
    let (config, sample_rate) = match probe {
        Ok(_probe_stream) => (preferred, SAMPLE_RATE),
        Err(_) => {
            let fallback_rate = supported.sample_rate().0;
            warn!(
                device_rate = fallback_rate,
                "device does not capture at {SAMPLE_RATE} Hz, resampling"
            );
            (
                StreamConfig {
                    channels: supported.channels(),
                    sample_rate: supported.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                },
                fallback_rate,
            )
        }
    };

    info!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "starting capture"
    );

    let rb = HeapRb::<f32>::new(CAPTURE_BUFFER);
    let (producer, consumer) = rb.split();

    let stream = match sample_format {
        SampleFormat::F32 => build_f32(&device, &config, channels, producer)?,
        SampleFormat::I16 => build_i16(&device, &config, channels, producer)?,
        format => anyhow::bail!("unsupported capture sample format: {format:?}"),
    };
    stream.play()?;

    Ok((CaptureStream { stream, sample_rate }, consumer))
}

fn build_f32(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut producer: HeapProd<f32>,
) -> Result<cpal::Stream> {
    Ok(device.build_input_stream(
        config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if channels == 1 {
                let _ = producer.push_slice(data);
            } else {
                for frame in data.chunks(channels) {
                    let _ = producer.try_push(frame[0]);
                }
            }
        },
        |err| error!("capture stream error: {err}"),
        None,
    )?)
}

fn build_i16(
    device: &cpal::Device,
    config: &StreamConfig,
    channels: usize,
    mut producer: HeapProd<f32>,
) -> Result<cpal::Stream> {
    Ok(device.build_input_stream(
        config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let _ = producer.try_push(frame[0] as f32 / i16::MAX as f32);
            }
        },
        |err| error!("capture stream error: {err}"),
        None,
    )?)
}
