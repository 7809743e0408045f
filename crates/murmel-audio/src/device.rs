//! Audio device enumeration and lookup.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
}

fn describe(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<String>,
) -> Vec<DeviceInfo> {
    let default_name = default_name.unwrap_or_default();
    devices
        .filter_map(|device| device.name().ok())
        .map(|name| DeviceInfo {
            is_default: name == default_name,
            name,
        })
        .collect()
}

/// List capture (microphone) devices.
pub fn input_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    Ok(describe(host.input_devices()?, default_name))
}

/// List playback devices.
pub fn output_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    Ok(describe(host.output_devices()?, default_name))
}

/// Find a capture device by name, falling back to the default.
pub fn find_input(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        for device in host.input_devices()? {
            if device.name().ok().as_deref() == Some(name) {
                return Ok(device);
            }
        }
    }
    host.default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no input device available"))
}

/// Find a playback device by name, falling back to the default.
pub fn find_output(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        for device in host.output_devices()? {
            if device.name().ok().as_deref() == Some(name) {
                return Ok(device);
            }
        }
    }
    host.default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device available"))
}
