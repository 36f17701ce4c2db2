//! Audio playback to the system speakers.

use crate::config::AudioConfig;
use crate::error::{DialogueError, Result};
use crate::pipeline::messages::AudioClip;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Something that can play one clip to completion.
///
/// `play` blocks until the clip has finished; interruption takes effect
/// only at clip boundaries, never mid-clip.
pub trait AudioPlayer: Send {
    /// Play `clip` synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stream cannot be created or started.
    fn play(&mut self, clip: &AudioClip) -> Result<()>;
}

/// Speaker playback via cpal.
pub struct CpalPlayer {
    device: cpal::Device,
}

impl CpalPlayer {
    /// Open the output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = config.output_device {
            host.output_devices()
                .map_err(|e| DialogueError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| DialogueError::Device(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| DialogueError::Device("no default output device".into()))?
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("using output device: {device_name}");

        Ok(Self { device })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| DialogueError::Device(format!("cannot enumerate devices: {e}")))?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

impl AudioPlayer for CpalPlayer {
    fn play(&mut self, clip: &AudioClip) -> Result<()> {
        // The stream is built per clip because each clip carries the
        // engine-reported sample rate.
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: clip.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(PlaybackBuffer {
            samples: clip.samples.clone(),
            position: 0,
            finished: false,
        }));
        let buffer_clone = Arc::clone(&buffer);

        let stream = self
            .device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut buf = match buffer_clone.lock() {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position];
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                },
                None,
            )
            .map_err(|e| DialogueError::Device(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| DialogueError::Device(format!("failed to start output stream: {e}")))?;

        loop {
            std::thread::sleep(std::time::Duration::from_millis(10));
            let buf = buffer
                .lock()
                .map_err(|e| DialogueError::Device(format!("playback buffer poisoned: {e}")))?;
            if buf.finished {
                break;
            }
        }

        drop(stream);
        Ok(())
    }
}

/// Internal buffer tracking playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}
