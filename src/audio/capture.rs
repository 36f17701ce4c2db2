//! Microphone capture via cpal, with two strategies behind one facade.
//!
//! *Echo-cancelled*: the FDAF filter subtracts playback audio from the
//! mic signal and an energy detector on the cleaned frame supplies the
//! per-frame voice-active flag, so the monitor needs no VAD of its own.
//!
//! *Plain*: raw frames, no flag; the monitor runs its own detector.
//!
//! Capture happens at the device's native rate, mixed down to mono and
//! downsampled to the 16kHz pipeline rate in software.

use crate::audio::aec::{AecProcessor, ReferenceBuffer};
use crate::audio::vad::EnergyVad;
use crate::config::{AecConfig, AudioConfig, MonitorConfig};
use crate::error::{DialogueError, Result};
use crate::pipeline::messages::Frame;
use crate::state::events::Event;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Depth of the internal raw-audio channel between the device callback
/// and the strategy loop.
const RAW_CHANNEL_SIZE: usize = 64;

/// Processing applied between the device and the frame queue.
enum Strategy {
    /// FDAF echo cancellation + voice-activity flag.
    EchoCancelled {
        processor: AecProcessor,
        vad: EnergyVad,
    },
    /// Raw frames, no flag.
    Plain,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::EchoCancelled { .. } => "echo-cancelled",
            Self::Plain => "plain",
        }
    }
}

/// Audio capture from the system microphone.
pub struct AudioCapture {
    device: cpal::Device,
    stream_config: StreamConfig,
    target_sample_rate: u32,
    chunk_frames: usize,
    strategy: Strategy,
    paused: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Open the input device and select the capture strategy.
    ///
    /// If echo cancellation is requested but the filter cannot be
    /// constructed, capture falls back to the plain strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn new(
        audio: &AudioConfig,
        aec: &AecConfig,
        monitor: &MonitorConfig,
        reference: ReferenceBuffer,
        paused: Arc<AtomicBool>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(ref name) = audio.input_device {
            let requested = host
                .input_devices()
                .map_err(|e| DialogueError::Device(format!("cannot enumerate devices: {e}")))?
                .find(|d| match d.description() {
                    Ok(desc) => desc.name() == name,
                    Err(_) => false,
                });
            match requested {
                Some(device) => device,
                None => {
                    warn!("input device '{name}' not found, using default input device");
                    host.default_input_device()
                        .ok_or_else(|| DialogueError::Device("no default input device".into()))?
                }
            }
        } else {
            host.default_input_device()
                .ok_or_else(|| DialogueError::Device("no default input device".into()))?
        };

        let device_name = match device.description() {
            Ok(d) => d.name().to_owned(),
            Err(_) => "<unknown>".into(),
        };
        info!("using input device: {device_name}");

        let default_config = device
            .default_input_config()
            .map_err(|e| DialogueError::Device(format!("no default input config: {e}")))?;

        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let strategy = if aec.enabled {
            match AecProcessor::new(aec, reference) {
                Ok(processor) => Strategy::EchoCancelled {
                    processor,
                    vad: EnergyVad::new(monitor.vad_threshold, monitor.vad_window),
                },
                Err(e) => {
                    warn!("echo canceller unavailable ({e}), falling back to plain capture");
                    Strategy::Plain
                }
            }
        } else {
            Strategy::Plain
        };
        info!("capture strategy selected: {}", strategy.name());

        Ok(Self {
            device,
            stream_config,
            target_sample_rate: audio.input_sample_rate,
            chunk_frames: audio.frame_size as usize,
            strategy,
            paused,
        })
    }

    /// Run the capture loop until cancelled, sending frames downstream.
    ///
    /// `ready` is set once the device stream is playing.
    ///
    /// # Errors
    ///
    /// Returns an error if the audio stream cannot be created or started.
    pub async fn run(
        self,
        tx: mpsc::Sender<Frame>,
        ready: Arc<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let native_rate = self.stream_config.sample_rate;
        let native_channels = self.stream_config.channels;
        let target_rate = self.target_sample_rate;
        let chunk_len = self.chunk_frames.max(1);

        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<f32>>(RAW_CHANNEL_SIZE);
        let mut pending: VecDeque<f32> = VecDeque::with_capacity(chunk_len * 4);
        let tx_closed = AtomicBool::new(false);

        let stream = self
            .device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    pending.extend(samples);

                    while pending.len() >= chunk_len {
                        if tx_closed.load(Ordering::Relaxed) {
                            pending.clear();
                            break;
                        }
                        let chunk: Vec<f32> = pending.drain(..chunk_len).collect();
                        match raw_tx.try_send(chunk) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                debug!("capture channel full, dropping chunk");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                tx_closed.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                },
                move |err| {
                    error!("audio input stream error: {err}");
                },
                None,
            )
            .map_err(|e| DialogueError::Device(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| DialogueError::Device(format!("failed to start input stream: {e}")))?;

        info!("audio capture started: native {native_rate}Hz -> target {target_rate}Hz");
        ready.set();

        let mut strategy = self.strategy;
        let paused = self.paused;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                chunk = raw_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if paused.load(Ordering::Relaxed) {
                        continue;
                    }
                    let frame = match strategy {
                        Strategy::EchoCancelled { ref mut processor, ref vad } => {
                            let cleaned = processor.process(&chunk);
                            let voice_active = vad.is_voice_active(&cleaned);
                            Frame {
                                pcm: to_pcm16(&cleaned),
                                voice_active: Some(voice_active),
                            }
                        }
                        Strategy::Plain => Frame {
                            pcm: to_pcm16(&chunk),
                            voice_active: None,
                        },
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }

        drop(stream);
        info!("audio capture stopped");
        Ok(())
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_input_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
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

/// Convert interleaved multi-channel audio to mono by averaging channels.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}

/// Convert float samples to 16-bit PCM.
fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_mixdown_averages_channels() {
        let stereo = [1.0, 0.0, 0.5, 0.5];
        assert_eq!(to_mono(&stereo, 2), vec![0.5, 0.5]);
    }

    #[test]
    fn downsample_halves_length_at_double_rate() {
        let samples = vec![0.25f32; 480];
        let out = downsample(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn pcm16_conversion_clamps() {
        let out = to_pcm16(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], i16::MAX);
        assert_eq!(out[3], i16::MAX);
    }
}
