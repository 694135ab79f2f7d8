//! Microphone and speaker devices using CPAL (Cross-Platform Audio Library).

use crate::audio::player::AudioSink;
use crate::audio::recorder::AudioSource;
use crate::audio::wav::{resample, resample_f32};
use crate::error::{Result, VoxError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Preferred device names for PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for a voice session.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// List usable input and output device names, preferred ones first.
pub fn list_devices() -> Result<(Vec<String>, Vec<String>)> {
    let host = cpal::default_host();
    let enumerate_failed = |e: cpal::DevicesError| VoxError::Device {
        message: format!("Failed to enumerate devices: {}", e),
    };

    let inputs = usable_names(host.input_devices().map_err(enumerate_failed)?);
    let outputs = usable_names(host.output_devices().map_err(enumerate_failed)?);
    Ok((inputs, outputs))
}

fn usable_names(devices: impl Iterator<Item = cpal::Device>) -> Vec<String> {
    let mut names: Vec<String> = devices
        .filter_map(|d| d.name().ok())
        .filter(|name| !should_filter_device(name))
        .collect();
    names.sort_by_key(|name| !is_preferred_device(name));
    names
}

enum Direction {
    Input,
    Output,
}

fn find_device(name: Option<&str>, direction: Direction) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let devices = match direction {
        Direction::Input => host.input_devices(),
        Direction::Output => host.output_devices(),
    }
    .map_err(|e| VoxError::Device {
        message: format!("Failed to enumerate devices: {}", e),
    })?;

    let mut preferred = None;
    for device in devices {
        let Ok(device_name) = device.name() else {
            continue;
        };
        match name {
            Some(wanted) if device_name == wanted => return Ok(device),
            None if preferred.is_none() && is_preferred_device(&device_name) => {
                preferred = Some(device)
            }
            _ => {}
        }
    }

    if let Some(wanted) = name {
        return Err(VoxError::DeviceNotFound {
            device: wanted.to_string(),
        });
    }

    preferred
        .or_else(|| match direction {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        })
        .ok_or_else(|| VoxError::DeviceNotFound {
            device: "default".to_string(),
        })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only touched through the owning struct's `&mut self`
/// methods, never from two threads at once.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture producing 16-bit mono PCM at the configured rate.
///
/// Tries the preferred format first (i16/mono at the capture rate), then
/// falls back to the device's native config with software conversion.
pub struct CpalAudioSource {
    device: cpal::Device,
    stream: Option<SendableStream>,
    buffer: Arc<Mutex<Vec<i16>>>,
    callback_count: Arc<AtomicU64>,
    sample_rate: u32,
}

impl CpalAudioSource {
    pub fn new(device_name: Option<&str>, sample_rate: u32) -> Result<Self> {
        let device = find_device(device_name, Direction::Input)?;
        if let Ok(name) = device.name() {
            tracing::info!(device = %name, sample_rate, "opened input device");
        }
        Ok(Self {
            device,
            stream: None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            callback_count: Arc::new(AtomicU64::new(0)),
            sample_rate,
        })
    }

    fn build_preferred_stream(&self) -> Result<cpal::Stream> {
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);

        self.device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| tracing::error!(error = %err, "input stream error"),
                None,
            )
            .map_err(|e| VoxError::Device {
                message: format!("Failed to build input stream: {}", e),
            })
    }

    /// Capture at the device's native config and convert in software.
    fn build_native_stream(&self) -> Result<cpal::Stream> {
        let default_config = self
            .device
            .default_input_config()
            .map_err(|e| VoxError::Device {
                message: format!("Failed to query default input config: {}", e),
            })?;

        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();
        tracing::info!(
            channels,
            native_rate,
            format = ?default_config.sample_format(),
            "using native input format, converting in software"
        );

        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.callback_count);
        let push = move |data: Vec<i16>| {
            counter.fetch_add(1, Ordering::Relaxed);
            let converted = to_mono(&data, channels, native_rate, target_rate);
            if let Ok(mut buf) = buffer.lock() {
                buf.extend_from_slice(&converted);
            }
        };
        let err_callback = |err| tracing::error!(error = %err, "input stream error");

        match default_config.sample_format() {
            cpal::SampleFormat::I16 => self.device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| push(data.to_vec()),
                err_callback,
                None,
            ),
            cpal::SampleFormat::F32 => self.device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push(
                        data.iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                            .collect(),
                    )
                },
                err_callback,
                None,
            ),
            fmt => {
                return Err(VoxError::Device {
                    message: format!("Unsupported native sample format: {:?}", fmt),
                });
            }
        }
        .map_err(|e| VoxError::Device {
            message: format!("Failed to build native input stream: {}", e),
        })
    }
}

fn to_mono(samples: &[i16], channels: usize, source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels <= 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };
    resample(&mono, source_rate, target_rate)
}

impl AudioSource for CpalAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let play = |stream: cpal::Stream| -> Result<cpal::Stream> {
            stream.play().map_err(|e| VoxError::Device {
                message: format!("Failed to start input stream: {}", e),
            })?;
            Ok(stream)
        };

        let stream = match self.build_preferred_stream() {
            Ok(stream) => {
                let stream = play(stream)?;
                // Some PipeWire-ALSA setups accept the config but never call back
                std::thread::sleep(Duration::from_millis(200));
                if self.callback_count.load(Ordering::Relaxed) == 0 {
                    drop(stream);
                    if let Ok(mut buf) = self.buffer.lock() {
                        buf.clear();
                    }
                    play(self.build_native_stream()?)?
                } else {
                    stream
                }
            }
            Err(_) => play(self.build_native_stream()?)?,
        };

        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| VoxError::Device {
                message: format!("Failed to stop input stream: {}", e),
            })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| VoxError::Device {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;
        Ok(std::mem::take(&mut *buffer))
    }
}

/// Samples waiting for the output callback plus a "drained" signal.
#[derive(Default)]
struct OutputQueue {
    samples: Mutex<VecDeque<f32>>,
    drained: Condvar,
}

/// Speaker output. `play` blocks until the device has consumed the buffer.
pub struct CpalAudioSink {
    queue: Arc<OutputQueue>,
    _stream: SendableStream,
    device_rate: u32,
    channels: usize,
}

impl CpalAudioSink {
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let device = find_device(device_name, Direction::Output)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| VoxError::Device {
                message: format!("Failed to query default output config: {}", e),
            })?;
        let device_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let stream_config: cpal::StreamConfig = default_config.clone().into();
        let queue = Arc::new(OutputQueue::default());

        let fill = {
            let queue = Arc::clone(&queue);
            move |out: &mut [f32]| {
                let Ok(mut pending) = queue.samples.lock() else {
                    out.fill(0.0);
                    return;
                };
                for slot in out.iter_mut() {
                    *slot = pending.pop_front().unwrap_or(0.0);
                }
                if pending.is_empty() {
                    queue.drained.notify_all();
                }
            }
        };
        let err_callback = |err| tracing::error!(error = %err, "output stream error");

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill(data),
                err_callback,
                None,
            ),
            cpal::SampleFormat::I16 => {
                let mut scratch = Vec::new();
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        scratch.resize(data.len(), 0.0f32);
                        fill(&mut scratch);
                        for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                            *dst = (src.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                        }
                    },
                    err_callback,
                    None,
                )
            }
            fmt => {
                return Err(VoxError::Device {
                    message: format!("Unsupported output sample format: {:?}", fmt),
                });
            }
        }
        .map_err(|e| VoxError::Device {
            message: format!("Failed to build output stream: {}", e),
        })?;

        stream.play().map_err(|e| VoxError::Device {
            message: format!("Failed to start output stream: {}", e),
        })?;
        if let Ok(name) = device.name() {
            tracing::info!(device = %name, device_rate, channels, "opened output device");
        }

        Ok(Self {
            queue,
            _stream: SendableStream(stream),
            device_rate,
            channels,
        })
    }
}

impl AudioSink for CpalAudioSink {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        let converted = resample_f32(samples, sample_rate, self.device_rate);
        let expected = Duration::from_secs_f64(converted.len() as f64 / self.device_rate as f64);

        let mut pending = self.queue.samples.lock().map_err(|e| VoxError::Device {
            message: format!("Failed to lock output queue: {}", e),
        })?;
        for sample in converted {
            for _ in 0..self.channels {
                pending.push_back(sample);
            }
        }

        // A stalled device must not hang the playback stage forever
        let deadline = expected + Duration::from_secs(2);
        let (_pending, timeout) = self
            .queue
            .drained
            .wait_timeout_while(pending, deadline, |p| !p.is_empty())
            .map_err(|e| VoxError::Device {
                message: format!("Output queue poisoned: {}", e),
            })?;
        if timeout.timed_out() {
            return Err(VoxError::Device {
                message: "output device stopped consuming audio".to_string(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}
