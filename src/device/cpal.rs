//! cpal output backend
//!
//! The cpal stream lives on its own thread and pulls f32 samples from a
//! lock-free queue the sink fills.
//! Device bytes are unpacked back to f32 on write, so both PCM encodings are
//! offered whenever the device has any output configuration.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::bounded;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::monotonic_nanos;
use crate::constants::PROBE_SAMPLE_RATES;
use crate::device::{Backend, CapabilityFamily, Device, DeviceInfo, DeviceTimestamp, OpenParams};
use crate::error::DeviceError;
use crate::format::Encoding;

/// Names of all cpal output devices on the default host
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            tracing::warn!("Failed to list output devices: {}", e);
            Vec::new()
        }
    }
}

/// Backend for one cpal output device
pub struct CpalBackend {
    /// `None` selects the host default
    device_name: Option<String>,
    id: String,
}

impl CpalBackend {
    pub fn default_output() -> Self {
        Self {
            device_name: None,
            id: "cpal:default".to_string(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("cpal:{}", name),
            device_name: Some(name),
        }
    }

    fn find_device(&self) -> Result<cpal::Device, DeviceError> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| DeviceError::Open("No default output device".to_string())),
            Some(name) => {
                let devices = host
                    .output_devices()
                    .map_err(|e| DeviceError::Backend(e.to_string()))?;
                for device in devices {
                    if device.name().map(|n| &n == name).unwrap_or(false) {
                        return Ok(device);
                    }
                }
                Err(DeviceError::Open(format!("Output device not found: {}", name)))
            }
        }
    }

    fn output_configs(&self) -> Result<Vec<cpal::SupportedStreamConfigRange>, DeviceError> {
        self.find_device()?
            .supported_output_configs()
            .map(|iter| iter.collect())
            .map_err(|e| DeviceError::Probe(e.to_string()))
    }
}

impl Backend for CpalBackend {
    fn name(&self) -> &str {
        &self.id
    }

    fn enumerate_capabilities(&self, family: CapabilityFamily) -> Result<DeviceInfo, DeviceError> {
        if family != CapabilityFamily::Pcm {
            return Ok(DeviceInfo::unsupported(family));
        }

        let configs = self.output_configs()?;
        let mut info = DeviceInfo::unsupported(family);
        for config in &configs {
            for rate_val in PROBE_SAMPLE_RATES {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !info.supported_sample_rates.contains(&rate_val)
                {
                    info.supported_sample_rates.push(rate_val);
                }
            }
            if !info.supported_channels.contains(&config.channels()) {
                info.supported_channels.push(config.channels());
            }
            if config.sample_format() == cpal::SampleFormat::F32 {
                info.supports_float = true;
            }
        }
        if !configs.is_empty() {
            info.supported_encodings = vec![Encoding::Pcm16, Encoding::PcmFloat];
        }
        Ok(info)
    }

    fn min_buffer_size_frames(&self, sample_rate: u32, channels: u16, encoding: Encoding) -> Option<u32> {
        if !encoding.is_pcm() {
            return None;
        }
        let rate = cpal::SampleRate(sample_rate);
        let configs = self.output_configs().ok()?;
        let config = configs.iter().find(|c| {
            c.channels() == channels && rate >= c.min_sample_rate() && rate <= c.max_sample_rate()
        })?;
        // 10 ms floor; 20 ms when the host does not say
        match config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => Some((*min).max(sample_rate / 100)),
            cpal::SupportedBufferSize::Unknown => Some(sample_rate / 50),
        }
    }

    fn open(&self, params: &OpenParams) -> Result<Box<dyn Device>, DeviceError> {
        if !params.encoding.is_pcm() {
            return Err(DeviceError::Open(format!(
                "{:?} passthrough is not available through cpal",
                params.encoding
            )));
        }
        let device = self.find_device()?;
        CpalDevice::start(device, params).map(|d| Box::new(d) as Box<dyn Device>)
    }
}

/// State shared with the stream callback
struct Shared {
    queue: ArrayQueue<f32>,
    channels: usize,
    played_frames: AtomicU64,
    stamp: Mutex<Option<DeviceTimestamp>>,
    paused: AtomicBool,
    running: AtomicBool,
    lost: AtomicBool,
}

/// Output stream on a cpal device
pub struct CpalDevice {
    shared: Arc<Shared>,
    encoding: Encoding,
    frame_size: usize,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalDevice {
    fn start(device: cpal::Device, params: &OpenParams) -> Result<Self, DeviceError> {
        let channels = params.channels as usize;
        let config = cpal::StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(Shared {
            queue: ArrayQueue::new((params.buffer_frames as usize * channels).max(channels)),
            channels,
            played_frames: AtomicU64::new(0),
            stamp: Mutex::new(None),
            paused: AtomicBool::new(true),
            running: AtomicBool::new(true),
            lost: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let callback_shared = shared.clone();
        let error_shared = shared.clone();
        let loop_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(format!("audiotrack-{}", params.device))
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_output(&callback_shared, data);
                    },
                    move |err| {
                        tracing::error!("Output stream error: {}", err);
                        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                            error_shared.lost.store(true, Ordering::SeqCst);
                        }
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while loop_shared.running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping playback
            })
            .map_err(|e| DeviceError::Open(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                encoding: params.encoding,
                frame_size: params.encoding.frame_size(params.channels),
                thread_handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(DeviceError::Open(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(DeviceError::Open("output thread exited during startup".to_string()))
            }
        }
    }
}

fn fill_output(shared: &Shared, data: &mut [f32]) {
    let mut filled = 0;
    if shared.paused.load(Ordering::Relaxed) {
        data.fill(0.0);
    } else {
        for sample in data.iter_mut() {
            match shared.queue.pop() {
                Some(s) => {
                    *sample = s;
                    filled += 1;
                }
                None => *sample = 0.0,
            }
        }
    }

    let frames = (filled / shared.channels) as u64;
    let position = shared.played_frames.fetch_add(frames, Ordering::SeqCst) + frames;
    // Stamped on every callback, paused or starved
    if position > 0 {
        if let Some(mut stamp) = shared.stamp.try_lock() {
            *stamp = Some(DeviceTimestamp {
                position_frames: position,
                nanos: monotonic_nanos(),
            });
        }
    }
}

impl Device for CpalDevice {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, DeviceError> {
        if !self.is_open() {
            return Err(DeviceError::Lost("output stream is gone".to_string()));
        }
        let channels = self.shared.channels;
        let offered = bytes.len() / self.frame_size;
        let free = (self.shared.queue.capacity() - self.shared.queue.len()) / channels;
        let frames = offered.min(free);
        let sample_bytes = self.frame_size / channels;

        for chunk in bytes[..frames * self.frame_size].chunks_exact(sample_bytes) {
            let sample = match self.encoding {
                Encoding::Pcm16 => crate::audio::convert::i16_to_f32(i16::from_le_bytes([chunk[0], chunk[1]])),
                _ => f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            };
            if self.shared.queue.push(sample).is_err() {
                return Err(DeviceError::Write("sample queue overflowed".to_string()));
            }
        }
        Ok(frames)
    }

    fn position_frames(&mut self) -> u64 {
        self.shared.played_frames.load(Ordering::SeqCst)
    }

    fn timestamp(&mut self) -> Option<DeviceTimestamp> {
        *self.shared.stamp.lock()
    }

    fn play(&mut self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    fn pause(&mut self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        // Queued samples keep playing until the callback runs dry
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_open(&self) -> bool {
        self.thread_handle.is_some() && !self.shared.lost.load(Ordering::SeqCst)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}
