//! Software output device
//!
//! Plays nothing, but keeps the same books a real output stream would: a
//! bounded buffer, a play head driven by a [`Clock`], optional hardware
//! timestamps. Doubles as a null output and as a scriptable device for
//! tests through [`SimulatedControl`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::device::{Backend, CapabilityFamily, Device, DeviceInfo, DeviceTimestamp, OpenParams};
use crate::error::DeviceError;
use crate::format::Encoding;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// How the play head moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadMode {
    /// Advances in real time on the backend clock while playing
    Clocked,
    /// Only moves through [`SimulatedControl::set_position`]
    Manual,
}

#[derive(Debug)]
struct SimState {
    params: Option<OpenParams>,
    open: bool,
    lost: bool,
    playing: bool,
    head_mode: HeadMode,
    timestamps: bool,
    /// Frames accepted since open
    written_frames: u64,
    /// Frames played since open
    played_frames: u64,
    /// Subtracted from the reported position after a simulated restart
    restart_base: u64,
    manual_position: u64,
    manual_timestamp: Option<DeviceTimestamp>,
    last_nanos: u64,
    carry: u128,
    max_frames_per_write: Option<usize>,
    fail_next_write: Option<DeviceError>,
    fail_open: bool,
    bytes: Vec<u8>,
    write_calls: usize,
    pause_calls: usize,
    play_calls: usize,
    stop_calls: usize,
}

impl SimState {
    fn new() -> Self {
        Self {
            params: None,
            open: false,
            lost: false,
            playing: false,
            head_mode: HeadMode::Clocked,
            timestamps: true,
            written_frames: 0,
            played_frames: 0,
            restart_base: 0,
            manual_position: 0,
            manual_timestamp: None,
            last_nanos: 0,
            carry: 0,
            max_frames_per_write: None,
            fail_next_write: None,
            fail_open: false,
            bytes: Vec::new(),
            write_calls: 0,
            pause_calls: 0,
            play_calls: 0,
            stop_calls: 0,
        }
    }

    fn sample_rate(&self) -> u32 {
        self.params.as_ref().map(|p| p.sample_rate).unwrap_or(1)
    }

    fn frame_size(&self) -> usize {
        self.params
            .as_ref()
            .map(|p| p.encoding.frame_size(p.channels))
            .unwrap_or(1)
    }

    fn buffer_frames(&self) -> u64 {
        self.params.as_ref().map(|p| p.buffer_frames as u64).unwrap_or(0)
    }

    /// Move the clocked play head up to `now`
    fn advance(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_nanos);
        self.last_nanos = now;
        if self.head_mode != HeadMode::Clocked || !self.playing {
            self.carry = 0;
            return;
        }
        let total = elapsed as u128 * self.sample_rate() as u128 + self.carry;
        let frames = (total / NANOS_PER_SEC) as u64;
        self.carry = total % NANOS_PER_SEC;
        self.played_frames = (self.played_frames + frames).min(self.written_frames);
    }

    fn reported_position(&self) -> u64 {
        match self.head_mode {
            HeadMode::Clocked => self.played_frames.saturating_sub(self.restart_base),
            HeadMode::Manual => self.manual_position,
        }
    }

    fn queued_frames(&self) -> u64 {
        match self.head_mode {
            HeadMode::Clocked => self.written_frames - self.played_frames,
            HeadMode::Manual => self.written_frames.saturating_sub(self.manual_position),
        }
    }
}

/// Handle for inspecting and scripting a simulated device
#[derive(Clone)]
pub struct SimulatedControl {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedControl {
    pub fn set_head_mode(&self, mode: HeadMode) {
        self.state.lock().head_mode = mode;
    }

    /// Report `frames` as the play head (manual mode)
    pub fn set_position(&self, frames: u64) {
        self.state.lock().manual_position = frames;
    }

    /// Report a fixed hardware timestamp (manual mode)
    pub fn set_timestamp(&self, timestamp: Option<DeviceTimestamp>) {
        self.state.lock().manual_timestamp = timestamp;
    }

    pub fn set_timestamps_enabled(&self, enabled: bool) {
        self.state.lock().timestamps = enabled;
    }

    /// Cap how many frames a single write may take
    pub fn set_max_frames_per_write(&self, frames: Option<usize>) {
        self.state.lock().max_frames_per_write = frames;
    }

    pub fn fail_next_write(&self, error: DeviceError) {
        self.state.lock().fail_next_write = Some(error);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// The platform restarted the stream: the reported position drops to 0
    pub fn simulate_restart(&self) {
        let mut state = self.state.lock();
        state.restart_base = state.played_frames;
        state.manual_position = 0;
    }

    /// Device disappears; every later write fails with `Lost`
    pub fn lose_device(&self) {
        let mut state = self.state.lock();
        state.lost = true;
        state.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn params(&self) -> Option<OpenParams> {
        self.state.lock().params.clone()
    }

    pub fn written_frames(&self) -> u64 {
        self.state.lock().written_frames
    }

    pub fn played_frames(&self) -> u64 {
        self.state.lock().played_frames
    }

    pub fn queued_frames(&self) -> u64 {
        self.state.lock().queued_frames()
    }

    /// Every byte the device accepted, in order
    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    pub fn pause_calls(&self) -> usize {
        self.state.lock().pause_calls
    }

    pub fn play_calls(&self) -> usize {
        self.state.lock().play_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().stop_calls
    }
}

/// Backend whose single output is a [`SimulatedDevice`]
pub struct SimulatedBackend {
    name: String,
    capabilities: HashMap<CapabilityFamily, DeviceInfo>,
    min_buffer_frames: u32,
    clock: SharedClock,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    /// Backend with a typical capability set: float PCM up to 8 channels,
    /// AC3/E-AC3/DTS direct and IEC 61937 packed passthrough
    pub fn new(clock: SharedClock) -> Self {
        let mut capabilities = HashMap::new();
        capabilities.insert(
            CapabilityFamily::Pcm,
            DeviceInfo {
                family: CapabilityFamily::Pcm,
                supported_encodings: vec![Encoding::Pcm16, Encoding::PcmFloat],
                supported_sample_rates: vec![22050, 32000, 44100, 48000, 88200, 96000, 192000],
                supported_channels: vec![1, 2, 4, 6, 8],
                supports_float: true,
            },
        );
        capabilities.insert(
            CapabilityFamily::Raw,
            DeviceInfo {
                family: CapabilityFamily::Raw,
                supported_encodings: vec![Encoding::Ac3, Encoding::Eac3, Encoding::Dts],
                supported_sample_rates: vec![32000, 44100, 48000],
                supported_channels: vec![2],
                supports_float: false,
            },
        );
        capabilities.insert(
            CapabilityFamily::Iec61937,
            DeviceInfo {
                family: CapabilityFamily::Iec61937,
                supported_encodings: vec![Encoding::Iec61937],
                supported_sample_rates: vec![44100, 48000, 192000],
                supported_channels: vec![2, 8],
                supports_float: false,
            },
        );

        Self {
            name: "simulated".to_string(),
            capabilities,
            min_buffer_frames: 1024,
            clock,
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capabilities(mut self, info: DeviceInfo) -> Self {
        self.capabilities.insert(info.family, info);
        self
    }

    pub fn without_family(mut self, family: CapabilityFamily) -> Self {
        self.capabilities.remove(&family);
        self
    }

    pub fn with_min_buffer_frames(mut self, frames: u32) -> Self {
        self.min_buffer_frames = frames;
        self
    }

    pub fn control(&self) -> SimulatedControl {
        SimulatedControl {
            state: self.state.clone(),
        }
    }
}

impl Backend for SimulatedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn enumerate_capabilities(&self, family: CapabilityFamily) -> Result<DeviceInfo, DeviceError> {
        self.capabilities
            .get(&family)
            .cloned()
            .ok_or_else(|| DeviceError::Probe(format!("{} output not available", family.label())))
    }

    fn min_buffer_size_frames(&self, sample_rate: u32, channels: u16, encoding: Encoding) -> Option<u32> {
        let supported = self.capabilities.values().any(|info| {
            info.supports(encoding)
                && info.supported_sample_rates.contains(&sample_rate)
                && info.supported_channels.contains(&channels)
        });
        supported.then_some(self.min_buffer_frames)
    }

    fn open(&self, params: &OpenParams) -> Result<Box<dyn Device>, DeviceError> {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(DeviceError::Open(format!("{} refused to open", params.device)));
        }

        let fresh = SimState {
            params: Some(params.clone()),
            open: true,
            head_mode: state.head_mode,
            timestamps: state.timestamps,
            max_frames_per_write: state.max_frames_per_write,
            last_nanos: now,
            ..SimState::new()
        };
        *state = fresh;

        tracing::debug!(
            "Simulated device opened: {} Hz, {} ch, {:?}, {} frame buffer",
            params.sample_rate,
            params.channels,
            params.encoding,
            params.buffer_frames
        );

        Ok(Box::new(SimulatedDevice {
            state: self.state.clone(),
            clock: self.clock.clone(),
        }))
    }
}

/// Output stream of a [`SimulatedBackend`]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    clock: SharedClock,
}

impl Device for SimulatedDevice {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, DeviceError> {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock();
        if state.lost || !state.open {
            return Err(DeviceError::Lost("device is closed".into()));
        }
        if let Some(error) = state.fail_next_write.take() {
            return Err(error);
        }
        state.advance(now);
        state.write_calls += 1;

        let frame_size = state.frame_size();
        let offered = bytes.len() / frame_size;
        let free = state.buffer_frames().saturating_sub(state.queued_frames()) as usize;
        let mut accepted = offered.min(free);
        if let Some(limit) = state.max_frames_per_write {
            accepted = accepted.min(limit);
        }

        state.bytes.extend_from_slice(&bytes[..accepted * frame_size]);
        state.written_frames += accepted as u64;
        Ok(accepted)
    }

    fn position_frames(&mut self) -> u64 {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock();
        state.advance(now);
        state.reported_position()
    }

    fn timestamp(&mut self) -> Option<DeviceTimestamp> {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock();
        state.advance(now);
        if !state.timestamps {
            return None;
        }
        match state.head_mode {
            HeadMode::Manual => state.manual_timestamp,
            HeadMode::Clocked => {
                let position = state.reported_position();
                (position > 0).then_some(DeviceTimestamp {
                    position_frames: position,
                    nanos: now,
                })
            }
        }
    }

    fn play(&mut self) {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock();
        state.advance(now);
        state.play_calls += 1;
        state.playing = true;
    }

    fn pause(&mut self) {
        let now = self.clock.now_nanos();
        let mut state = self.state.lock();
        state.advance(now);
        state.pause_calls += 1;
        state.playing = false;
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.stop_calls += 1;
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.open = false;
        state.playing = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::StreamType;
    use std::time::Duration;

    fn open(backend: &SimulatedBackend, buffer_frames: u32) -> Box<dyn Device> {
        let mut device = backend
            .open(&OpenParams {
                device: "sim".into(),
                stream_type: StreamType::Music,
                sample_rate: 48000,
                channels: 2,
                encoding: Encoding::Pcm16,
                buffer_frames,
            })
            .unwrap();
        device.play();
        device
    }

    #[test]
    fn test_head_follows_clock_and_stops_at_written() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = SimulatedBackend::new(clock.clone());
        let mut device = open(&backend, 4800);

        assert_eq!(device.write(&vec![0u8; 960 * 4]).unwrap(), 960);
        clock.advance(Duration::from_millis(10));
        assert_eq!(device.position_frames(), 480);

        clock.advance(Duration::from_millis(100));
        assert_eq!(device.position_frames(), 960);
    }

    #[test]
    fn test_full_buffer_accepts_partial_write() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = SimulatedBackend::new(clock);
        let mut device = open(&backend, 1000);

        assert_eq!(device.write(&vec![0u8; 800 * 4]).unwrap(), 800);
        assert_eq!(device.write(&vec![0u8; 800 * 4]).unwrap(), 200);
        assert_eq!(backend.control().queued_frames(), 1000);
    }

    #[test]
    fn test_paused_head_does_not_move() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = SimulatedBackend::new(clock.clone());
        let mut device = open(&backend, 4800);

        device.write(&vec![0u8; 4800 * 4]).unwrap();
        device.pause();
        clock.advance(Duration::from_millis(50));
        assert_eq!(device.position_frames(), 0);

        device.play();
        clock.advance(Duration::from_millis(50));
        assert_eq!(device.position_frames(), 2400);
    }

    #[test]
    fn test_restart_resets_reported_position() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = SimulatedBackend::new(clock.clone());
        let mut device = open(&backend, 9600);

        device.write(&vec![0u8; 9600 * 4]).unwrap();
        clock.advance(Duration::from_millis(100));
        assert_eq!(device.position_frames(), 4800);

        backend.control().simulate_restart();
        assert_eq!(device.position_frames(), 0);
    }

    #[test]
    fn test_unknown_family_probe_fails() {
        let clock = Arc::new(ManualClock::new(0));
        let backend = SimulatedBackend::new(clock).without_family(CapabilityFamily::Raw);
        assert!(backend.enumerate_capabilities(CapabilityFamily::Raw).is_err());
        assert_eq!(backend.min_buffer_size_frames(48000, 2, Encoding::Pcm16), Some(1024));
        assert_eq!(backend.min_buffer_size_frames(12345, 2, Encoding::Pcm16), None);
    }
}
