//! Platform output device abstraction
//!
//! A [`Backend`] answers capability questions and opens streams; the opened
//! stream is a [`Device`]. The sink only ever talks to these two traits.

pub mod capabilities;
#[cfg(feature = "cpal")]
pub mod cpal;
pub mod simulated;

pub use capabilities::{CapabilityCache, CapabilityFamily, DeviceInfo};
#[cfg(feature = "cpal")]
pub use self::cpal::CpalBackend;
pub use simulated::{SimulatedBackend, SimulatedControl};

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::format::Encoding;

/// Stream category a device is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamType {
    #[default]
    Music,
    Movie,
}

/// Parameters for [`Backend::open`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenParams {
    pub device: String,
    pub stream_type: StreamType,
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: Encoding,
    pub buffer_frames: u32,
}

/// Hardware snapshot: `position_frames` had been played at `nanos`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTimestamp {
    pub position_frames: u64,
    pub nanos: u64,
}

/// Static side of a platform binding
pub trait Backend: Send + Sync {
    /// Stable identifier, used to key cached capabilities
    fn name(&self) -> &str;

    /// Probe what the output supports for one format family. Expensive.
    fn enumerate_capabilities(&self, family: CapabilityFamily) -> Result<DeviceInfo, DeviceError>;

    /// Smallest buffer the platform accepts, `None` if the combination is
    /// unsupported
    fn min_buffer_size_frames(&self, sample_rate: u32, channels: u16, encoding: Encoding)
        -> Option<u32>;

    fn open(&self, params: &OpenParams) -> Result<Box<dyn Device>, DeviceError>;
}

/// An opened output stream
pub trait Device: Send {
    /// Queue interleaved device-format bytes. Returns whole frames accepted,
    /// which may be fewer than offered.
    fn write(&mut self, bytes: &[u8]) -> Result<usize, DeviceError>;

    /// Frames played since the stream started. May jump backwards when the
    /// platform restarts the stream internally.
    fn position_frames(&mut self) -> u64;

    /// Latest hardware timestamp, if the platform has one yet
    fn timestamp(&mut self) -> Option<DeviceTimestamp>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Stop after the queued audio has played out
    fn stop(&mut self);

    fn close(&mut self);

    fn is_open(&self) -> bool;
}
