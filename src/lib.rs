//! # AudioTrack Sink
//!
//! Audio output sink that feeds PCM or passthrough frames to a platform
//! output device and reports a smoothed playback delay back to the
//! pipeline that drives it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         UPSTREAM AUDIO PIPELINE                       │
//! │        add_packets / add_pause / drain          delay / latency       │
//! └───────────────┬──────────────────────────────────────▲───────────────┘
//!                 │                                      │
//!                 ▼                                      │
//! ┌──────────────────────────────────────────────────────┴───────────────┐
//! │                       AudioTrackSink (sink)                           │
//! │  ┌─────────────────┐                         ┌──────────────────────┐ │
//! │  │ SampleConverter │                         │    DelaySmoother     │ │
//! │  │ (audio::convert)│                         │  (audio::smoother)   │ │
//! │  └────────┬────────┘                         └──────────▲───────────┘ │
//! │           │                                             │             │
//! │           │                                  ┌──────────┴───────────┐ │
//! │           │                                  │ TimestampReconciler  │ │
//! │           │                                  │  (audio::reconcile)  │ │
//! │           │                                  └──────────▲───────────┘ │
//! └───────────┼─────────────────────────────────────────────┼─────────────┘
//!             │ write(bytes)          position / timestamp  │
//!             ▼                                             │
//! ┌─────────────────────────────────────────────────────────┴─────────────┐
//! │              Device (device::Device)  ◄── Backend::open               │
//! │        simulated software device  |  cpal output stream              │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod sink;

pub use config::SinkConfig;
pub use error::{DeviceError, Error, Result, SinkError};
pub use format::{AudioFormat, Encoding, NegotiatedFormat, SampleFormat};
pub use sink::{enumerate_devices, AudioTrackSink, DelayStatus};

/// Crate-wide constants
pub mod constants {
    /// Name the sink registers under
    pub const SINK_NAME: &str = "AUDIOTRACK";

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Number of delay observations kept by the moving average
    pub const DELAY_HISTORY_CAPACITY: usize = 20;

    /// Largest channel count a device frame may carry
    pub const MAX_CHANNELS: u16 = 8;

    /// Bytes per IEC 61937 frame (two 16-bit subframes)
    pub const IEC61937_FRAME_SIZE: usize = 4;

    /// Rates probed when a backend only reports ranges
    pub const PROBE_SAMPLE_RATES: [u32; 8] =
        [8000, 22050, 32000, 44100, 48000, 88200, 96000, 192000];
}
