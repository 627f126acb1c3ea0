//! Audio formats and format negotiation
//!
//! Pure functions only: nothing here touches a device, so negotiation can be
//! tested against hand-built capability sets.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{IEC61937_FRAME_SIZE, MAX_CHANNELS};
use crate::device::{CapabilityFamily, DeviceInfo};
use crate::error::SinkError;

/// Compressed bitstreams that can be passed through untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassthroughStream {
    Ac3,
    Eac3,
    Dts,
    DtsHd,
    TrueHd,
}

/// Sample layout handed to the sink by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Interleaved f32 in [-1.0, 1.0]
    F32,
    /// Interleaved signed 16-bit
    S16,
    /// Encoded bitstream, already framed by the pipeline
    Raw(PassthroughStream),
}

/// Encoding the device stream is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Pcm16,
    PcmFloat,
    /// Any passthrough stream packed into IEC 61937 bursts
    Iec61937,
    Ac3,
    Eac3,
    Dts,
    DtsHd,
    TrueHd,
}

impl Encoding {
    /// Encoding used when `stream` is written to the device as-is
    pub fn for_stream(stream: PassthroughStream) -> Self {
        match stream {
            PassthroughStream::Ac3 => Encoding::Ac3,
            PassthroughStream::Eac3 => Encoding::Eac3,
            PassthroughStream::Dts => Encoding::Dts,
            PassthroughStream::DtsHd => Encoding::DtsHd,
            PassthroughStream::TrueHd => Encoding::TrueHd,
        }
    }

    pub fn is_pcm(&self) -> bool {
        matches!(self, Encoding::Pcm16 | Encoding::PcmFloat)
    }

    /// Bytes one device frame occupies with `channels` channels.
    ///
    /// Passthrough streams travel in 16-bit stereo-sized slots.
    pub fn frame_size(&self, channels: u16) -> usize {
        match self {
            Encoding::Pcm16 => 2 * channels as usize,
            Encoding::PcmFloat => 4 * channels as usize,
            _ => IEC61937_FRAME_SIZE * (channels as usize / 2).max(1),
        }
    }
}

/// Format requested by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// Capability families worth probing for this format, in preference order
    pub fn candidate_families(&self) -> &'static [CapabilityFamily] {
        match self.sample_format {
            SampleFormat::F32 | SampleFormat::S16 => &[CapabilityFamily::Pcm],
            SampleFormat::Raw(_) => &[CapabilityFamily::Raw, CapabilityFamily::Iec61937],
        }
    }
}

/// What a session settled on after initialize
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub sample_rate: u32,
    pub input_channels: u16,
    pub device_channels: u16,
    pub sample_format: SampleFormat,
    pub encoding: Encoding,
    /// Device bytes per frame
    pub frame_size: usize,
    /// Frames the pipeline should hand over per `add_packets` call
    pub period_frames: u32,
    pub buffer_frames: u32,
    pub min_buffer_frames: u32,
}

impl NegotiatedFormat {
    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    /// Device buffer capacity in seconds
    pub fn buffer_secs(&self) -> f64 {
        self.frames_to_secs(self.buffer_frames as u64)
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames_to_secs(self.period_frames as u64))
    }

    pub fn is_passthrough(&self) -> bool {
        !self.encoding.is_pcm()
    }
}

/// Outcome of checking a format against one capability family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedConfiguration {
    pub family: CapabilityFamily,
    pub encoding: Encoding,
    pub device_channels: u16,
}

/// Check `format` against a probed capability set.
///
/// Picks the device encoding and the narrowest supported channel count that
/// can hold the input frame.
pub fn verify_sink_configuration(
    format: &AudioFormat,
    info: &DeviceInfo,
) -> Result<VerifiedConfiguration, SinkError> {
    if format.channels == 0 || format.channels > MAX_CHANNELS {
        return Err(SinkError::ConfigurationUnsupported(format!(
            "{} channels",
            format.channels
        )));
    }
    if info.is_empty() {
        return Err(SinkError::ConfigurationUnsupported(format!(
            "no {:?} capabilities",
            info.family
        )));
    }
    if !info.supported_sample_rates.contains(&format.sample_rate) {
        return Err(SinkError::ConfigurationUnsupported(format!(
            "sample rate {} Hz not supported for {:?}",
            format.sample_rate, info.family
        )));
    }

    let encoding = match (format.sample_format, info.family) {
        (SampleFormat::F32, CapabilityFamily::Pcm) => {
            if info.supports_float && info.supports(Encoding::PcmFloat) {
                Encoding::PcmFloat
            } else {
                Encoding::Pcm16
            }
        }
        (SampleFormat::S16, CapabilityFamily::Pcm) => Encoding::Pcm16,
        (SampleFormat::Raw(stream), CapabilityFamily::Raw) => Encoding::for_stream(stream),
        (SampleFormat::Raw(_), CapabilityFamily::Iec61937) => Encoding::Iec61937,
        (sample_format, family) => {
            return Err(SinkError::ConfigurationUnsupported(format!(
                "{:?} input cannot use {:?} capabilities",
                sample_format, family
            )))
        }
    };
    if !info.supports(encoding) {
        return Err(SinkError::ConfigurationUnsupported(format!(
            "encoding {:?} not supported",
            encoding
        )));
    }

    let device_channels = info
        .supported_channels
        .iter()
        .copied()
        .filter(|&c| c >= format.channels)
        .min()
        .ok_or_else(|| {
            SinkError::ConfigurationUnsupported(format!(
                "no device layout holds {} channels",
                format.channels
            ))
        })?;

    Ok(VerifiedConfiguration {
        family: info.family,
        encoding,
        device_channels,
    })
}

/// Device buffer size in frames for a backend minimum
pub fn buffer_frames_for(
    min_buffer_frames: u32,
    sample_rate: u32,
    buffer_multiplier: u32,
    min_buffer_ms: u32,
) -> u32 {
    let scaled = min_buffer_frames.saturating_mul(buffer_multiplier);
    let floor = (sample_rate as u64 * min_buffer_ms as u64 / 1000) as u32;
    scaled.max(floor).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_info(float: bool) -> DeviceInfo {
        let mut encodings = vec![Encoding::Pcm16];
        if float {
            encodings.push(Encoding::PcmFloat);
        }
        DeviceInfo {
            family: CapabilityFamily::Pcm,
            supported_encodings: encodings,
            supported_sample_rates: vec![44100, 48000],
            supported_channels: vec![1, 2, 4, 6, 8],
            supports_float: float,
        }
    }

    #[test]
    fn test_float_input_prefers_float_encoding() {
        let format = AudioFormat::new(48000, 2, SampleFormat::F32);
        let verified = verify_sink_configuration(&format, &pcm_info(true)).unwrap();
        assert_eq!(verified.encoding, Encoding::PcmFloat);
        assert_eq!(verified.device_channels, 2);

        let verified = verify_sink_configuration(&format, &pcm_info(false)).unwrap();
        assert_eq!(verified.encoding, Encoding::Pcm16);
    }

    #[test]
    fn test_odd_channel_count_aligns_up() {
        let format = AudioFormat::new(48000, 3, SampleFormat::S16);
        let verified = verify_sink_configuration(&format, &pcm_info(false)).unwrap();
        assert_eq!(verified.device_channels, 4);
    }

    #[test]
    fn test_unsupported_rate_rejected() {
        let format = AudioFormat::new(96000, 2, SampleFormat::S16);
        let err = verify_sink_configuration(&format, &pcm_info(true)).unwrap_err();
        assert!(matches!(err, SinkError::ConfigurationUnsupported(_)));
    }

    #[test]
    fn test_raw_against_pcm_family_rejected() {
        let format = AudioFormat::new(48000, 2, SampleFormat::Raw(PassthroughStream::Ac3));
        assert!(verify_sink_configuration(&format, &pcm_info(true)).is_err());
    }

    #[test]
    fn test_raw_stream_uses_iec_when_only_packed_supported() {
        let info = DeviceInfo {
            family: CapabilityFamily::Iec61937,
            supported_encodings: vec![Encoding::Iec61937],
            supported_sample_rates: vec![48000, 192000],
            supported_channels: vec![2, 8],
            supports_float: false,
        };
        let format = AudioFormat::new(48000, 2, SampleFormat::Raw(PassthroughStream::Dts));
        let verified = verify_sink_configuration(&format, &info).unwrap();
        assert_eq!(verified.encoding, Encoding::Iec61937);
        assert_eq!(Encoding::Iec61937.frame_size(8), 16);
    }

    #[test]
    fn test_buffer_sizing_respects_floor() {
        // 2 x 1024 frames is below the 100 ms floor at 48 kHz
        assert_eq!(buffer_frames_for(1024, 48000, 2, 100), 4800);
        assert_eq!(buffer_frames_for(4096, 48000, 2, 100), 8192);
    }
}
