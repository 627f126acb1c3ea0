//! Packing of pipeline samples into device byte layouts
//!
//! One converter per session. The output buffer is kept between calls so the
//! write path does not allocate once it has warmed up.

use crate::error::SinkError;
use crate::format::{Encoding, NegotiatedFormat, SampleFormat};

/// Interleaved input handed to the sink
#[derive(Debug, Clone, Copy)]
pub enum PacketData<'a> {
    F32(&'a [f32]),
    S16(&'a [i16]),
    /// Encoded bitstream bytes
    Bytes(&'a [u8]),
}

impl PacketData<'_> {
    fn kind(&self) -> &'static str {
        match self {
            PacketData::F32(_) => "f32",
            PacketData::S16(_) => "s16",
            PacketData::Bytes(_) => "bytes",
        }
    }
}

/// Convert one f32 sample to signed 16-bit, clamping out-of-range input
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Turns pipeline frames into device bytes
pub struct SampleConverter {
    sample_format: SampleFormat,
    encoding: Encoding,
    input_channels: usize,
    device_channels: usize,
    frame_size: usize,
    /// Reused output buffer
    out: Vec<u8>,
}

impl SampleConverter {
    pub fn new(format: &NegotiatedFormat) -> Result<Self, SinkError> {
        let converter = Self {
            sample_format: format.sample_format,
            encoding: format.encoding,
            input_channels: format.input_channels as usize,
            device_channels: format.device_channels as usize,
            frame_size: format.frame_size,
            out: Vec::new(),
        };
        converter.check_layout()?;
        Ok(converter)
    }

    fn check_layout(&self) -> Result<(), SinkError> {
        if self.device_channels < self.input_channels {
            return Err(SinkError::UnsupportedFormat(format!(
                "device frame has {} channels, input has {}",
                self.device_channels, self.input_channels
            )));
        }
        let compatible = match self.sample_format {
            SampleFormat::F32 | SampleFormat::S16 => self.encoding.is_pcm(),
            SampleFormat::Raw(_) => !self.encoding.is_pcm(),
        };
        if !compatible {
            return Err(SinkError::UnsupportedFormat(format!(
                "{:?} input cannot be written as {:?}",
                self.sample_format, self.encoding
            )));
        }
        Ok(())
    }

    /// Device bytes per frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Convert `frames` frames starting at frame `offset` of `input`.
    ///
    /// The returned slice borrows the converter's buffer and is only valid
    /// until the next call.
    pub fn convert(
        &mut self,
        input: PacketData<'_>,
        frames: usize,
        offset: usize,
    ) -> Result<&[u8], SinkError> {
        self.out.clear();
        if frames == 0 {
            return Ok(self.out.as_slice());
        }
        let out_len = frames.checked_mul(self.frame_size).ok_or_else(|| {
            SinkError::UnsupportedFormat(format!("{} frames do not fit in memory", frames))
        })?;
        self.out.reserve(out_len);

        match (input, self.encoding) {
            (PacketData::F32(samples), Encoding::Pcm16) => {
                let src = self.input_slice(samples, frames, offset)?;
                self.pack_frames(src, |s, out| out.extend_from_slice(&f32_to_i16(*s).to_le_bytes()), 2);
            }
            (PacketData::S16(samples), Encoding::Pcm16) => {
                let src = self.input_slice(samples, frames, offset)?;
                self.pack_frames(src, |s, out| out.extend_from_slice(&s.to_le_bytes()), 2);
            }
            (PacketData::F32(samples), Encoding::PcmFloat) => {
                let src = self.input_slice(samples, frames, offset)?;
                self.pack_frames(src, |s, out| out.extend_from_slice(&s.to_le_bytes()), 4);
            }
            (PacketData::S16(samples), Encoding::PcmFloat) => {
                let src = self.input_slice(samples, frames, offset)?;
                self.pack_frames(
                    src,
                    |s, out| out.extend_from_slice(&i16_to_f32(*s).to_le_bytes()),
                    4,
                );
            }
            (PacketData::Bytes(bytes), encoding) if !encoding.is_pcm() => {
                let start = offset
                    .checked_mul(self.frame_size)
                    .filter(|&start| start <= bytes.len())
                    .ok_or_else(|| {
                        SinkError::UnsupportedFormat(format!(
                            "offset {} frames past end of {} byte packet",
                            offset,
                            bytes.len()
                        ))
                    })?;
                let end = frames
                    .checked_mul(self.frame_size)
                    .and_then(|len| start.checked_add(len))
                    .map_or(bytes.len(), |end| end.min(bytes.len()));
                self.out.extend_from_slice(&bytes[start..end]);
                // Short final packet: pad up to whole device frames
                self.out.resize(out_len, 0);
            }
            (input, encoding) => {
                return Err(SinkError::UnsupportedFormat(format!(
                    "{} input cannot be written as {:?}",
                    input.kind(),
                    encoding
                )));
            }
        }

        Ok(self.out.as_slice())
    }

    fn input_slice<'a, T>(
        &self,
        samples: &'a [T],
        frames: usize,
        offset: usize,
    ) -> Result<&'a [T], SinkError> {
        let range = offset.checked_mul(self.input_channels).and_then(|start| {
            let end = frames
                .checked_mul(self.input_channels)
                .and_then(|len| start.checked_add(len))?;
            Some(start..end)
        });
        range.and_then(|range| samples.get(range)).ok_or_else(|| {
            SinkError::UnsupportedFormat(format!(
                "need {} frames from offset {}, packet has {} samples",
                frames,
                offset,
                samples.len()
            ))
        })
    }

    /// Interleave `src` into the output, padding each frame with silent
    /// channels up to the device width
    fn pack_frames<T>(&mut self, src: &[T], mut put: impl FnMut(&T, &mut Vec<u8>), sample_bytes: usize) {
        let pad = (self.device_channels - self.input_channels) * sample_bytes;
        if pad == 0 {
            for sample in src {
                put(sample, &mut self.out);
            }
            return;
        }
        for frame in src.chunks_exact(self.input_channels) {
            for sample in frame {
                put(sample, &mut self.out);
            }
            let len = self.out.len();
            self.out.resize(len + pad, 0);
        }
    }
}
