//! Audio format descriptions and raw PCM conversion.
//!
//! The canonical textual form is `"<sample_format>,<channels>,<rate>,<i|n>"`
//! (for example the crate default `s16_le,2,44100,i`). The conversion
//! helpers translate between interleaved raw PCM bytes and the planar f32
//! samples used everywhere inside the engine.

use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;
use crate::SampleBuffer;

/// On-disk/on-wire sample encodings understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit little-endian.
    S16Le,
    /// Signed 16-bit big-endian.
    S16Be,
    /// Signed 24-bit little-endian (packed, 3 bytes).
    S24Le,
    /// Signed 24-bit big-endian (packed, 3 bytes).
    S24Be,
    /// Signed 32-bit little-endian.
    S32Le,
    /// Signed 32-bit big-endian.
    S32Be,
    /// IEEE754 32-bit float little-endian, range [-1, +1).
    F32Le,
}

impl SampleFormat {
    /// Bytes occupied by a single sample.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le | Self::S16Be => 2,
            Self::S24Le | Self::S24Be => 3,
            Self::S32Le | Self::S32Be | Self::F32Le => 4,
        }
    }

    /// Bits per sample as stored in a RIFF `fmt ` block.
    pub fn bits(&self) -> u16 {
        (self.bytes_per_sample() * 8) as u16
    }

    /// The format-string token for this encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16Le => "s16_le",
            Self::S16Be => "s16_be",
            Self::S24Le => "s24_le",
            Self::S24Be => "s24_be",
            Self::S32Le => "s32_le",
            Self::S32Be => "s32_be",
            Self::F32Le => "f32_le",
        }
    }
}

impl FromStr for SampleFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u8" => Ok(Self::U8),
            "s8" => Ok(Self::U8), // accepted alias; stored unsigned
            "s16_le" | "s16" => Ok(Self::S16Le),
            "s16_be" => Ok(Self::S16Be),
            "s24_le" | "s24" => Ok(Self::S24Le),
            "s24_be" => Ok(Self::S24Be),
            "s32_le" | "s32" => Ok(Self::S32Le),
            "s32_be" => Ok(Self::S32Be),
            "f32_le" | "f32" => Ok(Self::F32Le),
            other => Err(EngineError::invalid_option(
                other,
                "unknown sample format token",
            )),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete audio format: sample encoding, channel count, rate, layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample encoding used at the object boundary.
    pub sample_format: SampleFormat,
    /// Number of channels.
    pub channels: usize,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Whether raw data is interleaved (`i`) or noninterleaved (`n`).
    pub interleaved: bool,
}

impl AudioFormat {
    /// Parses the `"<sample_format>,<channels>,<rate>,<i|n>"` form.
    ///
    /// The trailing layout field may be omitted; interleaved is assumed.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() < 3 || fields.len() > 4 {
            return Err(EngineError::invalid_option(
                s,
                "expected <sample_format>,<channels>,<rate>[,<i|n>]",
            ));
        }
        let sample_format: SampleFormat = fields[0].parse()?;
        let channels: usize = fields[1]
            .parse()
            .map_err(|_| EngineError::invalid_option(s, "channel count is not a number"))?;
        let sample_rate: u32 = fields[2]
            .parse()
            .map_err(|_| EngineError::invalid_option(s, "sample rate is not a number"))?;
        let interleaved = match fields.get(3) {
            None => true,
            Some(&"i") => true,
            Some(&"n") => false,
            Some(_) => {
                return Err(EngineError::invalid_option(
                    s,
                    "layout field must be 'i' or 'n'",
                ))
            }
        };
        if channels == 0 {
            return Err(EngineError::invalid_option(s, "channel count must be > 0"));
        }
        Ok(Self {
            sample_format,
            channels,
            sample_rate,
            interleaved,
        })
    }

    /// Renders the canonical format string.
    pub fn to_spec_string(&self) -> String {
        format!(
            "{},{},{},{}",
            self.sample_format,
            self.channels,
            self.sample_rate,
            if self.interleaved { "i" } else { "n" }
        )
    }

    /// Bytes occupied by one frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels
    }
}

impl Default for AudioFormat {
    /// The crate default: `s16_le,2,44100,i`.
    fn default() -> Self {
        Self {
            sample_format: SampleFormat::S16Le,
            channels: 2,
            sample_rate: 44100,
            interleaved: true,
        }
    }
}

fn decode_one(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleFormat::S16Be => i16::from_be_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleFormat::S24Le => {
            let v = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            v as f32 / 8_388_608.0
        }
        SampleFormat::S24Be => {
            let v = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8;
            v as f32 / 8_388_608.0
        }
        SampleFormat::S32Le => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::S32Be => {
            i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32Le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

fn encode_one(format: SampleFormat, sample: f32, out: &mut Vec<u8>) {
    let s = sample.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => out.push(((s * 127.0) + 128.0).round() as u8),
        SampleFormat::S16Le => {
            let v = (s * 32767.0).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleFormat::S16Be => {
            let v = (s * 32767.0).round() as i16;
            out.extend_from_slice(&v.to_be_bytes());
        }
        SampleFormat::S24Le => {
            let v = (s * 8_388_607.0).round() as i32;
            let b = v.to_le_bytes();
            out.extend_from_slice(&b[0..3]);
        }
        SampleFormat::S24Be => {
            let v = (s * 8_388_607.0).round() as i32;
            let b = v.to_be_bytes();
            out.extend_from_slice(&b[1..4]);
        }
        SampleFormat::S32Le => {
            let v = (s as f64 * 2_147_483_647.0).round() as i32;
            out.extend_from_slice(&v.to_le_bytes());
        }
        SampleFormat::S32Be => {
            let v = (s as f64 * 2_147_483_647.0).round() as i32;
            out.extend_from_slice(&v.to_be_bytes());
        }
        SampleFormat::F32Le => out.extend_from_slice(&s.to_le_bytes()),
    }
}

/// Decodes interleaved raw PCM into a planar sample buffer.
///
/// `bytes` must hold `frames * format.frame_bytes()` bytes; the buffer's
/// valid length is set to `frames`.
pub fn decode_frames(bytes: &[u8], format: &AudioFormat, frames: usize, buf: &mut SampleBuffer) {
    debug_assert!(bytes.len() >= frames * format.frame_bytes());
    let step = format.sample_format.bytes_per_sample();
    buf.set_frames(frames);
    for ch in 0..format.channels {
        let mut offset = ch * step;
        let channel = buf.channel_mut(ch);
        for sample in channel.iter_mut().take(frames) {
            *sample = decode_one(format.sample_format, &bytes[offset..offset + step]);
            offset += format.channels * step;
        }
    }
}

/// Encodes the valid frames of a planar buffer into interleaved raw PCM.
pub fn encode_frames(buf: &SampleBuffer, format: &AudioFormat) -> Vec<u8> {
    let frames = buf.frames();
    let mut out = Vec::with_capacity(frames * format.frame_bytes());
    for frame in 0..frames {
        for ch in 0..format.channels {
            // A mono buffer feeding a wider output duplicates its channel.
            let src = ch.min(buf.channel_count() - 1);
            encode_one(format.sample_format, buf.channel(src)[frame], &mut out);
        }
    }
    out
}
