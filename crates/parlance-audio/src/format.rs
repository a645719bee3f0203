//! Audio format descriptors and PCM conversion.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{AudioError, Result};

/// Linear PCM format specification. Everything inside the runtime is
/// 16-bit little-endian mono at [`AudioFormat::internal`]'s rate; the
/// transport side may differ and is converted at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// 1 = mono, 2 = stereo.
    pub channels: u8,
    pub bits_per_sample: u8,
}

impl AudioFormat {
    /// The fixed internal format: PCM16 mono 48 kHz.
    pub fn internal() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    /// PCM16 mono 16 kHz — what the speech recognizer consumes.
    pub fn asr() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    /// Wire format tag, e.g. `"pcm16/48000"`.
    pub fn tag(&self) -> String {
        format!("pcm{}/{}", self.bits_per_sample, self.sample_rate)
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * u32::from(self.channels) * u32::from(self.bits_per_sample / 8)
    }

    /// Byte length of one frame of `frame_ms` milliseconds.
    pub fn frame_bytes(&self, frame_ms: u32) -> usize {
        (self.bytes_per_second() / 1000) as usize * frame_ms as usize
    }

    /// Duration in milliseconds of `bytes` of audio in this format.
    pub fn duration_ms(&self, bytes: usize) -> u32 {
        (bytes as u64 * 1000 / u64::from(self.bytes_per_second())) as u32
    }
}

/// One frame of audio with its format.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub format: AudioFormat,
}

impl AudioFrame {
    pub fn new(data: Bytes, format: AudioFormat) -> Self {
        Self { data, format }
    }

    pub fn duration_ms(&self) -> u32 {
        self.format.duration_ms(self.data.len())
    }

    /// Convert to the internal format: downmix to mono, then resample by
    /// nearest-sample selection. Only 16-bit input is supported; the
    /// transport bridge rejects anything else before it gets here.
    pub fn to_internal(&self) -> Result<AudioFrame> {
        if self.format.bits_per_sample != 16 {
            return Err(AudioError::Unsupported(self.format.tag()));
        }
        let internal = AudioFormat::internal();
        if self.format == internal {
            return Ok(self.clone());
        }

        let samples = bytes_to_samples(&self.data);
        let mono: Vec<i16> = if self.format.channels == 2 {
            samples
                .chunks_exact(2)
                .map(|pair| ((i32::from(pair[0]) + i32::from(pair[1])) / 2) as i16)
                .collect()
        } else {
            samples
        };

        let resampled = if self.format.sample_rate == internal.sample_rate {
            mono
        } else {
            resample_nearest(&mono, self.format.sample_rate, internal.sample_rate)
        };

        Ok(AudioFrame::new(samples_to_bytes(&resampled), internal))
    }
}

fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    Bytes::from(out)
}

fn resample_nearest(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }
    let out_len = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * u64::from(from_rate) / u64::from(to_rate)) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_for_20ms_at_internal_rate() {
        // 48000 Hz * 2 bytes * 20 ms = 1920 bytes.
        assert_eq!(AudioFormat::internal().frame_bytes(20), 1920);
    }

    #[test]
    fn duration_is_inverse_of_frame_bytes() {
        let f = AudioFormat::internal();
        assert_eq!(f.duration_ms(f.frame_bytes(20)), 20);
    }

    #[test]
    fn stereo_downmix_averages_channels() {
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 16,
        };
        let mut data = Vec::new();
        for (l, r) in [(100i16, 200i16), (-50, 50)] {
            data.extend_from_slice(&l.to_le_bytes());
            data.extend_from_slice(&r.to_le_bytes());
        }
        let frame = AudioFrame::new(Bytes::from(data), format);
        let internal = frame.to_internal().unwrap();
        assert_eq!(bytes_to_samples(&internal.data), vec![150, 0]);
    }

    #[test]
    fn upsampling_triples_16khz_input() {
        let format = AudioFormat::asr();
        let samples: Vec<i16> = vec![1, 2, 3, 4];
        let frame = AudioFrame::new(samples_to_bytes(&samples), format);
        let internal = frame.to_internal().unwrap();
        assert_eq!(internal.data.len(), samples.len() * 3 * 2);
        assert_eq!(internal.format, AudioFormat::internal());
    }

    #[test]
    fn non_16bit_input_is_rejected() {
        let format = AudioFormat {
            sample_rate: 8_000,
            channels: 1,
            bits_per_sample: 8,
        };
        let frame = AudioFrame::new(Bytes::from_static(&[0, 1, 2]), format);
        assert!(frame.to_internal().is_err());
    }
}
