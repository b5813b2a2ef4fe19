//! PCM16 mono resampling between the client transport and the model service.

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Frames per resampler chunk: 20 ms of input audio.
const CHUNK_MILLIS: u32 = 20;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Streams little-endian PCM16 mono audio from one rate to another.
///
/// Input arrives in arbitrarily sized frames. Samples that do not fill a
/// whole resampler chunk, and a trailing odd byte, are held until the next
/// frame. Equal rates pass bytes through untouched.
pub struct PcmResampler {
    from_rate: u32,
    to_rate: u32,
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    odd_byte: Option<u8>,
}

impl PcmResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> anyhow::Result<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            let chunk = (from_rate * CHUNK_MILLIS / 1000).max(1) as usize;
            Some(create_resampler(from_rate.into(), to_rate.into(), chunk)?)
        };
        Ok(Self {
            from_rate,
            to_rate,
            resampler,
            pending: Vec::new(),
            odd_byte: None,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn rates(&self) -> (u32, u32) {
        (self.from_rate, self.to_rate)
    }

    /// Drops buffered samples, e.g. at the start of a new turn.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.odd_byte = None;
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Converts one frame. May return fewer bytes than a full conversion
    /// while input is buffered.
    pub fn process(&mut self, pcm: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        if let Some(byte) = self.odd_byte.take() {
            bytes.push(byte);
        }
        bytes.extend_from_slice(pcm);
        if bytes.len() % 2 == 1 {
            self.odd_byte = bytes.pop();
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(bytes);
        };

        self.pending.extend(decode_pcm16(&bytes));
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = resampler.process(&[chunk], None)?;
            if let Some(channel) = resampled.first() {
                out.extend_from_slice(channel);
            }
        }
        Ok(encode_pcm16(&out))
    }

    /// Emits the samples still short of a whole chunk, padded with silence
    /// and trimmed to their converted length. Call at the end of an utterance.
    pub fn flush(&mut self) -> anyhow::Result<Vec<u8>> {
        self.odd_byte = None;
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let buffered = self.pending.len();
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(resampler.input_frames_next().max(buffered), 0.0);
        let resampled = resampler.process(&[chunk], None)?;
        let keep = (buffered as u64 * u64::from(self.to_rate)).div_ceil(u64::from(self.from_rate)) as usize;
        let mut out = resampled.into_iter().next().unwrap_or_default();
        out.truncate(keep);
        resampler.reset();
        Ok(encode_pcm16(&out))
    }
}

/// Interprets little-endian PCM16 bytes as samples normalized to [-1.0, 1.0].
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Encodes normalized samples as little-endian PCM16 bytes, clamping overflow.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> anyhow::Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn constant(samples: usize, value: f32) -> Vec<u8> {
        encode_pcm16(&vec![value; samples])
    }

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 320).is_ok());
        assert!(create_resampler(48000.0, 16000.0, 960).is_ok());
    }

    #[test]
    fn test_pcm16_codec() {
        // 16384 = 0x4000 little endian, normalized to 0.5
        let decoded = decode_pcm16(&[0x00, 0x40, 0x00, 0x80]);
        assert_eq!(decoded.len(), 2);
        assert_abs_diff_eq!(decoded[0], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(decoded[1], -1.0, epsilon = 0.0001);

        let clamped = decode_pcm16(&encode_pcm16(&[2.0, -2.0, f32::NAN]));
        assert!(clamped.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_passthrough_keeps_bytes_and_carries_odd_byte() {
        let mut resampler = PcmResampler::new(16_000, 16_000).unwrap();
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[1, 2, 3]).unwrap(), vec![1, 2]);
        assert_eq!(resampler.process(&[4]).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_upsampling_preserves_duration_and_level() {
        let mut resampler = PcmResampler::new(16_000, 24_000).unwrap();
        let mut out = Vec::new();
        // One second of input in 100 ms frames.
        for _ in 0..10 {
            out.extend(resampler.process(&constant(1_600, 0.5)).unwrap());
        }
        let samples = decode_pcm16(&out);
        assert!(samples.len() > 23_000 && samples.len() < 24_100, "got {}", samples.len());
        assert_abs_diff_eq!(samples[samples.len() / 2], 0.5, epsilon = 0.01);
    }

    #[test]
    fn test_short_frames_are_buffered_not_dropped() {
        let mut resampler = PcmResampler::new(24_000, 16_000).unwrap();
        // The input chunk is 480 samples; 100-sample frames fill it on the fifth.
        let mut produced = Vec::new();
        for _ in 0..4 {
            produced.push(resampler.process(&constant(100, 0.25)).unwrap().len());
        }
        assert!(produced.iter().all(|&len| len == 0));
        assert!(!resampler.process(&constant(100, 0.25)).unwrap().is_empty());
    }

    #[test]
    fn test_reset_discards_buffered_input() {
        let mut resampler = PcmResampler::new(24_000, 16_000).unwrap();
        resampler.process(&constant(400, 0.25)).unwrap();
        resampler.reset();
        assert!(resampler.process(&constant(100, 0.25)).unwrap().is_empty());
    }

    #[test]
    fn test_flush_emits_buffered_tail_once() {
        let mut resampler = PcmResampler::new(24_000, 16_000).unwrap();
        assert!(resampler.process(&constant(300, 0.25)).unwrap().is_empty());

        let tail = decode_pcm16(&resampler.flush().unwrap());
        assert!(!tail.is_empty());
        assert!(tail.len() <= 200, "got {}", tail.len());
        assert!(resampler.flush().unwrap().is_empty());

        let mut passthrough = PcmResampler::new(16_000, 16_000).unwrap();
        passthrough.process(&[1, 2, 3]).unwrap();
        assert!(passthrough.flush().unwrap().is_empty());
    }

    #[test]
    fn test_base64_helpers() {
        let encoded = encode_base64(&[0, 1, 2, 3]);
        assert_eq!(decode_base64(&encoded).unwrap(), vec![0, 1, 2, 3]);
        assert!(decode_base64("not base64!").is_err());
    }
}
