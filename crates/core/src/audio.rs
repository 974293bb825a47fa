use anyhow::{Context, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;
use tracing::warn;

/// Sample rate expected by the speech recognizers.
pub const ASR_SAMPLE_RATE: u32 = 16_000;

const RESAMPLER_CHUNK: usize = 1024;

/// Creates a mono resampler between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Interprets little-endian bytes as PCM16 samples. A trailing odd byte is ignored.
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

pub fn pcm16_to_bytes(pcm16: &[i16]) -> Vec<u8> {
    pcm16.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Converts f32 samples to i16, clamping out-of-range values.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Root mean square of the samples, normalized to `0.0..=1.0`.
pub fn rms(pcm16: &[i16]) -> f32 {
    if pcm16.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm16
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / pcm16.len() as f64).sqrt() as f32
}

/// Wraps mono PCM16 samples in a WAV container.
pub fn encode_wav(pcm16: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Vec::with_capacity(44 + pcm16.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec)
            .context("Failed to start WAV stream")?;
        for &sample in pcm16 {
            writer.write_sample(sample)?;
        }
        writer.finalize().context("Failed to finalize WAV stream")?;
    }
    Ok(buffer)
}

/// Turns inbound client audio frames into 16 kHz mono PCM16 LE bytes.
pub trait AudioDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Releases decoder resources. Later calls to `decode` return no audio.
    fn close(&mut self);
}

/// Decoder for raw PCM16 input at an arbitrary rate and channel count.
pub struct PcmDecoder {
    channels: usize,
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    closed: bool,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let resampler = if sample_rate != ASR_SAMPLE_RATE {
            Some(create_resampler(
                sample_rate as f64,
                ASR_SAMPLE_RATE as f64,
                RESAMPLER_CHUNK,
            )?)
        } else {
            None
        };
        Ok(Self {
            channels: channels.max(1) as usize,
            resampler,
            pending: Vec::new(),
            closed: false,
        })
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if self.closed {
            return Ok(Vec::new());
        }
        let samples = pcm16_from_bytes(frame);
        let mono: Vec<i16> = if self.channels == 1 {
            samples
        } else {
            samples
                .chunks_exact(self.channels)
                .map(|c| (c.iter().map(|&s| s as i32).sum::<i32>() / c.len() as i32) as i16)
                .collect()
        };

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(pcm16_to_bytes(&mono));
        };
        self.pending.extend(convert_i16_to_f32(&mono));
        let mut out = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let chunk: Vec<f32> = self.pending.drain(..resampler.input_frames_next()).collect();
            let resampled = resampler.process(&[chunk], None)?;
            out.extend(convert_f32_to_i16(&resampled[0]));
        }
        Ok(pcm16_to_bytes(&out))
    }

    fn close(&mut self) {
        self.closed = true;
        self.resampler = None;
        self.pending.clear();
    }
}

/// Forwards frames untouched, for formats the recognizer consumes natively.
pub struct PassthroughDecoder {
    format: String,
    warned: bool,
    closed: bool,
}

impl PassthroughDecoder {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            warned: false,
            closed: false,
        }
    }
}

impl AudioDecoder for PassthroughDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if self.closed {
            return Ok(Vec::new());
        }
        if !self.warned {
            warn!(format = %self.format, "No decoder for client audio format, forwarding frames as-is");
            self.warned = true;
        }
        Ok(frame.to_vec())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Picks a decoder for the format negotiated in `hello`.
pub fn decoder_for(format: &str, sample_rate: u32, channels: u16) -> Result<Box<dyn AudioDecoder>> {
    match format.to_ascii_lowercase().as_str() {
        "pcm" | "pcm16" | "s16le" => Ok(Box::new(PcmDecoder::new(sample_rate, channels)?)),
        other => Ok(Box::new(PassthroughDecoder::new(other))),
    }
}
