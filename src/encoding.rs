/// Audio encoding module
///
/// Shared wire encoding for both capture paths: 16-bit mono little-endian
/// PCM in a RIFF/WAV container, base64 encoded for the JSON transport.

use crate::audio_source::{samples_to_duration, AudioError, AudioSample, SAMPLE_RATE};
use crate::segment::Segment;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;
use std::time::Duration;
use tracing::trace;

/// Encoded audio ready to submit to the recognizer
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlob {
    /// WAV bytes (RIFF header + PCM data chunk)
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub sample_count: usize,
}

impl AudioBlob {
    /// Encode raw samples captured at `SAMPLE_RATE`
    pub fn from_samples(samples: &[AudioSample]) -> Result<Self, AudioError> {
        let wav = encode_wav(samples, SAMPLE_RATE)?;

        trace!("Encoded {} samples into {} WAV bytes", samples.len(), wav.len());

        Ok(Self {
            wav,
            sample_rate: SAMPLE_RATE,
            sample_count: samples.len(),
        })
    }

    pub fn from_segment(segment: &Segment) -> Result<Self, AudioError> {
        Self::from_samples(&segment.samples)
    }

    /// Base64 transport encoding of the WAV bytes
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.wav)
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.sample_count)
    }
}

/// Write samples into an in-memory 16-bit mono WAV file
pub fn encode_wav(samples: &[AudioSample], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = WavWriter::new(&mut buffer, spec)
            .map_err(|e| AudioError::Encoding(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::Encoding(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| AudioError::Encoding(e.to_string()))?;
    }

    Ok(buffer.into_inner())
}
