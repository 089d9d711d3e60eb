/// Audio source module
///
/// Defines the pull-based frame stream every capture path reads from.
/// Frames are 16kHz mono 16-bit PCM with a capture timestamp.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Capture sample rate expected by the VAD and the recognizer
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame length: 1 second of audio
pub const DEFAULT_FRAME_MS: u64 = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio device is owned by {0}")]
    DeviceBusy(&'static str),

    #[error("No audio frame within {0:?}")]
    ReadTimeout(Duration),

    #[error("Audio source is not open")]
    NotOpen,

    #[error("Invalid capture duration: {0}ms")]
    InvalidDuration(u64),

    #[error("Audio encoding failed: {0}")]
    Encoding(String),
}

/// Frame sizing and read bounds for a capture device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Length of each frame handed to the VAD
    pub frame_ms: u64,

    /// Longest a single `read_frame` may block before reporting the device stalled
    pub read_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_ms: DEFAULT_FRAME_MS,
            read_timeout_ms: DEFAULT_FRAME_MS * 2 + 500,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.frame_ms == 0 {
            return Err("frame_ms must be greater than 0".to_string());
        }

        if self.read_timeout_ms < self.frame_ms {
            return Err(format!(
                "read_timeout_ms ({}) must be at least frame_ms ({})",
                self.read_timeout_ms, self.frame_ms
            ));
        }

        Ok(())
    }

    pub fn frame_samples(&self) -> usize {
        ms_to_samples(self.frame_ms).max(1)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// One fixed-size block of captured audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Mono PCM samples at `SAMPLE_RATE`
    pub samples: Vec<AudioSample>,

    /// Offset of the first sample from the start of the stream
    pub timestamp: Duration,
}

impl AudioFrame {
    pub fn new(samples: Vec<AudioSample>, timestamp: Duration) -> Self {
        Self { samples, timestamp }
    }

    /// Playback duration of this frame
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len())
    }

    /// Offset just past the last sample of this frame
    pub fn end(&self) -> Duration {
        self.timestamp + self.duration()
    }
}

/// Convert a sample count at `SAMPLE_RATE` into a duration
pub fn samples_to_duration(samples: usize) -> Duration {
    Duration::from_micros(samples as u64 * 1_000_000 / SAMPLE_RATE as u64)
}

/// Number of samples covering `ms` milliseconds at `SAMPLE_RATE`
pub fn ms_to_samples(ms: u64) -> usize {
    (ms * SAMPLE_RATE as u64 / 1000) as usize
}

/// Pull-based capture device.
///
/// `read_frame` blocks the calling thread for at most the source's read
/// timeout. Implementations are driven from a single capture thread.
pub trait AudioSource: Send {
    /// Acquire the underlying device and start buffering audio
    fn open(&mut self) -> Result<(), AudioError>;

    /// Read the next complete frame
    fn read_frame(&mut self) -> Result<AudioFrame, AudioError>;

    /// Release the device. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

impl<S: AudioSource + ?Sized> AudioSource for Box<S> {
    fn open(&mut self) -> Result<(), AudioError> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<AudioFrame, AudioError> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}
