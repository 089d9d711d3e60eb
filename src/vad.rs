/// Voice Activity Detection (VAD) module
///
/// Segments a live frame stream into speech spans using RMS energy.
/// Pure state machine: no I/O, time comes from frame timestamps.

use crate::audio_source::{AudioFrame, AudioSample};
use crate::segment::{CloseReason, Segment, SegmentBuffer};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum VadError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// VAD configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS amplitude (raw 16-bit units) above which a frame counts as voiced
    pub amplitude_threshold: f32,

    /// Trailing silence that closes a segment
    pub silence_duration_ms: u64,

    /// Hard cap on the length of one segment
    pub max_segment_duration_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            amplitude_threshold: 500.0,
            silence_duration_ms: 2000,      // 2s of silence closes a segment
            max_segment_duration_ms: 15000, // 15s upper bound per recognizer call
        }
    }
}

impl VadConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VadError> {
        if !(self.amplitude_threshold > 0.0) || self.amplitude_threshold > i16::MAX as f32 {
            return Err(VadError::InvalidConfig(
                "amplitude_threshold must be between 0 and 32767".to_string()
            ));
        }

        if self.silence_duration_ms == 0 {
            return Err(VadError::InvalidConfig(
                "silence_duration_ms must be greater than 0".to_string()
            ));
        }

        if self.max_segment_duration_ms == 0 {
            return Err(VadError::InvalidConfig(
                "max_segment_duration_ms must be greater than 0".to_string()
            ));
        }

        Ok(())
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_millis(self.silence_duration_ms)
    }

    pub fn max_segment_duration(&self) -> Duration {
        Duration::from_millis(self.max_segment_duration_ms)
    }
}

/// Segmentation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// No segment open
    Idle,

    /// Speech in progress
    Active { started_at: Duration },

    /// Speech paused, waiting to see if the silence lasts
    Trailing { last_voice_at: Duration },
}

/// Voice Activity Detector
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: SegmentState,
    buffer: SegmentBuffer,
    last_voice_at: Duration,
}

impl VoiceActivityDetector {
    /// Create a new VAD with default configuration
    pub fn new() -> Self {
        Self::with_config(VadConfig::default())
    }

    /// Create a new VAD with custom configuration
    pub fn with_config(config: VadConfig) -> Self {
        debug!("Initializing VAD with config: {:?}", config);

        Self {
            buffer: SegmentBuffer::new(config.max_segment_duration_ms),
            config,
            state: SegmentState::Idle,
            last_voice_at: Duration::ZERO,
        }
    }

    /// Feed one frame, in capture order. Returns a segment when one closes.
    pub fn observe(&mut self, frame: AudioFrame) -> Option<Segment> {
        let now = frame.end();
        let amplitude = Self::calculate_rms(&frame.samples);
        let voiced = amplitude > self.config.amplitude_threshold;

        trace!(
            "Frame analysis: rms={:.1}, voiced={}, state={:?}",
            amplitude, voiced, self.state
        );

        let max_segment = self.config.max_segment_duration();
        let mut emitted = None;

        // This frame would push the open segment past the cap: close it first
        if let Some(started_at) = self.buffer.started_at() {
            if now.saturating_sub(started_at) > max_segment {
                emitted = self.close(CloseReason::MaxDuration);
            }
        }

        match (self.state, voiced) {
            (SegmentState::Idle, true) => {
                self.buffer.clear();
                self.buffer.push(&frame);
                self.last_voice_at = now;
                self.state = SegmentState::Active { started_at: frame.timestamp };
                debug!("State: Idle -> Active");
            }

            (SegmentState::Idle, false) => {}

            (SegmentState::Active { .. }, true) => {
                self.buffer.push(&frame);
                self.last_voice_at = now;
            }

            (SegmentState::Trailing { .. }, true) => {
                self.buffer.push(&frame);
                self.last_voice_at = now;
                self.state = SegmentState::Active {
                    started_at: self.buffer.started_at().unwrap_or(frame.timestamp),
                };
                debug!("State: Trailing -> Active (speech resumed)");
            }

            (SegmentState::Active { .. }, false) => {
                self.buffer.push(&frame);
                self.state = SegmentState::Trailing {
                    last_voice_at: self.last_voice_at,
                };
                debug!("State: Active -> Trailing");
            }

            (SegmentState::Trailing { last_voice_at }, false) => {
                self.buffer.push(&frame);
                if now.saturating_sub(last_voice_at) > self.config.silence_duration() {
                    emitted = self.close(CloseReason::Silence);
                }
            }
        }

        if emitted.is_none() {
            if let Some(started_at) = self.buffer.started_at() {
                if now.saturating_sub(started_at) >= max_segment {
                    emitted = self.close(CloseReason::MaxDuration);
                }
            }
        }

        emitted
    }

    /// Force-close the open segment, if any
    pub fn flush(&mut self) -> Option<Segment> {
        if self.state == SegmentState::Idle {
            return None;
        }
        self.close(CloseReason::Flushed)
    }

    fn close(&mut self, reason: CloseReason) -> Option<Segment> {
        let segment = self.buffer.take(reason);
        self.state = SegmentState::Idle;
        if segment.is_some() {
            debug!("State: -> Idle ({:?})", reason);
        }
        segment
    }

    /// Root-mean-square amplitude of a frame in raw sample units
    pub fn calculate_rms(samples: &[AudioSample]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f64 = samples
            .iter()
            .map(|&s| {
                let s = s as f64;
                s * s
            })
            .sum();

        (sum_squares / samples.len() as f64).sqrt() as f32
    }

    /// Get current segmentation state
    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Samples held for the open segment
    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Duration of the open segment so far
    pub fn open_duration(&self, now: Duration) -> Option<Duration> {
        self.buffer.started_at().map(|start| now.saturating_sub(start))
    }

    /// Drop any open segment and return to Idle
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = SegmentState::Idle;
        self.last_voice_at = Duration::ZERO;
        debug!("VAD reset to initial state");
    }

    /// Get current configuration
    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new()
    }
}
