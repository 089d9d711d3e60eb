/// Segment accumulation module
///
/// Holds the raw samples of the speech segment the VAD currently has open.
/// The buffer is bounded by the maximum segment duration so a stuck-open
/// segment cannot grow without limit.

use crate::audio_source::{ms_to_samples, samples_to_duration, AudioFrame, AudioSample};
use std::time::Duration;
use tracing::{debug, warn};

/// Why a segment was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Trailing silence exceeded the silence duration
    Silence,

    /// Segment reached the maximum segment duration
    MaxDuration,

    /// Closed early because the capture stream ended
    Flushed,
}

/// A completed span of speech audio
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub samples: Vec<AudioSample>,
    pub started_at: Duration,
    pub completed_at: Duration,
    pub frame_count: usize,
    pub close_reason: CloseReason,
}

impl Segment {
    pub fn duration(&self) -> Duration {
        self.completed_at.saturating_sub(self.started_at)
    }
}

/// Accumulator for the open segment
#[derive(Debug)]
pub struct SegmentBuffer {
    samples: Vec<AudioSample>,
    frame_count: usize,
    started_at: Option<Duration>,
    ended_at: Duration,
    max_samples: usize,
}

impl SegmentBuffer {
    /// Create a buffer bounded to `max_duration_ms` of audio
    pub fn new(max_duration_ms: u64) -> Self {
        Self {
            samples: Vec::new(),
            frame_count: 0,
            started_at: None,
            ended_at: Duration::ZERO,
            max_samples: ms_to_samples(max_duration_ms).max(1),
        }
    }

    /// Append a frame, truncating at the sample bound
    pub fn push(&mut self, frame: &AudioFrame) {
        if self.started_at.is_none() {
            self.started_at = Some(frame.timestamp);
        }

        let room = self.max_samples.saturating_sub(self.samples.len());
        let take = frame.samples.len().min(room);
        if take < frame.samples.len() {
            warn!(
                "Segment buffer full, truncating frame ({} of {} samples kept)",
                take,
                frame.samples.len()
            );
        }

        self.samples.extend_from_slice(&frame.samples[..take]);
        self.frame_count += 1;
        self.ended_at = frame.timestamp + samples_to_duration(take);
    }

    /// Close the open segment and hand its samples out, leaving the buffer empty
    pub fn take(&mut self, reason: CloseReason) -> Option<Segment> {
        let started_at = self.started_at.take()?;
        let samples = std::mem::take(&mut self.samples);
        let frame_count = std::mem::replace(&mut self.frame_count, 0);

        debug!(
            "Segment closed ({:?}): {} frames, {} samples",
            reason,
            frame_count,
            samples.len()
        );

        Some(Segment {
            samples,
            started_at,
            completed_at: self.ended_at,
            frame_count,
            close_reason: reason,
        })
    }

    /// Discard any buffered audio
    pub fn clear(&mut self) {
        self.samples.clear();
        self.frame_count = 0;
        self.started_at = None;
    }

    pub fn started_at(&self) -> Option<Duration> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.started_at.is_none()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn capacity(&self) -> usize {
        self.max_samples
    }
}
