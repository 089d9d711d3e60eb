/// Short capture module
///
/// User-triggered fixed-length recording that bypasses the VAD.

use crate::audio_source::{ms_to_samples, AudioError, AudioSource};
use crate::device::DeviceOwnership;
use crate::encoding::AudioBlob;
use parking_lot::Mutex;
use tracing::{debug, info};

/// Device-ownership name used by short captures
pub const SHORT_CAPTURE_OWNER: &str = "short-capture";

pub struct ShortCaptureClient {
    source: Mutex<Box<dyn AudioSource>>,
    device: DeviceOwnership,
}

impl ShortCaptureClient {
    pub fn new(source: Box<dyn AudioSource>, device: DeviceOwnership) -> Self {
        Self {
            source: Mutex::new(source),
            device,
        }
    }

    /// Record exactly `duration_ms` of audio and encode it.
    ///
    /// Blocks the calling thread for the capture. Fails with `DeviceBusy`
    /// while the monitor owns the device.
    pub fn capture_fixed(&self, duration_ms: u64) -> Result<AudioBlob, AudioError> {
        if duration_ms == 0 {
            return Err(AudioError::InvalidDuration(duration_ms));
        }

        let _lease = self.device.try_acquire(SHORT_CAPTURE_OWNER)?;
        let mut source = self.source.lock();

        source.open()?;
        let recorded = Self::record(&mut **source, ms_to_samples(duration_ms));
        source.close();

        let samples = recorded?;
        info!("Short capture finished: {}ms", duration_ms);
        AudioBlob::from_samples(&samples)
    }

    fn record(source: &mut dyn AudioSource, wanted: usize) -> Result<Vec<i16>, AudioError> {
        let mut samples = Vec::with_capacity(wanted);

        while samples.len() < wanted {
            let frame = source.read_frame()?;
            debug!("Short capture frame: {} samples", frame.samples.len());
            samples.extend_from_slice(&frame.samples);
        }

        samples.truncate(wanted);
        Ok(samples)
    }
}
