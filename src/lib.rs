/// Distress monitor library
///
/// This library provides background distress-speech monitoring: energy-based
/// voice segmentation, bounded dispatch of segments to a remote recognizer,
/// and emergency escalation when a distress keyword is reported.

pub mod audio_source;
pub mod config;
pub mod credentials;
pub mod device;
pub mod encoding;
pub mod keep_alive;
#[cfg(feature = "microphone")]
pub mod microphone;
pub mod monitor;
pub mod notify;
pub mod recognition;
pub mod segment;
pub mod short_capture;
pub mod vad;

// Re-export main types
pub use audio_source::{AudioError, AudioFrame, AudioSample, AudioSource, CaptureConfig, SAMPLE_RATE};
pub use config::{ConfigError, MonitorConfig};
pub use credentials::{EnvTokenProvider, StaticTokenProvider, TokenProvider};
pub use device::{DeviceLease, DeviceOwnership};
pub use encoding::AudioBlob;
pub use keep_alive::{KeepAlive, KeepAliveBackend, LoggingKeepAlive};
#[cfg(feature = "microphone")]
pub use microphone::MicrophoneSource;
pub use monitor::{
    DispatchConfig, MonitorError, MonitorLifecycleState, MonitorService, MonitorStats, MonitorStatus,
};
pub use notify::{EmergencyNotice, MonitoringNotice, Notifier, NotifyError, TracingNotifier};
pub use recognition::{
    EscalationError, HttpRecognizerApi, RecognitionEscalationClient, RecognitionResult, RecognizerApi,
    RecognizerConfig, SegmentProcessor, TransportError,
};
pub use segment::{CloseReason, Segment, SegmentBuffer};
pub use short_capture::ShortCaptureClient;
pub use vad::{SegmentState, VadConfig, VadError, VoiceActivityDetector};
