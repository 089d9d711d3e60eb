/// Integration tests for the distress monitor
///
/// Drives the monitor end to end with synthetic audio and an in-process
/// recognizer.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use distress_monitor::recognition::{AlertResponse, RecognitionRequest, RecognizerResponse};
use distress_monitor::{
    AudioError, AudioFrame, AudioSource, DeviceOwnership, DispatchConfig, EmergencyNotice,
    KeepAlive, MonitorLifecycleState, MonitorService, MonitoringNotice, Notifier, NotifyError,
    RecognitionEscalationClient, RecognizerApi, RecognizerConfig, SegmentState,
    ShortCaptureClient, StaticTokenProvider, TransportError, VadConfig, VoiceActivityDetector,
    SAMPLE_RATE,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Generate synthetic audio tone with peak `amplitude` in raw sample units
fn generate_tone(frequency: f32, duration_ms: u64, amplitude: f32) -> Vec<i16> {
    let num_samples = (SAMPLE_RATE as u64 * duration_ms / 1000) as usize;

    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (amplitude * (2.0 * PI * frequency * t).sin()) as i16
        })
        .collect()
}

/// Speech-like burst: two formants under a slow envelope
fn generate_speech(duration_ms: u64) -> Vec<i16> {
    let num_samples = (SAMPLE_RATE as u64 * duration_ms / 1000) as usize;

    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let envelope = 0.6 + 0.4 * (2.0 * PI * 3.0 * t).sin().abs();
            let f1 = 0.6 * (2.0 * PI * 700.0 * t).sin();
            let f2 = 0.4 * (2.0 * PI * 1220.0 * t).sin();
            (envelope * (f1 + f2) * 4000.0) as i16
        })
        .collect()
}

fn silence(duration_ms: u64) -> Vec<i16> {
    generate_tone(440.0, duration_ms, 20.0)
}

/// Cuts `audio` into frames of `frame_ms`
fn frames(audio: &[i16], frame_ms: u64) -> Vec<Vec<i16>> {
    let frame_len = (SAMPLE_RATE as u64 * frame_ms / 1000) as usize;
    audio.chunks(frame_len).map(|c| c.to_vec()).collect()
}

/// Plays scripted frames, then near-silence until closed
struct SyntheticSource {
    script: VecDeque<Vec<i16>>,
    frame_ms: u64,
    open: bool,
    position: usize,
    opens: Arc<AtomicUsize>,
}

impl SyntheticSource {
    fn new(script: Vec<Vec<i16>>, frame_ms: u64) -> Self {
        Self {
            script: script.into(),
            frame_ms,
            open: false,
            position: 0,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioSource for SyntheticSource {
    fn open(&mut self) -> Result<(), AudioError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<AudioFrame, AudioError> {
        if !self.open {
            return Err(AudioError::NotOpen);
        }

        let samples = match self.script.pop_front() {
            Some(samples) => samples,
            None => {
                std::thread::sleep(Duration::from_millis(2));
                silence(self.frame_ms)
            }
        };

        let timestamp = Duration::from_micros(self.position as u64 * 1_000_000 / SAMPLE_RATE as u64);
        self.position += samples.len();
        Ok(AudioFrame::new(samples, timestamp))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// In-process recognizer that reports a keyword for every request
struct FakeRecognizer {
    transcript: String,
    keyword_detected: bool,
    requests: Mutex<Vec<RecognitionRequest>>,
    alerts: AtomicUsize,
}

impl FakeRecognizer {
    fn new(transcript: &str, keyword_detected: bool) -> Self {
        Self {
            transcript: transcript.to_string(),
            keyword_detected,
            requests: Mutex::new(Vec::new()),
            alerts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RecognizerApi for FakeRecognizer {
    async fn recognize(
        &self,
        token: &str,
        request: &RecognitionRequest,
    ) -> Result<RecognizerResponse, TransportError> {
        assert_eq!(token, "token-123");
        self.requests.lock().push(request.clone());
        Ok(RecognizerResponse {
            success: true,
            transcript: self.transcript.clone(),
            keyword_detected: self.keyword_detected,
            sms_sent: false,
            message: String::new(),
        })
    }

    async fn dispatch_alert(&self, _token: &str) -> Result<AlertResponse, TransportError> {
        self.alerts.fetch_add(1, Ordering::SeqCst);
        Ok(AlertResponse {
            success: true,
            message: "sent".to_string(),
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    emergencies: Mutex<Vec<EmergencyNotice>>,
    monitoring_shown: AtomicUsize,
}

impl Notifier for RecordingNotifier {
    fn show_monitoring(&self, _notice: &MonitoringNotice) -> Result<(), NotifyError> {
        self.monitoring_shown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_monitoring(&self) -> Result<(), NotifyError> {
        Ok(())
    }

    fn emergency(&self, notice: &EmergencyNotice) -> Result<(), NotifyError> {
        self.emergencies.lock().push(notice.clone());
        Ok(())
    }
}

struct Harness {
    monitor: MonitorService,
    recognizer: Arc<FakeRecognizer>,
    notifier: Arc<RecordingNotifier>,
    tokens: Arc<StaticTokenProvider>,
    device: DeviceOwnership,
    keep_alive: KeepAlive,
}

fn harness(script: Vec<Vec<i16>>, frame_ms: u64, recognizer: FakeRecognizer) -> Harness {
    let recognizer = Arc::new(recognizer);
    let notifier = Arc::new(RecordingNotifier::default());
    let tokens = Arc::new(StaticTokenProvider::new(Some("token-123".to_string())));
    let device = DeviceOwnership::new();
    let keep_alive = KeepAlive::default();

    let config = RecognizerConfig {
        user_id: Some(7),
        ..Default::default()
    };
    let client = RecognitionEscalationClient::new(
        &config,
        recognizer.clone(),
        tokens.clone(),
        notifier.clone(),
    );

    let monitor = MonitorService::new(
        VadConfig::default(),
        DispatchConfig::default(),
        Box::new(SyntheticSource::new(script, frame_ms)),
        Arc::new(client),
        device.clone(),
    )
    .with_notifier(notifier.clone())
    .with_keep_alive(keep_alive.clone());

    Harness {
        monitor,
        recognizer,
        notifier,
        tokens,
        device,
        keep_alive,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[test]
fn test_vad_scenario_three_voiced_three_silent() {
    let config = VadConfig {
        amplitude_threshold: 500.0,
        silence_duration_ms: 2000,
        ..Default::default()
    };
    let mut vad = VoiceActivityDetector::with_config(config);

    let mut audio = generate_tone(440.0, 2100, 800.0);
    audio.extend(vec![0i16; (SAMPLE_RATE as usize * 21) / 10]);

    let mut emitted = Vec::new();
    let mut position = 0usize;
    for samples in frames(&audio, 700) {
        let timestamp = Duration::from_micros(position as u64 * 1_000_000 / SAMPLE_RATE as u64);
        position += samples.len();
        emitted.extend(vad.observe(AudioFrame::new(samples, timestamp)));
    }

    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].frame_count, 6);
    assert_eq!(emitted[0].samples.len(), audio.len());
    assert_eq!(vad.state(), SegmentState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_distress_speech_escalates_end_to_end() {
    let mut audio = generate_speech(3000);
    audio.extend(silence(3000));
    let h = harness(frames(&audio, 1000), 1000, FakeRecognizer::new("help me please", true));

    h.monitor.start().await.unwrap();
    assert!(h.keep_alive.is_held());
    assert_eq!(h.notifier.monitoring_shown.load(Ordering::SeqCst), 1);

    wait_until(|| !h.notifier.emergencies.lock().is_empty()).await;
    h.monitor.stop().await.unwrap();
    h.monitor.wait_for_dispatches().await;

    let requests = h.recognizer.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].sample_rate, SAMPLE_RATE);
    assert_eq!(requests[0].user_id, Some(7));

    // 3s of speech plus the 3 silent frames that closed the segment
    let wav = STANDARD.decode(&requests[0].audio).unwrap();
    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.len(), SAMPLE_RATE * 6);

    assert_eq!(h.recognizer.alerts.load(Ordering::SeqCst), 1);
    let emergencies = h.notifier.emergencies.lock();
    assert_eq!(emergencies.len(), 1);
    assert_eq!(emergencies[0].transcript, "help me please");
    assert!(!h.keep_alive.is_held());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ordinary_speech_does_not_escalate() {
    let mut audio = generate_speech(2000);
    audio.extend(silence(3000));
    let h = harness(frames(&audio, 1000), 1000, FakeRecognizer::new("what time is it", false));

    h.monitor.start().await.unwrap();
    wait_until(|| h.monitor.stats().segments_completed == 1).await;
    h.monitor.stop().await.unwrap();

    assert_eq!(h.recognizer.requests.lock().len(), 1);
    assert_eq!(h.recognizer.alerts.load(Ordering::SeqCst), 0);
    assert!(h.notifier.emergencies.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signed_out_user_skips_recognizer() {
    let mut audio = generate_speech(2000);
    audio.extend(silence(3000));
    let h = harness(frames(&audio, 1000), 1000, FakeRecognizer::new("help", true));
    h.tokens.set(None);

    h.monitor.start().await.unwrap();
    wait_until(|| h.monitor.stats().segments_failed == 1).await;

    assert_eq!(h.monitor.state(), MonitorLifecycleState::Running);
    assert!(h.recognizer.requests.lock().is_empty());
    h.monitor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_short_capture_excludes_monitor() {
    let h = harness(Vec::new(), 1000, FakeRecognizer::new("", false));
    let short = ShortCaptureClient::new(
        Box::new(SyntheticSource::new(frames(&generate_speech(3000), 700), 700)),
        h.device.clone(),
    );

    h.monitor.start().await.unwrap();
    assert_eq!(short.capture_fixed(2000), Err(AudioError::DeviceBusy("monitor")));

    h.monitor.stop().await.unwrap();
    let blob = short.capture_fixed(2000).unwrap();
    assert_eq!(blob.sample_count, 2 * SAMPLE_RATE as usize);

    // The monitor cannot start while a short capture holds the device
    let lease = h.device.try_acquire("short-capture").unwrap();
    assert_eq!(
        h.monitor.start().await,
        Err(distress_monitor::MonitorError::Audio(AudioError::DeviceBusy("short-capture")))
    );
    drop(lease);
    h.monitor.start().await.unwrap();
    h.monitor.shutdown().await.unwrap();
}
