/// Recognition and escalation module
///
/// Sends each speech segment to the remote recognizer once and, when the
/// recognizer reports a distress keyword, fires the emergency alert call and
/// the local high-priority notification side by side.

use crate::credentials::TokenProvider;
use crate::encoding::AudioBlob;
use crate::notify::{EmergencyNotice, Notifier};
use crate::segment::Segment;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscalationError {
    #[error("No auth token available")]
    AuthMissing,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Recognizer rejected the request: {0}")]
    Rejected(String),

    #[error("Audio encoding failed: {0}")]
    Encoding(String),
}

/// Remote recognizer endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub base_url: String,
    pub recognize_path: String,
    pub alert_path: String,

    /// Upper bound on each remote call
    pub timeout_ms: u64,

    /// Optional account id forwarded with each recognition request
    pub user_id: Option<i64>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            recognize_path: "/api/voice/recognize".to_string(),
            alert_path: "/api/emergency/alert".to_string(),
            timeout_ms: 15_000,
            user_id: None,
        }
    }
}

impl RecognizerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(format!("base_url must be an http(s) URL: {}", self.base_url));
        }

        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn recognize_url(&self) -> String {
        join_url(&self.base_url, &self.recognize_path)
    }

    pub fn alert_url(&self) -> String {
        join_url(&self.base_url, &self.alert_path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Recognizer request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionRequest {
    /// Base64 WAV payload
    pub audio: String,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

/// Recognizer response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizerResponse {
    pub success: bool,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub keyword_detected: bool,
    #[serde(default)]
    pub sms_sent: bool,
    #[serde(default)]
    pub message: String,
}

/// Alert-dispatch response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Outcome of one recognizer round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub transcript: String,
    pub keyword_detected: bool,
    pub escalation_sent: bool,
}

/// Authenticated calls to the remote recognizer service
#[async_trait]
pub trait RecognizerApi: Send + Sync {
    async fn recognize(
        &self,
        token: &str,
        request: &RecognitionRequest,
    ) -> Result<RecognizerResponse, TransportError>;

    async fn dispatch_alert(&self, token: &str) -> Result<AlertResponse, TransportError>;
}

/// `RecognizerApi` over HTTPS with bearer auth
pub struct HttpRecognizerApi {
    client: reqwest::Client,
    recognize_url: String,
    alert_url: String,
}

impl HttpRecognizerApi {
    pub fn new(config: &RecognizerConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            recognize_url: config.recognize_url(),
            alert_url: config.alert_url(),
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl RecognizerApi for HttpRecognizerApi {
    async fn recognize(
        &self,
        token: &str,
        request: &RecognitionRequest,
    ) -> Result<RecognizerResponse, TransportError> {
        debug!("POST {} ({} base64 bytes)", self.recognize_url, request.audio.len());
        let builder = self
            .client
            .post(&self.recognize_url)
            .bearer_auth(token)
            .json(request);
        self.send(builder).await
    }

    async fn dispatch_alert(&self, token: &str) -> Result<AlertResponse, TransportError> {
        debug!("POST {}", self.alert_url);
        let builder = self.client.post(&self.alert_url).bearer_auth(token);
        self.send(builder).await
    }
}

/// Consumer of completed segments
#[async_trait]
pub trait SegmentProcessor: Send + Sync {
    async fn process(&self, segment: Segment) -> Result<RecognitionResult, EscalationError>;
}

#[derive(Default)]
struct RecognitionCounters {
    requests: AtomicU64,
    recognized: AtomicU64,
    keyword_hits: AtomicU64,
    alerts_sent: AtomicU64,
    alert_failures: AtomicU64,
    notification_failures: AtomicU64,
    transport_failures: AtomicU64,
    auth_missing: AtomicU64,
    rejected: AtomicU64,
}

/// Recognition statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognitionStats {
    pub requests: u64,
    pub recognized: u64,
    pub keyword_hits: u64,
    pub alerts_sent: u64,
    pub alert_failures: u64,
    pub notification_failures: u64,
    pub transport_failures: u64,
    pub auth_missing: u64,
    pub rejected: u64,
}

/// Segment-to-escalation pipeline
pub struct RecognitionEscalationClient {
    api: Arc<dyn RecognizerApi>,
    credentials: Arc<dyn TokenProvider>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    user_id: Option<i64>,
    counters: RecognitionCounters,
}

impl RecognitionEscalationClient {
    pub fn new(
        config: &RecognizerConfig,
        api: Arc<dyn RecognizerApi>,
        credentials: Arc<dyn TokenProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            api,
            credentials,
            notifier,
            timeout: config.timeout(),
            user_id: config.user_id,
            counters: RecognitionCounters::default(),
        }
    }

    /// Client talking to the HTTP recognizer described by `config`
    pub fn with_http(
        config: &RecognizerConfig,
        credentials: Arc<dyn TokenProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, TransportError> {
        let api = Arc::new(HttpRecognizerApi::new(config)?);
        Ok(Self::new(config, api, credentials, notifier))
    }

    /// Recognize an already-encoded blob and escalate on a keyword hit.
    ///
    /// Failures are returned, never retried.
    pub async fn process_blob(&self, blob: &AudioBlob) -> Result<RecognitionResult, EscalationError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let token = match self.credentials.token() {
            Some(token) => token,
            None => {
                self.counters.auth_missing.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping segment: no auth token");
                return Err(EscalationError::AuthMissing);
            }
        };

        let request = RecognitionRequest {
            audio: blob.to_base64(),
            sample_rate: blob.sample_rate,
            user_id: self.user_id,
        };

        let response = match tokio::time::timeout(self.timeout, self.api.recognize(&token, &request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Recognizer call failed, segment dropped: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                self.counters.transport_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Recognizer call timed out after {:?}, segment dropped", self.timeout);
                return Err(TransportError::Timeout.into());
            }
        };

        if !response.success {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Recognizer rejected segment: {}", response.message);
            return Err(EscalationError::Rejected(response.message));
        }

        self.counters.recognized.fetch_add(1, Ordering::Relaxed);

        if !response.keyword_detected {
            debug!(
                "Recognized {:.1}s of audio, no keyword: \"{}\"",
                blob.duration().as_secs_f32(),
                response.transcript
            );
            return Ok(RecognitionResult {
                transcript: response.transcript,
                keyword_detected: false,
                escalation_sent: response.sms_sent,
            });
        }

        self.counters.keyword_hits.fetch_add(1, Ordering::Relaxed);
        info!("Distress keyword detected: \"{}\"", response.transcript);

        let alert_sent = self.escalate(&token, &response.transcript).await;

        Ok(RecognitionResult {
            transcript: response.transcript,
            keyword_detected: true,
            escalation_sent: response.sms_sent || alert_sent,
        })
    }

    /// One alert-dispatch attempt and one local notification attempt, run
    /// together. Returns whether the alert call succeeded.
    async fn escalate(&self, token: &str, transcript: &str) -> bool {
        let notice = EmergencyNotice::new(transcript);

        let alert = async {
            match tokio::time::timeout(self.timeout, self.api.dispatch_alert(token)).await {
                Ok(Ok(response)) if response.success => {
                    info!("Emergency alert dispatched: {}", response.message);
                    true
                }
                Ok(Ok(response)) => {
                    error!("Emergency alert rejected: {}", response.message);
                    false
                }
                Ok(Err(e)) => {
                    error!("Emergency alert failed: {}", e);
                    false
                }
                Err(_) => {
                    error!("Emergency alert timed out after {:?}", self.timeout);
                    false
                }
            }
        };

        let notify = async {
            if let Err(e) = self.notifier.emergency(&notice) {
                self.counters.notification_failures.fetch_add(1, Ordering::Relaxed);
                error!("Emergency notification failed: {}", e);
            }
        };

        let (alert_sent, ()) = tokio::join!(alert, notify);

        if alert_sent {
            self.counters.alerts_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.alert_failures.fetch_add(1, Ordering::Relaxed);
        }

        alert_sent
    }

    /// Get current statistics
    pub fn stats(&self) -> RecognitionStats {
        let c = &self.counters;
        RecognitionStats {
            requests: c.requests.load(Ordering::Relaxed),
            recognized: c.recognized.load(Ordering::Relaxed),
            keyword_hits: c.keyword_hits.load(Ordering::Relaxed),
            alerts_sent: c.alerts_sent.load(Ordering::Relaxed),
            alert_failures: c.alert_failures.load(Ordering::Relaxed),
            notification_failures: c.notification_failures.load(Ordering::Relaxed),
            transport_failures: c.transport_failures.load(Ordering::Relaxed),
            auth_missing: c.auth_missing.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SegmentProcessor for RecognitionEscalationClient {
    async fn process(&self, segment: Segment) -> Result<RecognitionResult, EscalationError> {
        let blob = AudioBlob::from_segment(&segment)
            .map_err(|e| EscalationError::Encoding(e.to_string()))?;
        debug!(
            "Processing segment: {} frames, {:.1}s ({:?})",
            segment.frame_count,
            segment.duration().as_secs_f32(),
            segment.close_reason
        );
        self.process_blob(&blob).await
    }
}
