/// Notification surface module
///
/// The monitor produces two kinds of notices for the host OS: a persistent
/// low-priority "monitoring active" notice with a stop action, and a
/// high-priority emergency notice carrying the recognized transcript.

use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Notification surface unavailable: {0}")]
    Unavailable(String),

    #[error("Notification rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPriority {
    Low,
    High,
}

/// Persistent notice shown while the monitor is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringNotice {
    pub title: String,
    pub body: String,
    /// Label of the action that triggers `stop()`
    pub stop_action: String,
    pub priority: NotificationPriority,
}

impl Default for MonitoringNotice {
    fn default() -> Self {
        Self {
            title: "Safety monitoring active".to_string(),
            body: "Listening for distress keywords".to_string(),
            stop_action: "Stop".to_string(),
            priority: NotificationPriority::Low,
        }
    }
}

/// Transient notice raised when escalation fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyNotice {
    pub title: String,
    pub transcript: String,
    pub priority: NotificationPriority,
}

impl EmergencyNotice {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            title: "Emergency keyword detected".to_string(),
            transcript: transcript.into(),
            priority: NotificationPriority::High,
        }
    }
}

/// OS notification surface
pub trait Notifier: Send + Sync {
    fn show_monitoring(&self, notice: &MonitoringNotice) -> Result<(), NotifyError>;

    fn clear_monitoring(&self) -> Result<(), NotifyError>;

    fn emergency(&self, notice: &EmergencyNotice) -> Result<(), NotifyError>;
}

/// Notifier for hosts without a notification surface: writes to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_monitoring(&self, notice: &MonitoringNotice) -> Result<(), NotifyError> {
        info!("[notice:{:?}] {} - {} [{}]", notice.priority, notice.title, notice.body, notice.stop_action);
        Ok(())
    }

    fn clear_monitoring(&self) -> Result<(), NotifyError> {
        info!("[notice] monitoring notice cleared");
        Ok(())
    }

    fn emergency(&self, notice: &EmergencyNotice) -> Result<(), NotifyError> {
        warn!("[notice:{:?}] {}: \"{}\"", notice.priority, notice.title, notice.transcript);
        Ok(())
    }
}
