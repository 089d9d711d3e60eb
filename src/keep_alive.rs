/// Keep-alive module
///
/// Background capture has to keep running with the screen off. The platform
/// mechanism (wake lock, foreground service, power assertion) sits behind
/// `KeepAliveBackend`; `KeepAlive` makes acquire/release idempotent.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Platform hook that keeps the process scheduled while monitoring
pub trait KeepAliveBackend: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Backend for hosts without a power-management hook: only logs
#[derive(Debug, Default)]
pub struct LoggingKeepAlive;

impl KeepAliveBackend for LoggingKeepAlive {
    fn acquire(&self) {
        info!("Keep-alive acquired");
    }

    fn release(&self) {
        info!("Keep-alive released");
    }
}

/// Single-owner keep-alive resource with idempotent acquire/release
#[derive(Clone)]
pub struct KeepAlive {
    backend: Arc<dyn KeepAliveBackend>,
    held: Arc<Mutex<bool>>,
}

impl KeepAlive {
    pub fn new(backend: Arc<dyn KeepAliveBackend>) -> Self {
        Self {
            backend,
            held: Arc::new(Mutex::new(false)),
        }
    }

    /// Acquire the resource; no-op when already held
    pub fn acquire(&self) {
        let mut held = self.held.lock();
        if *held {
            debug!("Keep-alive already held");
            return;
        }
        self.backend.acquire();
        *held = true;
    }

    /// Release the resource; no-op when not held
    pub fn release(&self) {
        let mut held = self.held.lock();
        if !*held {
            return;
        }
        self.backend.release();
        *held = false;
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new(Arc::new(LoggingKeepAlive))
    }
}
