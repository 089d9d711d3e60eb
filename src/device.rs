/// Device ownership module
///
/// A single physical microphone is shared by the background monitor and the
/// short-capture path. `DeviceOwnership` is the injectable token both sides
/// check atomically at open time.

use crate::audio_source::AudioError;
use cache_padded::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct OwnershipState {
    /// Mirror of `owner.is_some()` for lock-free checks
    held: CachePadded<AtomicBool>,
    owner: Mutex<Option<&'static str>>,
}

/// Shared ownership flag for one physical audio device
#[derive(Clone)]
pub struct DeviceOwnership {
    state: Arc<OwnershipState>,
}

impl DeviceOwnership {
    pub fn new() -> Self {
        Self {
            state: Arc::new(OwnershipState {
                held: CachePadded::new(AtomicBool::new(false)),
                owner: Mutex::new(None),
            }),
        }
    }

    /// Take exclusive ownership of the device.
    ///
    /// Fails with `DeviceBusy` naming the current owner when the device is
    /// already leased. Ownership is released when the lease is dropped.
    pub fn try_acquire(&self, owner: &'static str) -> Result<DeviceLease, AudioError> {
        let mut current = self.state.owner.lock();

        if let Some(holder) = *current {
            debug!("Device busy: {} requested, held by {}", owner, holder);
            return Err(AudioError::DeviceBusy(holder));
        }

        *current = Some(owner);
        self.state.held.store(true, Ordering::Release);
        debug!("Device leased to {}", owner);

        Ok(DeviceLease {
            state: Arc::clone(&self.state),
            owner,
        })
    }

    pub fn is_held(&self) -> bool {
        self.state.held.load(Ordering::Acquire)
    }
}

impl Default for DeviceOwnership {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII lease on the audio device
pub struct DeviceLease {
    state: Arc<OwnershipState>,
    owner: &'static str,
}

impl DeviceLease {
    pub fn owner(&self) -> &'static str {
        self.owner
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut current = self.state.owner.lock();
        *current = None;
        self.state.held.store(false, Ordering::Release);
        debug!("Device released by {}", self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_lease() {
        let device = DeviceOwnership::new();
        let lease = device.try_acquire("monitor").unwrap();
        assert!(device.is_held());
        assert_eq!(lease.owner(), "monitor");

        match device.try_acquire("short-capture") {
            Err(AudioError::DeviceBusy(owner)) => assert_eq!(owner, "monitor"),
            _ => panic!("Expected DeviceBusy"),
        }
    }

    #[test]
    fn test_contention_always_names_owner() {
        let device = DeviceOwnership::new();
        let owners = ["monitor", "short-capture"];

        let handles: Vec<_> = owners
            .iter()
            .map(|&name| {
                let device = device.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        match device.try_acquire(name) {
                            Ok(lease) => drop(lease),
                            Err(AudioError::DeviceBusy(holder)) => {
                                assert!(owners.contains(&holder), "busy with owner {:?}", holder)
                            }
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!device.is_held());
    }

    #[test]
    fn test_release_on_drop() {
        let device = DeviceOwnership::new();
        let other_handle = device.clone();

        {
            let _lease = device.try_acquire("monitor").unwrap();
            assert!(other_handle.is_held());
        }

        assert!(!other_handle.is_held());
        assert!(other_handle.try_acquire("short-capture").is_ok());
    }
}
