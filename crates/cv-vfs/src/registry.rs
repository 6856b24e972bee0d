//! In-flight install tracking
//!
//! At most one install may target a given title key at a time. Claiming a
//! key yields an [`InstallGuard`] that releases it on drop, including on
//! error and cancellation paths.

use cv_core::error::InstallError;
use cv_core::title::TitleKey;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared set of title keys with an install running
#[derive(Debug, Default)]
pub struct InstallRegistry {
    in_flight: Mutex<HashSet<TitleKey>>,
}

impl InstallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `key`, failing with `InstallInProgress` if it is already held
    pub fn try_begin(self: &Arc<Self>, key: TitleKey) -> Result<InstallGuard, InstallError> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains(&key) {
            return Err(InstallError::InstallInProgress {
                serial: key.serial.to_string(),
                category: key.category,
            });
        }
        in_flight.insert(key.clone());
        tracing::debug!("Install slot claimed for {}", key);

        Ok(InstallGuard {
            registry: Arc::clone(self),
            key,
        })
    }

    pub fn is_in_flight(&self, key: &TitleKey) -> bool {
        self.in_flight.lock().contains(key)
    }

    /// Number of installs currently running
    pub fn active(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Held for the duration of one install
#[derive(Debug)]
pub struct InstallGuard {
    registry: Arc<InstallRegistry>,
    key: TitleKey,
}

impl InstallGuard {
    pub fn key(&self) -> &TitleKey {
        &self.key
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        self.registry.in_flight.lock().remove(&self.key);
        tracing::debug!("Install slot released for {}", self.key);
    }
}
