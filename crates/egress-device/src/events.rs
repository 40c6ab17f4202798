//! Error Events
//!
//! Fire-and-forget sink for errors observed while generating a tunnel
//! configuration. Sinks must never block or fail the caller.

use crate::error::NetworkProtectionError;
use std::sync::Mutex;
use tracing::error;

/// Receives every error the device manager reports
pub trait ErrorEvents: Send + Sync {
    fn fire(&self, error: &NetworkProtectionError);
}

impl<F> ErrorEvents for F
where
    F: Fn(&NetworkProtectionError) + Send + Sync,
{
    fn fire(&self, error: &NetworkProtectionError) {
        self(error)
    }
}

/// Default sink: one `tracing` error event per report
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorEvents;

impl ErrorEvents for TracingErrorEvents {
    fn fire(&self, err: &NetworkProtectionError) {
        error!(event = err.event_name(), "{}", err);
    }
}

/// Keeps every fired error in memory
#[derive(Debug, Default)]
pub struct RecordingErrorEvents {
    fired: Mutex<Vec<NetworkProtectionError>>,
}

impl RecordingErrorEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the errors fired so far, oldest first
    pub fn fired(&self) -> Vec<NetworkProtectionError> {
        match self.fired.lock() {
            Ok(fired) => fired.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn contains(&self, error: &NetworkProtectionError) -> bool {
        self.fired().contains(error)
    }
}

impl ErrorEvents for RecordingErrorEvents {
    fn fire(&self, error: &NetworkProtectionError) {
        match self.fired.lock() {
            Ok(mut fired) => fired.push(error.clone()),
            Err(poisoned) => poisoned.into_inner().push(error.clone()),
        }
    }
}
