//! Error types for the scheduler and the offload engine.

use thiserror::Error;

/// Errors surfaced by the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A resource (device memory, queue capacity) could not be obtained.
    #[error("out of resource: {0}")]
    OutOfResource(String),

    /// A named entity (datum, device, kernel symbol) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The targeted device has been disabled after a fatal error.
    #[error("device {0} is disabled")]
    DeviceDisabled(usize),
}

/// Errors raised inside the device offload engine.
///
/// `NeedRetry` and `MemoryExhausted` are recoverable: the task is pushed
/// back and retried once memory pressure eases. `Api` poisons the device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device backend reported an unrecoverable API failure.
    #[error("device API failure: {0}")]
    Api(String),

    /// The memory pool stayed exhausted across placement retries.
    #[error("device memory exhausted after {0} placement retries")]
    MemoryExhausted(u32),

    /// A write was attempted on a copy that still has active readers.
    #[error("anti-dependency: write access to datum {key:#x} with {readers} active readers")]
    AntiDependency { key: u64, readers: i32 },

    /// A device kernel symbol could not be resolved.
    #[error("kernel symbol not found: {0}")]
    NotFound(String),

    /// Internal signal: reserve backed out under pool pressure; the
    /// task re-queues and retries once eviction can make room.
    #[error("task must be rescheduled")]
    NeedRetry,
}

impl DeviceError {
    /// Whether this error poisons the whole device (as opposed to a
    /// single task or a retryable condition).
    pub fn is_fatal_for_device(&self) -> bool {
        matches!(self, DeviceError::Api(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(DeviceError::Api("event query".into()).is_fatal_for_device());
        assert!(!DeviceError::NeedRetry.is_fatal_for_device());
        assert!(!DeviceError::MemoryExhausted(3).is_fatal_for_device());
        assert!(!DeviceError::AntiDependency { key: 1, readers: 2 }.is_fatal_for_device());
    }
}
