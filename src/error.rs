//! Error taxonomy for the adapter and the component boundary

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdapterError>;

/// Error codes returned by calls into the hardware component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("incorrect state for this call")]
    IncorrectState,
    #[error("bad parameter")]
    BadParameter,
    #[error("unsupported setting")]
    Unsupported,
    #[error("hardware fault")]
    Hardware,
    #[error("component handle released")]
    Released,
}

/// How bad an error is for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Operation failed, adapter still usable
    Soft,
    /// Operation failed and buffers may have been dropped
    Hard,
    /// Adapter is unusable and must be torn down
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("component invalid: {0}")]
    HardwareInvalid(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("component call failed: {0}")]
    Hardware(#[from] HwError),
}

impl AdapterError {
    pub fn severity(&self) -> Severity {
        match self {
            AdapterError::HardwareInvalid(_) => Severity::Fatal,
            AdapterError::Timeout(_) | AdapterError::Hardware(HwError::Hardware) => Severity::Hard,
            _ => Severity::Soft,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>) -> Self {
        AdapterError::Timeout(what.into())
    }

    pub(crate) fn invalid_state(what: impl Into<String>) -> Self {
        AdapterError::InvalidState(what.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping() {
        assert_eq!(AdapterError::HardwareInvalid("x".into()).severity(), Severity::Fatal);
        assert_eq!(AdapterError::timeout("ack").severity(), Severity::Hard);
        assert_eq!(AdapterError::invalid_state("busy").severity(), Severity::Soft);
        assert_eq!(AdapterError::from(HwError::BadParameter).severity(), Severity::Soft);
        assert_eq!(AdapterError::from(HwError::Hardware).severity(), Severity::Hard);
        assert!(Severity::Fatal > Severity::Hard);
    }
}
