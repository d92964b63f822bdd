//! Transport-level error taxonomy.

use serde::{Deserialize, Serialize};

/// Failure reported by a transport before it could produce a [`crate::Response`].
///
/// A provider that managed to return a partial message reports failures through
/// [`crate::StopReason::Error`] instead, so the partial content is not lost.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SDKError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("request aborted")]
    Aborted,
}

impl SDKError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_message_includes_text() {
        let error = SDKError::provider("rate limited");
        assert_eq!(error.to_string(), "provider error: rate limited");
        assert!(!error.is_aborted());
        assert!(SDKError::Aborted.is_aborted());
    }
}
