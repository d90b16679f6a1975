//! Error types for the provider bridge.

use thiserror::Error;

use crate::types::ResourceState;

/// Errors that can occur while bridging calls to a source plugin.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The plugin binary could not be located or started.
    #[error("Launch error: {0}")]
    Launch(String),

    /// The plugin spoke an unsupported protocol version.
    #[error("Protocol mismatch: expected version {expected}, plugin reported {reported}")]
    ProtocolMismatch {
        /// The protocol version the bridge speaks.
        expected: u32,
        /// What the plugin reported in its handshake.
        reported: String,
    },

    /// Provider configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A call requiring a configured provider arrived before configuration.
    #[error("Provider is not configured: {0}")]
    NotConfigured(String),

    /// An identifier is unknown or its alias chain is broken.
    #[error("Schema mapping error: {0}")]
    SchemaMapping(String),

    /// A value cannot be represented in the other protocol's type system.
    #[error("Translation error at '{path}': {message}")]
    Translation {
        /// The property path of the offending value.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// The plugin's channel closed unexpectedly.
    #[error("Plugin crashed: {0}")]
    SubprocessCrash(String),

    /// The caller cancelled or disconnected; the plugin-side outcome is unknown.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The call did not complete within its deadline.
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    /// The plugin reported a failure for the call.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Invalid request from the engine.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A gRPC transport error occurred.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// An operation failed; the caller's last-known state is returned unmodified.
    #[error("{source}")]
    WithState {
        /// The state the caller held before the failed operation.
        state: Box<ResourceState>,
        /// The underlying failure.
        source: Box<BridgeError>,
    },
}

/// Coarse classification of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`BridgeError::Launch`].
    Launch,
    /// See [`BridgeError::ProtocolMismatch`].
    ProtocolMismatch,
    /// See [`BridgeError::Configuration`].
    Configuration,
    /// See [`BridgeError::NotConfigured`].
    NotConfigured,
    /// See [`BridgeError::SchemaMapping`].
    SchemaMapping,
    /// See [`BridgeError::Translation`].
    Translation,
    /// See [`BridgeError::SubprocessCrash`].
    SubprocessCrash,
    /// See [`BridgeError::Cancelled`].
    Cancelled,
    /// See [`BridgeError::Timeout`].
    Timeout,
    /// See [`BridgeError::Plugin`].
    Plugin,
    /// See [`BridgeError::InvalidRequest`].
    InvalidRequest,
    /// See [`BridgeError::Serialization`].
    Serialization,
    /// See [`BridgeError::Transport`].
    Transport,
}

impl BridgeError {
    /// Create a translation error for a property path.
    pub fn translation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Translation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Attach the caller's last-known state to this error.
    pub fn with_state(self, state: ResourceState) -> Self {
        match self {
            Self::WithState { source, .. } => Self::WithState {
                state: Box::new(state),
                source,
            },
            other => Self::WithState {
                state: Box::new(state),
                source: Box::new(other),
            },
        }
    }

    /// The last-known state carried by this error, if any.
    pub fn last_known_state(&self) -> Option<&ResourceState> {
        match self {
            Self::WithState { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Classify the error, looking through attached state.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Launch(_) => ErrorKind::Launch,
            Self::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::NotConfigured(_) => ErrorKind::NotConfigured,
            Self::SchemaMapping(_) => ErrorKind::SchemaMapping,
            Self::Translation { .. } => ErrorKind::Translation,
            Self::SubprocessCrash(_) => ErrorKind::SubprocessCrash,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Plugin(_) => ErrorKind::Plugin,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Transport(_) => ErrorKind::Transport,
            Self::WithState { source, .. } => source.kind(),
        }
    }

    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::Launch(msg) => msg,
            Self::ProtocolMismatch { reported, .. } => reported,
            Self::Configuration(msg) => msg,
            Self::NotConfigured(msg) => msg,
            Self::SchemaMapping(msg) => msg,
            Self::Translation { message, .. } => message,
            Self::SubprocessCrash(msg) => msg,
            Self::Cancelled(msg) => msg,
            Self::Timeout(msg) => msg,
            Self::Plugin(msg) => msg,
            Self::InvalidRequest(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
            Self::Transport(_err) => "transport error (see Debug output)",
            Self::WithState { source, .. } => source.message(),
        }
    }
}

impl From<BridgeError> for tonic::Status {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Launch(msg) => tonic::Status::unavailable(msg),
            err @ BridgeError::ProtocolMismatch { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            },
            BridgeError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            BridgeError::NotConfigured(msg) => tonic::Status::failed_precondition(msg),
            BridgeError::SchemaMapping(msg) => tonic::Status::not_found(msg),
            err @ BridgeError::Translation { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            },
            BridgeError::SubprocessCrash(msg) => tonic::Status::unavailable(msg),
            BridgeError::Cancelled(msg) => tonic::Status::cancelled(msg),
            BridgeError::Timeout(msg) => tonic::Status::deadline_exceeded(msg),
            BridgeError::Plugin(msg) => tonic::Status::internal(msg),
            BridgeError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            BridgeError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            BridgeError::Transport(err) => {
                tonic::Status::unavailable(format!("Transport error: {}", err))
            },
            BridgeError::WithState { source, .. } => (*source).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PropertyValue;

    #[test]
    fn test_error_display() {
        let err = BridgeError::NotConfigured("create".to_string());
        assert_eq!(format!("{}", err), "Provider is not configured: create");

        let err = BridgeError::translation("tags.0", "non-finite number");
        assert_eq!(
            format!("{}", err),
            "Translation error at 'tags.0': non-finite number"
        );

        let err = BridgeError::ProtocolMismatch {
            expected: 1,
            reported: "4".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Protocol mismatch: expected version 1, plugin reported 4"
        );
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = BridgeError::SchemaMapping("x".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = BridgeError::translation("a", "b").into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = BridgeError::Configuration("x".to_string()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = BridgeError::SubprocessCrash("x".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = BridgeError::Cancelled("x".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Cancelled);

        let status: tonic::Status = BridgeError::Timeout("x".to_string()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }

    #[test]
    fn test_with_state_keeps_kind_and_state() {
        let state = ResourceState::new(
            "i-123",
            "mock:index/instance:Instance",
            PropertyValue::map(vec![("ami", PropertyValue::from("ami-1"))]),
            0,
        );
        let err = BridgeError::SubprocessCrash("channel closed".to_string()).with_state(state);

        assert_eq!(err.kind(), ErrorKind::SubprocessCrash);
        assert_eq!(err.message(), "channel closed");
        assert_eq!(err.to_string(), "Plugin crashed: channel closed");
        let kept = err.last_known_state().unwrap();
        assert_eq!(kept.id, "i-123");

        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn test_message_method() {
        let err = BridgeError::Plugin("quota exceeded".to_string());
        assert_eq!(err.message(), "quota exceeded");
        assert_eq!(err.kind(), ErrorKind::Plugin);
    }
}
