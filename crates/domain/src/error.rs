/// Shared error type used across all VoxGate crates.
///
/// Every variant maps to a stable wire-level `kind` code (see [`Error::kind`])
/// so clients can handle failures programmatically. Raw vendor errors never
/// cross the API boundary; [`Error::user_message`] produces the short,
/// non-technical text surfaced to end users.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("auth denied: {0}")]
    AuthDenied(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool fault: {0}")]
    ToolFault(String),

    #[error("tool timed out: {0}")]
    ToolTimeout(String),

    #[error("{service} unavailable: {message}")]
    ExternalUnavailable { service: String, message: String },

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("stream backpressure: {0}")]
    Backpressure(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short constructor for provider-side unavailability.
    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InputInvalid(_) => "input_invalid",
            Self::AuthDenied(_) => "auth_denied",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::ToolFault(_) => "tool_fault",
            Self::ToolTimeout(_) => "tool_timeout",
            Self::ExternalUnavailable { .. } => "external_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Backpressure(_) => "backpressure",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Short, friendly text safe to show to an end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::InputInvalid(_) => "I couldn't understand that input.".into(),
            Self::AuthDenied(_) => "You are not authorized for this request.".into(),
            Self::ToolNotFound(_) | Self::ToolFault(_) | Self::ToolTimeout(_) => {
                "One of my tools had a problem. Please try again.".into()
            }
            Self::ExternalUnavailable { .. } => {
                "A service I depend on is currently unavailable. Please try again shortly.".into()
            }
            Self::Timeout(_) => "That took too long to answer. Please try again.".into(),
            Self::Backpressure(_) => "The connection could not keep up with the response.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            Self::Internal(_) => "Something went wrong on my side. Please try again.".into(),
        }
    }

    /// Whether this error is transient enough that one retry is worthwhile.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ExternalUnavailable { .. } | Self::Timeout(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(Error::InputInvalid("x".into()).kind(), "input_invalid");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::unavailable("tts", "connection refused").kind(),
            "external_unavailable"
        );
        assert_eq!(Error::Backpressure("buffer full".into()).kind(), "backpressure");
    }

    #[test]
    fn user_message_hides_detail() {
        let err = Error::ToolFault("panic in handler: index out of bounds".into());
        assert!(!err.user_message().contains("panic"));
        assert!(!err.user_message().contains("index"));
    }

    #[test]
    fn retriable_classification() {
        assert!(Error::unavailable("llm", "503").is_retriable());
        assert!(Error::Timeout("llm call".into()).is_retriable());
        assert!(!Error::InputInvalid("empty".into()).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
    }
}
