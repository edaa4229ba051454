use thiserror::Error;

pub type Result<T> = std::result::Result<T, ErrorKind>;

pub const SETUP_HINT: &str = "Make sure the container engine is running and its API is exposed \
(for example `colima start --api`, or enable the daemon socket in Docker Desktop).";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("unable to connect to the container engine at {endpoint}: {reason}")]
    ConnectionUnavailable { endpoint: String, reason: String },

    #[error("engine rejected request with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("invalid response from engine: {0}")]
    InvalidResponse(String),

    #[error("failed to decode stream unit: {0}")]
    StreamDecode(String),

    #[error("stream closed by engine")]
    StreamClosed,

    #[error("unsupported by transport: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} failed: {cause}")]
    CommandFailed {
        operation: String,
        cause: Box<ErrorKind>,
    },
}

impl ErrorKind {
    pub fn http(status: u16, body: &[u8]) -> Self {
        Self::Http {
            status,
            message: engine_message(body),
        }
    }

    pub fn command(operation: impl Into<String>, cause: ErrorKind) -> Self {
        Self::CommandFailed {
            operation: operation.into(),
            cause: Box::new(cause),
        }
    }

    /// The engine never answered: it is not running, not exposed, or too slow.
    /// Everything else means the engine answered and said no.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ConnectionUnavailable { .. } => true,
            Self::CommandFailed { cause, .. } => cause.is_unreachable(),
            Self::Http { .. }
            | Self::InvalidResponse(_)
            | Self::StreamDecode(_)
            | Self::StreamClosed
            | Self::Unsupported(_)
            | Self::InvalidArgument(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::CommandFailed { cause, .. } => cause.status(),
            _ => None,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        self.is_unreachable().then_some(SETUP_HINT)
    }

    /// Single line for status bars: the error plus the setup hint when the
    /// engine could not be reached.
    pub fn user_message(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{self}. {hint}"),
            None => self.to_string(),
        }
    }
}

fn engine_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(message) = value.get("message").and_then(|message| message.as_str())
    {
        return message.to_string();
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        "no details".to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, SETUP_HINT};

    #[test]
    fn unreachable_errors_carry_setup_hint() {
        let error = ErrorKind::ConnectionUnavailable {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert!(error.is_unreachable());
        assert!(error.user_message().ends_with(SETUP_HINT));

        let timeout = ErrorKind::Timeout(10_000);
        assert!(timeout.is_unreachable());
    }

    #[test]
    fn rejected_requests_are_not_unreachable() {
        let error = ErrorKind::http(409, br#"{"message":"container already started"}"#);
        assert!(!error.is_unreachable());
        assert_eq!(error.status(), Some(409));
        assert_eq!(
            error.to_string(),
            "engine rejected request with HTTP 409: container already started"
        );
        assert!(error.hint().is_none());
    }

    #[test]
    fn command_failures_inherit_reachability_of_cause() {
        let unreachable = ErrorKind::command("start", ErrorKind::Timeout(5));
        assert!(unreachable.is_unreachable());

        let rejected = ErrorKind::command("remove", ErrorKind::http(404, b"no such container"));
        assert!(!rejected.is_unreachable());
        assert_eq!(rejected.status(), Some(404));
        assert_eq!(
            rejected.to_string(),
            "remove failed: engine rejected request with HTTP 404: no such container"
        );
    }

    #[test]
    fn empty_error_body_reports_no_details() {
        let error = ErrorKind::http(500, b"  ");
        assert_eq!(
            error.to_string(),
            "engine rejected request with HTTP 500: no details"
        );
    }
}
