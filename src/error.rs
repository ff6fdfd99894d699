use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level failure classification. `Connect` and `Read` failures are
/// the recoverable kinds the retry stage may turn into a fresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Connect,
    Read,
    Write,
    Interrupted,
    Other,
}

impl TransportErrorKind {
    pub(crate) const fn is_recoverable(self) -> bool {
        matches!(self, Self::Connect | Self::Read)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Write => "write",
            Self::Interrupted => "interrupted",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    AlreadyExecuted,
    Canceled,
    InvalidArgument,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    TooManyFollowUps,
    ProtocolViolation,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyExecuted => "already_executed",
            Self::Canceled => "canceled",
            Self::InvalidArgument => "invalid_argument",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::TooManyFollowUps => "too_many_follow_ups",
            Self::ProtocolViolation => "protocol_violation",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("call was already executed")]
    AlreadyExecuted,
    #[error("call was canceled")]
    Canceled,
    #[error("invalid argument {what}: {value}")]
    InvalidArgument { what: &'static str, value: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    #[error("too many follow-up requests: {count}")]
    TooManyFollowUps { count: usize },
    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyExecuted => ErrorCode::AlreadyExecuted,
            Self::Canceled => ErrorCode::Canceled,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::TooManyFollowUps { .. } => ErrorCode::TooManyFollowUps,
            Self::ProtocolViolation { .. } => ErrorCode::ProtocolViolation,
        }
    }

    /// Convenience constructor for transport implementations.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// True when the retry stage may recover from this failure with a fresh
    /// attempt. Cancellation and protocol errors are always terminal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => kind.is_recoverable(),
            _ => false,
        }
    }
}
