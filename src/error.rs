use std::result::Result as StdResult;

/// Errors raised while framing or deframing wire messages. These are fatal to
/// the connection: no reply is written, the socket is closed.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("message checksum mismatch")]
    ChecksumMismatch,

    #[error("message body shorter than declared length")]
    TruncatedBody,

    #[error("unsupported op code {0}")]
    UnknownOpcode(i32),

    #[error("malformed message envelope: {0}")]
    MalformedEnvelope(String),
}

impl CodecError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        CodecError::MalformedEnvelope(msg.into())
    }
}

/// Numeric error codes carried on `ok: 0` replies. The values are fixed by
/// the wire protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    FailedToParse,
    Unauthorized,
    TypeMismatch,
    AuthenticationFailed,
    NamespaceNotFound,
    CursorNotFound,
    NamespaceExists,
    PathContainsEmptyElement,
    CommandNotFound,
    InvalidNamespace,
    WriteConflict,
    NotImplemented,
    DuplicateKey,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::FailedToParse => 9,
            ErrorCode::Unauthorized => 13,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::AuthenticationFailed => 18,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::NamespaceExists => 48,
            ErrorCode::PathContainsEmptyElement => 56,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::WriteConflict => 112,
            ErrorCode::NotImplemented => 238,
            ErrorCode::DuplicateKey => 11000,
        }
    }

    pub fn code_name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::AuthenticationFailed => "AuthenticationFailed",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::PathContainsEmptyElement => "Location56",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::WriteConflict => "WriteConflict",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::DuplicateKey => "DuplicateKey",
        }
    }
}

/// A command-level failure, reported to the client as an `ok: 0` reply with
/// `errmsg`, `code` and `codeName`. The connection stays open.
#[derive(thiserror::Error, Debug)]
#[error("{message} (code {})", self.code.code())]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeMismatch, message)
    }

    pub fn failed_to_parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedToParse, message)
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::CommandNotFound,
            format!("no such command: '{name}'"),
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn auth_failed() -> Self {
        Self::new(ErrorCode::AuthenticationFailed, "Authentication failed.")
    }

    pub fn invalid_namespace(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidNamespace, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Command(#[from] CommandError),

    /// A handler was invoked on a scope that carries no connection info.
    /// This is a programming error upstream, not a recoverable condition;
    /// it never turns into a wire reply.
    #[error("request scope carries no connection info")]
    MissingConnectionContext,

    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Fatal errors close the connection without a reply.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Codec(_) | Error::MissingConnectionContext
        )
    }
}

pub type Result<T> = StdResult<T, Error>;
