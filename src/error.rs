use serde_derive::{Deserialize, Serialize};

/// shardcast errors. All errors are transported in reply envelopes as an
/// HTTP-like status code plus a structured body, so variants are kept
/// serializable and self-contained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted, e.g. because the engine is shutting down.
    /// The client can retry against another node.
    Abort,
    /// A malformed or invalid client request: missing dataset, missing scatter
    /// key, invalid address, and so on. Maps to 400.
    BadRequest(String),
    /// An unknown dataset, source, or route target. Maps to 404.
    NotFound(String),
    /// An invalid execution plan: cyclic steps or an input name no step
    /// produces. Fatal to the single request, never to the process.
    Plan(String),
    /// The engine is draining ahead of shutdown and accepts no new requests.
    /// Maps to 503.
    Unavailable,
    /// An unexpected internal error. Maps to 500 and carries no internal
    /// detail beyond the message.
    Internal(String),
    /// An input/output error.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::BadRequest(message) => write!(f, "bad request: {message}"),
            Error::NotFound(message) => write!(f, "not found: {message}"),
            Error::Plan(message) => write!(f, "invalid plan: {message}"),
            Error::Unavailable => write!(f, "engine unavailable"),
            Error::Internal(message) => write!(f, "internal error: {message}"),
            Error::IO(message) => write!(f, "io error: {message}"),
        }
    }
}

impl Error {
    /// Returns the HTTP-like status code used when this error is placed in a
    /// reply envelope.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Abort => 503,
            Error::BadRequest(_) => 400,
            Error::NotFound(_) => 404,
            Error::Plan(_) => 500,
            Error::Unavailable => 503,
            Error::Internal(_) => 500,
            Error::IO(_) => 500,
        }
    }

    /// Returns true if the error was caused by the client rather than the
    /// engine, i.e. it has a 4xx status code.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

/// Constructs an Error::BadRequest using format! syntax.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::BadRequest(format!($($args)*)).into() };
}

/// Constructs an Error::NotFound using format! syntax.
#[macro_export]
macro_rules! errnotfound {
    ($($args:tt)*) => { $crate::error::Error::NotFound(format!($($args)*)).into() };
}

/// Constructs an Error::Plan using format! syntax.
#[macro_export]
macro_rules! errplan {
    ($($args:tt)*) => { $crate::error::Error::Plan(format!($($args)*)).into() };
}

/// A shardcast Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::BadRequest(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::BadRequest(err.to_string())
    }
}

impl From<std::time::SystemTimeError> for Error {
    fn from(err: std::time::SystemTimeError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<time::error::Parse> for Error {
    fn from(err: time::error::Parse) -> Self {
        Error::BadRequest(err.to_string())
    }
}

impl From<time::error::Format> for Error {
    fn from(err: time::error::Format) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Plan("x".into()).status_code(), 500);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
        assert_eq!(Error::Unavailable.status_code(), 503);
        assert!(Error::BadRequest("x".into()).is_client_error());
        assert!(!Error::Internal("x".into()).is_client_error());
    }

    #[test]
    fn macros_build_results() {
        let result: Result<()> = errinput!("missing key for {}", "scatter");
        assert_eq!(result, Err(Error::BadRequest("missing key for scatter".into())));
        let result: Result<()> = errnotfound!("no dataset {}", "Stores");
        assert_eq!(result, Err(Error::NotFound("no dataset Stores".into())));
        let result: Result<()> = errplan!("cyclic steps");
        assert_eq!(result, Err(Error::Plan("cyclic steps".into())));
    }
}
