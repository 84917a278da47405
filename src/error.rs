//! Error types surfaced by a [`Session`](crate::protocol::Session).
//!
//! Callers mostly care about one distinction: whether an error is fatal to the
//! whole session (reconnect) or only to the query that produced it (carry on).
//! [`Error::is_fatal`] answers exactly that.
use std::fmt;

use thiserror::Error;

use crate::protocol::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    /// The underlying stream failed; the session is unusable.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The session was closed earlier, either explicitly or after a transport failure.
    #[error("session is closed")]
    Closed,

    /// The query failed but the stream was resynchronised at the prompt.
    #[error("{0}")]
    Query(QueryError),

    /// The writer thread was handed a second query while still writing the first.
    #[error("writer thread already in use")]
    WriterBusy,

    #[error("cannot open debug log: {0}")]
    DebugLog(#[source] std::io::Error),

    /// A [`SessionConfig`](crate::SessionConfig) value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Returns `true` if the session must be discarded after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TransportClosed(_) | Error::Closed)
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        Error::TransportClosed(value.to_string())
    }
}

impl From<QueryError> for Error {
    fn from(value: QueryError) -> Self {
        Error::Query(value)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where a query failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// An `!` line sent by the server.
    Server,
    /// A line the client did not expect, or a response rejecting a line.
    Protocol,
    /// A response did not receive everything its header promised.
    Consistency,
}

/// SQLSTATE attached to client-detected protocol violations.
pub const PROTOCOL_VIOLATION: &str = "M0M10";

/// A single message making up a [`QueryError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Protocol,
            sqlstate: Some(PROTOCOL_VIOLATION.to_string()),
            message: message.into(),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Consistency,
            sqlstate: None,
            message: message.into(),
        }
    }

    pub fn with_sqlstate(mut self, sqlstate: &str) -> Self {
        self.sqlstate = Some(sqlstate.to_string());
        self
    }

    /// Builds a server failure from the text of an error line, without the
    /// leading `!`. A `XXXXX!` SQLSTATE prefix is split off when present.
    pub fn server(text: &str) -> Self {
        let (sqlstate, message) = split_sqlstate(text);
        Self {
            kind: FailureKind::Server,
            sqlstate,
            message: message.to_string(),
        }
    }
}

/// Splits `42000!syntax error` into `(Some("42000"), "syntax error")`.
pub(crate) fn split_sqlstate(text: &str) -> (Option<String>, &str) {
    let bytes = text.as_bytes();
    if bytes.len() > 5
        && bytes[5] == b'!'
        && bytes[..5].iter().all(|b| b.is_ascii_alphanumeric())
    {
        return (Some(text[..5].to_string()), &text[6..]);
    }
    (None, text)
}

/// All failures collected while draining one query's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryError {
    failures: Vec<Failure>,
}

impl QueryError {
    pub fn new(failures: Vec<Failure>) -> Self {
        Self { failures }
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// SQLSTATE of the first failure, if the server sent one.
    pub fn sqlstate(&self) -> Option<&str> {
        self.failures.first().and_then(|f| f.sqlstate.as_deref())
    }

    pub(crate) fn push(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", failure.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_sqlstate_prefix() {
        let failure = Failure::server("42S02!no such table 'foo'");
        assert_eq!(failure.sqlstate.as_deref(), Some("42S02"));
        assert_eq!(failure.message, "no such table 'foo'");
    }

    #[test]
    fn keeps_plain_messages() {
        let failure = Failure::server("permission denied");
        assert_eq!(failure.sqlstate, None);
        assert_eq!(failure.message, "permission denied");

        let failure = Failure::server("oops! bad");
        assert_eq!(failure.sqlstate, None);
        assert_eq!(failure.message, "oops! bad");
    }

    #[test]
    fn query_error_joins_messages() {
        let err = QueryError::new(vec![
            Failure::server("first"),
            Failure::protocol("second"),
        ]);
        assert_eq!(err.to_string(), "first\nsecond");
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::TransportClosed("eof".into()).is_fatal());
        assert!(Error::Closed.is_fatal());
        assert!(!Error::Query(QueryError::default()).is_fatal());
        assert!(!Error::WriterBusy.is_fatal());
    }
}
