use std::{fmt, io, path::PathBuf, time::Duration};

use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::session::SessionState;

/// Failure reported by the data-access layer.
///
/// An interrupted statement is surfaced as [`BackendError::Cancelled`] so callers
/// never have to inspect driver error codes themselves.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("statement was cancelled")]
    Cancelled,
    #[error(transparent)]
    Postgres(tokio_postgres::Error),
    #[error("{0}")]
    Unexpected(String),
}

impl BackendError {
    pub fn unexpected(details: impl fmt::Display) -> Self {
        Self::Unexpected(details.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<tokio_postgres::Error> for BackendError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.code() == Some(&SqlState::QUERY_CANCELED) {
            BackendError::Cancelled
        } else {
            BackendError::Postgres(err)
        }
    }
}

/// Coarse classification used by the binary when reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Io,
}

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("could not {stage}: {source}")]
    Connection {
        stage: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("{stage} failed: {source}")]
    Protocol {
        stage: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("malformed coverage data for {signature}: {details}")]
    MalformedRecord { signature: String, details: String },
    #[error("duplicate function signature in harvested set: {0}")]
    DuplicateSignature(String),
    #[error("listen call did not acknowledge cancellation within {0:?}")]
    CancelTimedOut(Duration),
    #[error("listen task ended without reporting an outcome")]
    ListenerLost,
    #[error("cannot {operation} a session that is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type CoverageResult<T> = Result<T, CoverageError>;

impl CoverageError {
    pub fn connection(stage: &'static str, source: impl Into<BackendError>) -> Self {
        Self::Connection {
            stage,
            source: source.into(),
        }
    }

    pub fn protocol(stage: &'static str, source: impl Into<BackendError>) -> Self {
        Self::Protocol {
            stage,
            source: source.into(),
        }
    }

    pub fn malformed(signature: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::MalformedRecord {
            signature: signature.into(),
            details: details.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Io { .. } => ErrorKind::Io,
            Self::Protocol { .. }
            | Self::MalformedRecord { .. }
            | Self::DuplicateSignature(_)
            | Self::CancelTimedOut(_)
            | Self::ListenerLost
            | Self::InvalidState { .. } => ErrorKind::Protocol,
        }
    }
}
