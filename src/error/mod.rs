use std::io;

use thiserror::Error;

/// Failures a caller may want to tell apart: which source broke and how.
///
/// Operations in this crate return `anyhow::Result`; the typed value rides
/// inside the `anyhow::Error` (or inside an `io::Error` payload when it comes
/// out of a `Read` impl) and is recovered with [`Error::find`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {location}")]
    NotFound { location: String },

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("connection to {location} failed: {message}")]
    Connection { location: String, message: String },

    #[error("no connection slot for {host} within the wait limit")]
    ConnectionLimit { host: String },

    #[error("corrupt data in {location} at offset {offset}: {message}")]
    Corrupt {
        location: String,
        offset: u64,
        message: String,
    },

    #[error("read from a closed stream")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn corrupt(location: impl Into<String>, offset: u64, message: impl Into<String>) -> Self {
        Error::Corrupt {
            location: location.into(),
            offset,
            message: message.into(),
        }
    }

    /// Wraps the error for transport through `std::io` signatures.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Error::NotFound { .. } => io::ErrorKind::NotFound,
            Error::Corrupt { .. } => io::ErrorKind::InvalidData,
            Error::Closed => io::ErrorKind::Other,
            Error::ConnectionLimit { .. } => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Finds the typed error anywhere in the chain of `err`.
    pub fn find(err: &anyhow::Error) -> Option<&Error> {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<Error>() {
                return Some(e);
            }
            if let Some(e) = cause
                .downcast_ref::<io::Error>()
                .and_then(|io_err| io_err.get_ref())
                .and_then(|inner| inner.downcast_ref::<Error>())
            {
                return Some(e);
            }
        }
        None
    }

    /// True for failures of a backend (missing file, bad status, network),
    /// as opposed to corrupt content or misuse.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::HttpStatus { .. }
                | Error::Connection { .. }
                | Error::ConnectionLimit { .. }
        )
    }
}
