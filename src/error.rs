use crate::oper::Optime;
use mongodb::bson;
use std::fmt;

/// A type alias for convenience so we can fix the error to our own `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error enumerates the list of possible error conditions when replicating from a
/// MongoDB replica set.
#[derive(Debug)]
pub enum Error {
    /// A database connectivity error raised by the MongoDB driver.
    Database(mongodb::error::Error),
    /// An error when converting a BSON document to an `Operation` and it has a missing field or
    /// unexpected type.
    MissingField(bson::document::ValueAccessError),
    /// An error when converting a BSON document to an `Operation` and it has an unsupported
    /// operation type.
    UnknownOperation(String),
    /// An error when converting an applyOps command with invalid documents.
    InvalidOperation,
    /// The source oplog no longer contains the requested start timestamp. Resuming would
    /// silently skip operations, so the engine refuses to continue.
    StaleOplog {
        /// The timestamp the tail was opened at.
        requested: Optime,
        /// The first timestamp actually present in the oplog, if any entry was returned.
        found: Option<Optime>,
    },
    /// The source replica set has no reachable primary.
    NoPrimary,
    /// An index key direction that is neither numeric nor one of the string index kinds.
    InvalidIndexDirection(String),
    /// A malformed or contradictory configuration, detected before any network activity.
    Config(String),
    /// An I/O error on the checkpoint file.
    Checkpoint(std::io::Error),
    /// A destination bulk write that failed even after per-operation isolation.
    BulkWrite {
        /// The destination namespace the batch was addressed to.
        ns: String,
        /// The server-reported write errors.
        detail: String,
    },
    /// A copy or replay worker task that died without reporting a result.
    Worker(String),
    /// The user interrupted the process before the phase could complete.
    Interrupted,
    /// A transport error talking to an Elasticsearch destination.
    Http(reqwest::Error),
    /// A non-success response from an Elasticsearch destination.
    Elasticsearch {
        /// The HTTP status code.
        status: u16,
        /// The response body, as far as it could be read.
        body: String,
    },
}

impl Error {
    /// Whether the error is a transient connectivity problem that reconnect-with-backoff
    /// recovers from, as opposed to one that must fail fast.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => is_transient_mongo(e),
            Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether the error is a duplicate-key write error. Replay treats these as retriable:
    /// the entry is logged and skipped because replace-by-`_id` keeps the replay idempotent.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Error::Database(e) => mongo_error_code(e) == Some(11000),
            _ => false,
        }
    }

    /// Whether the error is an authentication or authorisation failure.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Error::Database(e) => {
                if let mongodb::error::ErrorKind::Authentication { .. } = *e.kind {
                    return true;
                }
                matches!(mongo_error_code(e), Some(13) | Some(18))
            }
            _ => false,
        }
    }
}

fn is_transient_mongo(e: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;

    match *e.kind {
        ErrorKind::Io(_) => true,
        ErrorKind::ServerSelection { .. } => true,
        ErrorKind::ConnectionPoolCleared { .. } => true,
        _ => e.contains_label("RetryableWriteError"),
    }
}

fn mongo_error_code(e: &mongodb::error::Error) -> Option<i32> {
    use mongodb::error::{ErrorKind, WriteFailure};

    match *e.kind {
        ErrorKind::Command(ref c) => Some(c.code),
        ErrorKind::Write(WriteFailure::WriteError(ref w)) => Some(w.code),
        ErrorKind::Write(WriteFailure::WriteConcernError(ref w)) => Some(w.code),
        _ => None,
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::MissingField(e) => Some(e),
            Error::Checkpoint(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Database(ref err) => err.fmt(f),
            Error::MissingField(ref err) => err.fmt(f),
            Error::UnknownOperation(ref op) => write!(f, "Unknown operation type found: {}", op),
            Error::InvalidOperation => write!(f, "Invalid operation"),
            Error::StaleOplog { requested, found } => match found {
                Some(found) => write!(
                    f,
                    "Oplog is stale: requested start {} but oldest entry is {}",
                    requested, found
                ),
                None => write!(f, "Oplog is stale: no entry at requested start {}", requested),
            },
            Error::NoPrimary => write!(f, "Replica set status reports no primary member"),
            Error::InvalidIndexDirection(ref dir) => {
                write!(f, "Invalid index key direction: {}", dir)
            }
            Error::Config(ref msg) => write!(f, "Configuration error: {}", msg),
            Error::Checkpoint(ref err) => write!(f, "Checkpoint file error: {}", err),
            Error::BulkWrite { ref ns, ref detail } => {
                write!(f, "Bulk write to {} failed: {}", ns, detail)
            }
            Error::Worker(ref msg) => write!(f, "Worker task failed: {}", msg),
            Error::Interrupted => write!(f, "Interrupted by user"),
            Error::Http(ref err) => err.fmt(f),
            Error::Elasticsearch { status, ref body } => {
                write!(f, "Elasticsearch responded {}: {}", status, body)
            }
        }
    }
}

impl From<bson::document::ValueAccessError> for Error {
    fn from(original: bson::document::ValueAccessError) -> Error {
        Error::MissingField(original)
    }
}

impl From<mongodb::error::Error> for Error {
    fn from(original: mongodb::error::Error) -> Error {
        Error::Database(original)
    }
}

impl From<reqwest::Error> for Error {
    fn from(original: reqwest::Error) -> Error {
        Error::Http(original)
    }
}
