//! Error taxonomy for the record/block engine.
//!
//! Validation failures are not errors: they come back as `Ok(false)` and a
//! rendered marker. Everything here aborts the operation in progress.

use crate::triggers::EventKind;

pub type Result<T> = std::result::Result<T, FormError>;

#[derive(Debug, thiserror::Error)]
pub enum FormError {
    #[error("block '{block}': cannot start {attempted:?} while {running:?} is running")]
    TransactionConflict {
        block: String,
        running: EventKind,
        attempted: EventKind,
    },

    #[error("block '{block}': only the current record (offset 0) is reachable during {event:?}, requested offset {offset}")]
    TransactionRowAccess {
        block: String,
        event: EventKind,
        offset: i64,
    },

    #[error("record {record} in block '{block}' was changed by another user ({columns})")]
    RecordChanged {
        block: String,
        record: u64,
        columns: String,
    },

    #[error("record {record} in block '{block}' no longer exists")]
    RecordDeleted { block: String, record: u64 },

    #[error("backend {verb}: {message}")]
    Backend { verb: String, message: String },

    #[error("block '{block}': invalid query filter: {reason}")]
    InvalidFilter { block: String, reason: String },

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("unknown form '{0}'")]
    UnknownForm(String),

    #[error("unknown block '{0}'")]
    UnknownBlock(String),

    #[error("unknown field '{field}' in block '{block}'")]
    UnknownField { block: String, field: String },

    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("block '{block}': {operation} is not allowed")]
    NotAllowed { block: String, operation: &'static str },

    #[error("block '{0}' has pending changes")]
    PendingChanges(String),

    #[error("undo failed for form '{form}': {reason}")]
    UndoFailed { form: String, reason: String },

    #[error("invalid form definition: {0}")]
    Definition(String),

    #[error("event queue handler failed: {0}")]
    Handler(String),
}

impl FormError {
    pub fn backend(verb: impl Into<String>, message: impl Into<String>) -> Self {
        FormError::Backend {
            verb: verb.into(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for FormError {
    fn from(e: anyhow::Error) -> Self {
        FormError::Handler(format!("{e:#}"))
    }
}
