use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use ulid::Ulid;

use crate::model::time_label;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Shop configuration missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A read against the store failed or timed out.
    #[error("lookup failed: {0}")]
    Lookup(String),
    /// A write against the store failed or timed out; nothing was committed.
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("slot {date} {} is already booked", slot_label(.time))]
    SlotConflict { date: NaiveDate, time: NaiveTime },
    #[error("not found: {0}")]
    NotFound(Ulid),
}

fn slot_label(time: &NaiveTime) -> String {
    time_label(*time)
}

/// Which side of a store round trip failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

impl EngineError {
    pub(crate) fn from_store(err: StoreError, access: Access) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Conflict { date, time, .. } => EngineError::SlotConflict { date, time },
            StoreError::AlreadyExists(id) => {
                EngineError::Validation(format!("record {id} already exists"))
            }
            StoreError::LimitExceeded(what) => EngineError::Validation(what.into()),
            StoreError::Wal(msg) | StoreError::Unavailable(msg) => match access {
                Access::Read => EngineError::Lookup(msg),
                Access::Write => EngineError::Transport(msg),
            },
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }
}
