use std::time::Duration;

use thiserror::Error;

use crate::domain::BillId;

/// Failure talking to the billing / KDS backend.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

/// Why one queued task did not complete.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("bill {0} has not been created on the server yet")]
    UnresolvedBill(BillId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("task store encode: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure of an optimistic edit.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("bill {0} is not in the cache")]
    UnknownBill(BillId),

    #[error("bill {0} cannot be patched: {1}")]
    Patch(BillId, serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),
}
