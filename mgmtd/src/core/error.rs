use std::io;

use common::api_error::ApiError;
use common::states::ConsistencyState;

/// Failures surfaced by the registry, the mappers and the target state store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("malformed data: {0}")]
    MalformedData(String),
    #[error(
        "state changed concurrently: target {target_id} is {actual}, expected {expected}; retry"
    )]
    Conflict {
        target_id: u16,
        expected: ConsistencyState,
        actual: ConsistencyState,
    },
    #[error("unknown target {0}")]
    UnknownTarget(u16),
    #[error("unknown node {0}")]
    UnknownNode(u16),
    #[error("invalid buddy group: {0}")]
    InvalidBuddyGroup(String),
    #[error("buddy group {0} already exists")]
    BuddyGroupExists(u16),
    #[error("persistence failure: {0}")]
    Persistence(#[from] io::Error),
    #[error("remote node: {0}")]
    Remote(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } | StoreError::BuddyGroupExists(_) => {
                ApiError::Conflict(err.to_string())
            }
            StoreError::MalformedData(_) | StoreError::InvalidBuddyGroup(_) => {
                ApiError::BadRequest(err.to_string())
            }
            StoreError::UnknownTarget(_) => ApiError::UnknownTarget,
            StoreError::UnknownNode(_) => ApiError::UnknownNode,
            StoreError::Persistence(e) => ApiError::Io(e),
            StoreError::Remote(msg) => ApiError::Any(anyhow::anyhow!(msg)),
        }
    }
}
