// Service Errors
// Errors returned to callers of the experiment service

use crate::config::ConfigError;
use crate::execution::{PlanError, PoolError};
use crate::models::{ExperimentId, ExperimentStatus};
use crate::store::StoreError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("experiment {0} not found")]
    NotFound(ExperimentId),

    #[error("cannot {action} experiment {id} while it is {status}")]
    InvalidTransition {
        id: ExperimentId,
        action: &'static str,
        status: ExperimentStatus,
    },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
