use thiserror::Error;

use crate::provider::{ProviderError, StoreError};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid discovery: {0}")]
    InvalidDiscovery(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
