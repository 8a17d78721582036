use fleet_membership::{ChangeFeedError, RegistryError};
use thiserror::Error;

/// Errors from the redis-backed registry.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying redis command or connection failure.
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl RegistryError for Error {}

impl ChangeFeedError for Error {}
