use fleet_membership::{ChangeFeedError, RegistryError};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
#[error("memory registry error")]
pub struct Error;

impl RegistryError for Error {}

impl ChangeFeedError for Error {}
