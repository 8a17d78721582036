use thiserror::Error;

/// Errors surfaced by the membership monitor itself.
///
/// Backend failures never appear here: the monitor logs them and degrades
/// toward the next periodic resynchronization instead of propagating.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The monitor is already running.
    #[error("monitor already started")]
    AlreadyStarted,

    /// The monitor is not running.
    #[error("monitor not started")]
    NotStarted,
}
