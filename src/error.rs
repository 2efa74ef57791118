//! Error types for backend lifecycle operations

use thiserror::Error;

/// Failure to bring a backend up
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A backend instance is already running, nothing to do
    #[error("instance of server is already running")]
    AlreadyRunning,
    /// The backend process could not be spawned
    #[error("error launching server process: {0}")]
    Failed(std::io::Error),
    /// The launcher task has stopped (program is shutting down)
    #[error("launcher is no longer running")]
    Unavailable,
}

impl LaunchError {
    /// Whether this error only means the backend was already up
    pub fn is_already_running(&self) -> bool {
        matches!(self, LaunchError::AlreadyRunning)
    }
}

/// Failure to take a backend down
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// The kill signal could not be delivered
    #[error("error killing launched server process: {0}")]
    Failed(std::io::Error),
    /// The launcher task has stopped (program is shutting down)
    #[error("launcher is no longer running")]
    Unavailable,
}
