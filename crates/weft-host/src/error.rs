//! Host-layer failures.

use thiserror::Error;

/// Errors surfaced by the host facade.
///
/// The runtime above maps these to errno-style codes at its boundary.
#[derive(Debug, Error)]
pub enum HostError {
    /// The operating system refused to create a thread.
    #[error("failed to spawn host thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// A host wait completed abnormally.
    #[error("host wait failed")]
    WaitFailed,
}
