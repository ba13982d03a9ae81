use thiserror::Error;

/// Errors surfaced by the dispatcher (`spec.md §7`). `Unavailable` and
/// `Corrupted` are the two kinds from the taxonomy with dispatcher-specific
/// meaning; transport-level transience is absorbed by `netchain` before it
/// ever reaches this layer.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("service config directory {0} could not be read: {1}")]
    ConfigDirUnreadable(std::path::PathBuf, std::io::Error),

    #[error("service {0} references unknown subscriber endpoint")]
    Unavailable(String),

    #[error("frame shorter than its declared header ({declared} bytes claimed, {got} bytes read)")]
    Corrupted { declared: usize, got: usize },

    #[error("netchain i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netchain asocket error: {0}")]
    Asocket(#[from] netchain::AsocketError),
}
