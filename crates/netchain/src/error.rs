use thiserror::Error;

/// Errors surfaced by the reactor chain itself (registration, wake pipe).
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by asocket/assocket/acsocket operations.
///
/// `Transient` kinds (would-block, connect-in-progress) never reach this
/// enum — the reactor absorbs them and waits for the next readiness
/// notification (`spec.md §7`). Only permanent failures are reported here.
#[derive(Debug, Error)]
pub enum AsocketError {
    #[error("no free connection slot")]
    NoSlot,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame shorter than its declared header")]
    Corrupted,
}

/// Why an asocket's connection ended, delivered to `on_disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer performed an orderly shutdown (zero-length read).
    PeerClosed,
    /// A permanent transport error (connect failure, write error, ...).
    Error,
    /// The local side closed the connection (e.g. a utimer timeout fired).
    LocalClose,
}
