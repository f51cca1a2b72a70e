use std::io;

use thiserror::Error;

/// Error type for fallible runtime operations.
///
/// Only recoverable failures surface here. Invariant violations (misuse
/// of the fiber state machine, duplicate event registration, a failed
/// context switch) are programmer errors and abort with a panic instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Config(#[from] serde_yaml::Error),
}
