//! Error types for monitor operations

use std::io;
use thiserror::Error;

/// Result type for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur while setting up or driving the monitor
///
/// Transient conditions that are part of normal operation (a pid vanishing
/// between two procfs reads, a tracee dying before we resume it) are not
/// errors; they are modelled as `Option` returns or logged and absorbed by
/// the supervisor loop.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Trace error: {0}")]
    Trace(String),

    #[error("Notifier error: {0}")]
    Notify(String),

    #[error("Signal setup error: {0}")]
    Signal(String),

    #[error("Monitor already running")]
    AlreadyRunning,

    #[error("Monitor thread error: {0}")]
    Thread(String),
}
