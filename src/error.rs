//! Error kinds shared by the recognition engine, the VM adapter and the driver.
//!
//! Callers opt into retrying per error kind: only `TransientCapture` is ever
//! retried, and only when the caller asked for it.

use std::process::ExitStatus;

pub type Result<T> = std::result::Result<T, PilotError>;

#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    /// Setup mistake: bad geometry, missing reference image or medium, unknown profile.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The screen could not be captured or did not fit the active cell grid.
    #[error("transient capture failure: {0}")]
    TransientCapture(String),

    /// The guest never showed what the automation was waiting for.
    #[error("automation desynchronized from guest: gave up waiting for {expected} after {polls} polls")]
    Desynchronized { expected: String, polls: u32 },

    /// The operator could not be asked to identify a glyph.
    #[error("glyph training failed: {0}")]
    Training(String),

    #[error("{program} {args:?} failed ({status}): {stderr}")]
    Command {
        program: String,
        args: Vec<String>,
        status: ExitStatus,
        stderr: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PilotError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientCapture(msg.into())
    }

    /// True for failures that may clear up on their own if polled again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientCapture(_))
    }
}
