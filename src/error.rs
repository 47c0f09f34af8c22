//! Error taxonomy for the extraction pipeline.
//!
//! The split between retryable and fatal errors drives the retry
//! coordinator: automation, timeout and parse failures consume the attempt
//! budget; persistence and session-loss failures abort the batch immediately;
//! cancellation is never retried.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// Browser automation failure: element not found, stale handle,
    /// navigation error. Retryable.
    #[error("automation error: {0}")]
    Automation(String),

    /// The assistant's response never stabilized within the idle window.
    #[error("response did not stabilize within {0:?}")]
    Timeout(Duration),

    /// The response text yielded zero parseable segments even after fallback.
    #[error("unparseable response: {0}")]
    Parse(String),

    /// Checkpoint database or workbook write failure. Fatal to the batch:
    /// silently losing a durability write is worse than stopping.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The browser session could not be (re)attached after its retry budget.
    /// Fatal to the batch; pending tasks stay pending for a future resume.
    #[error("browser session lost: {0}")]
    SessionLost(String),

    /// External stop request. Never consumes the retry budget.
    #[error("batch cancelled")]
    Cancelled,
}

impl ExtractError {
    /// Whether the retry coordinator may spend an attempt on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtractError::Automation(_) | ExtractError::Timeout(_) | ExtractError::Parse(_)
        )
    }

    /// Whether this failure aborts the whole batch rather than one task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExtractError::Persistence(_) | ExtractError::SessionLost(_)
        )
    }
}

impl From<rusqlite::Error> for ExtractError {
    fn from(e: rusqlite::Error) -> Self {
        ExtractError::Persistence(e.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for ExtractError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        ExtractError::Persistence(e.to_string())
    }
}
