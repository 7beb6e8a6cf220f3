//! Spreadsheet ledger errors

use thiserror::Error;

pub type SheetsResult<T> = Result<T, SheetsError>;

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("Sheets transport error: {0}")]
    Transport(String),

    #[error("Could not connect to Sheets API: {0}")]
    Connect(String),

    #[error("Sheets API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Sheets authentication failed: {0}")]
    Auth(String),

    #[error("Invalid credentials: {0}")]
    Credentials(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl SheetsError {
    /// Rate limits, server errors and transport failures are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            SheetsError::Transport(_) | SheetsError::Connect(_) => true,
            SheetsError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Failures where the request was never applied: rate limits and
    /// connection errors. Only these are safe to resend for appends.
    pub fn is_safe_to_resend(&self) -> bool {
        match self {
            SheetsError::Connect(_) => true,
            SheetsError::Api { status, .. } => *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SheetsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SheetsError::Decode(err.to_string())
        } else if err.is_connect() {
            SheetsError::Connect(err.to_string())
        } else {
            SheetsError::Transport(err.to_string())
        }
    }
}
