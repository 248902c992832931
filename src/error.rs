// Error taxonomy. Steady-state failures are logged at the point of use; only
// CollectorError ever unwinds the run loop.

use thiserror::Error;

/// Conditions that end the collector's run loop.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Unrecoverable setup problem (store unreachable, bad credentials, hub offline).
    #[error("failed initialization: {0}")]
    FailedInitialization(String),
    /// The hub subscription stopped delivering events for a full watchdog window.
    #[error("lost connection to {0}")]
    WatchdogTimeout(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(String),
    /// The store understood the request and refused its content (bad line protocol, bad script).
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed store data: {0}")]
    Format(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        StoreError::Transport(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub connect failed: {0}")]
    Connect(String),
    #[error("hub protocol error: {0}")]
    Protocol(String),
    #[error("hub is not connected")]
    NotConnected,
}

impl From<rumqttc::ClientError> for HubError {
    fn from(e: rumqttc::ClientError) -> Self {
        HubError::Protocol(e.to_string())
    }
}

/// Raised while building a job definition; the job is skipped, never installed half-formed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid identifier {value:?} for {what}")]
    InvalidIdentifier { what: &'static str, value: String },
    #[error("invalid schedule {0:?}")]
    InvalidSchedule(String),
}
