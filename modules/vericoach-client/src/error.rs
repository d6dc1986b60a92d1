use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Network unreachable, connection refused, request timeout. The wire
    /// never answered; there is no backend message to show.
    #[error("Connection failed: {0}")]
    Network(String),

    /// Backend answered non-2xx. `message` is the structured `detail` field
    /// when the body carries one, otherwise the raw body or status text.
    #[error("Backend error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Read endpoint says the resource does not exist yet (404/409). Not a
    /// transport failure; callers poll again later.
    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Rejected before any request was made (empty target, bad input).
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Parse(err.to_string())
    }
}
