/// Error type returned by host port methods.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("{message}")]
    Message { message: String },
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl HostError {
    #[must_use]
    pub fn message(message: impl std::fmt::Display) -> Self {
        Self::Message {
            message: message.to_string(),
        }
    }
}

impl From<String> for HostError {
    fn from(value: String) -> Self {
        Self::message(value)
    }
}

impl From<&str> for HostError {
    fn from(value: &str) -> Self {
        Self::message(value)
    }
}

pub type HostResult<T> = Result<T, HostError>;
