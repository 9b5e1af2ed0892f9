use std::error::Error as StdError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Declared or observed size exceeds the configured cap.
    #[error("media exceeds size limit of {max_bytes} bytes")]
    SizeLimit { max_bytes: u64 },

    /// The download or upload budget elapsed.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    /// The platform answered with a non-success status.
    #[error("{context}: http status {status}")]
    HttpStatus { context: String, status: u16 },

    #[error("{message}")]
    InvalidInput { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
