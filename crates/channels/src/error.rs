use std::error::Error as StdError;

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed channel errors shared across the plug-in crates.
///
/// Each variant carries its propagation policy: signature and decrypt
/// failures reject the callback, policy denials drop silently, token
/// expiry is retried once inline, size and format limits surface as
/// user-visible fallback text, and transport loss is absorbed by
/// reconnection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Account credentials are missing or malformed; the account is
    /// marked unconfigured and skipped.
    #[error("invalid channel config: {message}")]
    ConfigInvalid { message: String },

    /// Webhook signature did not match; answered with 400.
    #[error("signature mismatch")]
    SignatureMismatch,

    /// Encrypted payload failed to decrypt or unpad.
    #[error("bad payload padding")]
    BadPadding,

    /// Decrypted payload's trailing receive id did not match the account.
    #[error("receive id mismatch")]
    ReceiveIdMismatch,

    /// Message rejected by the DM/group admission policy.
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    /// Platform reported an expired/invalid access token.
    #[error("access token expired (platform code {code})")]
    TokenExpired { code: i64 },

    /// Download or upload exceeded the configured size cap.
    #[error("media exceeds size limit of {max_bytes} bytes")]
    SizeLimit { max_bytes: u64 },

    /// An HTTP, ASR, or upload budget elapsed.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// The platform rejected a message format (e.g. QQ file sends).
    #[error("platform rejected format (code {code}): {message}")]
    PlatformFormatUnsupported { code: i64, message: String },

    /// An AI-card API call failed; the card is finished with a banner.
    #[error("card operation failed: {message}")]
    CardFailure { message: String },

    /// Stream/WebSocket connection dropped; reconnection is in progress.
    #[error("transport lost: {message}")]
    TransportLost { message: String },

    /// A requested account id is not registered.
    #[error("unknown channel account: {account_id}")]
    UnknownAccount { account_id: String },

    /// Wrapped source error from an external dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn config_invalid(message: impl std::fmt::Display) -> Self {
        Self::ConfigInvalid {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn policy_denied(reason: impl std::fmt::Display) -> Self {
        Self::PolicyDenied {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }

    #[must_use]
    pub fn card_failure(message: impl std::fmt::Display) -> Self {
        Self::CardFailure {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transport_lost(message: impl std::fmt::Display) -> Self {
        Self::TransportLost {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether the failure invalidates the cached access token.
    #[must_use]
    pub fn is_token_expiry(&self) -> bool {
        matches!(self, Self::TokenExpired { .. })
    }
}
