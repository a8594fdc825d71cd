use crate::error_code::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "rate_limit.max_per_day")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "response_cache", "router")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the relay.
///
/// Every variant maps onto one [`ErrorKind`] via [`Error::kind`]; presentation layers
/// render guidance from the kind and [`Error::retry_after`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("No credential configured for provider '{provider}'")]
    CredentialMissing { provider: String },

    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Request timeout after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("Circuit breaker for '{service}' is open; retry in {}s", .retry_after.as_secs())]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    #[error("All providers failed ({}): {last}", .attempted.join(", "))]
    AllProvidersFailed {
        attempted: Vec<String>,
        #[source]
        last: Box<Error>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Remote error: HTTP {status}: {message}")]
    Remote {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Storage error: {message}{}", format_context(.context))]
    Storage {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provider error: {message}{}", format_context(.context))]
    Provider {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn credential_missing(provider: impl Into<String>) -> Self {
        Error::CredentialMissing {
            provider: provider.into(),
        }
    }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Error::Remote {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
        }
    }

    /// Free-form provider failure; its kind is derived from the message text.
    pub fn provider(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn provider_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Provider {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn storage_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Storage {
            message: msg.into(),
            context,
        }
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CredentialMissing { .. } => ErrorKind::CredentialMissing,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::AllProvidersFailed { .. } => ErrorKind::AllProvidersFailed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Remote {
                status, message, ..
            } => match ErrorKind::from_http_status(*status) {
                ErrorKind::Unknown => ErrorKind::classify_message(message),
                kind => kind,
            },
            Error::Network { .. } => ErrorKind::NetworkUnavailable,
            Error::Validation { .. } | Error::Configuration { .. } => {
                ErrorKind::ValidationFailure
            }
            Error::Storage { .. } => ErrorKind::StorageFailure,
            Error::Serialization(_) => ErrorKind::ValidationFailure,
            Error::Provider { message, .. } => ErrorKind::classify_message(message),
        }
    }

    /// Suggested wait before trying again, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } | Error::Remote { retry_after, .. } => {
                *retry_after
            }
            Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Error::AllProvidersFailed { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Validation { context, .. }
            | Error::Configuration { context, .. }
            | Error::Storage { context, .. }
            | Error::Provider { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::configuration_with_context(
            e.to_string(),
            ErrorContext::new().with_source("config_loader"),
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::storage_with_context(e.to_string(), ErrorContext::new().with_source("io"))
    }
}
