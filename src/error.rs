// src/error.rs
// Error taxonomy for tunnel lifecycle management

use std::time::Duration;

use thiserror::Error;

/// Provider error code reported when the requested subdomain is held by another tunnel.
pub const SUBDOMAIN_IN_USE: &str = "SUBDOMAIN_IN_USE";

/// Main error type for the devtunnel library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The tunnel executable could not be located or launched.
    #[error("failed to launch {program}: {message}")]
    Spawn {
        program: String,
        message: String,
        remediation: Option<String>,
    },

    /// The tunnel came up but never produced a usable public URL.
    #[error("tunnel connection failed: {message}")]
    Connect {
        message: String,
        /// Provider-specific error code, when the provider reported one.
        code: Option<String>,
        /// Exit code of the tunnel process, when it exited early.
        exit_code: Option<i32>,
        retryable: bool,
        remediation: Option<String>,
    },

    #[error("timed out after {}ms waiting for the tunnel URL", .0.as_millis())]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("tunnel start cancelled")]
    Cancelled,
}

/// Convenience type alias for Result using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Retryable connect failure
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            code: None,
            exit_code: None,
            retryable: true,
            remediation: None,
        }
    }

    /// Connect failure that must end the retry loop immediately
    pub fn fatal(message: impl Into<String>, remediation: Option<String>) -> Self {
        Self::Connect {
            message: message.into(),
            code: None,
            exit_code: None,
            retryable: false,
            remediation,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Attach a provider error code to a connect failure. Other variants are returned unchanged.
    pub fn with_code(self, new_code: impl Into<String>) -> Self {
        match self {
            Self::Connect {
                message,
                exit_code,
                retryable,
                remediation,
                ..
            } => Self::Connect {
                message,
                code: Some(new_code.into()),
                exit_code,
                retryable,
                remediation,
            },
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Connect { retryable, .. } => *retryable,
            Self::Spawn { .. } | Self::Configuration(_) | Self::Settings(_) | Self::Cancelled => {
                false
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Provider error code, if any
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connect { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Hint to show the user alongside the error message
    pub fn remediation(&self) -> Option<&str> {
        match self {
            Self::Spawn { remediation, .. } | Self::Connect { remediation, .. } => {
                remediation.as_deref()
            }
            Self::Timeout(_) => Some(
                "The tunnel provider did not respond in time. Check your network connection \
                 or raise the connect timeout.",
            ),
            _ => None,
        }
    }

    /// Message plus remediation hint, formatted for the terminal
    pub fn to_user_string(&self) -> String {
        match self.remediation() {
            Some(hint) => format!("{}\n{}", self, hint),
            None => self.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for TunnelError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            TunnelError::Cancelled
        } else {
            TunnelError::connect(format!("tunnel task panicked: {}", err))
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Settings(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(TunnelError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TunnelError::connect("process exited").is_retryable());
        assert!(!TunnelError::fatal("bad token", None).is_retryable());
        assert!(!TunnelError::config("wrong port").is_retryable());
        assert!(!TunnelError::Cancelled.is_retryable());
        assert!(
            !TunnelError::Spawn {
                program: "cloudflared".into(),
                message: "not found".into(),
                remediation: None,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_timeout_message() {
        let err = TunnelError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
        assert!(err.is_timeout());
        assert!(err.remediation().is_some());
    }

    #[test]
    fn test_with_code() {
        let err = TunnelError::connect("in use").with_code(SUBDOMAIN_IN_USE);
        assert_eq!(err.code(), Some(SUBDOMAIN_IN_USE));
        assert!(err.is_retryable());

        let err = TunnelError::config("x").with_code(SUBDOMAIN_IN_USE);
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_user_string_includes_remediation() {
        let err = TunnelError::Spawn {
            program: "ngrok".into(),
            message: "No such file or directory".into(),
            remediation: Some("Install ngrok from https://ngrok.com/download".into()),
        };
        let text = err.to_user_string();
        assert!(text.contains("failed to launch ngrok"));
        assert!(text.contains("Install ngrok"));
    }
}
