// src/config/mod.rs
// Tunnel configuration and environment overrides

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::session::SessionKey;

/// Time allowed for one attempt to discover the public URL
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Attempts per start before the session is marked failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Pause between attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Time a tunnel process gets to exit after SIGTERM before it is killed
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(1_000);

/// Which tunnel backend a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// SaaS tunnel with auth token and optional custom subdomain/hostname
    ManagedRelay,
    /// Locally installed tunnel executable
    PublicBinary,
    /// WebSocket relay with a fixed local port and a session identifier
    ProprietaryRelay,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManagedRelay => "managed-relay",
            Self::PublicBinary => "public-binary",
            Self::ProprietaryRelay => "proprietary-relay",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "managed-relay" | "managed" | "ngrok" => Ok(Self::ManagedRelay),
            "public-binary" | "binary" | "cloudflared" => Ok(Self::PublicBinary),
            "proprietary-relay" | "relay" | "ws" => Ok(Self::ProprietaryRelay),
            other => Err(TunnelError::config(format!(
                "unknown tunnel provider '{}'. Supported: managed-relay, public-binary, proprietary-relay",
                other
            ))),
        }
    }
}

/// Immutable per-start configuration for one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Local port the dev server listens on
    pub local_port: u16,
    /// Project the tunnel belongs to (scopes persisted settings)
    pub project_root: PathBuf,
    pub provider: ProviderKind,
    /// Auth token for providers that need one
    pub auth_token: Option<String>,
    /// Explicit subdomain (ManagedRelay) or session id (ProprietaryRelay)
    pub subdomain: Option<String>,
    /// Explicit full hostname (ManagedRelay, named PublicBinary tunnels)
    pub hostname: Option<String>,
    /// Override for the tunnel executable
    pub binary_path: Option<PathBuf>,
    /// Override for the provider's public domain
    pub domain: Option<String>,
    /// Override for the relay WebSocket endpoint
    pub relay_endpoint: Option<String>,
    /// `None` until set; falls back to the environment, then the default
    pub connect_timeout: Option<Duration>,
    /// `None` until set; falls back to the environment, then the default
    pub max_attempts: Option<u32>,
    pub retry_backoff: Duration,
    pub kill_grace: Duration,
}

impl TunnelConfig {
    pub fn new(project_root: impl Into<PathBuf>, local_port: u16, provider: ProviderKind) -> Self {
        Self {
            local_port,
            project_root: project_root.into(),
            provider,
            auth_token: None,
            subdomain: None,
            hostname: None,
            binary_path: None,
            domain: None,
            relay_endpoint: None,
            connect_timeout: None,
            max_attempts: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_relay_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.relay_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Session key this config belongs to
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.project_root, self.local_port)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// True when the caller pinned the public name instead of letting it be derived
    pub fn has_explicit_name(&self) -> bool {
        self.subdomain.is_some() || self.hostname.is_some()
    }

    /// Fill fields the caller left unset from environment overrides
    pub fn apply_env(mut self, env: &TunnelEnv) -> Self {
        if self.subdomain.is_none() {
            self.subdomain = env.subdomain.clone();
        }
        if self.binary_path.is_none() {
            self.binary_path = env.binary_path.clone();
        }
        if self.auth_token.is_none() {
            self.auth_token = env.auth_token.clone();
        }
        if self.connect_timeout.is_none() {
            self.connect_timeout = env.connect_timeout;
        }
        if self.max_attempts.is_none() {
            self.max_attempts = env.max_attempts;
        }
        self
    }

    /// Static checks shared by every provider
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            return Err(TunnelError::config("local port must be greater than 0"));
        }
        if self.max_attempts() == 0 {
            return Err(TunnelError::config("max attempts must be at least 1"));
        }
        if self.connect_timeout().is_zero() {
            return Err(TunnelError::config("connect timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Overrides read from the process environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelEnv {
    /// `DEVTUNNEL_OFFLINE`: start is a no-op
    pub offline: bool,
    /// `DEVTUNNEL_SUBDOMAIN`
    pub subdomain: Option<String>,
    /// `DEVTUNNEL_BINARY`
    pub binary_path: Option<PathBuf>,
    /// `DEVTUNNEL_AUTH_TOKEN`
    pub auth_token: Option<String>,
    /// `DEVTUNNEL_CONNECT_TIMEOUT_MS`
    pub connect_timeout: Option<Duration>,
    /// `DEVTUNNEL_MAX_ATTEMPTS`
    pub max_attempts: Option<u32>,
}

impl TunnelEnv {
    /// Load overrides from `.env` (if present) and the process environment
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| clean(&v)).filter(|v| !v.is_empty());

        Self {
            offline: get("DEVTUNNEL_OFFLINE").map(|v| is_truthy(&v)).unwrap_or(false),
            subdomain: get("DEVTUNNEL_SUBDOMAIN"),
            binary_path: get("DEVTUNNEL_BINARY").map(PathBuf::from),
            auth_token: get("DEVTUNNEL_AUTH_TOKEN"),
            connect_timeout: get("DEVTUNNEL_CONNECT_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            max_attempts: get("DEVTUNNEL_MAX_ATTEMPTS").and_then(|v| v.parse().ok()),
        }
    }
}

// Trailing ` # comment`; a `#` inside a value (paths, tokens) is kept
fn clean(value: &str) -> String {
    let end = value
        .char_indices()
        .find(|&(i, c)| c == '#' && (i == 0 || value[..i].ends_with(char::is_whitespace)))
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    value[..end].trim().to_string()
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
