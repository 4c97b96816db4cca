//! Tunnel providers
//!
//! Supports three backends:
//! - **ManagedRelay** (`ngrok`): SaaS tunnel with auth token and a stable,
//!   derived or explicit hostname
//! - **PublicBinary** (`cloudflared`): quick tunnels on a random URL, or
//!   named tunnels with a token
//! - **ProprietaryRelay**: WebSocket relay on a fixed local port, addressed
//!   by a session id
//!
//! Each attempt runs `prepare` (I/O: binary lookup, settings, actor), then
//! the pure `build_invocation`, then `connect`, which starts the tunnel
//! and hands back a [`TunnelLink`]. The session races
//! [`TunnelLink::discover_url`] against its connect timeout and owns the
//! link until it shuts it down.

pub mod binary;
pub mod link;
pub mod managed;
pub mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::actor::{ActorLookup, ProfileActorLookup};
use crate::config::{ProviderKind, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::resolver::{BinaryResolver, PathResolver};
use crate::session::StatusNotifier;
use crate::settings::{FileSettingsStore, SettingsStore};
use crate::supervisor::CommandSpec;

pub use binary::PublicBinaryProvider;
pub use link::{Discovery, ProcessLink};
pub use managed::ManagedRelayProvider;
pub use relay::{ProprietaryRelayProvider, RelayLink, RelayParams};

/// Inputs gathered by [`TunnelProvider::prepare`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptContext {
    pub binary: Option<PathBuf>,
    pub url_randomness: Option<String>,
    pub actor_name: Option<String>,
    pub session_id: Option<String>,
}

/// What to launch for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Process {
        command: CommandSpec,
        /// Public URL known up front (explicit hostnames)
        expected_url: Option<String>,
    },
    Relay(RelayParams),
}

/// A started tunnel, owned by exactly one session
#[async_trait]
pub trait TunnelLink: Send {
    /// Resolves with the public URL once the tunnel reports it.
    ///
    /// Dropping the future (timeout, cancel) leaves the link running;
    /// call [`shutdown`](Self::shutdown) to tear it down.
    async fn discover_url(&mut self) -> Result<String>;

    fn is_alive(&self) -> bool;

    /// Tear down; must leave nothing running when it returns
    async fn shutdown(&mut self, grace: Duration);
}

/// Trait implemented by all tunnel providers
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Static checks, run once when a session is created
    fn validate(&self, _config: &TunnelConfig) -> Result<()> {
        Ok(())
    }

    /// Gather everything that needs I/O before an attempt
    async fn prepare(&self, config: &TunnelConfig) -> Result<AttemptContext>;

    /// Pure: command line or connection parameters for one attempt
    fn build_invocation(&self, config: &TunnelConfig, ctx: &AttemptContext) -> Result<Invocation>;

    /// Start the tunnel described by `invocation`
    async fn connect(
        &self,
        invocation: Invocation,
        notifier: StatusNotifier,
    ) -> Result<Box<dyn TunnelLink>>;

    /// Called after a retryable failure, before the next attempt.
    ///
    /// Returning an error ends the retry loop with that error.
    async fn recover(&self, _config: &TunnelConfig, _error: &TunnelError) -> Result<()> {
        Ok(())
    }
}

/// Collaborators shared by the built-in providers
#[derive(Clone)]
pub struct ProviderContext {
    pub settings: Arc<dyn SettingsStore>,
    pub actors: Arc<dyn ActorLookup>,
    pub resolver: Arc<dyn BinaryResolver>,
}

impl ProviderContext {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        actors: Arc<dyn ActorLookup>,
        resolver: Arc<dyn BinaryResolver>,
    ) -> Self {
        Self {
            settings,
            actors,
            resolver,
        }
    }

    /// File-backed settings, profile actor, `PATH` resolution
    pub fn from_defaults() -> Self {
        Self::new(
            Arc::new(FileSettingsStore::new()),
            Arc::new(ProfileActorLookup::new()),
            Arc::new(PathResolver),
        )
    }
}

/// Builds the provider for a session
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>>;
}

impl ProviderFactory for ProviderContext {
    fn create(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>> {
        Ok(Arc::new(AnyProvider::for_kind(config.provider, self)))
    }
}

/// The built-in providers behind one type
pub enum AnyProvider {
    ManagedRelay(ManagedRelayProvider),
    PublicBinary(PublicBinaryProvider),
    ProprietaryRelay(ProprietaryRelayProvider),
}

impl AnyProvider {
    pub fn for_kind(kind: ProviderKind, ctx: &ProviderContext) -> Self {
        match kind {
            ProviderKind::ManagedRelay => Self::ManagedRelay(ManagedRelayProvider::new(
                ctx.settings.clone(),
                ctx.actors.clone(),
                ctx.resolver.clone(),
            )),
            ProviderKind::PublicBinary => {
                Self::PublicBinary(PublicBinaryProvider::new(ctx.resolver.clone()))
            }
            ProviderKind::ProprietaryRelay => Self::ProprietaryRelay(ProprietaryRelayProvider),
        }
    }

    fn inner(&self) -> &dyn TunnelProvider {
        match self {
            Self::ManagedRelay(p) => p,
            Self::PublicBinary(p) => p,
            Self::ProprietaryRelay(p) => p,
        }
    }
}

#[async_trait]
impl TunnelProvider for AnyProvider {
    fn kind(&self) -> ProviderKind {
        self.inner().kind()
    }

    fn validate(&self, config: &TunnelConfig) -> Result<()> {
        self.inner().validate(config)
    }

    async fn prepare(&self, config: &TunnelConfig) -> Result<AttemptContext> {
        self.inner().prepare(config).await
    }

    fn build_invocation(&self, config: &TunnelConfig, ctx: &AttemptContext) -> Result<Invocation> {
        self.inner().build_invocation(config, ctx)
    }

    async fn connect(
        &self,
        invocation: Invocation,
        notifier: StatusNotifier,
    ) -> Result<Box<dyn TunnelLink>> {
        self.inner().connect(invocation, notifier).await
    }

    async fn recover(&self, config: &TunnelConfig, error: &TunnelError) -> Result<()> {
        self.inner().recover(config, error).await
    }
}

/// Check a URL scraped from tunnel output before handing it out
pub fn validate_public_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| TunnelError::connect(format!("malformed tunnel URL '{}': {}", trimmed, e)))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(TunnelError::connect(format!(
            "unsupported tunnel URL '{}'",
            trimmed
        )));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

/// Local address tunnels forward to
pub(crate) fn local_origin(port: u16) -> String {
    format!("http://localhost:{}", port)
}
