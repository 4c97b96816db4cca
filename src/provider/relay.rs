//! ProprietaryRelay provider (WebSocket relay)
//!
//! The relay forwards a fixed local port. A tunnel is addressed by a
//! session id, which becomes the first label of the public hostname:
//!
//! ```text
//! devtunnel ──ws──▶ <endpoint>?session=<id>&port=8081
//! browser ──https──▶ https://<id>.<relay domain> ──▶ localhost:8081
//! ```
//!
//! The socket is held open by a pump task after the handshake; losing it
//! means losing the tunnel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::{AttemptContext, Invocation, TunnelLink, TunnelProvider};
use crate::config::{ProviderKind, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::session::{StatusNotifier, TunnelStatus};

/// The only local port the relay forwards
pub const RELAY_PORT: u16 = 8081;
pub const DEFAULT_RELAY_ENDPOINT: &str = "wss://relay.devtunnel.dev/connect";
pub const DEFAULT_RELAY_DOMAIN: &str = "relay.devtunnel.dev";

const SESSION_ID_LEN: usize = 16;
const SESSION_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const SESSION_ID_TRIES: usize = 32;

// ============================================================================
// Session Ids
// ============================================================================

fn random_session_id() -> String {
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.random_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

fn starts_alphanumeric(id: &str) -> bool {
    id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
}

/// Draw from `source` until an id starts with an alphanumeric character.
///
/// Gives up after a bounded number of draws and prefixes the last one.
pub fn session_id_from<F>(mut source: F) -> String
where
    F: FnMut() -> String,
{
    let mut candidate = String::new();
    for _ in 0..SESSION_ID_TRIES {
        candidate = source();
        if starts_alphanumeric(&candidate) {
            return candidate;
        }
    }
    let rest: String = candidate.chars().skip(1).collect();
    format!("s{}", rest)
}

pub fn generate_session_id() -> String {
    session_id_from(random_session_id)
}

// ============================================================================
// Connection Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayParams {
    pub endpoint: String,
    pub session_id: String,
    pub local_port: u16,
    pub public_url: String,
}

impl RelayParams {
    /// Handshake URL: the endpoint with session and port appended
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            TunnelError::config(format!("invalid relay endpoint '{}': {}", self.endpoint, e))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TunnelError::config(format!(
                "relay endpoint must be ws:// or wss://, got '{}'",
                self.endpoint
            )));
        }
        url.query_pairs_mut()
            .append_pair("session", &self.session_id)
            .append_pair("port", &self.local_port.to_string());
        Ok(url)
    }
}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ProprietaryRelayProvider;

#[async_trait]
impl TunnelProvider for ProprietaryRelayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ProprietaryRelay
    }

    fn validate(&self, config: &TunnelConfig) -> Result<()> {
        if config.local_port != RELAY_PORT {
            return Err(TunnelError::config(format!(
                "the relay tunnel only forwards port {}, but the dev server is on port {}",
                RELAY_PORT, config.local_port
            )));
        }
        Ok(())
    }

    async fn prepare(&self, config: &TunnelConfig) -> Result<AttemptContext> {
        let session_id = config.subdomain.clone().unwrap_or_else(generate_session_id);
        Ok(AttemptContext {
            session_id: Some(session_id),
            ..Default::default()
        })
    }

    fn build_invocation(&self, config: &TunnelConfig, ctx: &AttemptContext) -> Result<Invocation> {
        let session_id = ctx
            .session_id
            .clone()
            .ok_or_else(|| TunnelError::config("relay session id was not prepared"))?;
        let domain = config.domain.as_deref().unwrap_or(DEFAULT_RELAY_DOMAIN);

        Ok(Invocation::Relay(RelayParams {
            endpoint: config
                .relay_endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_RELAY_ENDPOINT.to_string()),
            public_url: format!("https://{}.{}", session_id, domain),
            session_id,
            local_port: config.local_port,
        }))
    }

    async fn connect(
        &self,
        invocation: Invocation,
        notifier: StatusNotifier,
    ) -> Result<Box<dyn TunnelLink>> {
        let Invocation::Relay(params) = invocation else {
            return Err(TunnelError::config("relay tunnel needs relay parameters"));
        };
        // Validate before handing out a link so a bad endpoint is not retried
        params.connect_url()?;
        Ok(Box::new(RelayLink::new(params, notifier)))
    }
}

// ============================================================================
// Link
// ============================================================================

/// Relay connection; the handshake happens in `discover_url`
pub struct RelayLink {
    params: RelayParams,
    notifier: StatusNotifier,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl RelayLink {
    pub fn new(params: RelayParams, notifier: StatusNotifier) -> Self {
        Self {
            params,
            notifier,
            cancel: CancellationToken::new(),
            alive: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }
}

#[async_trait]
impl TunnelLink for RelayLink {
    async fn discover_url(&mut self) -> Result<String> {
        if self.pump.is_some() {
            return Ok(self.params.public_url.clone());
        }

        let url = self.params.connect_url()?;
        debug!(endpoint = %self.params.endpoint, session = %self.params.session_id, "Connecting to relay");
        let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TunnelError::connect(format!("relay handshake failed: {}", e)))?;

        info!(session = %self.params.session_id, url = %self.params.public_url, "Relay tunnel connected");
        self.alive.store(true, Ordering::SeqCst);

        let cancel = self.cancel.clone();
        let alive = self.alive.clone();
        let notifier = self.notifier.clone();
        self.pump = Some(tokio::spawn(async move {
            // Pings are answered by tungstenite while the stream is polled
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ws.close(None).await;
                        alive.store(false, Ordering::SeqCst);
                        return;
                    }
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Relay closed the tunnel");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "Relay connection error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
            notifier.notify(TunnelStatus::Closed);
        }));

        Ok(self.params.public_url.clone())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self, grace: Duration) {
        self.cancel.cancel();
        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(grace, &mut pump).await.is_err() {
                debug!(session = %self.params.session_id, "Relay close timed out, aborting");
                pump.abort();
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
