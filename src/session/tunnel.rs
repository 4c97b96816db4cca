//! One tunnel session: the retry loop and the live link
//!
//! A session is the only owner of its link. Every attempt tears the
//! previous link down (and waits for it to die) before the provider is
//! asked to start a new one.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{SessionSnapshot, StatusNotifier, TunnelState, TunnelStatus};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::provider::{TunnelLink, TunnelProvider};
use crate::timeout::{race_cancellable, sleep_cancellable};

pub struct TunnelSession {
    config: TunnelConfig,
    provider: Arc<dyn TunnelProvider>,
    notifier: StatusNotifier,
    link: Option<Box<dyn TunnelLink>>,
    snapshot: Arc<watch::Sender<SessionSnapshot>>,
}

impl TunnelSession {
    /// Fails fast on configuration the provider can never satisfy
    pub fn new(
        config: TunnelConfig,
        provider: Arc<dyn TunnelProvider>,
        mut notifier: StatusNotifier,
    ) -> Result<Self> {
        Self::check(&config, provider.as_ref())?;
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let snapshot = Arc::new(snapshot);
        // Links report their own death through the notifier
        notifier.bind_snapshot(snapshot.clone());
        Ok(Self {
            config,
            provider,
            notifier,
            link: None,
            snapshot,
        })
    }

    /// Static validation shared by construction and reconfiguration
    pub fn check(config: &TunnelConfig, provider: &dyn TunnelProvider) -> Result<()> {
        config.validate()?;
        provider.validate(config)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Observe state changes without locking the session
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// URL of a connected tunnel that is still alive
    pub fn live_url(&self) -> Option<String> {
        let snapshot = self.snapshot.borrow();
        let alive = self.link.as_ref().is_some_and(|link| link.is_alive());
        match (&snapshot.state, &snapshot.url) {
            (TunnelState::Connected, Some(url)) if alive => Some(url.clone()),
            _ => None,
        }
    }

    fn set_state(&self, state: TunnelState, url: Option<String>) {
        self.snapshot.send_modify(|s| {
            s.state = state;
            s.url = url;
        });
    }

    /// Swap in a new configuration, stopping whatever is running
    pub async fn reconfigure(&mut self, config: TunnelConfig, provider: Arc<dyn TunnelProvider>) {
        info!(key = %self.notifier.key(), provider = %config.provider, "Tunnel configuration changed");
        self.stop().await;
        self.config = config;
        self.provider = provider;
    }

    /// Run the retry loop until a URL is discovered, attempts run out, or
    /// `cancel` fires.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<String> {
        if let Some(url) = self.live_url() {
            return Ok(url);
        }
        if self.link.as_ref().is_some_and(|link| !link.is_alive()) {
            warn!(key = %self.notifier.key(), "Previous tunnel is gone, reconnecting");
        }

        let max_attempts = self.config.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.snapshot.send_modify(|s| {
                s.state = TunnelState::Connecting;
                s.url = None;
                s.attempts = attempt;
            });
            self.notifier.notify(TunnelStatus::Connecting { attempt });
            info!(
                key = %self.notifier.key(),
                provider = %self.provider.kind(),
                attempt,
                max_attempts,
                "Starting tunnel attempt"
            );

            let err = match self.attempt(cancel).await {
                Ok(url) => {
                    self.set_state(TunnelState::Connected, Some(url.clone()));
                    self.notifier.notify(TunnelStatus::Connected { url: url.clone() });
                    info!(key = %self.notifier.key(), url = %url, attempt, "Tunnel connected");
                    return Ok(url);
                }
                Err(TunnelError::Cancelled) => return self.abort().await,
                Err(err) => err,
            };

            // Providers get a chance to fix things up (or give up) first
            let err = if err.is_retryable() {
                match self.provider.recover(&self.config, &err).await {
                    Ok(()) => err,
                    Err(fatal) => fatal,
                }
            } else {
                err
            };

            if err.is_retryable() && attempt < max_attempts {
                warn!(key = %self.notifier.key(), attempt, error = %err, "Tunnel attempt failed, retrying");
                if sleep_cancellable(self.config.retry_backoff, cancel).await.is_err() {
                    return self.abort().await;
                }
                continue;
            }

            error!(key = %self.notifier.key(), attempt, error = %err, "Tunnel failed");
            self.teardown().await;
            self.set_state(TunnelState::Failed, None);
            self.notifier.notify(TunnelStatus::Failed {
                message: err.to_string(),
            });
            return Err(err);
        }
    }

    /// One spawn-and-discover cycle
    async fn attempt(&mut self, cancel: &CancellationToken) -> Result<String> {
        self.teardown().await;

        let provider = self.provider.clone();
        let notifier = self.notifier.clone();
        let config = &self.config;
        let link = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            link = async {
                let ctx = provider.prepare(config).await?;
                let invocation = provider.build_invocation(config, &ctx)?;
                provider.connect(invocation, notifier).await
            } => link?,
        };

        let limit = self.config.connect_timeout();
        let link = self.link.insert(link);
        race_cancellable(link.discover_url(), limit, cancel).await
    }

    async fn abort(&mut self) -> Result<String> {
        debug!(key = %self.notifier.key(), "Tunnel start cancelled");
        self.teardown().await;
        self.set_state(TunnelState::Idle, None);
        Err(TunnelError::Cancelled)
    }

    /// Shut the current link down and wait for it to die
    async fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown(self.config.kill_grace).await;
        }
    }

    /// Tear down and return to `Idle`. Never fails.
    pub async fn stop(&mut self) {
        let was_connected = self.snapshot.borrow().state == TunnelState::Connected;
        if self.link.is_some() {
            self.snapshot.send_modify(|s| s.state = TunnelState::Stopping);
            self.teardown().await;
        }
        self.set_state(TunnelState::Idle, None);

        if was_connected {
            info!(key = %self.notifier.key(), "Tunnel stopped");
            self.notifier.notify(TunnelStatus::Closed);
        }
    }
}
