// tests/common/mod.rs
// Scripted provider for driving sessions without real tunnels

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devtunnel::provider::{
    AttemptContext, Invocation, ProviderFactory, RelayParams, TunnelLink, TunnelProvider,
};
use devtunnel::session::StatusNotifier;
use devtunnel::{ProviderKind, Result, TunnelConfig, TunnelEnv, TunnelError, TunnelSessionManager};

// ============================================================================
// Scripted Outcomes
// ============================================================================

#[derive(Clone)]
pub enum Outcome {
    Url(&'static str),
    UrlAfter(Duration, &'static str),
    Hang,
    Fail(TunnelError),
}

/// Live link bookkeeping shared between a provider and its links
#[derive(Default)]
pub struct Counters {
    pub live: AtomicUsize,
    pub peak: AtomicUsize,
    pub connects: AtomicUsize,
}

impl Counters {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub struct FakeLink {
    outcome: Outcome,
    counters: Arc<Counters>,
    /// Cleared externally to simulate the tunnel dying
    alive: Arc<AtomicBool>,
    released: bool,
    stop_delay: Duration,
}

impl FakeLink {
    fn release(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TunnelLink for FakeLink {
    async fn discover_url(&mut self) -> Result<String> {
        match self.outcome.clone() {
            Outcome::Url(url) => Ok(url.to_string()),
            Outcome::UrlAfter(delay, url) => {
                tokio::time::sleep(delay).await;
                Ok(url.to_string())
            }
            Outcome::Hang => futures::future::pending().await,
            Outcome::Fail(err) => Err(err),
        }
    }

    fn is_alive(&self) -> bool {
        !self.released && self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&mut self, _grace: Duration) {
        if !self.stop_delay.is_zero() {
            tokio::time::sleep(self.stop_delay).await;
        }
        self.release();
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Provider + Factory
// ============================================================================

pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<Outcome>>,
    /// Used once the script runs out
    fallback: Outcome,
    pub counters: Arc<Counters>,
    links: Mutex<Vec<Arc<AtomicBool>>>,
    stop_delay: Mutex<Duration>,
}

impl ScriptedProvider {
    pub fn new(outcomes: Vec<Outcome>, fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            kind: ProviderKind::PublicBinary,
            script: Mutex::new(outcomes.into()),
            fallback,
            counters: Arc::new(Counters::default()),
            links: Mutex::new(Vec::new()),
            stop_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Links handed out from now on take `delay` to shut down
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    /// Make every link handed out so far report dead
    pub fn kill_links(&self) {
        for alive in self.links.lock().unwrap().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TunnelProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn prepare(&self, _config: &TunnelConfig) -> Result<AttemptContext> {
        Ok(AttemptContext::default())
    }

    fn build_invocation(&self, config: &TunnelConfig, _ctx: &AttemptContext) -> Result<Invocation> {
        Ok(Invocation::Relay(RelayParams {
            endpoint: "ws://scripted.invalid".into(),
            session_id: "scripted".into(),
            local_port: config.local_port,
            public_url: String::new(),
        }))
    }

    async fn connect(
        &self,
        _invocation: Invocation,
        _notifier: StatusNotifier,
    ) -> Result<Box<dyn TunnelLink>> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(live, Ordering::SeqCst);

        let alive = Arc::new(AtomicBool::new(true));
        self.links.lock().unwrap().push(alive.clone());
        Ok(Box::new(FakeLink {
            outcome,
            counters: self.counters.clone(),
            alive,
            released: false,
            stop_delay: *self.stop_delay.lock().unwrap(),
        }))
    }
}

/// Hands the same scripted provider to every session
pub struct ScriptedFactory(pub Arc<ScriptedProvider>);

impl ProviderFactory for ScriptedFactory {
    fn create(&self, _config: &TunnelConfig) -> Result<Arc<dyn TunnelProvider>> {
        Ok(self.0.clone())
    }
}

pub fn scripted_manager(provider: Arc<ScriptedProvider>) -> TunnelSessionManager {
    TunnelSessionManager::new(Arc::new(ScriptedFactory(provider)), TunnelEnv::default())
}

pub fn fast_config(port: u16) -> TunnelConfig {
    TunnelConfig::new("/tmp/devtunnel-test", port, ProviderKind::PublicBinary)
        .with_connect_timeout(Duration::from_millis(200))
        .with_retry_backoff(Duration::from_millis(10))
        .with_kill_grace(Duration::from_millis(200))
}
