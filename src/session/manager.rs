//! Session manager: one tunnel per `(project, port)`
//!
//! Starts run on a spawned task whose result is shared, so concurrent
//! callers for the same key await one connect sequence. `stop` cancels
//! whatever is in flight and waits for the tunnel to be torn down.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tunnel::TunnelSession;
use super::types::{SessionKey, SessionSnapshot, StatusNotifier, TunnelEvent};
use crate::config::{TunnelConfig, TunnelEnv};
use crate::error::Result;
use crate::provider::{ProviderContext, ProviderFactory, TunnelProvider};

type SharedStart = Shared<BoxFuture<'static, Result<String>>>;

struct Inflight {
    epoch: u64,
    cancel: CancellationToken,
    result: SharedStart,
}

struct SessionEntry {
    session: Arc<Mutex<TunnelSession>>,
    snapshot: watch::Receiver<SessionSnapshot>,
    config: TunnelConfig,
    /// Bumped by every start and stop; a stop only removes the entry it saw
    epoch: u64,
    inflight: Option<Inflight>,
}

impl SessionEntry {
    fn new(session: TunnelSession) -> Self {
        Self {
            snapshot: session.watch(),
            config: session.config().clone(),
            session: Arc::new(Mutex::new(session)),
            epoch: 0,
            inflight: None,
        }
    }
}

/// Entry point for starting and stopping tunnels
pub struct TunnelSessionManager {
    sessions: Arc<RwLock<HashMap<SessionKey, SessionEntry>>>,
    factory: Arc<dyn ProviderFactory>,
    env: TunnelEnv,
    event_tx: broadcast::Sender<TunnelEvent>,
    epochs: AtomicU64,
}

impl TunnelSessionManager {
    pub fn new(factory: Arc<dyn ProviderFactory>, env: TunnelEnv) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            factory,
            env,
            event_tx,
            epochs: AtomicU64::new(0),
        }
    }

    /// Built-in providers, environment overrides from the process
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(ProviderContext::from_defaults()),
            TunnelEnv::from_env(),
        )
    }

    /// Subscribe to status changes of every session
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.event_tx.subscribe()
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start (or join, or reuse) the tunnel for `config`'s key.
    ///
    /// Returns `Ok(None)` in offline mode.
    pub async fn start(&self, config: TunnelConfig) -> Result<Option<String>> {
        if self.env.offline {
            info!(port = config.local_port, "Offline mode, not starting a tunnel");
            return Ok(None);
        }

        let config = config.apply_env(&self.env);
        let key = config.key();

        let pending = {
            let mut sessions = self.sessions.write().await;
            let entry = match sessions.entry(key.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(v) => {
                    let provider = self.factory.create(&config)?;
                    let notifier = StatusNotifier::new(key.clone(), self.event_tx.clone());
                    let session = TunnelSession::new(config.clone(), provider, notifier)?;
                    v.insert(SessionEntry::new(session))
                }
            };

            if let Some(ref inflight) = entry.inflight {
                debug!(key = %key, "Joining in-flight tunnel start");
                inflight.result.clone()
            } else if entry.config != config {
                let provider = self.factory.create(&config)?;
                TunnelSession::check(&config, provider.as_ref())?;
                entry.config = config.clone();
                self.begin(&key, entry, Some((config, provider)))
            } else {
                // Lock is free when nothing is in flight, unless a stop holds it
                if let Ok(session) = entry.session.try_lock() {
                    if let Some(url) = session.live_url() {
                        debug!(key = %key, url = %url, "Tunnel already connected");
                        return Ok(Some(url));
                    }
                }
                self.begin(&key, entry, None)
            }
        };

        pending.await.map(Some)
    }

    /// Spawn the start task for `entry`. Caller holds the sessions lock.
    fn begin(
        &self,
        key: &SessionKey,
        entry: &mut SessionEntry,
        replacement: Option<(TunnelConfig, Arc<dyn TunnelProvider>)>,
    ) -> SharedStart {
        let epoch = self.next_epoch();
        let cancel = CancellationToken::new();

        let session = entry.session.clone();
        let sessions = self.sessions.clone();
        let task_key = key.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = {
                let mut session = session.lock().await;
                if let Some((config, provider)) = replacement {
                    session.reconfigure(config, provider).await;
                }
                session.start(&task_cancel).await
            };

            if let Some(entry) = sessions.write().await.get_mut(&task_key) {
                if entry.inflight.as_ref().is_some_and(|f| f.epoch == epoch) {
                    entry.inflight = None;
                }
            }
            result
        });

        let result: SharedStart = async move { task.await? }.boxed().shared();
        entry.epoch = epoch;
        entry.inflight = Some(Inflight {
            epoch,
            cancel,
            result: result.clone(),
        });
        result
    }

    /// Stop the tunnel for `key`. Safe to call at any time; never fails.
    pub async fn stop(&self, key: &SessionKey) {
        let (session, epoch) = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(key) else {
                debug!(key = %key, "No tunnel to stop");
                return;
            };
            let epoch = self.next_epoch();
            entry.epoch = epoch;
            if let Some(inflight) = entry.inflight.take() {
                debug!(key = %key, "Cancelling in-flight tunnel start");
                inflight.cancel.cancel();
            }
            (entry.session.clone(), epoch)
        };

        // Waits for a cancelled start to finish its own teardown
        let mut session = session.lock().await;
        let current = |sessions: &HashMap<SessionKey, SessionEntry>| {
            sessions.get(key).is_some_and(|e| e.epoch == epoch)
        };
        if !current(&*self.sessions.read().await) {
            debug!(key = %key, "Stop superseded by a newer start");
            return;
        }

        session.stop().await;

        let mut sessions = self.sessions.write().await;
        if current(&*sessions) {
            sessions.remove(key);
        }
    }

    /// Public URL for `key` while its tunnel is connected and alive
    pub async fn get_active_url(&self, key: &SessionKey) -> Option<String> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(key)?;
        // A held lock means a start or stop is running: not connected
        let session = entry.session.try_lock().ok()?;
        session.live_url()
    }

    /// Current state, URL and attempt count for `key`
    pub async fn snapshot(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        sessions.get(key).map(|e| e.snapshot.borrow().clone())
    }

    pub async fn active_keys(&self) -> Vec<SessionKey> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Stop every session
    pub async fn shutdown(&self) {
        let keys = self.active_keys().await;
        if !keys.is_empty() {
            info!(count = keys.len(), "Stopping all tunnels");
        }
        futures::future::join_all(keys.iter().map(|key| self.stop(key))).await;
    }
}
