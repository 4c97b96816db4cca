//! Types for tunnel sessions

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

// ============================================================================
// Session Types
// ============================================================================

/// Identity of a session: one tunnel per project and local port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub project_root: PathBuf,
    pub local_port: u16,
}

impl SessionKey {
    pub fn new(project_root: impl AsRef<Path>, local_port: u16) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            local_port,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_root.display(), self.local_port)
    }
}

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Never started, or fully stopped
    Idle,
    /// Tunnel spawned, URL not yet discovered
    Connecting,
    /// URL known and tunnel alive
    Connected,
    /// Attempts exhausted or non-retryable error
    Failed,
    /// Teardown in progress
    Stopping,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally observable view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: TunnelState,
    pub url: Option<String>,
    /// Attempts used by the current (or last) start
    pub attempts: u32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: TunnelState::Idle,
            url: None,
            attempts: 0,
        }
    }
}

// ============================================================================
// Status Notifications
// ============================================================================

/// Status changes worth showing to a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelStatus {
    Connecting { attempt: u32 },
    Connected { url: String },
    /// Tunnel went away: stopped, or died after connecting
    Closed,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub key: SessionKey,
    pub status: TunnelStatus,
}

/// Sends status events for one session
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    key: SessionKey,
    tx: broadcast::Sender<TunnelEvent>,
    /// Session snapshot that a `Closed` event moves out of `Connected`
    snapshot: Option<Arc<watch::Sender<SessionSnapshot>>>,
}

impl StatusNotifier {
    pub fn new(key: SessionKey, tx: broadcast::Sender<TunnelEvent>) -> Self {
        Self {
            key,
            tx,
            snapshot: None,
        }
    }

    /// Notifier whose events go nowhere
    pub fn detached(key: SessionKey) -> Self {
        let (tx, _) = broadcast::channel(1);
        Self::new(key, tx)
    }

    pub(crate) fn bind_snapshot(&mut self, snapshot: Arc<watch::Sender<SessionSnapshot>>) {
        self.snapshot = Some(snapshot);
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn notify(&self, status: TunnelStatus) {
        if status == TunnelStatus::Closed {
            if let Some(ref snapshot) = self.snapshot {
                snapshot.send_if_modified(|s| {
                    if s.state != TunnelState::Connected {
                        return false;
                    }
                    s.state = TunnelState::Idle;
                    s.url = None;
                    true
                });
            }
        }

        // No subscribers is fine
        let _ = self.tx.send(TunnelEvent {
            key: self.key.clone(),
            status,
        });
    }
}
