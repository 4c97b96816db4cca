//! Authenticated actor lookup
//!
//! ManagedRelay mixes the actor's display name into derived subdomains.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    /// Service account; cannot own managed tunnels
    Robot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub display_name: String,
    #[serde(default = "default_kind")]
    pub kind: ActorKind,
}

fn default_kind() -> ActorKind {
    ActorKind::User
}

impl Actor {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            kind: ActorKind::User,
        }
    }

    pub fn robot(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            kind: ActorKind::Robot,
        }
    }
}

#[async_trait]
pub trait ActorLookup: Send + Sync {
    /// Current actor, or `None` when nobody is signed in
    async fn current_actor(&self) -> Result<Option<Actor>>;
}

/// Reads `DEVTUNNEL_ACTOR`/`DEVTUNNEL_ACTOR_KIND`, falling back to
/// `~/.devtunnel/profile.json`
#[derive(Debug, Clone, Default)]
pub struct ProfileActorLookup {
    profile_path: Option<PathBuf>,
}

impl ProfileActorLookup {
    pub fn new() -> Self {
        Self {
            profile_path: dirs::home_dir().map(|home| home.join(".devtunnel").join("profile.json")),
        }
    }

    pub fn with_profile_path(path: impl Into<PathBuf>) -> Self {
        Self {
            profile_path: Some(path.into()),
        }
    }

    fn from_env() -> Option<Actor> {
        let name = std::env::var("DEVTUNNEL_ACTOR")
            .ok()
            .filter(|n| !n.trim().is_empty())?;
        let kind = match std::env::var("DEVTUNNEL_ACTOR_KIND") {
            Ok(kind) if kind.eq_ignore_ascii_case("robot") => ActorKind::Robot,
            _ => ActorKind::User,
        };
        Some(Actor {
            display_name: name.trim().to_string(),
            kind,
        })
    }
}

#[async_trait]
impl ActorLookup for ProfileActorLookup {
    async fn current_actor(&self) -> Result<Option<Actor>> {
        if let Some(actor) = Self::from_env() {
            return Ok(Some(actor));
        }

        let Some(ref path) = self.profile_path else {
            return Ok(None);
        };

        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let actor: Actor = serde_json::from_slice(&bytes).map_err(|e| {
                    TunnelError::Settings(format!("invalid profile {}: {}", path.display(), e))
                })?;
                debug!(actor = %actor.display_name, "Loaded actor profile");
                Ok(Some(actor))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TunnelError::Settings(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Fixed answer, for tests and embedders that already know the actor
#[derive(Debug, Clone, Default)]
pub struct StaticActorLookup(pub Option<Actor>);

#[async_trait]
impl ActorLookup for StaticActorLookup {
    async fn current_actor(&self) -> Result<Option<Actor>> {
        Ok(self.0.clone())
    }
}
