//! Locating tunnel executables

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, TunnelError};

/// What a provider needs resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRequest {
    /// Executable name looked up on `PATH`
    pub name: &'static str,
    /// Caller-supplied path that bypasses the lookup
    pub override_path: Option<PathBuf>,
    /// Shown to the user when nothing is found
    pub install_hint: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableDescriptor {
    pub path: PathBuf,
}

#[async_trait]
pub trait BinaryResolver: Send + Sync {
    /// Failures are non-retryable connect errors carrying the install hint
    async fn resolve(&self, request: &BinaryRequest) -> Result<ExecutableDescriptor>;
}

/// Explicit path first, then `PATH`
#[derive(Debug, Clone, Copy, Default)]
pub struct PathResolver;

#[async_trait]
impl BinaryResolver for PathResolver {
    async fn resolve(&self, request: &BinaryRequest) -> Result<ExecutableDescriptor> {
        if let Some(ref path) = request.override_path {
            return if is_file(path).await {
                Ok(ExecutableDescriptor { path: path.clone() })
            } else {
                Err(TunnelError::fatal(
                    format!("{} binary not found at {}", request.name, path.display()),
                    Some(request.install_hint.to_string()),
                ))
            };
        }

        let name = request.name;
        let found = tokio::task::spawn_blocking(move || which::which(name)).await?;
        match found {
            Ok(path) => {
                debug!(binary = %name, path = %path.display(), "Resolved tunnel binary");
                Ok(ExecutableDescriptor { path })
            }
            Err(e) => Err(TunnelError::fatal(
                format!("{} not found on PATH: {}", name, e),
                Some(request.install_hint.to_string()),
            )),
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
