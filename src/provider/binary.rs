//! PublicBinary provider (`cloudflared`)
//!
//! Quick tunnels print a random `https://*.trycloudflare.com` URL on
//! stderr. Named tunnels (token + hostname) never print their URL, so the
//! hostname is used once the first edge connection registers.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use super::{AttemptContext, Discovery, Invocation, ProcessLink, TunnelLink, TunnelProvider, local_origin};
use crate::config::{ProviderKind, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::resolver::{BinaryRequest, BinaryResolver};
use crate::scanner::OutputScanner;
use crate::session::StatusNotifier;
use crate::supervisor::CommandSpec;

pub const CLOUDFLARED: &str = "cloudflared";

const INSTALL_HINT: &str = "Install cloudflared from \
    https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/ \
    or point DEVTUNNEL_BINARY at an existing copy.";

static TUNNEL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://[a-zA-Z0-9-]+\.(?:trycloudflare|cfargotunnel)\.com")
        .unwrap_or_else(|e| panic!("invalid tunnel URL pattern: {}", e))
});

/// Extract a Cloudflare tunnel URL from a line of `cloudflared` output.
///
/// The quick-tunnel API host shows up in error lines and is skipped.
pub fn extract_cloudflare_url(line: &str) -> Option<String> {
    TUNNEL_URL
        .find_iter(line)
        .map(|m| m.as_str())
        .find(|url| !url.starts_with("https://api."))
        .map(String::from)
}

pub struct PublicBinaryProvider {
    resolver: Arc<dyn BinaryResolver>,
}

impl PublicBinaryProvider {
    pub fn new(resolver: Arc<dyn BinaryResolver>) -> Self {
        Self { resolver }
    }
}

fn quick_tunnel_scanner() -> OutputScanner<Discovery> {
    OutputScanner::new(|line| {
        if line.contains("failed to request quick Tunnel") {
            return Some(Discovery::Failure(TunnelError::connect(line.trim())));
        }
        extract_cloudflare_url(line).map(Discovery::Url)
    })
}

fn named_tunnel_scanner(url: String) -> OutputScanner<Discovery> {
    OutputScanner::new(move |line| {
        if line.contains("Provided Tunnel token is not valid") {
            return Some(Discovery::Failure(TunnelError::fatal(
                "cloudflared rejected the tunnel token",
                Some("Check DEVTUNNEL_AUTH_TOKEN against your Cloudflare dashboard.".into()),
            )));
        }
        line.contains("Registered tunnel connection")
            .then(|| Discovery::Url(url.clone()))
    })
}

#[async_trait]
impl TunnelProvider for PublicBinaryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::PublicBinary
    }

    async fn prepare(&self, config: &TunnelConfig) -> Result<AttemptContext> {
        let binary = self
            .resolver
            .resolve(&BinaryRequest {
                name: CLOUDFLARED,
                override_path: config.binary_path.clone(),
                install_hint: INSTALL_HINT,
            })
            .await?;

        Ok(AttemptContext {
            binary: Some(binary.path),
            ..Default::default()
        })
    }

    fn build_invocation(&self, config: &TunnelConfig, ctx: &AttemptContext) -> Result<Invocation> {
        let binary = ctx
            .binary
            .clone()
            .ok_or_else(|| TunnelError::config("cloudflared binary was not resolved"))?;

        let command = CommandSpec::new(binary).args(["tunnel", "--no-autoupdate"]);

        match (&config.auth_token, &config.hostname) {
            (Some(token), Some(hostname)) => Ok(Invocation::Process {
                // Token via env keeps it out of the process list
                command: command
                    .args(["run", "--url", &local_origin(config.local_port)])
                    .env("TUNNEL_TOKEN", token),
                expected_url: Some(format!("https://{}", hostname)),
            }),
            _ => Ok(Invocation::Process {
                command: command.args(["--url", &local_origin(config.local_port)]),
                expected_url: None,
            }),
        }
    }

    async fn connect(
        &self,
        invocation: Invocation,
        notifier: StatusNotifier,
    ) -> Result<Box<dyn TunnelLink>> {
        let Invocation::Process {
            command,
            expected_url,
        } = invocation
        else {
            return Err(TunnelError::config(
                "cloudflared needs a process invocation",
            ));
        };

        let scanner = match expected_url {
            Some(url) => {
                info!(port = %notifier.key().local_port, url = %url, "Starting cloudflared named tunnel");
                named_tunnel_scanner(url)
            }
            None => {
                info!(port = %notifier.key().local_port, "Starting cloudflared quick tunnel");
                quick_tunnel_scanner()
            }
        };

        Ok(Box::new(ProcessLink::spawn(
            &command,
            scanner,
            notifier,
            INSTALL_HINT,
        )?))
    }
}
