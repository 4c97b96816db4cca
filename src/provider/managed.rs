//! ManagedRelay provider (`ngrok`)
//!
//! The public hostname is stable per project: unless the caller names one,
//! it is derived from a persisted random token, the actor's display name
//! and the local port. A collision on a derived name rotates the token.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::{AttemptContext, Discovery, Invocation, ProcessLink, TunnelLink, TunnelProvider};
use crate::actor::{ActorKind, ActorLookup};
use crate::config::{ProviderKind, TunnelConfig};
use crate::error::{Result, SUBDOMAIN_IN_USE, TunnelError};
use crate::resolver::{BinaryRequest, BinaryResolver};
use crate::scanner::OutputScanner;
use crate::session::StatusNotifier;
use crate::settings::{SettingsPatch, SettingsStore};
use crate::supervisor::CommandSpec;

pub const NGROK: &str = "ngrok";
pub const DEFAULT_MANAGED_DOMAIN: &str = "exp.direct";
/// Display name used when nobody is signed in
pub const ANONYMOUS: &str = "anonymous";

const RANDOMNESS_LEN: usize = 5;
const RANDOMNESS_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_LABEL_LEN: usize = 63;

const INSTALL_HINT: &str = "Install ngrok from https://ngrok.com/download \
    or point DEVTUNNEL_BINARY at an existing copy.";
const AUTH_HINT: &str = "Set DEVTUNNEL_AUTH_TOKEN to the authtoken from \
    https://dashboard.ngrok.com/get-started/your-authtoken";

static NGROK_ERROR_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ERR_NGROK_\d+").unwrap_or_else(|e| panic!("invalid ngrok code pattern: {}", e))
});

// ============================================================================
// Hostname Derivation
// ============================================================================

/// Fresh `[a-z0-9]{5}` token
pub fn generate_randomness() -> String {
    let mut rng = rand::rng();
    (0..RANDOMNESS_LEN)
        .map(|_| RANDOMNESS_ALPHABET[rng.random_range(0..RANDOMNESS_ALPHABET.len())] as char)
        .collect()
}

/// Reduce `input` to a valid DNS label
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }

    let mut slug = slug.trim_matches('-').to_string();
    slug.truncate(MAX_LABEL_LEN);
    slug.trim_end_matches('-').to_string()
}

/// Default subdomain for a project; same inputs, same label
pub fn derive_subdomain(randomness: &str, actor_name: &str, port: u16) -> String {
    slugify(&format!("{}-{}-{}", randomness, actor_name, port))
}

pub fn managed_hostname(subdomain: &str, domain: &str) -> String {
    format!("{}.{}", subdomain, domain)
}

// ============================================================================
// Log Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    lvl: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

/// Map an ngrok error message onto the error taxonomy
pub fn classify_ngrok_error(message: &str) -> TunnelError {
    let message = message.trim();
    let code = NGROK_ERROR_CODE.find(message).map(|m| m.as_str().to_string());
    let lower = message.to_lowercase();

    if code.as_deref() == Some("ERR_NGROK_334")
        || lower.contains("already online")
        || lower.contains("already bound")
    {
        return TunnelError::connect(message).with_code(SUBDOMAIN_IN_USE);
    }

    match code.as_deref() {
        Some(c @ ("ERR_NGROK_105" | "ERR_NGROK_4018")) => {
            TunnelError::fatal(message, Some(AUTH_HINT.to_string())).with_code(c)
        }
        Some(c) => TunnelError::connect(message).with_code(c),
        None => TunnelError::connect(message),
    }
}

/// Read one line of `--log-format json` output
pub fn parse_ngrok_log_line(line: &str) -> Option<Discovery> {
    let line = line.trim();
    if !line.starts_with('{') {
        // Startup failures are printed as plain text before logging starts
        return line
            .contains("ERR_NGROK_")
            .then(|| Discovery::Failure(classify_ngrok_error(line)));
    }

    let entry: LogLine = serde_json::from_str(line).ok()?;
    if let Some(url) = entry.url.filter(|u| u.starts_with("https://")) {
        return Some(Discovery::Url(url));
    }
    match (entry.lvl.as_deref(), entry.err) {
        (Some("eror") | Some("crit"), Some(err)) if err != "<nil>" => {
            Some(Discovery::Failure(classify_ngrok_error(&err)))
        }
        _ => None,
    }
}

// ============================================================================
// Provider
// ============================================================================

pub struct ManagedRelayProvider {
    settings: Arc<dyn SettingsStore>,
    actors: Arc<dyn ActorLookup>,
    resolver: Arc<dyn BinaryResolver>,
}

impl ManagedRelayProvider {
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

    /// Display name for derivation; robots cannot own managed tunnels
    async fn actor_name(&self) -> Result<String> {
        match self.actors.current_actor().await? {
            Some(actor) if actor.kind == ActorKind::Robot => Err(TunnelError::config(format!(
                "robot account '{}' cannot start a managed tunnel; sign in as a user",
                actor.display_name
            ))),
            Some(actor) => Ok(actor.display_name),
            None => Ok(ANONYMOUS.to_string()),
        }
    }

    /// Persisted token for the project, created on first use
    async fn url_randomness(&self, config: &TunnelConfig) -> Result<String> {
        let root = config.project_root();
        if let Some(token) = self.settings.read(root).await?.url_randomness {
            return Ok(token);
        }

        let token = generate_randomness();
        self.settings
            .write(
                root,
                SettingsPatch {
                    url_randomness: Some(token.clone()),
                },
            )
            .await?;
        Ok(token)
    }

    /// Hostname the next attempt will request
    pub async fn hostname(&self, config: &TunnelConfig) -> Result<String> {
        let ctx = self.naming_context(config).await?;
        requested_hostname(config, &ctx)
    }

    async fn naming_context(&self, config: &TunnelConfig) -> Result<AttemptContext> {
        let actor_name = self.actor_name().await?;
        let url_randomness = if config.has_explicit_name() {
            None
        } else {
            Some(self.url_randomness(config).await?)
        };

        Ok(AttemptContext {
            actor_name: Some(actor_name),
            url_randomness,
            ..Default::default()
        })
    }
}

fn requested_hostname(config: &TunnelConfig, ctx: &AttemptContext) -> Result<String> {
    if let Some(ref hostname) = config.hostname {
        return Ok(hostname.clone());
    }

    let domain = config.domain.as_deref().unwrap_or(DEFAULT_MANAGED_DOMAIN);
    if let Some(ref subdomain) = config.subdomain {
        return Ok(managed_hostname(subdomain, domain));
    }

    let randomness = ctx
        .url_randomness
        .as_deref()
        .ok_or_else(|| TunnelError::config("no URL randomness available to derive a subdomain"))?;
    let actor = ctx.actor_name.as_deref().unwrap_or(ANONYMOUS);
    Ok(managed_hostname(
        &derive_subdomain(randomness, actor, config.local_port),
        domain,
    ))
}

#[async_trait]
impl TunnelProvider for ManagedRelayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ManagedRelay
    }

    async fn prepare(&self, config: &TunnelConfig) -> Result<AttemptContext> {
        let binary = self
            .resolver
            .resolve(&BinaryRequest {
                name: NGROK,
                override_path: config.binary_path.clone(),
                install_hint: INSTALL_HINT,
            })
            .await?;

        Ok(AttemptContext {
            binary: Some(binary.path),
            ..self.naming_context(config).await?
        })
    }

    fn build_invocation(&self, config: &TunnelConfig, ctx: &AttemptContext) -> Result<Invocation> {
        let binary = ctx
            .binary
            .clone()
            .ok_or_else(|| TunnelError::config("ngrok binary was not resolved"))?;
        let hostname = requested_hostname(config, ctx)?;

        let mut command = CommandSpec::new(binary).args([
            "http".to_string(),
            config.local_port.to_string(),
            "--log".into(),
            "stdout".into(),
            "--log-format".into(),
            "json".into(),
            "--domain".into(),
            hostname,
        ]);
        if let Some(ref token) = config.auth_token {
            command = command.env("NGROK_AUTHTOKEN", token);
        }

        Ok(Invocation::Process {
            command,
            expected_url: None,
        })
    }

    async fn connect(
        &self,
        invocation: Invocation,
        notifier: StatusNotifier,
    ) -> Result<Box<dyn TunnelLink>> {
        let Invocation::Process { command, .. } = invocation else {
            return Err(TunnelError::config("ngrok needs a process invocation"));
        };

        info!(port = %notifier.key().local_port, "Starting ngrok tunnel");
        let scanner = OutputScanner::new(parse_ngrok_log_line);
        Ok(Box::new(ProcessLink::spawn(
            &command,
            scanner,
            notifier,
            INSTALL_HINT,
        )?))
    }

    async fn recover(&self, config: &TunnelConfig, error: &TunnelError) -> Result<()> {
        if error.code() != Some(SUBDOMAIN_IN_USE) {
            return Ok(());
        }

        if config.has_explicit_name() {
            return Err(TunnelError::fatal(
                error.to_string(),
                Some("The requested subdomain is in use by another tunnel. Choose a different one.".into()),
            )
            .with_code(SUBDOMAIN_IN_USE));
        }

        let token = generate_randomness();
        warn!(
            project = %config.project_root().display(),
            "Derived subdomain is taken, rotating URL randomness"
        );
        self.settings
            .write(
                config.project_root(),
                SettingsPatch {
                    url_randomness: Some(token),
                },
            )
            .await
    }
}
