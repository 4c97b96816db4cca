// src/main.rs
// Devtunnel - expose a local dev server through a supervised tunnel

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use devtunnel::provider::{ManagedRelayProvider, ProviderContext};
use devtunnel::{ProviderKind, TunnelConfig, TunnelEnv, TunnelSessionManager, TunnelStatus};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "devtunnel")]
#[command(about = "Expose a local development server through a public tunnel")]
#[command(version)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a tunnel and keep it up until Ctrl-C
    Start {
        /// Local port the dev server listens on
        #[arg(short, long)]
        port: u16,

        /// Project root (default: current directory)
        #[arg(long)]
        project: Option<PathBuf>,

        /// managed-relay, public-binary or proprietary-relay
        #[arg(long, default_value = "public-binary")]
        provider: ProviderKind,

        /// Explicit subdomain or relay session id
        #[arg(long)]
        subdomain: Option<String>,

        /// Explicit public hostname
        #[arg(long)]
        hostname: Option<String>,

        /// Path to the tunnel executable
        #[arg(long)]
        binary: Option<PathBuf>,

        /// Provider auth token
        #[arg(long, env = "DEVTUNNEL_AUTH_TOKEN", hide_env_values = true)]
        auth_token: Option<String>,

        /// Time allowed per attempt to discover the URL
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Print the managed-relay hostname this project would request
    Hostname {
        #[arg(short, long)]
        port: u16,

        #[arg(long)]
        project: Option<PathBuf>,
    },
}

fn project_dir(project: Option<PathBuf>) -> PathBuf {
    project.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

async fn run_start(manager: TunnelSessionManager, config: TunnelConfig) -> Result<()> {
    let key = config.key();

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.status {
                TunnelStatus::Connecting { attempt } if attempt > 1 => {
                    eprintln!("Retrying tunnel (attempt {})", attempt);
                }
                TunnelStatus::Closed => eprintln!("Tunnel closed"),
                _ => {}
            }
        }
    });

    match manager.start(config).await {
        Ok(Some(url)) => println!("Tunnel ready at {}", url),
        Ok(None) => {
            println!("Offline mode: no tunnel started");
            return Ok(());
        }
        Err(e) => {
            eprintln!("{}", e.to_user_string());
            std::process::exit(1);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping tunnel");
    manager.stop(&key).await;
    Ok(())
}

async fn run_hostname(port: u16, project: Option<PathBuf>) -> Result<()> {
    let env = TunnelEnv::from_env();
    let config =
        TunnelConfig::new(project_dir(project), port, ProviderKind::ManagedRelay).apply_env(&env);

    let ctx = ProviderContext::from_defaults();
    let provider = ManagedRelayProvider::new(ctx.settings, ctx.actors, ctx.resolver);
    match provider.hostname(&config).await {
        Ok(hostname) => println!("{}", hostname),
        Err(e) => {
            eprintln!("{}", e.to_user_string());
            std::process::exit(1);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Start {
            port,
            project,
            provider,
            subdomain,
            hostname,
            binary,
            auth_token,
            timeout_ms,
            max_attempts,
        } => {
            let mut config = TunnelConfig::new(project_dir(project), port, provider);
            if let Some(subdomain) = subdomain {
                config = config.with_subdomain(subdomain);
            }
            if let Some(hostname) = hostname {
                config = config.with_hostname(hostname);
            }
            if let Some(binary) = binary {
                config = config.with_binary(binary);
            }
            if let Some(token) = auth_token {
                config = config.with_auth_token(token);
            }
            if let Some(ms) = timeout_ms {
                config = config.with_connect_timeout(Duration::from_millis(ms));
            }
            if let Some(attempts) = max_attempts {
                config = config.with_max_attempts(attempts);
            }

            run_start(TunnelSessionManager::with_defaults(), config).await?;
        }
        Commands::Hostname { port, project } => {
            run_hostname(port, project).await?;
        }
    }

    Ok(())
}
