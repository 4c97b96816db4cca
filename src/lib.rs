// src/lib.rs
// Devtunnel - supervised public tunnels for local dev servers

pub mod actor;
pub mod config;
pub mod error;
pub mod provider;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod settings;
pub mod supervisor;
pub mod timeout;

pub use config::{ProviderKind, TunnelConfig, TunnelEnv};
pub use error::{Result, TunnelError};
pub use session::{
    SessionKey, SessionSnapshot, TunnelEvent, TunnelSessionManager, TunnelState, TunnelStatus,
};
