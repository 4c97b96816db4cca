//! Tunnel sessions
//!
//! [`TunnelSession`] owns one tunnel and its retry loop;
//! [`TunnelSessionManager`] keys sessions by project and port and is what
//! callers talk to.
//!
//! ```text
//! Idle ──start──▶ Connecting ──url──▶ Connected
//!                  │    ▲                 │
//!        fail/timeout   └── retry ──┘     stop
//!                  ▼                      ▼
//!               Failed ──start──▶ ...  Stopping ──▶ Idle
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = TunnelSessionManager::with_defaults();
//! let mut events = manager.subscribe();
//!
//! let config = TunnelConfig::new("/path/to/app", 8081, ProviderKind::PublicBinary);
//! let key = config.key();
//! if let Some(url) = manager.start(config).await? {
//!     println!("Tunnel ready at {}", url);
//! }
//!
//! manager.stop(&key).await;
//! ```

mod manager;
mod tunnel;
mod types;

pub use manager::TunnelSessionManager;
pub use tunnel::TunnelSession;
pub use types::{
    SessionKey, SessionSnapshot, StatusNotifier, TunnelEvent, TunnelState, TunnelStatus,
};
