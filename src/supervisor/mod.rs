//! Process supervisor
//!
//! Spawns tunnel executables and keeps them on a short leash.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐     ProcessEvent::Line     ┌──────────────────┐
//! │  stdout reader task  │ ─────────────────────────► │                  │
//! └──────────────────────┘                            │                  │
//! ┌──────────────────────┐     ProcessEvent::Line     │ SupervisedProcess│
//! │  stderr reader task  │ ─────────────────────────► │   (one owner)    │
//! └──────────────────────┘                            │                  │
//! ┌──────────────────────┐  ProcessEvent::Exited +    │                  │
//! │  exit watcher (Child)│ ─── watch<ExitInfo> ─────► │                  │
//! └──────────────────────┘ ◄── force kill request ─── └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let spec = CommandSpec::new("cloudflared")
//!     .args(["tunnel", "--url", "http://localhost:8081"]);
//! let mut process = SupervisedProcess::spawn(&spec)?;
//!
//! while let Some(event) = process.next_event().await {
//!     // ...
//! }
//!
//! process.kill(Duration::from_secs(1)).await;
//! ```

mod process;
mod stream;

pub use process::{
    CommandSpec, ExitInfo, OutputLine, OutputSource, ProcessEvent, SupervisedProcess,
};
