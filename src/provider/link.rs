//! Tunnel link backed by a supervised process
//!
//! Shared by the process-based providers: they differ only in the command
//! line and in how their output is read.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{TunnelLink, validate_public_url};
use crate::error::{Result, TunnelError};
use crate::scanner::{OutputScanner, Scan};
use crate::session::{StatusNotifier, TunnelStatus};
use crate::supervisor::{CommandSpec, ProcessEvent, SupervisedProcess};

/// What a provider's extractor pulled out of a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Url(String),
    /// Provider reported an error payload
    Failure(TunnelError),
}

pub struct ProcessLink {
    process: SupervisedProcess,
    scanner: OutputScanner<Discovery>,
    notifier: StatusNotifier,
    url: Option<String>,
}

impl ProcessLink {
    /// Spawn `command`; a spawn failure carries `remediation`
    pub fn spawn(
        command: &CommandSpec,
        scanner: OutputScanner<Discovery>,
        notifier: StatusNotifier,
        remediation: &str,
    ) -> Result<Self> {
        let process = SupervisedProcess::spawn(command).map_err(|e| match e {
            TunnelError::Spawn {
                program, message, ..
            } => TunnelError::Spawn {
                program,
                message,
                remediation: Some(remediation.to_string()),
            },
            other => other,
        })?;

        Ok(Self {
            process,
            scanner,
            notifier,
            url: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    fn on_connected(&mut self, url: &str) {
        info!(program = %self.process.program(), url = %url, "Tunnel URL discovered");
        self.url = Some(url.to_string());

        // Nobody reads output from here on; keep the pipes flowing and
        // report if the tunnel dies on its own
        let notifier = self.notifier.clone();
        self.process
            .drain_in_background(move |_| notifier.notify(TunnelStatus::Closed));
    }
}

#[async_trait]
impl TunnelLink for ProcessLink {
    async fn discover_url(&mut self) -> Result<String> {
        if let Some(ref url) = self.url {
            return Ok(url.clone());
        }

        while let Some(event) = self.process.next_event().await {
            match event {
                ProcessEvent::Line(line) => match self.scanner.feed_line(&line.text) {
                    Scan::Found(Discovery::Url(raw)) => {
                        let url = validate_public_url(&raw)?;
                        self.on_connected(&url);
                        return Ok(url);
                    }
                    Scan::Found(Discovery::Failure(err)) => {
                        debug!(program = %self.process.program(), error = %err, "Provider reported failure");
                        return Err(err);
                    }
                    Scan::NotFound => {}
                },
                ProcessEvent::IoError(e) => {
                    return Err(TunnelError::connect(format!(
                        "{} output could not be read: {}",
                        self.process.program(),
                        e
                    )));
                }
                ProcessEvent::Exited(info) => {
                    return Err(TunnelError::Connect {
                        message: format!(
                            "{} exited before a tunnel URL was found ({})",
                            self.process.program(),
                            info.describe()
                        ),
                        code: None,
                        exit_code: info.code,
                        retryable: true,
                        remediation: None,
                    });
                }
            }
        }

        Err(TunnelError::connect(format!(
            "{} output closed before a tunnel URL was found",
            self.process.program()
        )))
    }

    fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    async fn shutdown(&mut self, grace: Duration) {
        debug!(program = %self.process.program(), pid = ?self.process.pid(), "Shutting down tunnel process");
        self.process.kill(grace).await;
        self.url = None;
    }
}
