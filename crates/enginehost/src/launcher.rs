//! Host process-activation boundary.
//!
//! The supervisor never spawns processes directly; it goes through a
//! [`ServiceLauncher`], which hides whether a service kind is a real helper
//! binary or an in-process stand-in. This is what lets the supervisor be
//! exercised without any child processes.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::bridge::protocol::ServiceKind;
use crate::handoff::ChannelEndpoint;

/// A freshly started service process, before the endpoint handshake.
///
/// The control halves carry the framed protocol from bridge::protocol;
/// `child` is present when the launcher spawned a real OS process.
pub struct LaunchedService {
    pub control_rx: Box<dyn AsyncRead + Send + Unpin>,
    pub control_tx: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Option<Child>,
}

impl std::fmt::Debug for LaunchedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedService")
            .field("has_child", &self.child.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to launch service process: {0}")]
    LaunchFailed(#[from] std::io::Error),
    #[error("launch failed: {0}")]
    Other(String),
}

/// Process activation as provided by the host.
pub trait ServiceLauncher: Send + Sync {
    fn launch(
        &self,
        kind: ServiceKind,
        endpoint: &ChannelEndpoint,
    ) -> Result<LaunchedService, LaunchError>;
}

/// Spawns each service kind as its own helper binary from a common
/// directory, with the control channel on the child's stdin/stdout and the
/// endpoint descriptor inherited across the spawn.
pub struct CommandLauncher {
    bin_dir: PathBuf,
}

impl CommandLauncher {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }
}

impl ServiceLauncher for CommandLauncher {
    fn launch(
        &self,
        kind: ServiceKind,
        endpoint: &ChannelEndpoint,
    ) -> Result<LaunchedService, LaunchError> {
        let program = self.bin_dir.join(kind.binary_name());

        endpoint.clear_cloexec()?;
        let spawned = Command::new(&program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn();
        if let Err(e) = endpoint.set_cloexec() {
            tracing::warn!(%kind, error = %e, "could not restore close-on-exec on endpoint");
        }

        let mut child = spawned?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LaunchError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::Other("stdout not captured".to_string()))?;

        tracing::debug!(
            %kind,
            program = %program.display(),
            pid = child.id(),
            "launched service process"
        );

        Ok(LaunchedService {
            control_rx: Box::new(stdout),
            control_tx: Box::new(stdin),
            child: Some(child),
        })
    }
}
