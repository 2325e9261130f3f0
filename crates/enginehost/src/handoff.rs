//! Endpoint construction and descriptor handoff.
//!
//! A bind request arrives with a raw descriptor (one end of an engine IPC
//! channel, minted by the requesting process) and a resource directory the
//! target engine reads its assets from. `handoff` validates both and
//! packages them as a [`ChannelEndpoint`] the supervisor can deliver to a
//! launched service process.
//!
//! Ownership rules: `handoff` takes ownership of the descriptor; after a
//! successful call the caller must not use or close the raw fd again. The
//! endpoint never closes the descriptor on delivery - the service process
//! receives its own inherited copy, and the supervisor-side copy lives
//! exactly as long as the service handle that owns it (which is what makes
//! re-delivery to a restarted process possible).

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// The descriptor does not name an open channel, or the resource
    /// directory is missing or unreadable.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
}

/// A bidirectional communication handle plus the resource directory a
/// service process needs for local assets. Created once per bind.
#[derive(Debug)]
pub struct ChannelEndpoint {
    ipc: OwnedFd,
    resource_dir: PathBuf,
}

/// Validate a raw descriptor and resource directory and take ownership of
/// the descriptor for delivery to a service process.
pub fn handoff(
    ipc_fd: RawFd,
    resource_dir: impl Into<PathBuf>,
) -> Result<ChannelEndpoint, HandoffError> {
    let resource_dir = resource_dir.into();

    if ipc_fd < 0 {
        return Err(HandoffError::InvalidHandle(format!(
            "negative descriptor {ipc_fd}"
        )));
    }

    // Safety: probing only; ownership is taken below, after validation.
    let probe = unsafe { BorrowedFd::borrow_raw(ipc_fd) };
    fcntl(probe, FcntlArg::F_GETFD).map_err(|e| {
        HandoffError::InvalidHandle(format!("descriptor {ipc_fd} is not open: {e}"))
    })?;

    std::fs::read_dir(&resource_dir).map_err(|e| {
        HandoffError::InvalidHandle(format!(
            "resource directory {} is not readable: {e}",
            resource_dir.display()
        ))
    })?;

    // Safety: validated open above; the caller transfers ownership of
    // ipc_fd with this call.
    let ipc = unsafe { OwnedFd::from_raw_fd(ipc_fd) };

    tracing::debug!(ipc_fd, resource_dir = %resource_dir.display(), "endpoint packaged");

    Ok(ChannelEndpoint { ipc, resource_dir })
}

impl ChannelEndpoint {
    pub fn ipc_fd(&self) -> RawFd {
        self.ipc.as_raw_fd()
    }

    pub fn resource_dir(&self) -> &Path {
        &self.resource_dir
    }

    /// Allow the descriptor to be inherited across the next spawn.
    pub fn clear_cloexec(&self) -> io::Result<()> {
        fcntl(self.ipc.as_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
        Ok(())
    }

    /// Restore close-on-exec so the descriptor does not leak into
    /// unrelated child processes.
    pub fn set_cloexec(&self) -> io::Result<()> {
        fcntl(self.ipc.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(())
    }

    /// Transfer ownership of the descriptor out of the endpoint without
    /// closing it.
    pub fn into_ipc_fd(self) -> OwnedFd {
        self.ipc
    }
}
