//! Service-side runtime for helper processes.
//!
//! This module is the child half of the control protocol; the supervisor
//! half (launching, handoff, liveness) is in supervisor.rs. A helper binary
//! wires its engine into [`EngineEntry`] and hands control to
//! [`run_service`], which performs the endpoint handshake and then stays on
//! the control channel until shutdown.

use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ControlResponse};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine could not come up on the delivered endpoint.
    #[error("engine initialization failed: {message}")]
    Init { message: String },

    /// The engine came up and later stopped on its own.
    #[error("engine terminated: {message}")]
    Terminated { message: String },
}

impl EngineError {
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::Terminated {
            message: message.into(),
        }
    }
}

/// The channel a service process serves on: the adopted IPC descriptor and
/// the resource directory passed through from the bind request.
pub struct EngineChannel {
    pub ipc: OwnedFd,
    pub resource_dir: PathBuf,
}

/// The engine boundary. Invoked once per process start with the bound
/// channel; everything behind it is opaque to this layer.
#[async_trait::async_trait]
pub trait EngineEntry: Send + Sync + 'static {
    async fn run(&self, channel: EngineChannel) -> Result<(), EngineError>;
}

/// Run the service event loop on the process's stdin/stdout.
///
/// Waits for the endpoint handshake, reports Ready, then drives the engine
/// while answering control messages. Returns when the supervisor asks for
/// shutdown, the control channel closes, or the engine stops.
pub async fn run_service<E: EngineEntry>(entry: Arc<E>) -> io::Result<()> {
    serve(entry, tokio::io::stdin(), tokio::io::stdout()).await
}

async fn serve<E, R, W>(entry: Arc<E>, reader: R, writer: W) -> io::Result<()>
where
    E: EngineEntry,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ctrl_rx = FramedRead::new(reader, JsonCodec::<ControlRequest>::new());
    let mut ctrl_tx = FramedWrite::new(writer, JsonCodec::<ControlResponse>::new());

    let (ipc_fd, resource_dir) = match ctrl_rx.next().await {
        Some(Ok(ControlRequest::Init {
            ipc_fd,
            resource_dir,
        })) => (ipc_fd, resource_dir),
        Some(Ok(other)) => {
            tracing::error!(?other, "expected endpoint delivery as first message");
            let _ = ctrl_tx
                .send(ControlResponse::Failed {
                    error: "expected init as first message".to_string(),
                })
                .await;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "control channel did not start with init",
            ));
        }
        Some(Err(e)) => return Err(e),
        None => {
            tracing::error!("control channel closed before endpoint delivery");
            return Ok(());
        }
    };

    let channel = match adopt_endpoint(ipc_fd, resource_dir) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "could not adopt delivered endpoint");
            let _ = ctrl_tx
                .send(ControlResponse::Failed {
                    error: e.to_string(),
                })
                .await;
            return Ok(());
        }
    };

    ctrl_tx.send(ControlResponse::Ready).await?;
    tracing::info!(ipc_fd, "service ready");

    let mut engine = entry.run(channel);
    loop {
        tokio::select! {
            biased;

            msg = ctrl_rx.next() => match msg {
                Some(Ok(ControlRequest::Shutdown)) => {
                    tracing::info!("shutdown requested");
                    let _ = ctrl_tx.send(ControlResponse::ShuttingDown).await;
                    break;
                }
                Some(Ok(ControlRequest::Init { .. })) => {
                    tracing::warn!("duplicate endpoint delivery ignored");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "control channel error");
                    break;
                }
                None => {
                    tracing::error!("control channel closed (supervisor died?), exiting");
                    break;
                }
            },

            result = &mut engine => {
                match result {
                    Ok(()) => tracing::info!("engine returned"),
                    Err(e) => {
                        tracing::error!(error = %e, "engine failed");
                        let _ = ctrl_tx
                            .send(ControlResponse::Failed {
                                error: e.to_string(),
                            })
                            .await;
                    }
                }
                break;
            }
        }
    }

    tracing::info!("service exiting");
    Ok(())
}

/// Take ownership of the inherited descriptor and check the handoff is
/// usable before reporting Ready.
fn adopt_endpoint(ipc_fd: RawFd, resource_dir: PathBuf) -> Result<EngineChannel, EngineError> {
    if ipc_fd < 0 {
        return Err(EngineError::init(format!("negative descriptor {ipc_fd}")));
    }

    // Safety: probing only; ownership is taken below, after validation.
    let probe = unsafe { BorrowedFd::borrow_raw(ipc_fd) };
    fcntl(probe, FcntlArg::F_GETFD).map_err(|e| {
        EngineError::init(format!("inherited descriptor {ipc_fd} is not open: {e}"))
    })?;

    std::fs::read_dir(&resource_dir).map_err(|e| {
        EngineError::init(format!(
            "resource directory {} is not readable: {e}",
            resource_dir.display()
        ))
    })?;

    // Safety: the handoff contract gives this process sole ownership of
    // the inherited descriptor, validated open above.
    let ipc = unsafe { OwnedFd::from_raw_fd(ipc_fd) };

    // Our own children must not inherit the engine channel.
    if let Err(e) = fcntl(&ipc, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
        tracing::warn!(ipc_fd, error = %e, "could not set close-on-exec on endpoint");
    }

    Ok(EngineChannel { ipc, resource_dir })
}
