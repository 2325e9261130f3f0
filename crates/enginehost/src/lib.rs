//! enginehost: service connection broker for browser engine helper processes.
//!
//! A browser instance is assembled from isolated OS processes - WebContent,
//! RequestServer, ImageDecoder - each backed by its own engine library and
//! reachable only through a channel endpoint handed to it at bind time.
//! This crate is the plumbing that ties them together: it launches helper
//! processes, delivers endpoints (descriptor plus resource directory),
//! watches for peer death, and restarts what dies.
//!
//! Unix only: endpoint delivery relies on descriptor inheritance.

mod death;
mod handoff;
mod launcher;

pub mod bridge;
pub mod logging;
pub mod service;
pub mod supervisor;

pub use death::{DeathObserver, ObserverState};
pub use handoff::{ChannelEndpoint, HandoffError, handoff};
pub use launcher::{CommandLauncher, LaunchError, LaunchedService, ServiceLauncher};

pub use bridge::protocol::{
    ControlRequest, ControlResponse, HandleId, ServiceKind, UnknownKindError,
};
pub use service::{EngineChannel, EngineEntry, EngineError, run_service};
pub use supervisor::{
    BindError, ReleaseError, RestartPolicy, ServiceState, ServiceStatus, Supervisor,
    SupervisorConfig,
};
