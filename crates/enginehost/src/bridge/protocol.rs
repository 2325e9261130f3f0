//! Wire protocol types for the supervisor-service control channel.
//!
//! One channel per service process, carried over its stdin/stdout:
//! endpoint delivery (`Init`) and graceful teardown (`Shutdown`) flow down,
//! readiness and failure reports flow up. Liveness needs no message of its
//! own: the channel closing is the disconnect signal.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The auxiliary processes a browser instance is assembled from.
///
/// Each kind is backed by its own engine library and runs in its own
/// OS process, reachable only through the endpoint handed to it at bind
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    WebContent,
    RequestServer,
    ImageDecoder,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [
        ServiceKind::WebContent,
        ServiceKind::RequestServer,
        ServiceKind::ImageDecoder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebContent => "web_content",
            Self::RequestServer => "request_server",
            Self::ImageDecoder => "image_decoder",
        }
    }

    /// Name of the helper binary implementing this kind.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::WebContent => "webcontentservice",
            Self::RequestServer => "requestserverservice",
            Self::ImageDecoder => "imagedecoderservice",
        }
    }

    /// Parse a kind from its wire name. This is the gate for requests that
    /// arrive with a string-typed kind: anything unrecognized is rejected
    /// before a process is launched.
    pub fn parse(s: &str) -> Result<Self, UnknownKindError> {
        match s {
            "web_content" => Ok(Self::WebContent),
            "request_server" => Ok(Self::RequestServer),
            "image_decoder" => Ok(Self::ImageDecoder),
            other => Err(UnknownKindError(other.to_string())),
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown service kind: {0:?}")]
pub struct UnknownKindError(pub String);

/// Unique identifier for one service process incarnation.
///
/// A restarted service gets a fresh id, so stale liveness events from a
/// previous incarnation can be told apart from current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(uuid::Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control messages from supervisor to service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Endpoint delivery, sent once immediately after launch (must be the
    /// first message). `ipc_fd` names the descriptor the service inherited;
    /// `resource_dir` is passed through verbatim to the engine.
    Init {
        ipc_fd: i32,
        resource_dir: PathBuf,
    },

    Shutdown,
}

/// Control messages from service to supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// The service adopted the endpoint and its engine is running.
    Ready,

    /// The service could not start (bad endpoint, engine failure). The
    /// process exits after sending this.
    Failed { error: String },

    ShuttingDown,
}
