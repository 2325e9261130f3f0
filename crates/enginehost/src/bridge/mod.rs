//! Supervisor-service control channel: wire protocol and framing.
//!
//! The supervisor side (launching, handoff, liveness) is in supervisor.rs;
//! the service side is in service.rs. Both speak the same framed protocol
//! over the service process's stdin/stdout.

pub mod codec;
pub mod protocol;
