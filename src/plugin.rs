//! The external transport collaborator: serializes outer (Prepare/Fulfill/Reject)
//! packets and performs the hop-by-hop conditional-transfer I/O. The connection
//! core only ever calls `send_data` and never constructs a transport packet
//! itself outside of what's needed to drive this call.

use async_trait::async_trait;
use interledger_packet::{Fulfill, Prepare, Reject};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginResponse {
    Fulfill(Fulfill),
    Reject(Reject),
}

/// Mirrors §6's `send_data(bytes) -> bytes`: the plugin takes a serialized
/// Prepare and returns a serialized Fulfill or Reject. Implementations MUST be
/// safe to call from the connection's single owner (no internal concurrent
/// send from the same plugin instance is assumed by the core).
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn send_data(&self, prepare: Prepare) -> Result<PluginResponse, PluginError>;
}

#[derive(Debug, thiserror::Error)]
#[error("plugin I/O error: {0}")]
pub struct PluginError(pub String);
