//! Connection lifecycle notifications, delivered over a channel rather than
//! registered callbacks (see the event-emitter-to-actor note in the design
//! rationale).

use crate::error::Error;
use std::sync::Arc;

/// A stream newly created by receipt of a stream-bearing frame, or one the
/// local application opened, as seen from the outside of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOpened {
    pub id: u64,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The path prober succeeded for the first time; the connection is ready
    /// to carry value and data.
    Connect,
    /// A new stream is available, created locally or by the remote peer.
    Stream(StreamOpened),
    /// `end()` completed: all streams drained and ConnectionClose(NoError) sent.
    End,
    /// The connection has fully shut down, gracefully or otherwise. Always the
    /// last event delivered.
    Close,
    /// A fatal error drove the connection to `destroy`. Always followed by
    /// exactly one `Close`.
    Error(Arc<Error>),
}
