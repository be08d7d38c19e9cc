//! Connection core for the STREAM transport protocol (RFC-0029): multiplexed
//! money and data streams over a single Interledger plugin, encrypted end to
//! end with a shared secret established out of band.
//!
//! The crate owns the protocol state machine only. It does not ship a
//! connector, a plugin implementation beyond the in-memory [`stream::StreamState`]
//! buffer, or address/secret generation for the STREAM server side of a
//! connector; those are external collaborators per the plugin/stream-handle
//! seams in [`plugin`] and [`stream`].

mod config;
mod connection;
mod crypto;
mod error;
mod event;
mod inbound;
mod packet;
mod plugin;
mod prober;
mod stream;

pub use config::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::Connection;
pub use error::Error;
pub use event::{ConnectionEvent, StreamOpened};
pub use plugin::{Plugin, PluginError, PluginResponse};
pub use stream::{IncomingOffsets, OutgoingOffsets, Role, StreamHandle, StreamState};

pub use packet::ErrorCode as StreamErrorCode;
pub use interledger_packet::{Address, AddressError};
