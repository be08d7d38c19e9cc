//! Error taxonomy for the connection core, per the propagation policy: recoverable
//! path conditions (F08, Txx, stream-level limits) are absorbed inside the send
//! loop and never constructed as an [`Error`]; only conditions that call
//! `destroy` produce one.

use crate::packet::ErrorCode as StreamErrorCode;
use interledger_packet::ErrorCode as IlpErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stream id error: {0}")]
    StreamIdError(String),

    #[error("stream state error: {0}")]
    StreamStateError(String),

    #[error("flow control error: {0}")]
    FlowControlError(String),

    #[error("application error: {0}")]
    ApplicationError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("path error {code:?}: {message}")]
    PathError {
        code: IlpErrorCode,
        message: String,
    },

    #[error("crypto or codec error: {0}")]
    CodecError(String),

    #[error("plugin error: {0}")]
    PluginError(String),

    #[error("connection timed out due to inactivity")]
    IdleTimeout,

    #[error("path discovery failed: {0}")]
    PathDiscoveryFailed(String),
}

impl Error {
    /// The STREAM-level error code this error would be reported as in a
    /// ConnectionClose or StreamClose frame.
    pub fn as_stream_error_code(&self) -> StreamErrorCode {
        match self {
            Error::ProtocolViolation(_) => StreamErrorCode::ProtocolViolation,
            Error::StreamIdError(_) => StreamErrorCode::StreamIdError,
            Error::StreamStateError(_) => StreamErrorCode::StreamStateError,
            Error::FlowControlError(_) => StreamErrorCode::FlowControlError,
            Error::ApplicationError(_) => StreamErrorCode::ApplicationError,
            Error::InternalError(_)
            | Error::PathError { .. }
            | Error::CodecError(_)
            | Error::PluginError(_)
            | Error::IdleTimeout
            | Error::PathDiscoveryFailed(_) => StreamErrorCode::InternalError,
        }
    }
}
