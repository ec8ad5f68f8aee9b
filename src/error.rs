use thiserror::Error;

use crate::command::ErrorCode;
use crate::store::StoreError;

/// A datagram that could not be decoded into a [`crate::command::Command`].
///
/// This is recovered locally at the channel (reported through the error event) and never
///  crosses the channel boundary as a failure of the receive loop itself.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ParseError {
    #[error("datagram is truncated")]
    Truncated,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("string field without null terminator")]
    UnterminatedString,
    #[error("string field is not valid UTF-8")]
    InvalidString,
    #[error("unknown transfer mode {0:?}")]
    UnknownTransferMode(String),
    #[error("option {0:?} has a name but no value")]
    MissingOptionValue(String),
}

/// Failures of the transfer channel itself, either surfaced synchronously from `open` / `send` /
///  `set_remote_endpoint`, or reported asynchronously through the channel's error event
///  (`Io` during receive, `Parse` for malformed inbound datagrams).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// lifecycle error: the operation was attempted after the channel was closed
    #[error("channel is disposed")]
    Disposed,
    /// programmer error: sending without a configured remote endpoint
    #[error("no remote endpoint configured")]
    NotConnected,
    /// the endpoint's address family does not match the channel's transport
    #[error("endpoint address family is not supported by this channel")]
    UnsupportedAddressFamily,
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed datagram: {0}")]
    Parse(#[from] ParseError),
}

/// Terminal outcome of a failed transfer, surfaced to the session's caller.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid transfer configuration: {0}")]
    Config(String),
    /// the retry budget for the last unacknowledged command is exhausted
    #[error("transfer timed out after {retries} retransmissions")]
    Timeout { retries: u32 },
    /// the peer terminated the transfer with an Error command
    #[error("peer reported {code:?}: {message}")]
    Peer { code: ErrorCode, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
