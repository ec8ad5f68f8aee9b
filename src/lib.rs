//! A minimal TFTP protocol engine over UDP: a command-oriented state machine that turns raw
//!  datagrams into a reliable, ordered, at-most-one-in-flight request / acknowledgment
//!  exchange for uploading and downloading file contents.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *commands* (typed protocol messages) as opposed
//!   to streams of bytes
//! * Strict stop-and-wait flow control: exactly one unacknowledged command in flight at any
//!   time, by protocol design - there is no send window and no batching of data blocks
//!   ahead of acknowledgment
//! * The transport stays connectionless: a channel's remote endpoint is default-destination
//!   bookkeeping, not connection state. Any datagram from any sender is dispatched with its
//!   source endpoint attached, and the *session* decides whether to accept it - pinning the
//!   peer on first contact and ignoring request floods from unrelated sources afterwards
//! * The receive loop is self-sustaining: exactly one receive outstanding at a time,
//!   re-armed after every completion *including failures*. A single malformed packet or a
//!   transport hiccup must never silently kill a channel
//! * Reliability is the session's business, not the channel's: block-number sequencing,
//!   retransmission on timeout and a bounded retry budget live in the state machine, while
//!   the channel only validates and dispatches
//! * Explicitly *not* a messaging system with pub/sub, encryption pipelines or multi-client
//!   stream servers --> different trade-offs
//!
//! ## Wire format
//!
//! Every command is one UDP datagram. All integers are in network byte order (BE), strings
//!  are null-terminated:
//!
//! ```ascii
//! 0:  opcode (u16)
//! 2:  opcode-specific body:
//!     * 1 read request / 2 write request:
//!         filename (string), mode (string, "netascii" | "octet", case-insensitive),
//!         followed by any number of option name / value string pairs (RFC 2347)
//!     * 3 data:
//!         block number (u16), payload (up to the negotiated block size; a payload
//!         shorter than the block size marks the final block of the transfer)
//!     * 4 acknowledgment:
//!         block number (u16)
//!     * 5 error:
//!         error code (u16), message (string)
//!     * 6 option acknowledgment:
//!         any number of option name / value string pairs
//! ```
//!
//! Block numbers wrap modulo 2^16. The block size is 512 bytes unless negotiated via the
//!  `blksize` option (RFC 2348, 8..=65464).
//!
//! ## Roles
//!
//! A *server* channel is bound to a well-known port and learns each client's ephemeral
//!  source endpoint from its first request. A *client* channel is bound to an ephemeral
//!  port and targets the server's well-known port; the server may answer from a different
//!  port, and the client pins its peer to the source of the first valid answer.

pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod factory;
pub mod session;
pub mod store;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
