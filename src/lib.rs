//! natpmp - an asynchronous NAT Port Mapping Protocol client
//!
//! This library talks NAT-PMP (RFC 6886) to an IPv4 gateway: it discovers the
//! gateway's external address, creates and destroys port mappings, and keeps
//! granted mappings alive by renewing them before they expire.
//!
//! Only one request is ever in flight; everything else waits in a FIFO queue.
//! Requests are retransmitted on the protocol's fixed backoff ladder
//! (250ms doubling up to 64s) before failing with [`Error::Timeout`].
//!
//! # Example
//!
//! ```no_run
//! use natpmp::{Client, ClientConfig, Protocol};
//!
//! # async fn example() -> natpmp::Result<()> {
//! let client = Client::bind(ClientConfig::default()).await?;
//! println!("External IP: {}", client.get_external_ip().await?);
//!
//! let mapping = client.map_port(Protocol::Tcp, 3000, 3000, 3600).await?;
//! println!("Mapped {} -> {}", mapping.private_port, mapping.public_port);
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod transport;

#[cfg(test)]
mod tests;

pub use client::{Client, ClientState};
pub use codec::{Opcode, Protocol, Request, Response, ResponseBody, ResultCode};
pub use config::ClientConfig;
pub use manager::Mapping;
pub use transport::Transport;

/// Result type alias for NAT-PMP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for NAT-PMP operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A datagram could not be decoded as a NAT-PMP response
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The gateway understood the request but refused it
    #[error("Gateway error: {0}")]
    Protocol(ResultCode),

    /// No valid response arrived before the retransmission ladder ran out
    #[error("Request timed out")]
    Timeout,

    /// The client was closed before the operation completed
    #[error("Client closed")]
    Closed,

    /// The caller supplied an argument the protocol cannot express
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No default gateway could be discovered
    #[error("No gateway found")]
    NoGateway,

    /// Configuration could not be loaded or is inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// Socket bind or send failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Install a `tracing` subscriber that writes to stdout
///
/// Intended for binaries; the library itself never installs a subscriber.
pub fn init() {
    tracing_subscriber::fmt::init();
}
