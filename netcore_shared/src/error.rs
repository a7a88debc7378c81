//! Error taxonomy for the networking core.
//!
//! Socket setup and address resolution are reported through `anyhow::Result`
//! with context; `NetError` exists for the narrower set of conditions
//! callers need to match on by kind (a malformed control command vs. a
//! closed peer vs. a config problem all need different recovery).

use thiserror::Error;

/// Error kinds surfaced by the core's internal seams.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("config error: {0}")]
    Config(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("datagram of {len} bytes exceeds mtu {max}")]
    DatagramTooLarge { len: usize, max: usize },
}

pub type NetResult<T> = std::result::Result<T, NetError>;
