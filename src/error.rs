use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced while constructing runtime components.
///
/// Failures inside a running loop are never propagated through user
/// callbacks; they are recovered, logged, or escalated to the connection
/// close path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}
