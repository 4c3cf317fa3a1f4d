// Startup errors for the relay.
//
// Only startup can fail: once the dispatch loop is running, decode errors are
// dropped per message and transport errors close a single session.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not bind {transport} socket on {addr}: {source}")]
    Bind {
        transport: &'static str,
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("i/o error during startup: {0}")]
    Io(#[from] std::io::Error),
}
