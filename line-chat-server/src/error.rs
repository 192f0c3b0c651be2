use std::{io, net::SocketAddr};

use thiserror::Error;

/// Rejection of a registration attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// Another live session already owns the display name.
    #[error("username '{name}' is already taken")]
    NameTaken { name: String },
}

/// Fatal failures of the listener.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
