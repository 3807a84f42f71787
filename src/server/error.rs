use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::task::JoinError;

use crate::config::ConfigError;

use super::ConnectionId;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("invalid address: {0}")]
    Address(String),
    #[error("failed to send data: {0}")]
    Send(#[source] io::Error),
    #[error("incomplete send: {sent} of {expected} bytes written")]
    ShortWrite { sent: usize, expected: usize },
    #[error("failed to receive data: {0}")]
    Receive(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateId(ConnectionId),
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to start worker {name}: {reason}")]
    Create { name: String, reason: &'static str },
    #[error("worker {name} did not stop cleanly: {source}")]
    Cancel {
        name: String,
        #[source]
        source: JoinError,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}
