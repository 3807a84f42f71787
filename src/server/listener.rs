use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::validate_port;

use super::error::ServerError;
use super::registry::{Registry, RegistrySettings};
use super::shutdown::ShutdownFlag;
use super::socket::{ListenSocket, UnboundSocket};

const LISTEN_BACKLOG: u32 = 5;

/// Accept loop feeding the connection registry.
pub struct Server {
    listener: ListenSocket,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: ShutdownFlag,
    shutdown_timeout: Duration,
}

impl Server {
    /// Binds every IPv4 interface on `port` and starts listening.
    pub fn bind(
        port: u16,
        settings: RegistrySettings,
        shutdown: ShutdownFlag,
        shutdown_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let port = validate_port(port.into())?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        Self::bind_addr(addr, settings, shutdown, shutdown_timeout)
    }

    /// Like [`Server::bind`] with an explicit address; port 0 picks an
    /// ephemeral one.
    pub fn bind_addr(
        addr: SocketAddr,
        settings: RegistrySettings,
        shutdown: ShutdownFlag,
        shutdown_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let bound = UnboundSocket::for_addr(&addr)?.bind(addr)?;
        let local_addr = bound.local_addr()?;
        let listener = bound.listen(LISTEN_BACKLOG)?;
        info!(addr = %local_addr, "server listening");

        Ok(Self {
            listener,
            local_addr,
            registry: Arc::new(Registry::new(settings)),
            shutdown,
            shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Accepts clients until the shutdown flag is set, then closes the
    /// listening socket and tears down every remaining connection.
    pub async fn serve(self) -> Result<(), ServerError> {
        let Self {
            listener,
            registry,
            shutdown,
            shutdown_timeout,
            ..
        } = self;

        loop {
            debug!("waiting for a new connection");
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok(socket) => match registry.create(socket) {
                        Ok(id) => info!(id = %id, "client connected"),
                        Err(err) => error!(error = %err, "failed to register connection"),
                    },
                    Err(err) => error!(error = %err, "accept failed"),
                },
            }
        }

        drop(listener);
        info!(connections = registry.count(), "stopped accepting connections");

        let report = registry.shutdown(shutdown_timeout).await;
        if report.aborted > 0 || report.failed > 0 {
            error!(
                aborted = report.aborted,
                failed = report.failed,
                "some connections were not stopped cleanly"
            );
        } else {
            info!(closed = report.drained, "graceful shutdown completed");
        }

        Ok(())
    }
}
