use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::error::{RegistryError, SocketError};
use super::registry::{ConnectionId, Registry};
use super::socket::{Received, Socket};

pub(crate) const BYE: &[u8] = b"BYE\n";

/// Announce period of a connection and how finely it is polled in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTiming {
    pub period: Duration,
    pub slices: u32,
}

impl CycleTiming {
    pub fn slice(&self) -> Duration {
        self.period / self.slices.max(1)
    }
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            slices: 20,
        }
    }
}

#[derive(Debug)]
enum Exit {
    Disconnected,
    Cancelled,
    Failed(SocketError),
}

impl From<SocketError> for Exit {
    fn from(err: SocketError) -> Self {
        match &err {
            SocketError::Send(io_err) | SocketError::Receive(io_err) if is_hangup(io_err) => {
                Exit::Disconnected
            }
            _ => Exit::Failed(err),
        }
    }
}

pub(crate) struct Connection {
    id: ConnectionId,
    socket: Arc<Socket>,
    registry: Arc<Registry>,
    timing: CycleTiming,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        socket: Arc<Socket>,
        registry: Arc<Registry>,
        timing: CycleTiming,
    ) -> Self {
        Self {
            id,
            socket,
            registry,
            timing,
        }
    }

    /// Serves the client until it leaves, an I/O error occurs or `cancel`
    /// fires. Only a voluntary end deregisters the connection; whoever
    /// cancels a worker owns its record.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        info!(
            local = %self.socket.local_addr(),
            remote = %self.socket.peer_addr(),
            "connection started"
        );

        let exit = self.serve(&cancel).await;
        match &exit {
            Exit::Disconnected => info!("client disconnected"),
            Exit::Cancelled => debug!("connection cancelled"),
            Exit::Failed(err) => error!(error = %err, "connection failed"),
        }

        self.say_goodbye().await;

        if !matches!(exit, Exit::Cancelled) {
            match self.registry.destroy(self.id) {
                Ok(()) => {}
                // Registry shutdown drained the record first.
                Err(RegistryError::NotFound(_)) => debug!("connection already deregistered"),
                Err(err) => error!(error = %err, "failed to deregister connection"),
            }
        }
    }

    async fn serve(&self, cancel: &CancellationToken) -> Exit {
        loop {
            if let Err(exit) = self.cycle(cancel).await {
                return exit;
            }
            if !self.socket.is_connected().await {
                return Exit::Disconnected;
            }
        }
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<(), Exit> {
        self.send(cancel, &id_line(self.id)).await?;

        let slice = self.timing.slice();
        for _ in 0..self.timing.slices {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Exit::Cancelled),
                _ = time::sleep(slice) => {}
            }

            if !self.socket.is_connected().await {
                return Err(Exit::Disconnected);
            }
            if self.socket.is_read_closed() {
                continue;
            }

            match self.socket.try_receive()? {
                Received::Data(data) => {
                    debug!(data = %String::from_utf8_lossy(&data), "data received");
                    if data.contains(&b'\n') {
                        self.send(cancel, &count_line(self.registry.count())).await?;
                    }
                }
                Received::WouldBlock => {}
                Received::Closed => {
                    // The peer may still be reading. Announce right away: a
                    // peer that is gone answers the write with a reset.
                    debug!("client stopped sending");
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    async fn send(&self, cancel: &CancellationToken, data: &[u8]) -> Result<(), Exit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Exit::Cancelled),
            result = self.socket.send(data) => result.map_err(Exit::from),
        }
    }

    async fn say_goodbye(&self) {
        if !self.socket.is_connected().await {
            return;
        }
        match time::timeout(self.timing.slice(), self.socket.send(BYE)).await {
            Ok(Ok(())) => trace!("goodbye sent"),
            Ok(Err(err)) => debug!(error = %err, "goodbye not delivered"),
            Err(_) => debug!("goodbye timed out"),
        }
    }
}

pub(crate) fn id_line(id: ConnectionId) -> Vec<u8> {
    format!("ID={id}\n").into_bytes()
}

pub(crate) fn count_line(count: usize) -> Vec<u8> {
    format!("COUNT={count}\n").into_bytes()
}

fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}
