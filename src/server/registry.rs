use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{Instrument, debug, error, info_span, warn};

use super::connection::{BYE, Connection, CycleTiming};
use super::error::RegistryError;
use super::socket::Socket;
use super::worker::{JoinOutcome, Worker};

const FORCED_BYE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where connection identifiers come from.
///
/// `Descriptor` reuses the accepted socket's OS handle, which is unique only
/// among open sockets. The record keeps its socket open until removal, so a
/// live entry cannot collide; identifiers do repeat over the process
/// lifetime. `Sequential` draws from a registry-wide counter instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdPolicy {
    #[default]
    Descriptor,
    Sequential,
}

impl FromStr for IdPolicy {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "descriptor" | "fd" => Ok(IdPolicy::Descriptor),
            "sequential" => Ok(IdPolicy::Sequential),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrySettings {
    pub timing: CycleTiming,
    pub id_policy: IdPolicy,
}

/// Totals of a [`Registry::shutdown`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: usize,
    pub stopped: usize,
    pub aborted: usize,
    pub failed: usize,
}

struct ConnectionRecord {
    worker: Worker,
    socket: Arc<Socket>,
}

impl Drop for ConnectionRecord {
    fn drop(&mut self) {
        // The worker must stop before the socket handle is released.
        self.worker.cancel();
    }
}

/// Active connections keyed by identifier.
///
/// Inserts and removals are serialized by one lock. [`Registry::count`]
/// reads a mirror of the map length without locking, so it is only an
/// advisory snapshot.
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    len: AtomicUsize,
    next_id: AtomicU64,
    settings: RegistrySettings,
}

impl Registry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            len: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            settings,
        }
    }

    /// Registers `socket` and starts its connection worker.
    pub fn create(self: &Arc<Self>, socket: Socket) -> Result<ConnectionId, RegistryError> {
        let id = self.allocate_id(&socket);
        self.admit(id, socket)
    }

    /// Removes the record for `id`, cancelling its worker.
    pub fn destroy(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let record = {
            let mut connections = self.lock();
            let record = connections
                .remove(&id)
                .ok_or(RegistryError::NotFound(id))?;
            self.len.store(connections.len(), Ordering::Release);
            record
        };
        drop(record);

        debug!(id = %id, "connection deregistered");
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancels every registered connection and waits up to `grace` in total
    /// for their workers. Workers still running afterwards are aborted and
    /// their clients get a best-effort `BYE`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut records: Vec<(ConnectionId, ConnectionRecord)> = {
            let mut connections = self.lock();
            let drained = connections.drain().collect();
            self.len.store(0, Ordering::Release);
            drained
        };

        let mut report = ShutdownReport {
            drained: records.len(),
            ..ShutdownReport::default()
        };
        if records.is_empty() {
            return report;
        }

        for (_, record) in &records {
            record.worker.cancel();
        }

        let deadline = Instant::now() + grace;
        for (id, record) in &mut records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match record.worker.join(remaining).await {
                Ok(JoinOutcome::Completed | JoinOutcome::NotStarted) => report.stopped += 1,
                Ok(JoinOutcome::Aborted) => {
                    report.aborted += 1;
                    say_bye(&record.socket).await;
                }
                Err(err) => {
                    error!(id = %id, error = %err, "connection worker failed during shutdown");
                    report.failed += 1;
                    say_bye(&record.socket).await;
                }
            }
        }

        debug!(?report, "registry drained");
        report
    }

    fn admit(
        self: &Arc<Self>,
        id: ConnectionId,
        socket: Socket,
    ) -> Result<ConnectionId, RegistryError> {
        let socket = Arc::new(socket);
        let span = info_span!("connection", id = %id, peer = %socket.peer_addr());

        let mut connections = self.lock();
        if connections.contains_key(&id) {
            warn!(id = %id, "identifier already registered");
            return Err(RegistryError::DuplicateId(id));
        }

        // Started under the lock so the worker never sees its own record missing.
        let mut worker = Worker::new(format!("connection-{id}"));
        let connection = Connection::new(id, socket.clone(), self.clone(), self.settings.timing);
        worker.run(move |token| connection.run(token).instrument(span))?;

        connections.insert(id, ConnectionRecord { worker, socket });
        self.len.store(connections.len(), Ordering::Release);

        debug!(id = %id, "connection registered");
        Ok(id)
    }

    fn allocate_id(&self, socket: &Socket) -> ConnectionId {
        match self.settings.id_policy {
            IdPolicy::Descriptor => ConnectionId(socket.identifier_seed()),
            IdPolicy::Sequential => ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionRecord>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock is still safe to use.
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

async fn say_bye(socket: &Socket) {
    if socket.is_connected().await {
        let _ = time::timeout(FORCED_BYE_TIMEOUT, socket.send(BYE)).await;
    }
}
