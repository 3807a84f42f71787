//! Connection lifecycle: accept loop, registry and per-client workers.
//!
//! ```text
//! Server::serve ──accept──▶ Registry::create ──run──▶ Worker ─▶ Connection
//!      ▲                         ▲                                  │
//!  ShutdownFlag           destroy(id) ◀─────── on disconnect ───────┘
//! ```

mod connection;
mod error;
mod listener;
mod registry;
mod shutdown;
mod socket;
mod worker;

pub use connection::CycleTiming;
pub use error::{RegistryError, ServerError, SocketError, WorkerError};
pub use listener::Server;
pub use registry::{ConnectionId, IdPolicy, Registry, RegistrySettings, ShutdownReport};
pub use shutdown::{ShutdownFlag, install_fault_hook, watch_signals};
pub use socket::{BoundSocket, ListenSocket, RECEIVE_CHUNK, Received, Socket, UnboundSocket};
pub use worker::{JoinOutcome, Worker};
