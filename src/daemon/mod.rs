/// RSKT socket broker daemon
///
/// Applications on this node talk to the daemon over a Unix socket; daemons
/// talk to each other over TCP peer links. A single serializer thread owns
/// all broker state and is fed by per-connection receiver threads:
/// - `protocol`: framing plus the application and peer message sets
/// - `registry`: socket-number lifecycle
/// - `task`: unified tasks and their pipelines
/// - `serializer`: the broker itself
/// - `app` / `speer` / `wpeer`: connection managers and receivers
/// - `tx`: per-connection-kind transmit dispatchers
/// - `server`: wiring, lifecycle and shutdown
/// - `client`: application-side library

pub mod app;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod handle;
pub mod link;
pub mod memspace;
pub mod protocol;
pub mod records;
pub mod registry;
pub mod serializer;
pub mod server;
pub mod speer;
pub mod task;
pub mod tx;
pub mod wpeer;

pub use client::{ClientError, Connection, ForceClose, RsktClient};
pub use config::DaemonConfig;
pub use directory::{PeerDirectory, PeerInfo, StaticDirectory};
pub use error::RsktError;
pub use memspace::{MemorySpace, MemorySpacePool, MemorySpaceProvider};
pub use protocol::{AppMessage, MsInfo, PeerHello, PeerMessage, SocketAddress};
pub use server::{DaemonServer, RunningDaemon};
