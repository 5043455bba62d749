//! Fabric directory
//!
//! The directory tells the daemon which remote nodes are reachable and
//! whether they run the RSKT service. A watcher thread polls it and hands
//! every snapshot to the serializer, which opens and tears down wpeers to
//! match.

use crate::daemon::serializer::Event;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One reachable node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Component tag of the node
    pub ct: u32,
    /// Address of the node's peer channel
    pub addr: SocketAddr,
    /// Node runs an RSKT daemon
    pub advertises_rskt: bool,
}

/// Source of reachable nodes
pub trait PeerDirectory: Send + Sync {
    fn snapshot(&self) -> Vec<PeerInfo>;
}

/// Directory holding an explicitly managed list
#[derive(Default)]
pub struct StaticDirectory {
    peers: RwLock<Vec<PeerInfo>>,
}

impl StaticDirectory {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers: RwLock::new(peers) }
    }

    /// Replace the whole list
    pub fn set(&self, peers: Vec<PeerInfo>) {
        *self.peers.write().unwrap_or_else(|e| e.into_inner()) = peers;
    }

    /// Add or replace the entry for `peer.ct`
    pub fn add(&self, peer: PeerInfo) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.retain(|p| p.ct != peer.ct);
        peers.push(peer);
    }

    pub fn remove(&self, ct: u32) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.ct != ct);
    }
}

impl PeerDirectory for StaticDirectory {
    fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Poll `directory` every `interval` until `stop` fires or is dropped
///
/// The first snapshot is sent immediately.
pub fn spawn_watcher(
    directory: Arc<dyn PeerDirectory>,
    interval: Duration,
    events: Sender<Event>,
    stop: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("rsktd-directory".to_string())
        .spawn(move || loop {
            if events.send(Event::Directory(directory.snapshot())).is_err() {
                break;
            }
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
}
