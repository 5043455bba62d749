//! Slave-peer manager
//!
//! Accepts connections from remote daemons on the peer listener. A speer
//! only ever carries requests towards this daemon; the answers go out
//! through the speer Tx dispatcher.

use crate::daemon::app::ACCEPT_POLL;
use crate::daemon::handle::ConnId;
use crate::daemon::link::{receive_loop, Link};
use crate::daemon::protocol::PeerMessage;
use crate::daemon::serializer::Event;
use crate::daemon::task::{PeerRef, TaskTracker, UnifiedTask};
use crossbeam_channel::{bounded, Sender};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Accept loop for inbound peer connections
pub struct SpeerManager {
    listener: TcpListener,
    events: Sender<Event>,
    tracker: TaskTracker,
    shutdown: Arc<AtomicBool>,
    receivers: Vec<JoinHandle<()>>,
}

impl SpeerManager {
    pub fn new(
        listener: TcpListener,
        events: Sender<Event>,
        tracker: TaskTracker,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            listener,
            events,
            tracker,
            shutdown,
            receivers: Vec::new(),
        }
    }

    /// Run the accept loop on its own thread
    pub fn spawn(self) -> io::Result<JoinHandle<Vec<JoinHandle<()>>>> {
        thread::Builder::new()
            .name("rsktd-speer-accept".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.listener.set_nonblocking(true) {
            tracing::error!("peer listener: {}", e);
            return self.receivers;
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.accept(stream, addr) {
                        tracing::warn!(%addr, "error accepting peer: {}", e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.receivers.retain(|handle| !handle.is_finished());
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!("error accepting peer: {}", e);
                    thread::sleep(ACCEPT_POLL * 10);
                }
            }
        }
        tracing::debug!("speer accept loop stopped");
        self.receivers
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let link = Arc::new(Link::over(format!("speer {}", addr), &stream)?);

        let (reply, reply_rx) = bounded(1);
        let attach = Event::SpeerAttached { link: link.clone(), reply };
        if self.events.send(attach).is_err() {
            return Ok(());
        }
        let Ok(Some(id)) = reply_rx.recv() else {
            tracing::warn!(%addr, "peer connection refused");
            link.fail();
            return Ok(());
        };
        tracing::debug!(speer = %id, %addr, "peer connected");

        let events = self.events.clone();
        let tracker = self.tracker.clone();
        let handle = thread::Builder::new()
            .name(format!("rsktd-speer-{}", id))
            .spawn(move || receive(id, stream, link, events, tracker));
        match handle {
            Ok(handle) => self.receivers.push(handle),
            Err(e) => {
                let _ = self.events.send(Event::SpeerDetached(id));
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Receiver thread body for one speer
fn receive(id: ConnId, mut stream: TcpStream, link: Arc<Link>, events: Sender<Event>, tracker: TaskTracker) {
    receive_loop(&mut stream, link.label(), |seq, msg: PeerMessage| {
        let kind = msg.kind();
        match UnifiedTask::from_peer(&tracker, PeerRef::Speer(id), seq, msg) {
            Some(task) => events.send(Event::Task(task)).is_ok(),
            None => {
                tracing::warn!(speer = %id, seq, kind, "unexpected message on speer dropped");
                true
            }
        }
    });
    let _ = events.send(Event::SpeerDetached(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::handle::HandleTable;
    use crate::daemon::protocol::{write_message, PeerHello};
    use crate::daemon::task::Pipeline;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn test_speer_requests_become_tasks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, events_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = SpeerManager::new(listener, events, TaskTracker::new(), shutdown.clone())
            .spawn()
            .unwrap();

        let mut remote = TcpStream::connect(addr).unwrap();
        let id = HandleTable::new(1).insert(()).unwrap();
        match events_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Event::SpeerAttached { reply, .. }) => reply.send(Some(id)).unwrap(),
            _ => panic!("expected attach"),
        }

        let hello = PeerHello { ct: 0x20, cm_skt: 1, mport: 0, pid: 9 };
        write_message(&mut remote, &PeerMessage::HelloReq(hello), 0).unwrap();
        // Responses never travel on a speer
        write_message(&mut remote, &PeerMessage::CloseResp { rem_sn: 1, loc_sn: 2, err: 0 }, 1).unwrap();
        write_message(&mut remote, &PeerMessage::CloseReq { rem_sn: 1, loc_sn: 2, force: false }, 2).unwrap();
        drop(remote);

        let mut seen = Vec::new();
        loop {
            match events_rx.recv_timeout(Duration::from_secs(5)) {
                Ok(Event::Task(task)) => seen.push((task.pipeline(), task.peer_seq)),
                Ok(Event::SpeerDetached(d)) => {
                    assert_eq!(d, id);
                    break;
                }
                _ => panic!("unexpected event"),
            }
        }
        assert_eq!(seen, vec![(Pipeline::Sreq, 0), (Pipeline::S2a, 2)]);

        shutdown.store(true, Ordering::Relaxed);
        for receiver in handle.join().unwrap() {
            receiver.join().unwrap();
        }
    }
}
