//! Worker-peer manager
//!
//! Opens outbound connections to remote daemons when the serializer asks
//! for one (directory reconciliation). A wpeer is usable once the HELLO
//! exchange at sequence 0 succeeded; after that its receiver only matches
//! responses to the requests parked by the wpeer Tx dispatcher.

use crate::daemon::directory::PeerInfo;
use crate::daemon::handle::ConnId;
use crate::daemon::link::{receive_loop, Link};
use crate::daemon::protocol::{read_message, write_message, PeerHello, PeerMessage, Seq};
use crate::daemon::serializer::Event;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Opens and runs outbound peer connections
pub struct WpeerManager {
    local: PeerHello,
    timeout: Duration,
    events: Sender<Event>,
    receivers: Vec<JoinHandle<()>>,
}

impl WpeerManager {
    pub fn new(local: PeerHello, timeout: Duration, events: Sender<Event>) -> Self {
        Self {
            local,
            timeout,
            events,
            receivers: Vec::new(),
        }
    }

    /// Serve open requests until the serializer drops its sender
    pub fn spawn(self, requests: Receiver<PeerInfo>) -> io::Result<JoinHandle<Vec<JoinHandle<()>>>> {
        thread::Builder::new()
            .name("rsktd-wpeer-open".to_string())
            .spawn(move || self.run(requests))
    }

    fn run(mut self, requests: Receiver<PeerInfo>) -> Vec<JoinHandle<()>> {
        while let Ok(peer) = requests.recv() {
            self.receivers.retain(|handle| !handle.is_finished());
            let ct = peer.ct;
            if let Err(e) = self.open(peer) {
                tracing::warn!(ct, "cannot open wpeer: {}", e);
                if self.events.send(Event::WpeerOpenFailed { ct }).is_err() {
                    break;
                }
            }
        }
        tracing::debug!("wpeer manager stopped");
        self.receivers
    }

    fn open(&mut self, peer: PeerInfo) -> io::Result<()> {
        let stream = TcpStream::connect_timeout(&peer.addr, self.timeout)?;
        stream.set_nodelay(true)?;
        let hello = handshake(&stream, self.local, self.timeout)?;
        if hello.ct != peer.ct {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("peer at {} is component {:#x}, expected {:#x}", peer.addr, hello.ct, peer.ct),
            ));
        }

        let link = Arc::new(Link::over(format!("wpeer {:#x}", peer.ct), &stream)?);
        let (reply, reply_rx) = bounded(1);
        let attach = Event::WpeerAttached {
            peer,
            hello,
            link: link.clone(),
            reply,
        };
        if self.events.send(attach).is_err() {
            return Ok(());
        }
        let Ok(Some(id)) = reply_rx.recv() else {
            // Superseded or no longer wanted
            link.fail();
            return Ok(());
        };

        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name(format!("rsktd-wpeer-{}", id))
            .spawn(move || receive(id, stream, link, events));
        match handle {
            Ok(handle) => self.receivers.push(handle),
            Err(e) => {
                let _ = self.events.send(Event::WpeerDetached(id));
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Exchange HELLO at sequence 0 with a bounded wait
pub fn handshake(stream: &TcpStream, local: PeerHello, timeout: Duration) -> io::Result<PeerHello> {
    let mut stream = stream;
    stream.set_read_timeout(Some(timeout))?;
    write_message(&mut stream, &PeerMessage::HelloReq(local), 0)?;
    let (reply, seq): (PeerMessage, Seq) = read_message(&mut stream)?;
    stream.set_read_timeout(None)?;
    match reply {
        PeerMessage::HelloResp(hello) if seq == 0 => Ok(hello),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected handshake reply {} (seq {})", other.kind(), seq),
        )),
    }
}

/// Receiver thread body for one wpeer
fn receive(id: ConnId, mut stream: TcpStream, link: Arc<Link>, events: Sender<Event>) {
    let label = link.label().to_string();
    receive_loop(&mut stream, &label, |seq, msg: PeerMessage| {
        if !msg.is_response() {
            tracing::warn!(wpeer = %id, seq, kind = msg.kind(), "request on wpeer dropped");
            return true;
        }
        match link.pending().take(seq) {
            Some(mut task) => {
                task.complete_peer_response(msg);
                events.send(Event::Task(task)).is_ok()
            }
            None => {
                tracing::warn!(wpeer = %id, seq, kind = msg.kind(), "response matches no pending request");
                true
            }
        }
    });
    let _ = events.send(Event::WpeerDetached(id));
}
