//! Application connection manager
//!
//! Accepts local applications on the Unix socket. Each accepted stream is
//! attached to the serializer first (which issues its [`ConnId`]), then gets
//! a receiver thread that turns requests into tasks and matches the
//! application's answers to daemon-initiated requests.

use crate::daemon::handle::ConnId;
use crate::daemon::link::{receive_loop, Link};
use crate::daemon::protocol::AppMessage;
use crate::daemon::serializer::Event;
use crate::daemon::task::{TaskTracker, UnifiedTask};
use crossbeam_channel::{bounded, Sender};
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the accept loop sleeps when nothing is pending
pub(crate) const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Accept loop for local applications
pub struct AppManager {
    listener: UnixListener,
    events: Sender<Event>,
    tracker: TaskTracker,
    shutdown: Arc<AtomicBool>,
    receivers: Vec<JoinHandle<()>>,
}

impl AppManager {
    pub fn new(
        listener: UnixListener,
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
    ///
    /// The thread returns the receiver threads still running once
    /// `shutdown` is set.
    pub fn spawn(self) -> io::Result<JoinHandle<Vec<JoinHandle<()>>>> {
        thread::Builder::new()
            .name("rsktd-app-accept".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.listener.set_nonblocking(true) {
            tracing::error!("app listener: {}", e);
            return self.receivers;
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(e) = self.accept(stream) {
                        tracing::warn!("error accepting application: {}", e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.receivers.retain(|handle| !handle.is_finished());
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!("error accepting application: {}", e);
                    thread::sleep(ACCEPT_POLL * 10);
                }
            }
        }
        tracing::debug!("application accept loop stopped");
        self.receivers
    }

    fn accept(&mut self, stream: UnixStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        let link = Arc::new(Link::over("app", &stream)?);

        let (reply, reply_rx) = bounded(1);
        let attach = Event::AppAttached { link: link.clone(), reply };
        if self.events.send(attach).is_err() {
            return Ok(());
        }
        let Ok(Some(id)) = reply_rx.recv() else {
            tracing::warn!("application refused");
            link.fail();
            return Ok(());
        };

        let events = self.events.clone();
        let tracker = self.tracker.clone();
        let handle = thread::Builder::new()
            .name(format!("rsktd-app-{}", id))
            .spawn(move || receive(id, stream, link, events, tracker));
        match handle {
            Ok(handle) => self.receivers.push(handle),
            Err(e) => {
                let _ = self.events.send(Event::AppDetached(id));
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Receiver thread body for one application
fn receive(id: ConnId, mut stream: UnixStream, link: Arc<Link>, events: Sender<Event>, tracker: TaskTracker) {
    let label = format!("app {}", id);
    receive_loop(&mut stream, &label, |seq, msg: AppMessage| {
        let task = match msg {
            AppMessage::ForceCloseResp { .. } => match link.pending().take(seq) {
                Some(mut task) => {
                    task.complete_app_response(msg);
                    task
                }
                None => {
                    tracing::warn!(app = %id, seq, "FORCE_CLOSE_RESP matches no pending request");
                    return true;
                }
            },
            msg => match UnifiedTask::from_app(&tracker, id, seq, msg) {
                Some(task) => task,
                None => {
                    tracing::warn!(app = %id, seq, "unexpected message from application dropped");
                    return true;
                }
            },
        };
        events.send(Event::Task(task)).is_ok()
    });
    let _ = events.send(Event::AppDetached(id));
}
