//! Connection links and correlation tables
//!
//! A [`Link`] is the part of a connection shared between its receiver
//! thread, the Tx dispatcher that writes to it and the serializer that owns
//! its table slot. The stream halves are cloned so that the receiver owns
//! the read side, the dispatcher owns the write side and anyone may shut the
//! socket down to unblock the receiver.

use crate::daemon::protocol::{decode_payload, read_frame, Seq};
use crate::daemon::task::UnifiedTask;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Byte stream a link can run over
pub trait Transport: Read + Write + Send + Sync + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;
    fn shutdown_both(&self) -> io::Result<()>;
}

impl Transport for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

impl Transport for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Write side of a link
pub trait Wire: Send + Sync {
    /// Write one encoded frame
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// Tear the connection down; blocked readers return with an error
    fn shutdown(&self);
}

/// [`Wire`] over a cloned stream
pub struct StreamWire<S: Transport> {
    writer: Mutex<S>,
    control: S,
}

impl<S: Transport> StreamWire<S> {
    pub fn new(stream: &S) -> io::Result<Self> {
        Ok(Self {
            writer: Mutex::new(stream.try_clone_stream()?),
            control: stream.try_clone_stream()?,
        })
    }
}

impl<S: Transport> Wire for StreamWire<S> {
    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(frame)?;
        writer.flush()
    }

    fn shutdown(&self) {
        // Already-closed sockets report ENOTCONN, nothing to do then
        let _ = self.control.shutdown_both();
    }
}

/// Lock ignoring poison: the protected maps stay consistent across panics
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct PendingState {
    closed: bool,
    tasks: HashMap<Seq, Box<UnifiedTask>>,
}

/// Sequence number → parked task
///
/// The Tx dispatcher parks, the receiver takes on match, the serializer
/// closes and drains on teardown. Once closed, parking hands the task back.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<PendingState>,
}

impl PendingTable {
    /// Park `task` under `seq`; returns it when the table is closed
    pub fn park(&self, seq: Seq, task: Box<UnifiedTask>) -> Result<(), Box<UnifiedTask>> {
        let mut state = lock(&self.inner);
        if state.closed {
            return Err(task);
        }
        if let Some(old) = state.tasks.insert(seq, task) {
            tracing::error!(seq, ?old, "sequence number reused while parked");
        }
        Ok(())
    }

    /// Remove the task waiting for `seq`
    pub fn take(&self, seq: Seq) -> Option<Box<UnifiedTask>> {
        lock(&self.inner).tasks.remove(&seq)
    }

    /// Refuse further parking and hand back everything still waiting
    pub fn close_and_drain(&self) -> Vec<Box<UnifiedTask>> {
        let mut state = lock(&self.inner);
        state.closed = true;
        let mut drained: Vec<(Seq, Box<UnifiedTask>)> = state.tasks.drain().collect();
        drained.sort_by_key(|(seq, _)| *seq);
        drained.into_iter().map(|(_, task)| task).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared half of one app, speer or wpeer connection
pub struct Link {
    label: String,
    wire: Box<dyn Wire>,
    pending: PendingTable,
    failed: AtomicBool,
}

impl Link {
    pub fn new(label: impl Into<String>, wire: Box<dyn Wire>) -> Self {
        Self {
            label: label.into(),
            wire,
            pending: PendingTable::default(),
            failed: AtomicBool::new(false),
        }
    }

    /// Link over a stream; the caller keeps `stream` as the read side
    pub fn over<S: Transport>(label: impl Into<String>, stream: &S) -> io::Result<Self> {
        Ok(Self::new(label, Box::new(StreamWire::new(stream)?)))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_failed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link failed"));
        }
        self.wire.write_frame(frame)
    }

    /// Mark the link dead and shut the socket so the receiver notices
    pub fn fail(&self) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            tracing::debug!(link = %self.label, "link failed");
        }
        self.wire.shutdown();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Read frames until the stream fails, handing each message to `deliver`
///
/// Undecodable frames are logged and skipped; the connection stays up.
/// Returns when the stream ends or `deliver` returns `false`.
pub fn receive_loop<S, M, F>(stream: &mut S, label: &str, mut deliver: F)
where
    S: Read,
    M: DeserializeOwned,
    F: FnMut(Seq, M) -> bool,
{
    loop {
        let (seq, payload) = match read_frame(stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(link = label, "connection closed");
                return;
            }
            Err(e) => {
                tracing::warn!(link = label, "receive failed: {}", e);
                return;
            }
        };
        match decode_payload::<M>(&payload) {
            Ok(msg) => {
                if !deliver(seq, msg) {
                    return;
                }
            }
            Err(e) => tracing::warn!(link = label, seq, "dropping undecodable frame: {}", e),
        }
    }
}
