//! RSKT application client
//!
//! Thin client for the application socket. Requests are numbered by the
//! client; blocking calls such as ACCEPT can be issued with `begin_*` and
//! collected later with `finish_*`, so other requests may travel in between.
//! Daemon-initiated FORCE_CLOSE messages are acknowledged as soon as they
//! are read and kept for [`RsktClient::take_force_closes`].

use crate::daemon::protocol::{read_message, write_message, AppMessage, MsInfo, Seq, SocketAddress};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Client-side failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon connection: {0}")]
    Io(#[from] io::Error),

    /// The daemon answered with a non-zero error code
    #[error("request failed: {}", io::Error::from_raw_os_error(*.0))]
    Errno(i32),

    #[error("unexpected reply {0}")]
    Unexpected(&'static str),
}

impl ClientError {
    /// POSIX code reported by the daemon, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            ClientError::Errno(code) => Some(*code),
            _ => None,
        }
    }
}

fn check(err: i32) -> Result<(), ClientError> {
    match err {
        0 => Ok(()),
        code => Err(ClientError::Errno(code)),
    }
}

/// An established connection as seen by this application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Local socket number of the connection
    pub sn: u16,
    /// Remote end
    pub peer: SocketAddress,
    pub loc_ms: MsInfo,
    pub rem_ms: MsInfo,
}

/// Notification that the remote side closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceClose {
    pub sn: u16,
    /// 0 for an orderly close, `ECONNRESET` when the remote daemon died
    pub err: i32,
}

/// Client for one application connection to the daemon
pub struct RsktClient {
    stream: UnixStream,
    next_seq: Seq,
    /// Replies read while waiting for another sequence number
    replies: HashMap<Seq, AppMessage>,
    /// Destinations of outstanding CONNECT requests
    connecting: HashMap<Seq, SocketAddress>,
    force_closes: VecDeque<ForceClose>,
}

impl RsktClient {
    /// Connect to the daemon at `path`
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)?;
        Ok(Self {
            stream,
            next_seq: 1,
            replies: HashMap::new(),
            connecting: HashMap::new(),
            force_closes: VecDeque::new(),
        })
    }

    /// Check if a daemon answers on `path`
    pub fn is_daemon_running(path: &Path) -> bool {
        path.exists() && UnixStream::connect(path).is_ok()
    }

    /// Send a request, returning its sequence number
    pub fn begin(&mut self, msg: AppMessage) -> Result<Seq, ClientError> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        write_message(&mut self.stream, &msg, seq)?;
        Ok(seq)
    }

    /// Wait for the reply to `seq`
    pub fn finish(&mut self, seq: Seq) -> Result<AppMessage, ClientError> {
        loop {
            if let Some(reply) = self.replies.remove(&seq) {
                return Ok(reply);
            }
            self.read_one()?;
        }
    }

    /// Send a request and wait for its reply
    pub fn request(&mut self, msg: AppMessage) -> Result<AppMessage, ClientError> {
        let seq = self.begin(msg)?;
        self.finish(seq)
    }

    /// Read one message, acknowledging FORCE_CLOSE on the spot
    fn read_one(&mut self) -> Result<(), ClientError> {
        let (msg, seq): (AppMessage, Seq) = read_message(&mut self.stream)?;
        match msg {
            AppMessage::ForceClose { sn, err } => {
                write_message(&mut self.stream, &AppMessage::ForceCloseResp { sn }, seq)?;
                self.force_closes.push_back(ForceClose { sn, err });
            }
            reply => {
                self.replies.insert(seq, reply);
            }
        }
        Ok(())
    }

    /// Register with the daemon; returns the component tag of this node
    pub fn hello(&mut self, name: &str) -> Result<u32, ClientError> {
        let msg = AppMessage::Hello {
            name: name.to_string(),
            pid: std::process::id() as i32,
        };
        match self.request(msg)? {
            AppMessage::HelloResp { ct, err } => check(err).map(|()| ct),
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    pub fn bind(&mut self, sn: u16) -> Result<(), ClientError> {
        match self.request(AppMessage::Bind { sn })? {
            AppMessage::BindResp { err, .. } => check(err),
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    pub fn listen(&mut self, sn: u16, backlog: u32) -> Result<(), ClientError> {
        match self.request(AppMessage::Listen { sn, backlog })? {
            AppMessage::ListenResp { err, .. } => check(err),
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    pub fn begin_accept(&mut self, sn: u16) -> Result<Seq, ClientError> {
        self.begin(AppMessage::Accept { sn })
    }

    pub fn finish_accept(&mut self, seq: Seq) -> Result<Connection, ClientError> {
        match self.finish(seq)? {
            AppMessage::AcceptResp {
                new_sn,
                peer,
                loc_ms,
                rem_ms,
                err,
                ..
            } => {
                check(err)?;
                Ok(Connection {
                    sn: new_sn,
                    peer,
                    loc_ms,
                    rem_ms,
                })
            }
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    /// Block until a connection arrives on listening socket `sn`
    pub fn accept(&mut self, sn: u16) -> Result<Connection, ClientError> {
        let seq = self.begin_accept(sn)?;
        self.finish_accept(seq)
    }

    pub fn begin_connect(&mut self, dst: SocketAddress) -> Result<Seq, ClientError> {
        let seq = self.begin(AppMessage::Connect { dst })?;
        self.connecting.insert(seq, dst);
        Ok(seq)
    }

    pub fn finish_connect(&mut self, seq: Seq) -> Result<Connection, ClientError> {
        let reply = self.finish(seq);
        let dst = self.connecting.remove(&seq).unwrap_or_default();
        match reply? {
            AppMessage::ConnectResp {
                new_sn,
                rem_sn,
                loc_ms,
                rem_ms,
                err,
            } => {
                check(err)?;
                Ok(Connection {
                    sn: new_sn,
                    peer: SocketAddress { ct: dst.ct, sn: rem_sn },
                    loc_ms,
                    rem_ms,
                })
            }
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    /// Connect to a listening socket on another node
    pub fn connect_to(&mut self, dst: SocketAddress) -> Result<Connection, ClientError> {
        let seq = self.begin_connect(dst)?;
        self.finish_connect(seq)
    }

    pub fn close(&mut self, sn: u16) -> Result<(), ClientError> {
        match self.request(AppMessage::Close { sn })? {
            AppMessage::CloseResp { err, .. } => check(err),
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    /// FORCE_CLOSE notifications received so far
    pub fn take_force_closes(&mut self) -> Vec<ForceClose> {
        self.force_closes.drain(..).collect()
    }

    /// Wait up to `timeout` for the next FORCE_CLOSE
    pub fn wait_force_close(&mut self, timeout: Duration) -> Result<Option<ForceClose>, ClientError> {
        let deadline = Instant::now() + timeout;
        while self.force_closes.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            // Only the wait is bounded; a frame once started is read whole
            self.stream.set_read_timeout(Some(left))?;
            let ready = {
                // UnixStream::peek is unstable; same call via recv(MSG_PEEK)
                let mut buf = [0u8; 1];
                let n = unsafe {
                    libc::recv(self.stream.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), libc::MSG_PEEK)
                };
                if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
            };
            self.stream.set_read_timeout(None)?;
            match ready {
                Ok(_) => self.read_one()?,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.force_closes.pop_front())
    }
}
