//! Listening and connected socket records

use crate::daemon::handle::ConnId;
use crate::daemon::memspace::MemorySpace;
use crate::daemon::protocol::{MsInfo, SocketAddress};
use crate::daemon::task::{ClosingRef, PeerRef, UnifiedTask};
use std::collections::VecDeque;

/// A listening socket: its owner, its backlog and the requests waiting on it
pub struct ListenRecord {
    pub app: ConnId,
    pub backlog: usize,
    connects: VecDeque<Box<UnifiedTask>>,
    accept: Option<Box<UnifiedTask>>,
}

impl ListenRecord {
    pub fn new(app: ConnId, backlog: usize) -> Self {
        Self {
            app,
            backlog,
            connects: VecDeque::new(),
            accept: None,
        }
    }

    /// Queue an inbound connect; hands it back when the backlog is full
    pub fn queue_connect(&mut self, task: Box<UnifiedTask>) -> Result<(), Box<UnifiedTask>> {
        if self.connects.len() >= self.backlog {
            return Err(task);
        }
        self.connects.push_back(task);
        Ok(())
    }

    /// Park the one outstanding accept
    pub fn set_accept(&mut self, task: Box<UnifiedTask>) -> Result<(), Box<UnifiedTask>> {
        if self.accept.is_some() {
            return Err(task);
        }
        self.accept = Some(task);
        Ok(())
    }

    /// Oldest connect paired with the outstanding accept, if both exist
    pub fn take_pair(&mut self) -> Option<(Box<UnifiedTask>, Box<UnifiedTask>)> {
        if self.accept.is_none() || self.connects.is_empty() {
            return None;
        }
        let accept = self.accept.take()?;
        let connect = self.connects.pop_front()?;
        Some((accept, connect))
    }

    /// Remove queued connects that arrived through `peer`
    pub fn drop_connects_from(&mut self, peer: PeerRef) -> Vec<Box<UnifiedTask>> {
        let (gone, keep): (VecDeque<_>, VecDeque<_>) =
            self.connects.drain(..).partition(|task| task.peer == Some(peer));
        self.connects = keep;
        gone.into_iter().collect()
    }

    pub fn queued(&self) -> usize {
        self.connects.len()
    }

    pub fn has_accept(&self) -> bool {
        self.accept.is_some()
    }

    /// Everything still waiting: (accept, queued connects)
    pub fn into_waiting(self) -> (Option<Box<UnifiedTask>>, Vec<Box<UnifiedTask>>) {
        (self.accept, self.connects.into_iter().collect())
    }
}

/// A connected socket
#[derive(Debug, Clone)]
pub struct ConnectedRecord {
    /// Owning application, `None` once it went away
    pub app: Option<ConnId>,
    /// Local memory space in use for the data path
    pub ms: MemorySpace,
    /// Remote end of the connection
    pub remote: SocketAddress,
    pub remote_ms: MsInfo,
    /// Peer connection the connection was set up over
    pub peer: PeerRef,
    /// A close pipeline is running for this socket
    pub closing: bool,
}

impl ConnectedRecord {
    pub fn closing_ref(&self, sn: u16) -> ClosingRef {
        ClosingRef {
            sn,
            remote_ct: self.remote.ct,
            remote_sn: self.remote.sn,
        }
    }

    /// Whether `closing` still designates this record
    pub fn matches(&self, closing: &ClosingRef) -> bool {
        self.remote.ct == closing.remote_ct && self.remote.sn == closing.remote_sn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::handle::HandleTable;
    use crate::daemon::protocol::PeerMessage;
    use crate::daemon::task::TaskTracker;

    fn connect_task(tracker: &TaskTracker, peer: PeerRef, src_sn: u16) -> Box<UnifiedTask> {
        let msg = PeerMessage::ConnectReq {
            dst_sn: 10,
            dst_ct: 0x10,
            src_sn,
            src_mso: 0,
            src_ms: "ms".to_string(),
            src_msub_o: 0,
            src_msub_s: 0,
        };
        UnifiedTask::from_peer(tracker, peer, src_sn as u32, msg).unwrap()
    }

    #[test]
    fn test_fifo_pairing_and_backlog() {
        let mut ids = HandleTable::new(4);
        let app = ids.insert(()).unwrap();
        let speer = PeerRef::Speer(ids.insert(()).unwrap());
        let tracker = TaskTracker::new();
        let mut rec = ListenRecord::new(app, 2);

        rec.queue_connect(connect_task(&tracker, speer, 1)).unwrap();
        rec.queue_connect(connect_task(&tracker, speer, 2)).unwrap();
        assert!(rec.queue_connect(connect_task(&tracker, speer, 3)).is_err());
        assert!(rec.take_pair().is_none());

        let accept = UnifiedTask::from_app(
            &tracker,
            app,
            9,
            crate::daemon::protocol::AppMessage::Accept { sn: 10 },
        )
        .unwrap();
        rec.set_accept(accept).unwrap();
        let (_, first) = rec.take_pair().unwrap();
        assert_eq!(first.peer_seq, 1);
        assert_eq!(rec.queued(), 1);
        assert!(!rec.has_accept());
    }

    #[test]
    fn test_drop_connects_from_peer() {
        let mut ids = HandleTable::new(4);
        let app = ids.insert(()).unwrap();
        let a = PeerRef::Speer(ids.insert(()).unwrap());
        let b = PeerRef::Speer(ids.insert(()).unwrap());
        let tracker = TaskTracker::new();
        let mut rec = ListenRecord::new(app, 8);
        for (peer, sn) in [(a, 1), (b, 2), (a, 3)] {
            rec.queue_connect(connect_task(&tracker, peer, sn)).unwrap();
        }
        let gone = rec.drop_connects_from(a);
        assert_eq!(gone.len(), 2);
        assert_eq!(rec.queued(), 1);
    }
}
