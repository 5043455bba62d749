//! Unified tasks
//!
//! A [`UnifiedTask`] is one in-flight operation. It is created where a
//! request enters the daemon (app receiver or speer receiver), moved by value
//! through the serializer queue, the Tx queues and the correlation tables, and
//! dropped once its pipeline reaches the terminal stage.

use crate::daemon::handle::ConnId;
use crate::daemon::memspace::MemorySpace;
use crate::daemon::protocol::{AppMessage, PeerMessage, Seq};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The four task pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// App request handled entirely inside this daemon
    Areq,
    /// App request that needs a remote daemon (through a wpeer)
    A2w,
    /// Peer request handled inside this daemon
    Sreq,
    /// Peer request that needs the local application
    S2a,
}

/// Processing stage of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RequestReceived,
    PeerRequestSent,
    PeerResponseReceived,
    ResponseSent,
    PeerRequestReceived,
    AppRequestSent,
    AppResponseReceived,
    PeerResponseSent,
}

impl Pipeline {
    /// Stages in order, first to terminal
    pub fn stages(self) -> &'static [Stage] {
        use Stage::*;
        match self {
            Pipeline::Areq => &[RequestReceived, ResponseSent],
            Pipeline::A2w => &[RequestReceived, PeerRequestSent, PeerResponseReceived, ResponseSent],
            Pipeline::Sreq => &[PeerRequestReceived, PeerResponseSent],
            Pipeline::S2a => &[PeerRequestReceived, AppRequestSent, AppResponseReceived, PeerResponseSent],
        }
    }

    pub fn initial(self) -> Stage {
        self.stages()[0]
    }

    pub fn terminal(self) -> Stage {
        let stages = self.stages();
        stages[stages.len() - 1]
    }

    /// Stage a parked task moves to when its reply (or a failure) arrives
    fn reply_stage(self) -> Option<Stage> {
        match self {
            Pipeline::A2w => Some(Stage::PeerResponseReceived),
            Pipeline::S2a => Some(Stage::AppResponseReceived),
            Pipeline::Areq | Pipeline::Sreq => None,
        }
    }

    /// Pipeline for a request arriving from an application
    pub fn for_app_request(msg: &AppMessage) -> Option<Pipeline> {
        match msg {
            AppMessage::Hello { .. }
            | AppMessage::Bind { .. }
            | AppMessage::Listen { .. }
            | AppMessage::Accept { .. } => Some(Pipeline::Areq),
            AppMessage::Connect { .. } | AppMessage::Close { .. } => Some(Pipeline::A2w),
            _ => None,
        }
    }

    /// Pipeline for a request arriving from a peer daemon
    pub fn for_peer_request(msg: &PeerMessage) -> Option<Pipeline> {
        match msg {
            PeerMessage::HelloReq(_) | PeerMessage::ConnectReq { .. } => Some(Pipeline::Sreq),
            PeerMessage::CloseReq { .. } => Some(Pipeline::S2a),
            _ => None,
        }
    }
}

/// Which peer connection a task is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRef {
    Speer(ConnId),
    Wpeer(ConnId),
}

/// Counts live tasks so cleanup can be checked for leaks
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    live: Arc<AtomicUsize>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks not yet dropped
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn token(&self) -> LiveToken {
        self.live.fetch_add(1, Ordering::SeqCst);
        LiveToken { live: self.live.clone() }
    }
}

struct LiveToken {
    live: Arc<AtomicUsize>,
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connected socket a close pipeline is tearing down
///
/// The socket number alone is not enough: by the time the far side answers,
/// the number may have been released and handed to a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosingRef {
    pub sn: u16,
    pub remote_ct: u32,
    pub remote_sn: u16,
}

/// Resources reserved by an outgoing connect until the peer answers
#[derive(Debug, Clone)]
pub struct PendingConnect {
    pub sn: u16,
    pub ms: MemorySpace,
    pub dst_ct: u32,
}

/// One in-flight operation
pub struct UnifiedTask {
    pipeline: Pipeline,
    stage: Stage,
    /// Owning application connection
    pub app: Option<ConnId>,
    /// Sequence number of the app request, or of the daemon request to the app
    pub app_seq: Seq,
    /// Owning peer connection
    pub peer: Option<PeerRef>,
    /// Sequence number of the peer request, or of our request to the peer
    pub peer_seq: Seq,
    pub app_in: Option<AppMessage>,
    pub app_out: Option<AppMessage>,
    pub peer_in: Option<PeerMessage>,
    pub peer_out: Option<PeerMessage>,
    pub closing: Option<ClosingRef>,
    pub connect: Option<PendingConnect>,
    /// Error code once the pipeline failed
    pub err: i32,
    _live: LiveToken,
}

impl UnifiedTask {
    fn new(tracker: &TaskTracker, pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            stage: pipeline.initial(),
            app: None,
            app_seq: 0,
            peer: None,
            peer_seq: 0,
            app_in: None,
            app_out: None,
            peer_in: None,
            peer_out: None,
            closing: None,
            connect: None,
            err: 0,
            _live: tracker.token(),
        }
    }

    /// Wrap a request received from an application
    ///
    /// Returns `None` for messages that are not requests.
    pub fn from_app(tracker: &TaskTracker, app: ConnId, seq: Seq, msg: AppMessage) -> Option<Box<Self>> {
        let pipeline = Pipeline::for_app_request(&msg)?;
        let mut task = Self::new(tracker, pipeline);
        task.app = Some(app);
        task.app_seq = seq;
        task.app_in = Some(msg);
        Some(Box::new(task))
    }

    /// Wrap a request received on a slave peer
    pub fn from_peer(tracker: &TaskTracker, peer: PeerRef, seq: Seq, msg: PeerMessage) -> Option<Box<Self>> {
        let pipeline = Pipeline::for_peer_request(&msg)?;
        let mut task = Self::new(tracker, pipeline);
        task.peer = Some(peer);
        task.peer_seq = seq;
        task.peer_in = Some(msg);
        Some(Box::new(task))
    }

    /// Daemon-originated `FORCE_CLOSE` with no peer waiting on the outcome
    pub fn force_close(tracker: &TaskTracker, app: ConnId, closing: ClosingRef, err: i32) -> Box<Self> {
        let mut task = Self::new(tracker, Pipeline::S2a);
        task.app = Some(app);
        task.closing = Some(closing);
        task.app_out = Some(AppMessage::ForceClose { sn: closing.sn, err });
        task.advance(Stage::AppRequestSent);
        Box::new(task)
    }

    /// Daemon-originated close towards a remote peer with no app waiting
    pub fn remote_close(tracker: &TaskTracker, wpeer: ConnId, closing: ClosingRef) -> Box<Self> {
        let mut task = Self::new(tracker, Pipeline::A2w);
        task.peer = Some(PeerRef::Wpeer(wpeer));
        task.closing = Some(closing);
        task.peer_out = Some(PeerMessage::CloseReq {
            rem_sn: closing.remote_sn,
            loc_sn: closing.sn,
            force: false,
        });
        task.advance(Stage::PeerRequestSent);
        Box::new(task)
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_terminal(&self) -> bool {
        self.stage == self.pipeline.terminal()
    }

    /// Move to `next`: the following stage, or straight to terminal
    ///
    /// Panics on any other transition; that can only be a broker bug.
    pub fn advance(&mut self, next: Stage) {
        let stages = self.pipeline.stages();
        let current = stages.iter().position(|s| *s == self.stage);
        let successor = current.and_then(|i| stages.get(i + 1)).copied();
        if Some(next) != successor && next != self.pipeline.terminal() {
            panic!(
                "illegal stage transition {:?} -> {:?} in {:?} pipeline",
                self.stage, next, self.pipeline
            );
        }
        self.stage = next;
    }

    /// Attach the application's reply to a daemon request
    pub fn complete_app_response(&mut self, msg: AppMessage) {
        self.app_in = Some(msg);
        self.advance(Stage::AppResponseReceived);
    }

    /// Attach the remote daemon's reply to our request
    pub fn complete_peer_response(&mut self, msg: PeerMessage) {
        self.peer_in = Some(msg);
        self.advance(Stage::PeerResponseReceived);
    }

    /// Complete a parked task with an error instead of a reply
    pub fn fail(&mut self, err: i32) {
        self.err = err;
        if let Some(stage) = self.pipeline.reply_stage() {
            if self.stage != stage {
                self.advance(stage);
            }
        }
    }
}

impl fmt::Debug for UnifiedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedTask")
            .field("pipeline", &self.pipeline)
            .field("stage", &self.stage)
            .field("app", &self.app)
            .field("peer", &self.peer)
            .field("err", &self.err)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::handle::HandleTable;

    fn conn() -> ConnId {
        let mut table = HandleTable::new(1);
        table.insert(()).unwrap()
    }

    #[test]
    fn test_classification() {
        let tracker = TaskTracker::new();
        let task = UnifiedTask::from_app(&tracker, conn(), 1, AppMessage::Bind { sn: 1 }).unwrap();
        assert_eq!(task.pipeline(), Pipeline::Areq);

        let task = UnifiedTask::from_app(&tracker, conn(), 2, AppMessage::Close { sn: 1 }).unwrap();
        assert_eq!(task.pipeline(), Pipeline::A2w);

        assert!(UnifiedTask::from_app(&tracker, conn(), 3, AppMessage::ForceCloseResp { sn: 1 }).is_none());

        let msg = PeerMessage::CloseReq { rem_sn: 1, loc_sn: 2, force: false };
        let task = UnifiedTask::from_peer(&tracker, PeerRef::Speer(conn()), 4, msg).unwrap();
        assert_eq!(task.pipeline(), Pipeline::S2a);
        assert_eq!(task.stage(), Stage::PeerRequestReceived);
    }

    #[test]
    fn test_live_count_follows_drop() {
        let tracker = TaskTracker::new();
        let a = UnifiedTask::from_app(&tracker, conn(), 1, AppMessage::Bind { sn: 1 }).unwrap();
        let b = UnifiedTask::from_app(&tracker, conn(), 2, AppMessage::Bind { sn: 2 }).unwrap();
        assert_eq!(tracker.live(), 2);
        drop(a);
        assert_eq!(tracker.live(), 1);
        drop(b);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn test_a2w_stage_walk() {
        let tracker = TaskTracker::new();
        let mut task =
            UnifiedTask::from_app(&tracker, conn(), 1, AppMessage::Connect { dst: Default::default() }).unwrap();
        task.advance(Stage::PeerRequestSent);
        task.fail(libc::ECONNRESET);
        assert_eq!(task.stage(), Stage::PeerResponseReceived);
        assert_eq!(task.err, libc::ECONNRESET);
        task.advance(Stage::ResponseSent);
        assert!(task.is_terminal());
    }

    #[test]
    fn test_shortcut_to_terminal() {
        let tracker = TaskTracker::new();
        let mut task = UnifiedTask::from_app(&tracker, conn(), 1, AppMessage::Close { sn: 9 }).unwrap();
        task.advance(Stage::ResponseSent);
        assert!(task.is_terminal());
    }

    #[test]
    #[should_panic(expected = "illegal stage transition")]
    fn test_illegal_transition_panics() {
        let tracker = TaskTracker::new();
        let mut task = UnifiedTask::from_app(&tracker, conn(), 1, AppMessage::Bind { sn: 1 }).unwrap();
        task.advance(Stage::AppRequestSent);
    }

    #[test]
    fn test_force_close_task() {
        let tracker = TaskTracker::new();
        let closing = ClosingRef { sn: 0x1000, remote_ct: 0x20, remote_sn: 0x1001 };
        let task = UnifiedTask::force_close(&tracker, conn(), closing, libc::ECONNRESET);
        assert_eq!(task.stage(), Stage::AppRequestSent);
        assert_eq!(
            task.app_out,
            Some(AppMessage::ForceClose { sn: 0x1000, err: libc::ECONNRESET })
        );
    }
}
