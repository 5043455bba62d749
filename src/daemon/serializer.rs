//! Message processing serializer
//!
//! The [`Broker`] is the only code that reads or writes the socket registry,
//! the connection tables and the listener queues. Receivers, managers and Tx
//! dispatchers talk to it exclusively through [`Event`]s on one channel, so
//! every mutation happens on a single thread in arrival order.
//!
//! ## Pipelines
//!
//! - AREQ: `HELLO`, `BIND`, `LISTEN`, `ACCEPT` answered locally
//! - A2W: `CONNECT`, `CLOSE` forwarded over the wpeer to the remote node
//! - SREQ: peer `HELLO_REQ`, `CONNECT_REQ` answered locally
//! - S2A: peer `CLOSE_REQ` forwarded to the owning application
//!
//! A task leaves the broker either complete (queued for its final send) or
//! parked in a link's correlation table, in which case the receiver or a
//! teardown hands it back here.
//!
//! ## Shutdown
//!
//! [`Event::Shutdown`] first fails every accept and queued connect and asks
//! the wpeer dispatcher to drain. Requests it still held come back parked or
//! bounced; [`Event::TxDrained`] then fails the parked ones and detaches every
//! link. Application links close only after their final answers are written.

use crate::daemon::directory::PeerInfo;
use crate::daemon::error::{errno_of, RsktError};
use crate::daemon::handle::{ConnId, HandleTable};
use crate::daemon::link::Link;
use crate::daemon::memspace::MemorySpaceProvider;
use crate::daemon::protocol::{AppMessage, MsInfo, PeerHello, PeerMessage, SocketAddress};
use crate::daemon::records::{ConnectedRecord, ListenRecord};
use crate::daemon::registry::{SocketRegistry, SocketState, DEFAULT_DYNAMIC_START};
use crate::daemon::task::{ClosingRef, PendingConnect, PeerRef, Pipeline, Stage, TaskTracker, UnifiedTask};
use crate::daemon::tx::{Egress, ToWpeer, TxCommand};
use crossbeam_channel::{Receiver, Sender};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Input of the serializer
pub enum Event {
    /// New request, or a parked task handed back by a receiver or dispatcher
    Task(Box<UnifiedTask>),
    /// An application connected; the reply carries its id (`None` = refused)
    AppAttached { link: Arc<Link>, reply: Sender<Option<ConnId>> },
    AppDetached(ConnId),
    SpeerAttached { link: Arc<Link>, reply: Sender<Option<ConnId>> },
    SpeerDetached(ConnId),
    /// Outbound peer connection finished its handshake
    WpeerAttached {
        peer: PeerInfo,
        hello: PeerHello,
        link: Arc<Link>,
        reply: Sender<Option<ConnId>>,
    },
    WpeerOpenFailed { ct: u32 },
    WpeerDetached(ConnId),
    /// Current directory contents
    Directory(Vec<PeerInfo>),
    /// A Tx dispatcher processed every command queued before its drain
    TxDrained(&'static str),
    Shutdown,
}

/// Identity of this daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNode {
    pub ct: u32,
    pub cm_skt: u16,
    pub mport: u8,
    pub pid: u32,
}

impl LocalNode {
    pub fn hello(&self) -> PeerHello {
        PeerHello {
            ct: self.ct,
            cm_skt: self.cm_skt,
            mport: self.mport,
            pid: self.pid,
        }
    }
}

/// Table sizes and limits
#[derive(Debug, Clone, Copy)]
pub struct BrokerLimits {
    pub max_apps: usize,
    pub max_peers: usize,
    pub max_backlog: u32,
    pub dynamic_start: u16,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            max_apps: 64,
            max_peers: 64,
            max_backlog: 64,
            dynamic_start: DEFAULT_DYNAMIC_START,
        }
    }
}

/// Queues the broker feeds
#[derive(Clone)]
pub struct BrokerPorts {
    pub app_tx: Sender<TxCommand>,
    pub speer_tx: Sender<TxCommand>,
    pub wpeer_tx: Sender<TxCommand>,
    /// Requests to the wpeer manager to open a connection
    pub wpeer_open: Sender<PeerInfo>,
}

struct AppEntry {
    link: Arc<Link>,
    name: String,
    pid: i32,
}

struct PeerEntry {
    link: Arc<Link>,
    hello: Option<PeerHello>,
}

/// Owner of all broker state
pub struct Broker {
    local: LocalNode,
    limits: BrokerLimits,
    registry: SocketRegistry,
    spaces: Box<dyn MemorySpaceProvider>,
    apps: HandleTable<AppEntry>,
    speers: HandleTable<PeerEntry>,
    wpeers: HandleTable<PeerEntry>,
    wpeer_by_ct: HashMap<u32, ConnId>,
    wpeer_opening: HashSet<u32>,
    reachable: HashSet<u32>,
    /// Bound and listening sockets by owning application
    owners: HashMap<u16, ConnId>,
    listeners: HashMap<u16, ListenRecord>,
    connected: HashMap<u16, ConnectedRecord>,
    ports: BrokerPorts,
    tracker: TaskTracker,
    shutting_down: bool,
}

fn post(port: &Sender<TxCommand>, command: TxCommand) {
    if port.send(command).is_err() {
        tracing::debug!("tx dispatcher gone, command dropped");
    }
}

fn accept_error(sn: u16, err: i32) -> AppMessage {
    AppMessage::AcceptResp {
        sn,
        new_sn: 0,
        peer: SocketAddress::default(),
        loc_ms: MsInfo::default(),
        rem_ms: MsInfo::default(),
        err,
    }
}

fn connect_error(err: i32) -> AppMessage {
    AppMessage::ConnectResp {
        new_sn: 0,
        rem_sn: 0,
        loc_ms: MsInfo::default(),
        rem_ms: MsInfo::default(),
        err,
    }
}

/// Failure answer to an application request
fn refusal(request: &AppMessage, err: i32) -> Option<AppMessage> {
    let reply = match request {
        AppMessage::Hello { .. } => AppMessage::HelloResp { ct: 0, err },
        AppMessage::Bind { sn } => AppMessage::BindResp { sn: *sn, err },
        AppMessage::Listen { sn, .. } => AppMessage::ListenResp { sn: *sn, err },
        AppMessage::Accept { sn } => accept_error(*sn, err),
        AppMessage::Connect { .. } => connect_error(err),
        AppMessage::Close { sn } => AppMessage::CloseResp { sn: *sn, err },
        _ => return None,
    };
    Some(reply)
}

impl Broker {
    pub fn new(
        local: LocalNode,
        limits: BrokerLimits,
        spaces: Box<dyn MemorySpaceProvider>,
        ports: BrokerPorts,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            local,
            limits,
            registry: SocketRegistry::new(limits.dynamic_start),
            spaces,
            apps: HandleTable::new(limits.max_apps),
            speers: HandleTable::new(limits.max_peers),
            wpeers: HandleTable::new(limits.max_peers),
            wpeer_by_ct: HashMap::new(),
            wpeer_opening: HashSet::new(),
            reachable: HashSet::new(),
            owners: HashMap::new(),
            listeners: HashMap::new(),
            connected: HashMap::new(),
            ports,
            tracker,
            shutting_down: false,
        }
    }

    /// Run the broker on its own thread
    pub fn spawn(self, events: Receiver<Event>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("rsktd-serializer".to_string())
            .spawn(move || self.run(events))
    }

    pub fn run(mut self, events: Receiver<Event>) {
        while let Ok(event) = events.recv() {
            if !self.handle(event) {
                break;
            }
        }
        tracing::debug!("serializer stopped");
    }

    /// Process one event; `false` after shutdown
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Task(task) => self.task(task),
            Event::AppAttached { link, reply } => {
                let id = self.app_attached(link);
                let _ = reply.send(id);
            }
            Event::AppDetached(id) => self.app_detached(id),
            Event::SpeerAttached { link, reply } => {
                let id = self.speer_attached(link);
                let _ = reply.send(id);
            }
            Event::SpeerDetached(id) => self.speer_detached(id),
            Event::WpeerAttached { peer, hello, link, reply } => {
                let id = self.wpeer_attached(peer, hello, link);
                let _ = reply.send(id);
            }
            Event::WpeerOpenFailed { ct } => {
                self.wpeer_opening.remove(&ct);
            }
            Event::WpeerDetached(id) => self.wpeer_detached(id, libc::ECONNRESET),
            Event::Directory(peers) => self.reconcile(peers),
            Event::TxDrained(direction) => {
                if self.shutting_down && direction == ToWpeer::DIRECTION {
                    self.finish_shutdown();
                    return false;
                }
            }
            Event::Shutdown => {
                if !self.begin_shutdown() {
                    self.finish_shutdown();
                    return false;
                }
            }
        }
        true
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn registry(&self) -> &SocketRegistry {
        &self.registry
    }

    pub fn connected(&self, sn: u16) -> Option<&ConnectedRecord> {
        self.connected.get(&sn)
    }

    pub fn listener(&self, sn: u16) -> Option<&ListenRecord> {
        self.listeners.get(&sn)
    }

    pub fn wpeer_for(&self, ct: u32) -> Option<ConnId> {
        self.wpeer_by_ct.get(&ct).copied()
    }

    pub fn memory_spaces_in_use(&self) -> usize {
        self.spaces.in_use()
    }

    fn task(&mut self, task: Box<UnifiedTask>) {
        match (task.pipeline(), task.stage()) {
            (Pipeline::Areq | Pipeline::A2w, Stage::RequestReceived) => self.app_request(task),
            (Pipeline::A2w, Stage::PeerResponseReceived) => self.finish_a2w(task),
            (Pipeline::Sreq | Pipeline::S2a, Stage::PeerRequestReceived) => self.peer_request(task),
            (Pipeline::S2a, Stage::AppResponseReceived) => self.finish_s2a(task),
            _ => tracing::error!(?task, "task handed to serializer in unexpected stage"),
        }
    }

    // ---- outbound helpers ----

    fn to_app(&self, task: Box<UnifiedTask>) {
        let Some(app) = task.app else {
            return;
        };
        if !self.apps.contains(app) {
            tracing::debug!(app = %app, ?task, "application gone, message dropped");
            return;
        }
        post(&self.ports.app_tx, TxCommand::Send { to: app, task });
    }

    fn respond_app(&self, mut task: Box<UnifiedTask>, msg: AppMessage) {
        tracing::debug!(app = ?task.app, seq = task.app_seq, kind = msg.kind(), "app response");
        task.app_out = Some(msg);
        task.advance(task.pipeline().terminal());
        self.to_app(task);
    }

    fn respond_peer(&self, mut task: Box<UnifiedTask>, msg: PeerMessage) {
        tracing::debug!(peer = ?task.peer, seq = task.peer_seq, kind = msg.kind(), "peer response");
        task.peer_out = Some(msg);
        task.advance(task.pipeline().terminal());
        match task.peer {
            Some(PeerRef::Speer(id)) if self.speers.contains(id) => {
                post(&self.ports.speer_tx, TxCommand::Send { to: id, task });
            }
            _ => tracing::debug!(?task, "requesting peer gone, response dropped"),
        }
    }

    fn to_wpeer(&self, wpeer: ConnId, task: Box<UnifiedTask>) {
        post(&self.ports.wpeer_tx, TxCommand::Send { to: wpeer, task });
    }

    fn app_alive(&self, app: Option<ConnId>) -> Option<ConnId> {
        app.filter(|id| self.apps.contains(*id))
    }

    // ---- application requests (AREQ, A2W first half) ----

    fn app_request(&mut self, task: Box<UnifiedTask>) {
        let Some(app) = task.app else {
            tracing::error!(?task, "app request without application");
            return;
        };
        if !self.apps.contains(app) {
            tracing::debug!(app = %app, "request from departed application dropped");
            return;
        }
        let Some(msg) = task.app_in.clone() else {
            tracing::error!(?task, "app request without message");
            return;
        };
        tracing::debug!(app = %app, seq = task.app_seq, kind = msg.kind(), "app request");

        if self.shutting_down {
            match refusal(&msg, libc::ECONNRESET) {
                Some(reply) => self.respond_app(task, reply),
                None => tracing::warn!(kind = msg.kind(), "not an application request"),
            }
            return;
        }

        match msg {
            AppMessage::Hello { name, pid } => {
                if let Some(entry) = self.apps.get_mut(app) {
                    tracing::info!(app = %app, %name, pid, "application registered");
                    entry.name = name;
                    entry.pid = pid;
                }
                let ct = self.local.ct;
                self.respond_app(task, AppMessage::HelloResp { ct, err: 0 });
            }
            AppMessage::Bind { sn } => {
                let result = self.registry.bind(sn);
                if result.is_ok() {
                    self.owners.insert(sn, app);
                }
                self.respond_app(task, AppMessage::BindResp { sn, err: errno_of(result) });
            }
            AppMessage::Listen { sn, backlog } => {
                let result = self.listen(app, sn, backlog);
                self.respond_app(task, AppMessage::ListenResp { sn, err: errno_of(result) });
            }
            AppMessage::Accept { sn } => self.accept(app, sn, task),
            AppMessage::Connect { dst } => self.connect(dst, task),
            AppMessage::Close { sn } => self.app_close(app, sn, task),
            other => tracing::warn!(kind = other.kind(), "not an application request"),
        }
    }

    fn listen(&mut self, app: ConnId, sn: u16, backlog: u32) -> Result<(), RsktError> {
        if self.owners.get(&sn) != Some(&app) {
            return Err(RsktError::BadSocket(sn));
        }
        self.registry.listen(sn, backlog)?;
        let backlog = backlog.min(self.limits.max_backlog).max(1) as usize;
        self.listeners.insert(sn, ListenRecord::new(app, backlog));
        Ok(())
    }

    fn accept(&mut self, app: ConnId, sn: u16, task: Box<UnifiedTask>) {
        if self.owners.get(&sn) != Some(&app) {
            return self.respond_app(task, accept_error(sn, libc::EBADF));
        }
        if let Err(e) = self.registry.begin_accept(sn) {
            return self.respond_app(task, accept_error(sn, e.errno()));
        }
        let Some(listener) = self.listeners.get_mut(&sn) else {
            tracing::error!(sn, "accepting socket has no listener record");
            return self.respond_app(task, accept_error(sn, libc::EINVAL));
        };
        if let Err(task) = listener.set_accept(task) {
            return self.respond_app(task, accept_error(sn, libc::ECONNREFUSED));
        }
        self.rendezvous(sn);
    }

    fn connect(&mut self, dst: SocketAddress, mut task: Box<UnifiedTask>) {
        match self.start_connect(dst, &mut task) {
            Ok(wpeer) => {
                task.advance(Stage::PeerRequestSent);
                self.to_wpeer(wpeer, task);
            }
            Err(e) => {
                tracing::debug!(ct = dst.ct, sn = dst.sn, "connect refused: {}", e);
                self.respond_app(task, connect_error(e.errno()));
            }
        }
    }

    /// Reserve a memory space and a dynamic socket for an outgoing connect
    fn start_connect(&mut self, dst: SocketAddress, task: &mut UnifiedTask) -> Result<ConnId, RsktError> {
        if dst.ct == self.local.ct {
            return Err(RsktError::ConnectionRefused(dst.sn));
        }
        if dst.sn == 0 {
            return Err(RsktError::InvalidArgument);
        }
        let wpeer = self
            .wpeer_for(dst.ct)
            .ok_or(RsktError::NetworkUnreachable(dst.ct))?;
        let ms = self.spaces.acquire()?;
        let sn = match self
            .registry
            .allocate_dynamic()
            .and_then(|sn| self.registry.begin_connect(sn).map(|()| sn))
        {
            Ok(sn) => sn,
            Err(e) => {
                self.spaces.release(&ms);
                return Err(e);
            }
        };

        task.peer = Some(PeerRef::Wpeer(wpeer));
        task.peer_out = Some(PeerMessage::ConnectReq {
            dst_sn: dst.sn,
            dst_ct: dst.ct,
            src_sn: sn,
            src_mso: ms.owner,
            src_ms: ms.name.clone(),
            src_msub_o: ms.sub_offset,
            src_msub_s: ms.sub_size,
        });
        task.connect = Some(PendingConnect { sn, ms, dst_ct: dst.ct });
        Ok(wpeer)
    }

    fn app_close(&mut self, app: ConnId, sn: u16, mut task: Box<UnifiedTask>) {
        let (closing, already) = match self.connected.get_mut(&sn) {
            Some(rec) if rec.app == Some(app) => {
                let already = rec.closing;
                rec.closing = true;
                (Some(rec.closing_ref(sn)), already)
            }
            Some(_) => return self.respond_app(task, AppMessage::CloseResp { sn, err: libc::EBADF }),
            None => (None, false),
        };

        let Some(closing) = closing else {
            // Bound or listening socket: nothing remote to tell
            if self.owners.get(&sn) != Some(&app) {
                return self.respond_app(task, AppMessage::CloseResp { sn, err: libc::EBADF });
            }
            self.close_owned(sn, libc::ECONNRESET);
            return self.respond_app(task, AppMessage::CloseResp { sn, err: 0 });
        };
        if already {
            return self.respond_app(task, AppMessage::CloseResp { sn, err: 0 });
        }

        if let Err(e) = self.registry.close(sn) {
            tracing::warn!(sn, "closing connected socket: {}", e);
        }
        match self.wpeer_for(closing.remote_ct) {
            Some(wpeer) => {
                task.peer = Some(PeerRef::Wpeer(wpeer));
                task.closing = Some(closing);
                task.peer_out = Some(PeerMessage::CloseReq {
                    rem_sn: closing.remote_sn,
                    loc_sn: sn,
                    force: false,
                });
                task.advance(Stage::PeerRequestSent);
                self.to_wpeer(wpeer, task);
            }
            None => {
                tracing::debug!(sn, ct = closing.remote_ct, "no wpeer to remote node, closing locally");
                self.teardown(closing);
                self.respond_app(task, AppMessage::CloseResp { sn, err: 0 });
            }
        }
    }

    /// Drop a bound or listening socket, failing whatever waits on it
    fn close_owned(&mut self, sn: u16, err: i32) {
        self.owners.remove(&sn);
        if let Some(listener) = self.listeners.remove(&sn) {
            let (accept, connects) = listener.into_waiting();
            if let Some(accept) = accept {
                self.respond_app(accept, accept_error(sn, err));
            }
            for connect in connects {
                self.refuse_connect(connect, err);
            }
        }
        if let Err(e) = self.registry.close_and_release(sn) {
            tracing::warn!(sn, "releasing socket: {}", e);
        }
    }

    /// Release a connected socket's record, number and memory space
    ///
    /// A no-op when the record is gone or now belongs to another connection.
    fn teardown(&mut self, closing: ClosingRef) -> bool {
        match self.connected.get(&closing.sn) {
            Some(rec) if rec.matches(&closing) => {}
            _ => return false,
        }
        let Some(rec) = self.connected.remove(&closing.sn) else {
            return false;
        };
        self.spaces.release(&rec.ms);
        let _ = self.registry.close(closing.sn);
        if let Err(e) = self.registry.release(closing.sn) {
            tracing::warn!(sn = closing.sn, "releasing connected socket: {}", e);
        }
        tracing::debug!(sn = closing.sn, remote_ct = closing.remote_ct, remote_sn = closing.remote_sn, "connection torn down");
        true
    }

    /// Close a connection towards the remote node with no application waiting
    fn begin_remote_close(&mut self, sn: u16) {
        let closing = match self.connected.get_mut(&sn) {
            Some(rec) if !rec.closing => {
                rec.closing = true;
                rec.app = None;
                rec.closing_ref(sn)
            }
            _ => return,
        };
        let _ = self.registry.close(sn);
        match self.wpeer_for(closing.remote_ct) {
            Some(wpeer) if !self.shutting_down => {
                let task = UnifiedTask::remote_close(&self.tracker, wpeer, closing);
                self.to_wpeer(wpeer, task);
            }
            _ => {
                self.teardown(closing);
            }
        }
    }

    // ---- A2W second half ----

    /// Requests bounced off a wpeer that left the directory report the same
    /// code as the ones it held parked
    fn departure_errno(&self, ct: u32, err: i32) -> i32 {
        if err == libc::ECONNRESET && !self.reachable.contains(&ct) {
            libc::ENETUNREACH
        } else {
            err
        }
    }

    fn finish_a2w(&mut self, mut task: Box<UnifiedTask>) {
        if let Some(pending) = task.connect.take() {
            self.finish_connect(task, pending);
        } else if let Some(closing) = task.closing {
            self.finish_close(task, closing);
        } else {
            tracing::error!(?task, "A2W task without connect or close state");
        }
    }

    fn finish_connect(&mut self, mut task: Box<UnifiedTask>, pending: PendingConnect) {
        let reply = match (task.err, task.peer_in.take()) {
            (0, Some(PeerMessage::ConnectResp { acc_sn, dst_ms, dst_msub_s, err: 0, .. })) => {
                Ok((acc_sn, MsInfo { name: dst_ms, size: dst_msub_s }))
            }
            (0, Some(PeerMessage::ConnectResp { err, .. })) => Err(err),
            (0, other) => {
                tracing::warn!(?other, "unexpected reply to CONNECT_REQ");
                Err(libc::EPROTO)
            }
            (err, _) => Err(self.departure_errno(pending.dst_ct, err)),
        };

        let (acc_sn, rem_ms) = match reply {
            Ok(accepted) => accepted,
            Err(err) => {
                if let Err(e) = self.registry.close_and_release(pending.sn) {
                    tracing::warn!(sn = pending.sn, "releasing failed connect: {}", e);
                }
                self.spaces.release(&pending.ms);
                return self.respond_app(task, connect_error(err));
            }
        };

        if let Err(e) = self.registry.complete(pending.sn, SocketState::Connected) {
            tracing::error!(sn = pending.sn, "completing connect: {}", e);
        }
        let app = self.app_alive(task.app);
        let Some(peer) = task.peer else {
            tracing::error!(?task, "connect task lost its wpeer");
            return;
        };
        let loc_ms = MsInfo {
            name: pending.ms.name.clone(),
            size: pending.ms.sub_size,
        };
        self.connected.insert(
            pending.sn,
            ConnectedRecord {
                app,
                ms: pending.ms,
                remote: SocketAddress { ct: pending.dst_ct, sn: acc_sn },
                remote_ms: rem_ms.clone(),
                peer,
                closing: false,
            },
        );
        tracing::info!(sn = pending.sn, remote_ct = pending.dst_ct, remote_sn = acc_sn, "connected");

        if app.is_none() {
            // Nobody left to hand the connection to
            return self.begin_remote_close(pending.sn);
        }
        self.respond_app(
            task,
            AppMessage::ConnectResp {
                new_sn: pending.sn,
                rem_sn: acc_sn,
                loc_ms,
                rem_ms,
                err: 0,
            },
        );
    }

    fn finish_close(&mut self, task: Box<UnifiedTask>, closing: ClosingRef) {
        let err = match (task.err, &task.peer_in) {
            (0, Some(PeerMessage::CloseResp { err, .. })) => *err,
            (err, _) => self.departure_errno(closing.remote_ct, err),
        };
        self.teardown(closing);
        if task.app.is_some() {
            self.respond_app(task, AppMessage::CloseResp { sn: closing.sn, err });
        }
    }

    // ---- peer requests (SREQ, S2A first half) ----

    fn peer_request(&mut self, task: Box<UnifiedTask>) {
        let Some(PeerRef::Speer(speer)) = task.peer else {
            tracing::error!(?task, "peer request not from a speer");
            return;
        };
        if !self.speers.contains(speer) {
            tracing::debug!(speer = %speer, "request from departed speer dropped");
            return;
        }
        let Some(msg) = task.peer_in.clone() else {
            tracing::error!(?task, "peer request without message");
            return;
        };
        tracing::debug!(speer = %speer, seq = task.peer_seq, kind = msg.kind(), "peer request");

        match msg {
            PeerMessage::HelloReq(hello) => {
                if let Some(entry) = self.speers.get_mut(speer) {
                    tracing::info!(speer = %speer, ct = hello.ct, pid = hello.pid, "speer identified");
                    entry.hello = Some(hello);
                }
                let hello = self.local.hello();
                self.respond_peer(task, PeerMessage::HelloResp(hello));
            }
            PeerMessage::ConnectReq { dst_sn, dst_ct, .. } => self.peer_connect(speer, dst_sn, dst_ct, task),
            PeerMessage::CloseReq { rem_sn, loc_sn, force } => {
                self.peer_close(speer, rem_sn, loc_sn, force, task)
            }
            other => tracing::warn!(kind = other.kind(), "not a peer request"),
        }
    }

    fn speer_ct(&self, speer: ConnId) -> Option<u32> {
        self.speers.get(speer).and_then(|e| e.hello).map(|h| h.ct)
    }

    fn peer_connect(&mut self, speer: ConnId, dst_sn: u16, dst_ct: u32, task: Box<UnifiedTask>) {
        if self.speer_ct(speer).is_none() {
            tracing::warn!(speer = %speer, "CONNECT_REQ before HELLO_REQ");
            return self.refuse_connect(task, libc::ECONNREFUSED);
        }
        if dst_ct != self.local.ct {
            tracing::warn!(speer = %speer, dst_ct, "CONNECT_REQ for another node");
            return self.refuse_connect(task, libc::ECONNREFUSED);
        }
        let Some(listener) = self.listeners.get_mut(&dst_sn) else {
            return self.refuse_connect(task, libc::ECONNREFUSED);
        };
        if let Err(task) = listener.queue_connect(task) {
            tracing::debug!(sn = dst_sn, "listener backlog full");
            return self.refuse_connect(task, libc::ECONNREFUSED);
        }
        self.rendezvous(dst_sn);
    }

    fn refuse_connect(&self, task: Box<UnifiedTask>, err: i32) {
        let dst_sn = match &task.peer_in {
            Some(PeerMessage::ConnectReq { dst_sn, .. }) => *dst_sn,
            _ => 0,
        };
        let msg = PeerMessage::ConnectResp {
            dst_sn,
            acc_sn: 0,
            dst_ct: self.local.ct,
            dst_ms: String::new(),
            dst_msub_s: 0,
            err,
        };
        self.respond_peer(task, msg);
    }

    /// Pair the listener's accept with its oldest connect, if both exist
    fn rendezvous(&mut self, sn: u16) {
        loop {
            let Some(listener) = self.listeners.get_mut(&sn) else {
                return;
            };
            let app = listener.app;
            let Some((accept, connect)) = listener.take_pair() else {
                return;
            };

            let remote_ct = match connect.peer {
                Some(PeerRef::Speer(speer)) => self.speer_ct(speer),
                _ => None,
            };
            let Some(remote_ct) = remote_ct else {
                tracing::debug!(sn, "queued connect from departed speer dropped");
                if let Some(listener) = self.listeners.get_mut(&sn) {
                    let _ = listener.set_accept(accept);
                }
                continue;
            };

            if let Err(e) = self.registry.complete(sn, SocketState::Listening) {
                tracing::error!(sn, "finishing accept: {}", e);
            }
            match self.establish(app, remote_ct, &connect) {
                Ok((accept_msg, connect_msg)) => {
                    // Both answers are queued before this event ends
                    self.respond_app(accept, accept_msg);
                    self.respond_peer(connect, connect_msg);
                }
                Err(e) => {
                    tracing::debug!(sn, "rendezvous failed: {}", e);
                    self.respond_app(accept, accept_error(sn, e.errno()));
                    self.refuse_connect(connect, e.errno());
                }
            }
            return;
        }
    }

    /// Allocate the accepted side and build both responses
    fn establish(
        &mut self,
        app: ConnId,
        remote_ct: u32,
        connect: &UnifiedTask,
    ) -> Result<(AppMessage, PeerMessage), RsktError> {
        let Some(PeerMessage::ConnectReq {
            dst_sn,
            src_sn,
            src_ms,
            src_msub_s,
            ..
        }) = &connect.peer_in
        else {
            return Err(RsktError::InvalidArgument);
        };
        let Some(peer) = connect.peer else {
            return Err(RsktError::ConnectionReset);
        };

        let ms = self.spaces.acquire()?;
        let new_sn = match self.registry.allocate_dynamic() {
            Ok(sn) => sn,
            Err(e) => {
                self.spaces.release(&ms);
                return Err(e);
            }
        };
        if let Err(e) = self.registry.complete(new_sn, SocketState::Connected) {
            tracing::error!(sn = new_sn, "completing accept: {}", e);
        }

        let remote = SocketAddress { ct: remote_ct, sn: *src_sn };
        let rem_ms = MsInfo {
            name: src_ms.clone(),
            size: *src_msub_s,
        };
        let accept_msg = AppMessage::AcceptResp {
            sn: *dst_sn,
            new_sn,
            peer: remote,
            loc_ms: MsInfo {
                name: ms.name.clone(),
                size: ms.sub_size,
            },
            rem_ms: rem_ms.clone(),
            err: 0,
        };
        let connect_msg = PeerMessage::ConnectResp {
            dst_sn: *dst_sn,
            acc_sn: new_sn,
            dst_ct: self.local.ct,
            dst_ms: ms.name.clone(),
            dst_msub_s: ms.sub_size,
            err: 0,
        };
        tracing::info!(sn = new_sn, listener = *dst_sn, remote_ct, remote_sn = *src_sn, "accepted");
        self.connected.insert(
            new_sn,
            ConnectedRecord {
                app: Some(app),
                ms,
                remote,
                remote_ms: rem_ms,
                peer,
                closing: false,
            },
        );
        Ok((accept_msg, connect_msg))
    }

    fn peer_close(&mut self, speer: ConnId, rem_sn: u16, loc_sn: u16, force: bool, mut task: Box<UnifiedTask>) {
        let ack = PeerMessage::CloseResp { rem_sn, loc_sn, err: 0 };
        let Some(remote_ct) = self.speer_ct(speer) else {
            tracing::warn!(speer = %speer, "CLOSE_REQ before HELLO_REQ");
            let refused = PeerMessage::CloseResp { rem_sn, loc_sn, err: libc::ENOTCONN };
            return self.respond_peer(task, refused);
        };
        let closing = ClosingRef { sn: rem_sn, remote_ct, remote_sn: loc_sn };

        let app = match self.connected.get_mut(&rem_sn) {
            Some(rec) if rec.matches(&closing) && !rec.closing => {
                rec.closing = true;
                rec.app
            }
            // Already closing on our side, or gone
            _ => return self.respond_peer(task, ack),
        };
        let _ = self.registry.close(rem_sn);

        match self.app_alive(app) {
            Some(app) if !force => {
                task.app = Some(app);
                task.closing = Some(closing);
                task.app_out = Some(AppMessage::ForceClose { sn: rem_sn, err: 0 });
                task.advance(Stage::AppRequestSent);
                self.to_app(task);
            }
            Some(app) => {
                self.respond_peer(task, ack);
                self.to_app(UnifiedTask::force_close(&self.tracker, app, closing, 0));
            }
            None => {
                self.teardown(closing);
                self.respond_peer(task, ack);
            }
        }
    }

    // ---- S2A second half ----

    fn finish_s2a(&mut self, task: Box<UnifiedTask>) {
        let Some(closing) = task.closing else {
            tracing::error!(?task, "S2A task without close state");
            return;
        };
        self.teardown(closing);
        if task.peer.is_some() {
            let err = task.err;
            self.respond_peer(
                task,
                PeerMessage::CloseResp {
                    rem_sn: closing.sn,
                    loc_sn: closing.remote_sn,
                    err,
                },
            );
        }
    }

    /// Notify the owners of every live connection over `peer` that it died
    fn reset_connections(&mut self, peer: PeerRef) {
        let mut sns: Vec<u16> = self
            .connected
            .iter()
            .filter(|(_, rec)| rec.peer == peer && !rec.closing)
            .map(|(sn, _)| *sn)
            .collect();
        sns.sort_unstable();

        for sn in sns {
            let Some(rec) = self.connected.get_mut(&sn) else {
                continue;
            };
            rec.closing = true;
            let closing = rec.closing_ref(sn);
            let app = rec.app;
            let _ = self.registry.close(sn);
            match self.app_alive(app) {
                Some(app) if !self.shutting_down => {
                    self.to_app(UnifiedTask::force_close(&self.tracker, app, closing, libc::ECONNRESET));
                }
                _ => {
                    self.teardown(closing);
                }
            }
        }
    }

    // ---- connection lifecycle ----

    fn app_attached(&mut self, link: Arc<Link>) -> Option<ConnId> {
        if self.shutting_down {
            return None;
        }
        let entry = AppEntry {
            link: link.clone(),
            name: String::new(),
            pid: 0,
        };
        match self.apps.insert(entry) {
            Ok(id) => {
                post(&self.ports.app_tx, TxCommand::Register { id, link });
                tracing::info!(app = %id, "application connected");
                Some(id)
            }
            Err(_) => {
                tracing::warn!(max = self.limits.max_apps, "application table full");
                None
            }
        }
    }

    fn app_detached(&mut self, id: ConnId) {
        let Some(entry) = self.apps.remove(id) else {
            return;
        };
        tracing::info!(app = %id, name = %entry.name, pid = entry.pid, "application disconnected");
        // The dispatcher fails the link after the answers queued so far
        post(&self.ports.app_tx, TxCommand::Unregister(id));

        // Daemon requests the application never answered
        for mut task in entry.link.pending().close_and_drain() {
            task.fail(libc::ECONNRESET);
            self.finish_s2a(task);
        }

        let mut owned: Vec<u16> = self
            .owners
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(sn, _)| *sn)
            .collect();
        owned.sort_unstable();
        for sn in owned {
            self.close_owned(sn, libc::ECONNRESET);
        }

        let mut conns: Vec<u16> = self
            .connected
            .iter()
            .filter(|(_, rec)| rec.app == Some(id))
            .map(|(sn, _)| *sn)
            .collect();
        conns.sort_unstable();
        for sn in conns {
            let Some(rec) = self.connected.get(&sn) else {
                continue;
            };
            if rec.closing {
                let closing = rec.closing_ref(sn);
                self.teardown(closing);
            } else {
                self.begin_remote_close(sn);
            }
        }
    }

    fn speer_attached(&mut self, link: Arc<Link>) -> Option<ConnId> {
        if self.shutting_down {
            return None;
        }
        match self.speers.insert(PeerEntry { link: link.clone(), hello: None }) {
            Ok(id) => {
                post(&self.ports.speer_tx, TxCommand::Register { id, link });
                tracing::debug!(speer = %id, "speer attached");
                Some(id)
            }
            Err(_) => {
                tracing::warn!(max = self.limits.max_peers, "speer table full");
                None
            }
        }
    }

    fn speer_detached(&mut self, id: ConnId) {
        let Some(entry) = self.speers.remove(id) else {
            return;
        };
        tracing::warn!(speer = %id, ct = ?entry.hello.map(|h| h.ct), "speer disconnected");
        post(&self.ports.speer_tx, TxCommand::Unregister(id));
        let stray = entry.link.pending().close_and_drain();
        if !stray.is_empty() {
            tracing::error!(speer = %id, count = stray.len(), "tasks parked on a speer");
        }

        for listener in self.listeners.values_mut() {
            let dropped = listener.drop_connects_from(PeerRef::Speer(id));
            if !dropped.is_empty() {
                tracing::debug!(speer = %id, count = dropped.len(), "queued connects dropped");
            }
        }
        self.reset_connections(PeerRef::Speer(id));
    }

    fn wpeer_attached(&mut self, peer: PeerInfo, hello: PeerHello, link: Arc<Link>) -> Option<ConnId> {
        self.wpeer_opening.remove(&peer.ct);
        if self.shutting_down || self.wpeer_by_ct.contains_key(&peer.ct) || !self.reachable.contains(&peer.ct) {
            return None;
        }
        if hello.ct != peer.ct {
            tracing::warn!(expected = peer.ct, got = hello.ct, addr = %peer.addr, "wpeer answered with wrong component tag");
            return None;
        }
        match self.wpeers.insert(PeerEntry { link: link.clone(), hello: Some(hello) }) {
            Ok(id) => {
                self.wpeer_by_ct.insert(peer.ct, id);
                post(&self.ports.wpeer_tx, TxCommand::Register { id, link });
                tracing::info!(wpeer = %id, ct = peer.ct, addr = %peer.addr, "wpeer connected");
                Some(id)
            }
            Err(_) => {
                tracing::warn!(max = self.limits.max_peers, "wpeer table full");
                None
            }
        }
    }

    fn wpeer_detached(&mut self, id: ConnId, err: i32) {
        let Some(entry) = self.wpeers.remove(id) else {
            return;
        };
        if let Some(ct) = entry.hello.map(|h| h.ct) {
            if self.wpeer_by_ct.get(&ct) == Some(&id) {
                self.wpeer_by_ct.remove(&ct);
            }
            tracing::warn!(wpeer = %id, ct, "wpeer disconnected");
        }
        entry.link.fail();
        post(&self.ports.wpeer_tx, TxCommand::Unregister(id));

        for mut task in entry.link.pending().close_and_drain() {
            task.fail(err);
            self.finish_a2w(task);
        }
        self.reset_connections(PeerRef::Wpeer(id));
    }

    /// Match wpeers to the directory
    fn reconcile(&mut self, peers: Vec<PeerInfo>) {
        if self.shutting_down {
            return;
        }
        let wanted: BTreeMap<u32, PeerInfo> = peers
            .into_iter()
            .filter(|p| p.advertises_rskt && p.ct != self.local.ct)
            .map(|p| (p.ct, p))
            .collect();
        self.reachable = wanted.keys().copied().collect();

        let mut gone: Vec<(u32, ConnId)> = self
            .wpeer_by_ct
            .iter()
            .filter(|(ct, _)| !wanted.contains_key(ct))
            .map(|(ct, id)| (*ct, *id))
            .collect();
        gone.sort_unstable_by_key(|(ct, _)| *ct);
        for (ct, id) in gone {
            tracing::info!(ct, "destination left the directory");
            self.wpeer_detached(id, libc::ENETUNREACH);
        }

        for (ct, info) in wanted {
            if self.wpeer_by_ct.contains_key(&ct) || !self.wpeer_opening.insert(ct) {
                continue;
            }
            tracing::debug!(ct, addr = %info.addr, "opening wpeer");
            if self.ports.wpeer_open.send(info).is_err() {
                self.wpeer_opening.remove(&ct);
            }
        }
    }

    /// Fail what waits on local sockets; `true` while the wpeer dispatcher drains
    fn begin_shutdown(&mut self) -> bool {
        if self.shutting_down {
            return true;
        }
        tracing::info!("serializer shutting down");
        self.shutting_down = true;

        let mut owned: Vec<u16> = self.owners.keys().copied().collect();
        owned.sort_unstable();
        for sn in owned {
            self.close_owned(sn, libc::ECONNRESET);
        }

        // CONNECT and CLOSE still queued for a wpeer come back parked or bounced
        !self.wpeers.is_empty() && self.ports.wpeer_tx.send(TxCommand::Drain).is_ok()
    }

    fn finish_shutdown(&mut self) {
        for id in self.wpeers.ids() {
            self.wpeer_detached(id, libc::ECONNRESET);
        }
        for id in self.apps.ids() {
            self.app_detached(id);
        }
        for id in self.speers.ids() {
            self.speer_detached(id);
        }
        let count = self.registry.shutdown_all();
        if count > 0 {
            tracing::debug!(count, "sockets shut down");
        }
        for port in [&self.ports.app_tx, &self.ports.speer_tx, &self.ports.wpeer_tx] {
            post(port, TxCommand::Stop);
        }
    }
}
