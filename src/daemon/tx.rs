//! Tx dispatch threads
//!
//! One dispatcher per egress direction (apps, speers, wpeers). Each owns the
//! write side of every link in its direction and assigns the sequence numbers
//! of the requests it sends, so numbers are gap-free and increasing per link.
//! Requests are parked in the link's correlation table before the frame is
//! written, so a fast reply always finds its task.

use crate::daemon::handle::ConnId;
use crate::daemon::link::Link;
use crate::daemon::protocol::{encode_message, AppMessage, PeerMessage, Seq};
use crate::daemon::serializer::Event;
use crate::daemon::task::{Stage, UnifiedTask};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Commands accepted by a Tx dispatcher
pub enum TxCommand {
    /// Start serving a link; registering an id twice is a broker bug
    Register { id: ConnId, link: Arc<Link> },
    /// Stop serving a link and fail it once earlier sends are written
    Unregister(ConnId),
    Send { to: ConnId, task: Box<UnifiedTask> },
    /// Report [`Event::TxDrained`] once every earlier command is processed
    Drain,
    Stop,
}

/// What a task wants written
pub enum Outbound<M> {
    /// Fresh request: the dispatcher assigns the sequence number and parks
    Request(M),
    /// Reply echoing the requester's sequence number
    Response { msg: M, seq: Seq },
}

/// Per-direction message selection
pub trait Egress: Send + 'static {
    const DIRECTION: &'static str;
    type Msg: Serialize + fmt::Debug;

    fn take_outbound(task: &mut UnifiedTask) -> Option<Outbound<Self::Msg>>;

    /// Remember the sequence number assigned to a request
    fn record_seq(task: &mut UnifiedTask, seq: Seq);
}

/// Dispatcher direction: local applications
pub struct ToApp;
/// Dispatcher direction: inbound peer connections (responses only)
pub struct ToSpeer;
/// Dispatcher direction: outbound peer connections (requests only)
pub struct ToWpeer;

impl Egress for ToApp {
    const DIRECTION: &'static str = "app";
    type Msg = AppMessage;

    fn take_outbound(task: &mut UnifiedTask) -> Option<Outbound<AppMessage>> {
        let msg = task.app_out.take()?;
        if task.stage() == Stage::AppRequestSent {
            Some(Outbound::Request(msg))
        } else {
            Some(Outbound::Response { msg, seq: task.app_seq })
        }
    }

    fn record_seq(task: &mut UnifiedTask, seq: Seq) {
        task.app_seq = seq;
    }
}

impl Egress for ToSpeer {
    const DIRECTION: &'static str = "speer";
    type Msg = PeerMessage;

    fn take_outbound(task: &mut UnifiedTask) -> Option<Outbound<PeerMessage>> {
        let msg = task.peer_out.take()?;
        Some(Outbound::Response { msg, seq: task.peer_seq })
    }

    fn record_seq(task: &mut UnifiedTask, seq: Seq) {
        task.peer_seq = seq;
    }
}

impl Egress for ToWpeer {
    const DIRECTION: &'static str = "wpeer";
    type Msg = PeerMessage;

    fn take_outbound(task: &mut UnifiedTask) -> Option<Outbound<PeerMessage>> {
        task.peer_out.take().map(Outbound::Request)
    }

    fn record_seq(task: &mut UnifiedTask, seq: Seq) {
        task.peer_seq = seq;
    }
}

struct TxLink {
    link: Arc<Link>,
    next_seq: Seq,
}

impl TxLink {
    fn next_seq(&mut self) -> Seq {
        let seq = self.next_seq;
        // 0 is reserved for the peer handshake
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }
}

/// Single-consumer sender for one direction
pub struct TxDispatcher<E: Egress> {
    links: HashMap<ConnId, TxLink>,
    events: Sender<Event>,
    _egress: PhantomData<E>,
}

impl<E: Egress> TxDispatcher<E> {
    pub fn new(events: Sender<Event>) -> Self {
        Self {
            links: HashMap::new(),
            events,
            _egress: PhantomData,
        }
    }

    /// Run the dispatcher on its own thread
    pub fn spawn(commands: Receiver<TxCommand>, events: Sender<Event>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("rsktd-tx-{}", E::DIRECTION))
            .spawn(move || Self::new(events).run(commands))
    }

    pub fn run(mut self, commands: Receiver<TxCommand>) {
        while let Ok(command) = commands.recv() {
            if !self.handle(command) {
                break;
            }
        }
        tracing::debug!(direction = E::DIRECTION, "tx dispatcher stopped");
    }

    /// Process one command; `false` once stopped
    pub fn handle(&mut self, command: TxCommand) -> bool {
        match command {
            TxCommand::Register { id, link } => {
                if self.links.contains_key(&id) {
                    panic!("duplicate {} tx registration for {}", E::DIRECTION, id);
                }
                self.links.insert(id, TxLink { link, next_seq: 1 });
            }
            TxCommand::Unregister(id) => {
                if let Some(entry) = self.links.remove(&id) {
                    entry.link.fail();
                }
            }
            TxCommand::Send { to, task } => self.send(to, task),
            TxCommand::Drain => {
                if self.events.send(Event::TxDrained(E::DIRECTION)).is_err() {
                    tracing::debug!(direction = E::DIRECTION, "serializer gone, drain not reported");
                }
            }
            TxCommand::Stop => return false,
        }
        true
    }

    fn send(&mut self, to: ConnId, mut task: Box<UnifiedTask>) {
        let Some(outbound) = E::take_outbound(&mut task) else {
            tracing::error!(direction = E::DIRECTION, ?task, "task has nothing to send");
            return;
        };

        let Some(entry) = self.links.get_mut(&to) else {
            match outbound {
                Outbound::Request(_) => self.bounce(task, libc::ECONNRESET),
                Outbound::Response { .. } => {
                    tracing::debug!(direction = E::DIRECTION, conn = %to, "response for departed link dropped");
                }
            }
            return;
        };

        match outbound {
            Outbound::Response { msg, seq } => {
                let frame = match encode_message(&msg, seq) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(direction = E::DIRECTION, ?msg, "cannot encode response: {}", e);
                        return;
                    }
                };
                if let Err(e) = entry.link.write_frame(&frame) {
                    tracing::warn!(link = %entry.link.label(), "send failed: {}", e);
                    entry.link.fail();
                }
                // Response written: the task is complete and dropped here
            }
            Outbound::Request(msg) => {
                let seq = entry.next_seq();
                let frame = match encode_message(&msg, seq) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(direction = E::DIRECTION, ?msg, "cannot encode request: {}", e);
                        self.bounce(task, libc::EINVAL);
                        return;
                    }
                };
                E::record_seq(&mut task, seq);
                let link = entry.link.clone();
                if let Err(task) = link.pending().park(seq, task) {
                    self.bounce(task, libc::ECONNRESET);
                    return;
                }
                if let Err(e) = link.write_frame(&frame) {
                    // Parked task is failed when the serializer drains the link
                    tracing::warn!(link = %link.label(), seq, "send failed: {}", e);
                    link.fail();
                }
            }
        }
    }

    /// Return a request that could not be sent to the serializer, failed
    fn bounce(&self, mut task: Box<UnifiedTask>, err: i32) {
        task.fail(err);
        if self.events.send(Event::Task(task)).is_err() {
            tracing::debug!(direction = E::DIRECTION, "serializer gone, failed task dropped");
        }
    }
}
