use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use driftwood_proto::{Mode, ServerMessage};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Client frame forwarded to the partner exactly as it arrived.
    Relay(String),
    /// Liveness check, written as a websocket ping.
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Waiting,
    /// Already queued for this mode; the queue position is kept.
    AlreadyWaiting,
    Paired { partner: ConnectionId },
    /// The connection joined another mode earlier; mode is fixed per connection.
    ModeMismatch { joined: Mode },
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Unpaired { partner: ConnectionId },
    Dequeued,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { partner: ConnectionId },
    NoPartner,
    PartnerClosed,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchSnapshot {
    pub connections: usize,
    pub waiting_chat: usize,
    pub waiting_video: usize,
    pub pairs: usize,
}

/// Handle returned on registration; notified when the liveness monitor evicts
/// the connection so the socket task can drop the transport.
pub struct Registration {
    pub terminate: Arc<Notify>,
}

struct ConnectionEntry {
    sender: mpsc::UnboundedSender<Outbound>,
    terminate: Arc<Notify>,
    mode: Option<Mode>,
    alive: bool,
    role: Option<Role>,
}

impl ConnectionEntry {
    fn deliver(&self, outbound: Outbound) -> bool {
        !self.sender.is_closed() && self.sender.send(outbound).is_ok()
    }
}

#[derive(Default)]
struct MatchState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    chat_queue: VecDeque<ConnectionId>,
    video_queue: VecDeque<ConnectionId>,
    pairs: HashMap<ConnectionId, ConnectionId>,
}

/// Owns the connection registry, both waiting queues and the pairing table.
///
/// Every operation takes the single state lock for its whole duration and
/// never awaits while holding it, so queue and pairing updates are atomic with
/// respect to each other and to the liveness sweep. Notifications are pushed
/// into the per-connection channels under the same lock, which keeps their
/// order consistent with the order of the mutations that produced them.
#[derive(Clone, Default)]
pub struct Matchmaker {
    inner: Arc<Mutex<MatchState>>,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: ConnectionId,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Registration {
        let terminate = Arc::new(Notify::new());
        let mut state = self.inner.lock();
        state.connections.insert(
            id,
            ConnectionEntry {
                sender,
                terminate: Arc::clone(&terminate),
                mode: None,
                alive: true,
                role: None,
            },
        );
        gauge!("driftwood_road_connections_active", state.connections.len() as f64);
        Registration { terminate }
    }

    pub fn join(&self, id: ConnectionId, mode: Mode) -> JoinOutcome {
        let mut state = self.inner.lock();
        let Some(entry) = state.connections.get_mut(&id) else {
            return JoinOutcome::Unregistered;
        };
        match entry.mode {
            Some(joined) if joined != mode => return JoinOutcome::ModeMismatch { joined },
            _ => entry.mode = Some(mode),
        }

        if state.queue(mode).contains(&id) {
            return JoinOutcome::AlreadyWaiting;
        }
        if state.pairs.contains_key(&id) {
            // Re-join while paired ends the current pair first.
            state.unpair(id);
        }

        let outcome = match state.queue_mut(mode).pop_front() {
            Some(partner) => {
                state.pair(id, partner, mode);
                JoinOutcome::Paired { partner }
            }
            None => {
                state.queue_mut(mode).push_back(id);
                if let Some(entry) = state.connections.get(&id) {
                    entry.deliver(Outbound::Message(ServerMessage::Waiting));
                }
                debug!(connection_id = %id, mode = %mode, "connection waiting for a partner");
                JoinOutcome::Waiting
            }
        };
        state.record_gauges();
        outcome
    }

    pub fn leave(&self, id: ConnectionId) -> LeaveOutcome {
        let mut state = self.inner.lock();
        let outcome = state.detach(id);
        state.record_gauges();
        outcome
    }

    /// Tears the connection down and drops it from the registry. Returns
    /// `None` when the connection was already removed.
    pub fn disconnect(&self, id: ConnectionId) -> Option<LeaveOutcome> {
        let mut state = self.inner.lock();
        let outcome = state.remove(id);
        state.record_gauges();
        outcome
    }

    pub fn partner_of(&self, id: ConnectionId) -> Option<ConnectionId> {
        self.inner.lock().pairs.get(&id).copied()
    }

    pub fn role_of(&self, id: ConnectionId) -> Option<Role> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .and_then(|entry| entry.role)
    }

    pub fn is_waiting(&self, id: ConnectionId) -> bool {
        let state = self.inner.lock();
        state.chat_queue.contains(&id) || state.video_queue.contains(&id)
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(&id)
    }

    /// Forwards a frame to the sender's current partner if its transport is open.
    pub fn relay(&self, from: ConnectionId, outbound: Outbound) -> RelayOutcome {
        let state = self.inner.lock();
        let Some(partner) = state.pairs.get(&from).copied() else {
            return RelayOutcome::NoPartner;
        };
        let delivered = state
            .connections
            .get(&partner)
            .is_some_and(|entry| entry.deliver(outbound));
        if delivered {
            RelayOutcome::Delivered { partner }
        } else {
            RelayOutcome::PartnerClosed
        }
    }

    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(entry) = self.inner.lock().connections.get_mut(&id) {
            entry.alive = true;
        }
    }

    /// One liveness tick: evicts connections that never answered the previous
    /// ping, then pings everyone else.
    pub fn sweep(&self) -> SweepReport {
        let mut state = self.inner.lock();
        let mut report = SweepReport::default();

        for (id, entry) in state.connections.iter_mut() {
            if entry.alive {
                entry.alive = false;
                if entry.deliver(Outbound::Ping) {
                    report.pinged += 1;
                }
            } else {
                report.evicted.push(*id);
            }
        }

        for id in &report.evicted {
            if let Some(entry) = state.connections.get(id) {
                entry.terminate.notify_one();
            }
            state.remove(*id);
            counter!("driftwood_road_evictions_total", 1);
            info!(connection_id = %id, "evicted unresponsive connection");
        }

        state.record_gauges();
        report
    }

    /// Asks every open socket to close. Each socket task then runs its own
    /// `disconnect`. Returns how many connections were signalled.
    pub fn terminate_all(&self) -> usize {
        let state = self.inner.lock();
        for entry in state.connections.values() {
            entry.terminate.notify_one();
        }
        state.connections.len()
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        let state = self.inner.lock();
        MatchSnapshot {
            connections: state.connections.len(),
            waiting_chat: state.chat_queue.len(),
            waiting_video: state.video_queue.len(),
            pairs: state.pairs.len() / 2,
        }
    }
}

impl MatchState {
    fn queue(&self, mode: Mode) -> &VecDeque<ConnectionId> {
        match mode {
            Mode::Chat => &self.chat_queue,
            Mode::Video => &self.video_queue,
        }
    }

    fn queue_mut(&mut self, mode: Mode) -> &mut VecDeque<ConnectionId> {
        match mode {
            Mode::Chat => &mut self.chat_queue,
            Mode::Video => &mut self.video_queue,
        }
    }

    /// The newcomer initiates; the connection that waited longer responds.
    fn pair(&mut self, newcomer: ConnectionId, waiting: ConnectionId, mode: Mode) {
        self.pairs.insert(newcomer, waiting);
        self.pairs.insert(waiting, newcomer);

        for (id, role) in [(newcomer, Role::Initiator), (waiting, Role::Responder)] {
            if let Some(entry) = self.connections.get_mut(&id) {
                entry.role = Some(role);
                entry.deliver(Outbound::Message(ServerMessage::Paired {
                    initiator: role == Role::Initiator,
                }));
            }
        }

        counter!("driftwood_road_pairs_total", 1, "mode" => mode.as_str());
        info!(
            initiator = %newcomer,
            responder = %waiting,
            mode = %mode,
            "paired connections"
        );
    }

    /// Removes both sides of the pair atomically and tells the partner.
    fn unpair(&mut self, id: ConnectionId) -> Option<ConnectionId> {
        let partner = self.pairs.remove(&id)?;
        self.pairs.remove(&partner);

        if let Some(entry) = self.connections.get_mut(&id) {
            entry.role = None;
        }
        if let Some(entry) = self.connections.get_mut(&partner) {
            entry.role = None;
            entry.deliver(Outbound::Message(ServerMessage::PartnerLeft));
        }
        debug!(connection_id = %id, partner = %partner, "pair dissolved");
        Some(partner)
    }

    fn detach(&mut self, id: ConnectionId) -> LeaveOutcome {
        if let Some(partner) = self.unpair(id) {
            return LeaveOutcome::Unpaired { partner };
        }
        let before = self.chat_queue.len() + self.video_queue.len();
        self.chat_queue.retain(|queued| *queued != id);
        self.video_queue.retain(|queued| *queued != id);
        if self.chat_queue.len() + self.video_queue.len() < before {
            LeaveOutcome::Dequeued
        } else {
            LeaveOutcome::Idle
        }
    }

    fn remove(&mut self, id: ConnectionId) -> Option<LeaveOutcome> {
        if !self.connections.contains_key(&id) {
            return None;
        }
        let outcome = self.detach(id);
        self.connections.remove(&id);
        Some(outcome)
    }

    fn record_gauges(&self) {
        gauge!("driftwood_road_connections_active", self.connections.len() as f64);
        gauge!(
            "driftwood_road_waiting",
            self.chat_queue.len() as f64,
            "mode" => Mode::Chat.as_str()
        );
        gauge!(
            "driftwood_road_waiting",
            self.video_queue.len() as f64,
            "mode" => Mode::Video.as_str()
        );
        gauge!("driftwood_road_pairs_active", (self.pairs.len() / 2) as f64);
    }
}
