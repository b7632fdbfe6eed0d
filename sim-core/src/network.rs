//! §4.2 Connection Network — routes packets between every registered agent,
//! forwards snooped traffic to observers, and counts down the tick-blocking
//! quorum for the Simulation Manager.
//!
//! One dedicated tokio task drains each registered agent's outbound half of
//! its link and calls into `NetworkState::route`, which holds the registry
//! and snoop table behind `parking_lot::Mutex`es (short, non-async critical
//! sections — the send itself is a non-blocking `mpsc` push). This mirrors
//! the single-dispatcher-over-many-readers shape used for actor mailboxes in
//! the corpus (`other_examples` Torq `ActorSystem`), generalized here to a
//! star topology rooted at the Network rather than a supervision tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::link::{Link, duplex};
use crate::packet::{Destination, Packet, PacketBody, PacketKind};
use crate::types::AgentId;

struct Registry {
    /// Outbound half the Network uses to reach each agent.
    links: HashMap<AgentId, mpsc::UnboundedSender<Packet>>,
    /// packet kind -> observers that receive a forwarded copy of that kind.
    snoop: HashMap<PacketKind, HashSet<AgentId>>,
    /// Agents that asked to be blocked on at the step barrier.
    tick_subscribers: HashSet<AgentId>,
    /// Subset of `tick_subscribers` that has acked `TICK_BLOCKED` this step.
    tick_pending: HashSet<AgentId>,
    observer_id: Option<AgentId>,
    manager_id: Option<AgentId>,
}

impl Registry {
    fn new() -> Self {
        Self {
            links: HashMap::new(),
            snoop: HashMap::new(),
            tick_subscribers: HashSet::new(),
            tick_pending: HashSet::new(),
            observer_id: None,
            manager_id: None,
        }
    }
}

/// Shared handle to the routing fabric. Cheap to clone — every clone refers
/// to the same registry and snoop table.
#[derive(Clone)]
pub struct Network {
    state: Arc<Mutex<Registry>>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(Registry::new())) }
    }

    /// Declare which agent id is the statistics observer: only packets from
    /// this id may mutate the snoop table (§4.2 rule 5).
    pub fn set_observer(&self, id: AgentId) {
        self.state.lock().observer_id = Some(id);
    }

    /// Declare which agent id is the Simulation Manager: `ADVANCE_STEP`
    /// signals are routed here once the tick-blocking quorum closes.
    pub fn set_manager(&self, id: AgentId) {
        self.state.lock().manager_id = Some(id);
    }

    /// Register a new agent (or marketplace — they are peers reached by
    /// well-known id) and return its side of the duplex link. Spawns the
    /// dedicated reader task that drains the Network-side link.
    pub fn register(&self, agent_id: AgentId) -> Link {
        let (network_side, agent_side) = duplex();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        // `network_side` is moved into the reader task below; we keep a
        // separate raw sender in the registry so other readers can reach
        // this agent directly without going through its own reader task.
        self.state.lock().links.insert(agent_id.clone(), outbound_tx);

        let state = self.state.clone();
        let id = agent_id.clone();
        tokio::spawn(async move {
            let mut link = network_side;
            // Pump: anything handed to this agent's registry sender gets
            // forwarded out over the real link to the agent's process.
            let forward_id = id.clone();
            let forward_state = state.clone();
            tokio::spawn(async move {
                while let Some(packet) = outbound_rx.recv().await {
                    if let Err(_closed) = deliver_raw(&forward_state, &forward_id, packet) {
                        break;
                    }
                }
            });
            loop {
                match link.recv().await {
                    Ok(packet) => route(&state, packet),
                    Err(_closed) => {
                        state.lock().links.remove(&id);
                        debug!(agent = %id, "reader exiting: link closed");
                        break;
                    }
                }
            }
        });
        agent_side
    }

    /// Direct injection used by the Manager / test harnesses that hold a
    /// `Network` handle without a full agent registration.
    pub fn route_packet(&self, packet: Packet) {
        route(&self.state, packet);
    }

    pub fn registered_agents(&self) -> Vec<AgentId> {
        self.state.lock().links.keys().cloned().collect()
    }

    pub fn is_registered(&self, id: &AgentId) -> bool {
        self.state.lock().links.contains_key(id)
    }
}

/// Deliver a packet directly into `id`'s registry sender (used for the
/// network-to-agent hop once routing has decided on a destination).
fn deliver_raw(state: &Arc<Mutex<Registry>>, id: &AgentId, packet: Packet) -> Result<(), ()> {
    let sender = { state.lock().links.get(id).cloned() };
    match sender {
        Some(s) => s.send(packet).map_err(|_| ()),
        None => Err(()),
    }
}

fn send_error(state: &Arc<Mutex<Registry>>, to: &AgentId, reason: String) {
    let _ = deliver_raw(
        state,
        to,
        Packet::targeted(
            AgentId::new("__network__"),
            to.clone(),
            PacketBody::Error { reason },
        ),
    );
}

/// The core routing decision of §4.2, rules 1-5, run synchronously under the
/// registry lock (routing never awaits, so the critical section is short
/// even though many reader tasks contend on it).
fn route(state: &Arc<Mutex<Registry>>, packet: Packet) {
    let kind = packet.kind();

    // Rule 1: snoop forwarding, self-snoop suppressed, copies marked
    // non-incoming so an observer can never create a feedback loop.
    if packet.incoming {
        let observers: Vec<AgentId> = {
            let reg = state.lock();
            reg.snoop
                .get(&kind)
                .map(|set| {
                    set.iter()
                        .filter(|o| **o != packet.sender)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        for observer in observers {
            let mut copy = packet.clone();
            copy.incoming = false;
            let _ = deliver_raw(state, &observer, copy);
        }
    }

    // Rule 2: tear down a link.
    if matches!(kind, PacketKind::KillPipeNetwork) {
        let mut reg = state.lock();
        reg.links.remove(&packet.sender);
        reg.tick_subscribers.remove(&packet.sender);
        reg.tick_pending.remove(&packet.sender);
        return;
    }

    // Rule 5: snoop table mutation, only from the statistics observer.
    if let PacketBody::SnoopStart { packet_kinds } = &packet.body {
        let mut reg = state.lock();
        if reg.observer_id.as_ref() != Some(&packet.sender) {
            drop(reg);
            send_error(
                state,
                &packet.sender,
                ProtocolError::SnoopNotAuthorized.to_string(),
            );
            return;
        }
        for k in packet_kinds {
            reg.snoop.entry(*k).or_default().insert(packet.sender.clone());
        }
        return;
    }

    // Tick-blocking quorum bookkeeping (§4.2 rule-adjacent, §4.5 step 2).
    match &packet.body {
        PacketBody::TickBlockSubscribe => {
            state.lock().tick_subscribers.insert(packet.sender.clone());
            return;
        }
        PacketBody::TickGrantBroadcast { .. } => {
            state.lock().tick_pending.clear();
        }
        PacketBody::TickBlocked => {
            let (manager_id, advance) = {
                let mut reg = state.lock();
                reg.tick_pending.insert(packet.sender.clone());
                let advance = !reg.tick_subscribers.is_empty()
                    && reg.tick_subscribers.is_subset(&reg.tick_pending);
                (reg.manager_id.clone(), advance)
            };
            let _ = deliver_raw(
                state,
                &packet.sender,
                Packet::targeted(
                    AgentId::new("__network__"),
                    packet.sender.clone(),
                    PacketBody::TickBlockedAck,
                ),
            );
            if advance {
                if let Some(manager) = manager_id {
                    let _ = deliver_raw(
                        state,
                        &manager,
                        Packet::targeted(
                            AgentId::new("__network__"),
                            manager,
                            PacketBody::AdvanceStep,
                        ),
                    );
                }
            }
            return;
        }
        _ => {}
    }

    // Rule 3/4: broadcast vs targeted delivery.
    match &packet.destination {
        Destination::Broadcast => {
            let targets: Vec<AgentId> = {
                let reg = state.lock();
                reg.links.keys().filter(|a| **a != packet.sender).cloned().collect()
            };
            for target in targets {
                let mut copy = packet.clone();
                copy.destination = Destination::Agent(target.clone());
                let _ = deliver_raw(state, &target, copy);
            }
        }
        Destination::Agent(dest) => {
            if !state.lock().links.contains_key(dest) {
                warn!(destination = %dest, "undeliverable packet");
                send_error(
                    state,
                    &packet.sender,
                    ProtocolError::UnknownDestination(dest.clone()).to_string(),
                );
                return;
            }
            let dest = dest.clone();
            let _ = deliver_raw(state, &dest, packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBody;

    #[tokio::test]
    async fn targeted_delivery() {
        let net = Network::new();
        let mut a = net.register(AgentId::new("a"));
        let mut b = net.register(AgentId::new("b"));

        a.send(Packet::targeted(
            AgentId::new("a"),
            AgentId::new("b"),
            PacketBody::TickBlockSubscribe,
        ))
        .unwrap();

        let got = b.recv().await.unwrap();
        assert!(matches!(got.body, PacketBody::TickBlockSubscribe));
    }

    #[tokio::test]
    async fn unknown_destination_gets_error_reply() {
        let net = Network::new();
        let mut a = net.register(AgentId::new("a"));
        a.send(Packet::targeted(
            AgentId::new("a"),
            AgentId::new("ghost"),
            PacketBody::TickBlockSubscribe,
        ))
        .unwrap();
        let got = a.recv().await.unwrap();
        assert!(matches!(got.body, PacketBody::Error { .. }));
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let net = Network::new();
        let mut a = net.register(AgentId::new("a"));
        let mut b = net.register(AgentId::new("b"));
        let mut c = net.register(AgentId::new("c"));

        a.send(Packet::broadcast(AgentId::new("a"), PacketBody::ControllerStartBroadcast))
            .unwrap();

        let got_b = b.recv().await.unwrap();
        let got_c = c.recv().await.unwrap();
        assert!(matches!(got_b.body, PacketBody::ControllerStartBroadcast));
        assert!(matches!(got_c.body, PacketBody::ControllerStartBroadcast));
        assert!(a.recv_timeout().await.is_none());
    }

    #[tokio::test]
    async fn snoop_forwards_marked_non_incoming_and_suppresses_self() {
        let net = Network::new();
        net.set_observer(AgentId::new("obs"));
        let mut obs = net.register(AgentId::new("obs"));
        let mut a = net.register(AgentId::new("a"));
        let mut b = net.register(AgentId::new("b"));

        obs.send(Packet::targeted(
            AgentId::new("obs"),
            AgentId::new("obs"),
            PacketBody::SnoopStart { packet_kinds: vec![PacketKind::TradeReqAck] },
        ))
        .unwrap();
        // Give the registry a tick to apply the snoop-table mutation.
        tokio::task::yield_now().await;

        b.send(Packet::targeted(
            AgentId::new("b"),
            AgentId::new("a"),
            PacketBody::TradeReqAck { accepted: true },
        ))
        .unwrap();

        let direct = a.recv().await.unwrap();
        assert!(matches!(direct.body, PacketBody::TradeReqAck { .. }));
        let snooped = obs.recv().await.unwrap();
        assert!(matches!(snooped.body, PacketBody::TradeReqAck { .. }));
        assert!(!snooped.incoming);
    }
}

/// Test-only helper so assertions can check "nothing arrived" without
/// hanging forever on an unbounded channel.
#[cfg(test)]
impl Link {
    async fn recv_timeout(&mut self) -> Option<Packet> {
        tokio::time::timeout(std::time::Duration::from_millis(50), self.recv())
            .await
            .ok()
            .and_then(|r| r.ok())
    }
}
