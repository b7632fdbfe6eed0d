//! §4.5 Simulation Manager — drives the two-level step/tick barrier.
//!
//! Each step: broadcast a tick grant, wait for the Network's `ADVANCE_STEP`
//! signal (raised once every tick-blocking subscriber has acked), optionally
//! broadcast a checkpoint request, then move to the next step. After the
//! configured step count the Manager halts new trades and tears the whole
//! simulation down.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::link::Link;
use crate::network::Network;
use crate::packet::{Packet, PacketBody};
use crate::types::AgentId;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub simulation_steps: u64,
    pub ticks_per_step: u32,
    pub checkpoint_frequency: Option<u64>,
    /// Wall-clock budget to wait for `ADVANCE_STEP` before giving up on a
    /// step (a misbehaving or deadlocked agent should not hang the process
    /// forever).
    pub step_timeout: Duration,
    /// Where to write the manager's own `manager.json` once a checkpoint
    /// step's acks are in (§6 persisted state: "one file ... for the
    /// manager"). `None` disables checkpointing even if `checkpoint_frequency`
    /// is set.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            simulation_steps: 100,
            ticks_per_step: 8,
            checkpoint_frequency: None,
            step_timeout: Duration::from_secs(30),
            checkpoint_dir: None,
        }
    }
}

/// Run the full simulation loop. Returns the step number actually reached,
/// which is `config.simulation_steps` on a clean run and something smaller
/// if a step timed out.
pub async fn run(manager_id: AgentId, network: &Network, mut link: Link, config: ManagerConfig) -> u64 {
    network.set_manager(manager_id.clone());

    let mut completed = 0u64;
    for step in 0..config.simulation_steps {
        info!(step, "granting ticks for step");
        link.send(Packet::broadcast(
            manager_id.clone(),
            PacketBody::TickGrantBroadcast { ticks: config.ticks_per_step },
        ))
        .ok();

        if !await_advance(&mut link, config.step_timeout).await {
            warn!(step, "step timed out waiting for ADVANCE_STEP; halting simulation");
            break;
        }
        completed = step + 1;

        if let Some(freq) = config.checkpoint_frequency {
            if freq > 0 && completed % freq == 0 {
                info!(step = completed, "broadcasting checkpoint request");
                link.send(Packet::broadcast(
                    manager_id.clone(),
                    PacketBody::SaveCheckpointBroadcast { step: completed },
                ))
                .ok();

                let expected: HashSet<AgentId> = network
                    .registered_agents()
                    .into_iter()
                    .filter(|id| id != &manager_id)
                    .collect();
                if !await_checkpoint_acks(&mut link, expected, config.step_timeout).await {
                    warn!(step = completed, "timed out waiting for checkpoint acks");
                }

                if let Some(dir) = &config.checkpoint_dir {
                    if let Err(e) = crate::checkpoint::save_manager(dir, completed) {
                        warn!(step = completed, error = %e, "failed to save manager checkpoint");
                    }
                }
            }
        }
    }

    info!(steps_completed = completed, "simulation run complete, tearing down");
    link.send(Packet::broadcast(manager_id.clone(), PacketBody::TerminateSimulation)).ok();
    link.send(Packet::broadcast(manager_id.clone(), PacketBody::KillAllBroadcast)).ok();
    completed
}

async fn await_advance(link: &mut Link, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, link.recv()).await {
            Ok(Ok(packet)) if matches!(packet.body, PacketBody::AdvanceStep) => return true,
            Ok(Ok(_)) => continue,
            Ok(Err(_)) | Err(_) => return false,
        }
    }
}

/// Wait until every id in `expected` has sent a `SaveCheckpointAck`, or the
/// timeout elapses. Acks from ids outside `expected` (e.g. a duplicate from a
/// slow retry) are tolerated and simply ignored.
async fn await_checkpoint_acks(link: &mut Link, mut expected: HashSet<AgentId>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !expected.is_empty() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, link.recv()).await {
            Ok(Ok(packet)) => {
                if matches!(packet.body, PacketBody::SaveCheckpointAck) {
                    expected.remove(&packet.sender);
                }
            }
            Ok(Err(_)) | Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;
    use crate::types::AgentId;

    #[tokio::test]
    async fn runs_the_configured_number_of_steps_with_no_subscribers() {
        // With no tick-blocking subscribers, the Network never emits
        // ADVANCE_STEP on its own; the manager must inject it itself here via
        // a short timeout, so this exercises the timeout-halts-the-run path.
        let network = Network::new();
        let manager_link = network.register(AgentId::new("manager"));
        let config = ManagerConfig {
            simulation_steps: 3,
            ticks_per_step: 4,
            checkpoint_frequency: None,
            step_timeout: Duration::from_millis(20),
            checkpoint_dir: None,
        };
        let completed = run(AgentId::new("manager"), &network, manager_link, config).await;
        assert_eq!(completed, 0);
    }

    #[tokio::test]
    async fn advances_when_all_subscribers_ack() {
        let network = Network::new();
        let manager_link = network.register(AgentId::new("manager"));
        let mut agent_link = network.register(AgentId::new("agent"));

        let config = ManagerConfig {
            simulation_steps: 1,
            ticks_per_step: 4,
            checkpoint_frequency: None,
            step_timeout: Duration::from_secs(2),
            checkpoint_dir: None,
        };

        agent_link
            .send(Packet::targeted(
                AgentId::new("agent"),
                AgentId::new("agent"),
                PacketBody::TickBlockSubscribe,
            ))
            .unwrap();
        tokio::task::yield_now().await;

        let acker = tokio::spawn(async move {
            let granted = agent_link.recv().await.unwrap();
            assert_eq!(granted.kind(), PacketKind::TickGrantBroadcast);
            agent_link
                .send(Packet::targeted(
                    AgentId::new("agent"),
                    AgentId::new("agent"),
                    PacketBody::TickBlocked,
                ))
                .unwrap();
            agent_link.recv().await.unwrap()
        });

        let completed = run(AgentId::new("manager"), &network, manager_link, config).await;
        assert_eq!(completed, 1);
        let ack = acker.await.unwrap();
        assert!(matches!(ack.body, PacketBody::TickBlockedAck));
    }
}
