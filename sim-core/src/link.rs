//! §4.1 Connection Link — a duplex, ordered, reliable carrier between two
//! endpoints. Built on a pair of `tokio::mpsc` channels, one per direction,
//! the same shape the corpus uses for actor mailboxes (`other_examples`
//! Torq `ActorRef`/`mpsc::UnboundedSender`). Per-direction FIFO is exactly
//! what `mpsc` already guarantees; we don't need to reinvent it.

use tokio::sync::mpsc;

use crate::error::LinkClosed;
use crate::packet::Packet;

/// One endpoint of a duplex link. Cloning a `Link` would let two senders race
/// on the same outbound half, which the spec forbids ("links are not shared
/// between multiple senders without external synchronization") — so `Link`
/// is deliberately not `Clone`; share it behind a task that owns it, or wrap
/// the send half in a mutex if genuinely multiple writers are needed.
pub struct Link {
    outbound: mpsc::UnboundedSender<Packet>,
    inbound: mpsc::UnboundedReceiver<Packet>,
}

/// Construct both ends of a duplex link in one call.
pub fn duplex() -> (Link, Link) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Link { outbound: a_tx, inbound: b_rx },
        Link { outbound: b_tx, inbound: a_rx },
    )
}

impl Link {
    /// Enqueue a packet for the peer. Fails only once the peer has dropped
    /// its receive half, i.e. the link is already closed from the far side.
    pub fn send(&self, packet: Packet) -> Result<(), LinkClosed> {
        self.outbound.send(packet).map_err(|_| LinkClosed)
    }

    /// Block until a packet arrives or the link is closed.
    pub async fn recv(&mut self) -> Result<Packet, LinkClosed> {
        self.inbound.recv().await.ok_or(LinkClosed)
    }

    /// Close this endpoint. Pending `recv` on the peer's side will then
    /// observe `LinkClosed` once its queue drains.
    pub fn close(&mut self) {
        self.inbound.close();
    }

    /// Split into a cloneable send half and an exclusively-owned receive
    /// half. The send half can be handed to every concurrent protocol call
    /// an agent makes; the receive half is owned by the single dispatch
    /// fiber that drains it.
    pub fn into_parts(self) -> (mpsc::UnboundedSender<Packet>, mpsc::UnboundedReceiver<Packet>) {
        (self.outbound, self.inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBody;
    use crate::types::AgentId;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (mut a, b) = duplex();
        for i in 0..5u32 {
            b.send(Packet::targeted(
                AgentId::new("b"),
                AgentId::new("a"),
                PacketBody::TickGrant { ticks: i },
            ))
            .unwrap();
        }
        for i in 0..5u32 {
            let p = a.recv().await.unwrap();
            match p.body {
                PacketBody::TickGrant { ticks } => assert_eq!(ticks, i),
                _ => panic!("unexpected body"),
            }
        }
    }

    #[tokio::test]
    async fn recv_fails_after_close() {
        let (mut a, mut b) = duplex();
        b.close();
        drop(b);
        assert!(matches!(a.recv().await, Err(LinkClosed)));
    }
}
