//! The land marketplace: one listing per `(seller, allocation)`, optionally
//! filtered by allocation when sampled.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use tracing::warn;

use crate::link::Link;
use crate::packet::{Packet, PacketBody};
use crate::types::{AgentId, LandListing};

use super::listing_store::ListingStore;

pub struct LandMarket {
    pub id: AgentId,
    store: Mutex<ListingStore<(AgentId, String), LandListing>>,
    checkpoint_dir: Mutex<Option<PathBuf>>,
}

impl LandMarket {
    pub fn new(id: AgentId) -> Arc<Self> {
        Arc::new(Self { id, store: Mutex::new(ListingStore::new()), checkpoint_dir: Mutex::new(None) })
    }

    pub fn with_checkpoint_dir(self: &Arc<Self>, dir: PathBuf) {
        *self.checkpoint_dir.lock() = Some(dir);
    }

    pub fn listing_count(&self) -> usize {
        self.store.lock().len()
    }

    pub fn snapshot(&self) -> Vec<LandListing> {
        self.store.lock().all_values()
    }

    pub fn restore(&self, listings: Vec<LandListing>) {
        self.store.lock().replace_all(listings, LandListing::identity);
    }

    pub async fn run(self: Arc<Self>, mut link: Link, mut rng: StdRng) {
        loop {
            let packet = match link.recv().await {
                Ok(p) => p,
                Err(_) => break,
            };
            if matches!(packet.body, PacketBody::KillPipeAgent) {
                break;
            }
            if let Err(e) = self.handle(&mut link, packet, &mut rng) {
                warn!(market = %self.id, error = %e, "land market dispatch error");
            }
        }
    }

    fn handle(
        &self,
        link: &mut Link,
        packet: Packet,
        rng: &mut StdRng,
    ) -> Result<(), crate::error::LinkClosed> {
        let sender = packet.sender.clone();
        match packet.body {
            PacketBody::LandMarketUpdate { listing } => {
                if listing.seller_id != sender {
                    return link.send(Packet::targeted(
                        self.id.clone(),
                        sender,
                        PacketBody::Error {
                            reason: crate::error::ProtocolError::Unauthorized(sender.clone()).to_string(),
                        },
                    ));
                }
                self.store.lock().upsert(listing.identity(), listing);
                Ok(())
            }
            PacketBody::LandMarketRemove { allocation } => {
                self.store.lock().remove(&(sender, allocation));
                Ok(())
            }
            PacketBody::LandMarketSample { allocation, sample_size } => {
                let listings = self.store.lock().sample(
                    |listing| allocation.as_deref().is_none_or(|a| a == listing.allocation),
                    sample_size,
                    rng,
                );
                link.send(Packet::targeted(
                    self.id.clone(),
                    sender,
                    PacketBody::LandMarketSampleAck { listings },
                ))
            }
            PacketBody::SaveCheckpoint | PacketBody::SaveCheckpointBroadcast { .. } => {
                let Some(dir) = self.checkpoint_dir.lock().clone() else {
                    warn!(market = %self.id, "save checkpoint requested but no checkpoint_dir configured");
                    return Ok(());
                };
                let listings = self.snapshot();
                if let Err(e) = crate::checkpoint::save_market(&dir, "land", &listings) {
                    warn!(market = %self.id, error = %e, "failed to save land market checkpoint");
                    return Ok(());
                }
                link.send(Packet::targeted(self.id.clone(), sender, PacketBody::SaveCheckpointAck))
            }
            PacketBody::LoadCheckpoint { .. } | PacketBody::LoadCheckpointBroadcast { .. } => {
                let Some(dir) = self.checkpoint_dir.lock().clone() else {
                    warn!(market = %self.id, "load checkpoint requested but no checkpoint_dir configured");
                    return Ok(());
                };
                match crate::checkpoint::load_market(&dir, "land") {
                    Ok(listings) => self.restore(listings),
                    Err(e) => warn!(market = %self.id, error = %e, "failed to load land market checkpoint"),
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(seller: &str, allocation: &str, hectares: f64) -> LandListing {
        LandListing {
            seller_id: AgentId::new(seller),
            allocation: allocation.into(),
            hectares,
            unit_price: 500,
        }
    }

    #[test]
    fn sample_with_no_allocation_filter_returns_everything() {
        let market = LandMarket::new(AgentId::new("land-market"));
        market.store.lock().upsert(listing("s1", "plains", 4.0).identity(), listing("s1", "plains", 4.0));
        market.store.lock().upsert(listing("s2", "hills", 2.0).identity(), listing("s2", "hills", 2.0));
        use rand::SeedableRng;
        let mut rng = StdRng::seed_from_u64(3);
        let sampled = market.store.lock().sample(|_| true, 10, &mut rng);
        assert_eq!(sampled.len(), 2);
    }

    #[test]
    fn sample_with_allocation_filter_restricts_results() {
        let market = LandMarket::new(AgentId::new("land-market"));
        market.store.lock().upsert(listing("s1", "plains", 4.0).identity(), listing("s1", "plains", 4.0));
        market.store.lock().upsert(listing("s2", "hills", 2.0).identity(), listing("s2", "hills", 2.0));
        use rand::SeedableRng;
        let mut rng = StdRng::seed_from_u64(3);
        let sampled = market.store.lock().sample(|l| l.allocation == "hills", 10, &mut rng);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].seller_id, AgentId::new("s2"));
    }

    #[tokio::test]
    async fn update_from_a_non_owner_is_rejected() {
        use rand::SeedableRng;
        let market = LandMarket::new(AgentId::new("land-market"));
        let (mut test_side, mut market_side) = crate::link::duplex();
        let mut rng = StdRng::seed_from_u64(3);

        let spoofed = Packet::targeted(
            AgentId::new("impostor"),
            AgentId::new("land-market"),
            PacketBody::LandMarketUpdate { listing: listing("s1", "plains", 4.0) },
        );
        market.handle(&mut market_side, spoofed, &mut rng).unwrap();
        let reply = test_side.recv().await.unwrap();
        assert!(matches!(reply.body, PacketBody::Error { .. }));
        assert!(market.snapshot().is_empty());
    }
}
