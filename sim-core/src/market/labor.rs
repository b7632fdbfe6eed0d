//! The labor marketplace: one listing per `(employer, listing_tag)`, sampled
//! by skill-level band.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use tracing::warn;

use crate::link::Link;
use crate::packet::{Packet, PacketBody};
use crate::types::{AgentId, LaborListing};

use super::listing_store::ListingStore;

pub struct LaborMarket {
    pub id: AgentId,
    store: Mutex<ListingStore<(AgentId, String), LaborListing>>,
    checkpoint_dir: Mutex<Option<PathBuf>>,
}

impl LaborMarket {
    pub fn new(id: AgentId) -> Arc<Self> {
        Arc::new(Self { id, store: Mutex::new(ListingStore::new()), checkpoint_dir: Mutex::new(None) })
    }

    pub fn with_checkpoint_dir(self: &Arc<Self>, dir: PathBuf) {
        *self.checkpoint_dir.lock() = Some(dir);
    }

    pub fn listing_count(&self) -> usize {
        self.store.lock().len()
    }

    pub fn snapshot(&self) -> Vec<LaborListing> {
        self.store.lock().all_values()
    }

    pub fn restore(&self, listings: Vec<LaborListing>) {
        self.store.lock().replace_all(listings, LaborListing::identity);
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
                warn!(market = %self.id, error = %e, "labor market dispatch error");
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
            PacketBody::LaborMarketUpdate { listing } => {
                if listing.employer_id != sender {
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
            PacketBody::LaborMarketRemove { listing_tag } => {
                self.store.lock().remove(&(sender, listing_tag));
                Ok(())
            }
            PacketBody::LaborMarketSample { min_skill, max_skill, sample_size } => {
                let listings = self.store.lock().sample(
                    |listing| listing.skill_level >= min_skill && listing.skill_level <= max_skill,
                    sample_size,
                    rng,
                );
                link.send(Packet::targeted(
                    self.id.clone(),
                    sender,
                    PacketBody::LaborMarketSampleAck { listings },
                ))
            }
            PacketBody::SaveCheckpoint | PacketBody::SaveCheckpointBroadcast { .. } => {
                let Some(dir) = self.checkpoint_dir.lock().clone() else {
                    warn!(market = %self.id, "save checkpoint requested but no checkpoint_dir configured");
                    return Ok(());
                };
                let listings = self.snapshot();
                if let Err(e) = crate::checkpoint::save_market(&dir, "labor", &listings) {
                    warn!(market = %self.id, error = %e, "failed to save labor market checkpoint");
                    return Ok(());
                }
                link.send(Packet::targeted(self.id.clone(), sender, PacketBody::SaveCheckpointAck))
            }
            PacketBody::LoadCheckpoint { .. } | PacketBody::LoadCheckpointBroadcast { .. } => {
                let Some(dir) = self.checkpoint_dir.lock().clone() else {
                    warn!(market = %self.id, "load checkpoint requested but no checkpoint_dir configured");
                    return Ok(());
                };
                match crate::checkpoint::load_market(&dir, "labor") {
                    Ok(listings) => self.restore(listings),
                    Err(e) => warn!(market = %self.id, error = %e, "failed to load labor market checkpoint"),
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

    fn listing(employer: &str, tag: &str, skill: f64) -> LaborListing {
        LaborListing {
            employer_id: AgentId::new(employer),
            listing_tag: tag.into(),
            skill_level: skill,
            wage_per_tick: 100,
            ticks_per_step: 8,
            contract_length: 10,
            applicants_considered: 0,
            last_updated: 0,
        }
    }

    #[test]
    fn sample_filters_by_skill_band() {
        let market = LaborMarket::new(AgentId::new("labor-market"));
        market.store.lock().upsert(listing("e1", "farmhand", 0.2).identity(), listing("e1", "farmhand", 0.2));
        market.store.lock().upsert(listing("e2", "mason", 0.8).identity(), listing("e2", "mason", 0.8));
        use rand::SeedableRng;
        let mut rng = StdRng::seed_from_u64(1);
        let sampled = market.store.lock().sample(|l| l.skill_level <= 0.5, 10, &mut rng);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].listing_tag, "farmhand");
    }

    #[tokio::test]
    async fn update_from_a_non_owner_is_rejected() {
        use rand::SeedableRng;
        let market = LaborMarket::new(AgentId::new("labor-market"));
        let (mut test_side, mut market_side) = crate::link::duplex();
        let mut rng = StdRng::seed_from_u64(1);

        let spoofed = Packet::targeted(
            AgentId::new("impostor"),
            AgentId::new("labor-market"),
            PacketBody::LaborMarketUpdate { listing: listing("e1", "farmhand", 0.2) },
        );
        market.handle(&mut market_side, spoofed, &mut rng).unwrap();
        let reply = test_side.recv().await.unwrap();
        assert!(matches!(reply.body, PacketBody::Error { .. }));
        assert!(market.snapshot().is_empty());
    }
}
