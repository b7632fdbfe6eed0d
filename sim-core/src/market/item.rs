//! The item marketplace: one listing per `(seller, item_id)`, sampled by
//! item id.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use tracing::warn;

use crate::link::Link;
use crate::packet::{Packet, PacketBody};
use crate::types::{AgentId, ItemListing};

use super::listing_store::ListingStore;

pub struct ItemMarket {
    pub id: AgentId,
    store: Mutex<ListingStore<(AgentId, String), ItemListing>>,
    checkpoint_dir: Mutex<Option<PathBuf>>,
}

impl ItemMarket {
    pub fn new(id: AgentId) -> Arc<Self> {
        Arc::new(Self { id, store: Mutex::new(ListingStore::new()), checkpoint_dir: Mutex::new(None) })
    }

    pub fn with_checkpoint_dir(self: &Arc<Self>, dir: PathBuf) {
        *self.checkpoint_dir.lock() = Some(dir);
    }

    pub fn listing_count(&self) -> usize {
        self.store.lock().len()
    }

    /// All current listings, for `saveCheckpoint` (§6 persisted state: "one
    /// file for each marketplace").
    pub fn snapshot(&self) -> Vec<ItemListing> {
        self.store.lock().all_values()
    }

    /// Replace every listing atomically, for `loadCheckpoint`.
    pub fn restore(&self, listings: Vec<ItemListing>) {
        self.store.lock().replace_all(listings, ItemListing::identity);
    }

    /// Drive the market's dispatch loop until the link closes or the
    /// simulation is torn down.
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
                warn!(market = %self.id, error = %e, "item market dispatch error");
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
            PacketBody::ItemMarketUpdate { listing } => {
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
            PacketBody::ItemMarketRemove { item_id } => {
                self.store.lock().remove(&(sender, item_id));
                Ok(())
            }
            PacketBody::ItemMarketSample { item_id, sample_size } => {
                let listings = self.store.lock().sample(
                    |listing| listing.item_id == item_id,
                    sample_size,
                    rng,
                );
                link.send(Packet::targeted(
                    self.id.clone(),
                    sender,
                    PacketBody::ItemMarketSampleAck { listings },
                ))
            }
            PacketBody::SaveCheckpoint | PacketBody::SaveCheckpointBroadcast { .. } => {
                let Some(dir) = self.checkpoint_dir.lock().clone() else {
                    warn!(market = %self.id, "save checkpoint requested but no checkpoint_dir configured");
                    return Ok(());
                };
                let listings = self.snapshot();
                if let Err(e) = crate::checkpoint::save_market(&dir, "item", &listings) {
                    warn!(market = %self.id, error = %e, "failed to save item market checkpoint");
                    return Ok(());
                }
                link.send(Packet::targeted(self.id.clone(), sender, PacketBody::SaveCheckpointAck))
            }
            PacketBody::LoadCheckpoint { .. } | PacketBody::LoadCheckpointBroadcast { .. } => {
                let Some(dir) = self.checkpoint_dir.lock().clone() else {
                    warn!(market = %self.id, "load checkpoint requested but no checkpoint_dir configured");
                    return Ok(());
                };
                match crate::checkpoint::load_market(&dir, "item") {
                    Ok(listings) => self.restore(listings),
                    Err(e) => warn!(market = %self.id, error = %e, "failed to load item market checkpoint"),
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
    use crate::types::Cents;

    fn listing(seller: &str, item: &str, price: Cents) -> ItemListing {
        ItemListing {
            seller_id: AgentId::new(seller),
            item_id: item.into(),
            unit_price: price,
            max_quantity: 100.0,
            last_updated: 0,
        }
    }

    #[test]
    fn sample_only_returns_listings_for_the_requested_item() {
        let market = ItemMarket::new(AgentId::new("item-market"));
        market.store.lock().upsert(listing("s1", "wheat", 10).identity(), listing("s1", "wheat", 10));
        market.store.lock().upsert(listing("s2", "stone", 5).identity(), listing("s2", "stone", 5));
        use rand::SeedableRng;
        let mut rng = StdRng::seed_from_u64(1);
        let sampled = market.store.lock().sample(|l| l.item_id == "wheat", 10, &mut rng);
        assert_eq!(sampled.len(), 1);
        assert_eq!(sampled[0].seller_id, AgentId::new("s1"));
    }

    #[tokio::test]
    async fn update_from_a_non_owner_is_rejected() {
        use rand::SeedableRng;
        let market = ItemMarket::new(AgentId::new("item-market"));
        let (mut test_side, mut market_side) = crate::link::duplex();
        let mut rng = StdRng::seed_from_u64(1);

        // "impostor" claims to be updating s1's listing.
        let spoofed = Packet::targeted(
            AgentId::new("impostor"),
            AgentId::new("item-market"),
            PacketBody::ItemMarketUpdate { listing: listing("s1", "wheat", 1) },
        );
        market.handle(&mut market_side, spoofed, &mut rng).unwrap();
        let reply = test_side.recv().await.unwrap();
        assert!(matches!(reply.body, PacketBody::Error { .. }));
        assert!(market.snapshot().is_empty());
    }
}
