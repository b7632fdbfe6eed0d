//! §4.3 Agent Runtime — the generic per-agent machine. One reader fiber
//! drains the link and dispatches to handlers; controller-initiated outbound
//! protocols run concurrently by sending through the cloned outbound half.
//! Each field family (`balance`, `inventory`, `land`, `contracts`,
//! `accounting`, `ticks`, `nutrition`) sits behind its own `parking_lot`
//! lock, so unrelated mutations never contend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use uuid::Uuid;

use crate::collaborators::Controller;
use crate::error::LinkClosed;
use crate::link::Link;
use crate::packet::{Packet, PacketBody};
use crate::types::{AgentId, Cents, Inventory, ItemContainer, LandHoldings, LaborContract};

use super::accounting::{AccountingLedger, DEFAULT_ALPHA};
use super::nutrition::NutritionState;
use super::protocols;
use super::state::AgentState;
use super::transactions::TransactionTable;

/// Everything the runtime needs to run one agent, minus the controller
/// (which is owned by the dispatch loop since only it calls into it).
pub struct AgentRuntime {
    pub id: AgentId,
    pub balance: Mutex<Cents>,
    pub inventory: Mutex<Inventory>,
    pub land: Mutex<LandHoldings>,
    pub contracts_as_employer: Mutex<Vec<LaborContract>>,
    pub contracts_as_worker: Mutex<Vec<LaborContract>>,
    pub ticks_remaining: Mutex<u32>,
    /// Steps observed via `TICK_GRANT[_BROADCAST]` so far. Every agent
    /// advances this in lockstep with the Manager's barrier, so it doubles
    /// as the step number to tag statistics rows with (§6 CSV output).
    pub current_step: Mutex<u64>,
    pub nutrition: Mutex<Option<NutritionState>>,
    pub accounting: Mutex<AccountingLedger>,
    pub transactions: TransactionTable,
    pub transaction_timeout: Duration,
    pub checkpoint_dir: Mutex<Option<PathBuf>>,
    /// Item reserved for a buyer pending that trade's currency leg, keyed by
    /// the trade's transaction id (§4.3.3).
    pub trade_reservations: Mutex<HashMap<Uuid, (AgentId, ItemContainer)>>,
    /// Same, for land trades (§4.3.4): `(buyer, allocation, hectares)`.
    pub land_reservations: Mutex<HashMap<Uuid, (AgentId, String, f64)>>,
    /// Signalled once the item/land leg of a trade has actually landed in
    /// the buyer's holdings, so `trade`/`land_trade` can wait for full
    /// settlement rather than just the currency ack. Registered before the
    /// currency leg is sent, so there is no race with the seller's reply.
    deliveries: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    /// Well-known marketplace ids this agent can reach (§4.3.7). Set once at
    /// bootstrap; a plain `Mutex` rather than a constructor argument so
    /// `new` doesn't have to thread three more parameters through every
    /// caller that doesn't need marketplaces at all.
    pub item_market: Mutex<Option<AgentId>>,
    pub labor_market: Mutex<Option<AgentId>>,
    pub land_market: Mutex<Option<AgentId>>,
    /// This agent's own published item listings, cached locally so a
    /// `TRADE_REQ` can be re-validated against the advertised price and
    /// `maxQuantity` without a round trip to the marketplace (§9 open
    /// question: the seller re-validates its own listing before accepting).
    own_item_listings: Mutex<HashMap<String, crate::types::ItemListing>>,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl AgentRuntime {
    pub fn new(
        id: AgentId,
        initial_balance: Cents,
        link: Link,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        let (outbound, inbound) = link.into_parts();
        let runtime = Arc::new(Self {
            id,
            balance: Mutex::new(initial_balance),
            inventory: Mutex::new(Inventory::new()),
            land: Mutex::new(LandHoldings::new()),
            contracts_as_employer: Mutex::new(Vec::new()),
            contracts_as_worker: Mutex::new(Vec::new()),
            ticks_remaining: Mutex::new(0),
            current_step: Mutex::new(0),
            nutrition: Mutex::new(None),
            accounting: Mutex::new(AccountingLedger::default()),
            transactions: TransactionTable::new(),
            transaction_timeout: super::transactions::DEFAULT_TRANSACTION_TIMEOUT,
            checkpoint_dir: Mutex::new(None),
            trade_reservations: Mutex::new(HashMap::new()),
            land_reservations: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            item_market: Mutex::new(None),
            labor_market: Mutex::new(None),
            land_market: Mutex::new(None),
            own_item_listings: Mutex::new(HashMap::new()),
            outbound,
        });
        (runtime, inbound)
    }

    /// Point this agent at the marketplace ids it should use for listing and
    /// sampling operations (§4.3.7).
    pub fn set_markets(
        &self,
        item_market: Option<AgentId>,
        labor_market: Option<AgentId>,
        land_market: Option<AgentId>,
    ) {
        *self.item_market.lock() = item_market;
        *self.labor_market.lock() = labor_market;
        *self.land_market.lock() = land_market;
    }

    /// Cache this agent's own listing locally so an incoming `TRADE_REQ` can
    /// be re-validated against it without a marketplace round trip (§9 open
    /// question: the seller re-validates before accepting).
    pub fn cache_item_listing(&self, listing: crate::types::ItemListing) {
        self.own_item_listings.lock().insert(listing.item_id.clone(), listing);
    }

    /// Forget a cached listing once it's withdrawn.
    pub fn forget_item_listing(&self, item_id: &str) {
        self.own_item_listings.lock().remove(item_id);
    }

    /// This agent's cached listing for `item_id`, if it currently advertises
    /// one.
    pub fn cached_item_listing(&self, item_id: &str) -> Option<crate::types::ItemListing> {
        self.own_item_listings.lock().get(item_id).cloned()
    }

    /// Register interest in a delivery confirmation before sending the
    /// currency leg that will trigger it.
    pub fn register_delivery(&self, id: Uuid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.deliveries.lock().insert(id, tx);
        rx
    }

    /// Called once the item/land transfer for `id` has been credited.
    pub fn signal_delivery(&self, id: Uuid) {
        if let Some(tx) = self.deliveries.lock().remove(&id) {
            let _ = tx.send(());
        }
    }

    pub fn with_checkpoint_dir(self: &Arc<Self>, dir: PathBuf) {
        *self.checkpoint_dir.lock() = Some(dir);
    }

    pub fn send(&self, packet: Packet) -> Result<(), LinkClosed> {
        self.outbound.send(packet).map_err(|_| LinkClosed)
    }

    /// Snapshot the full `AgentState`, taking each field-family lock in turn.
    /// Used for `INFO_RESP` and checkpointing; never held across an `.await`.
    pub fn snapshot(&self) -> AgentState {
        AgentState {
            balance: *self.balance.lock(),
            inventory: self.inventory.lock().clone(),
            land_holdings: self.land.lock().clone(),
            labor_contracts_as_employer: self.contracts_as_employer.lock().clone(),
            labor_contracts_as_worker: self.contracts_as_worker.lock().clone(),
            ticks_remaining: *self.ticks_remaining.lock(),
            nutrition: self.nutrition.lock().clone(),
            accounting: self.accounting.lock().clone(),
        }
    }

    /// Replace the full state (`loadCheckpoint`), taking every lock in turn.
    pub fn restore(&self, state: AgentState) {
        *self.balance.lock() = state.balance;
        *self.inventory.lock() = state.inventory;
        *self.land.lock() = state.land_holdings;
        *self.contracts_as_employer.lock() = state.labor_contracts_as_employer;
        *self.contracts_as_worker.lock() = state.labor_contracts_as_worker;
        *self.ticks_remaining.lock() = state.ticks_remaining;
        *self.nutrition.lock() = state.nutrition;
        *self.accounting.lock() = state.accounting;
    }

    pub fn close_step_accounting(&self, alpha: f64) {
        self.accounting.lock().close_step(alpha);
    }

    pub fn current_step(&self) -> u64 {
        *self.current_step.lock()
    }
}

/// Drive the dispatch loop for one agent: read packets, hand acks to the
/// transaction table, hand everything else to `protocols::respond_to_packet`.
/// Runs until the link closes or a `KILL_PIPE_AGENT` is observed.
pub async fn run_dispatch_loop(
    runtime: Arc<AgentRuntime>,
    mut inbound: mpsc::UnboundedReceiver<Packet>,
    mut controller: Box<dyn Controller>,
) {
    controller.on_start().await;
    while let Some(packet) = inbound.recv().await {
        controller.on_packet(&packet.body).await;
        if matches!(packet.body, PacketBody::KillPipeAgent) {
            runtime.transactions.cancel_all();
            break;
        }
        if let Some(tx_id) = packet.transaction_id {
            if is_ack(&packet.body) && runtime.transactions.resolve(tx_id, packet.body.clone()) {
                continue;
            }
        }
        if let PacketBody::TickGrantBroadcast { ticks } | PacketBody::TickGrant { ticks } =
            &packet.body
        {
            *runtime.ticks_remaining.lock() = *ticks;
            *runtime.current_step.lock() += 1;
            crate::statistics::record_accounting_step(&runtime);
            runtime.close_step_accounting(DEFAULT_ALPHA);
            controller.on_tick_grant(*ticks).await;
            // §4.3.9: decay/auto-eat runs as its own task — it issues trade
            // requests whose acks this same reader fiber needs to observe,
            // so it must not block the loop that would resolve them.
            if runtime.nutrition.lock().is_some() {
                let nutrition_runtime = runtime.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        protocols::run_step_nutrition(&nutrition_runtime, protocols::AUTO_EAT_SAMPLE_SIZE)
                            .await
                    {
                        warn!(agent = %nutrition_runtime.id, error = %e, "auto-eat failed");
                    }
                });
            }
        }
        if matches!(
            packet.body,
            PacketBody::SaveCheckpoint | PacketBody::SaveCheckpointBroadcast { .. }
        ) {
            handle_save_checkpoint(&runtime, controller.as_ref(), &packet.sender);
            continue;
        }
        if let PacketBody::LoadCheckpoint { .. } | PacketBody::LoadCheckpointBroadcast { .. } =
            &packet.body
        {
            handle_load_checkpoint(&runtime, controller.as_mut());
            continue;
        }
        if let Err(e) = protocols::respond_to_packet(&runtime, controller.as_mut(), packet).await {
            warn!(agent = %runtime.id, error = %e, "error responding to packet");
        }
    }
}

/// §4.3.10 `saveCheckpoint`: serialize the full agent state plus the
/// controller's opaque blob. Only reachable from inside the dispatch loop,
/// which is the sole place that owns both `runtime` and `controller`
/// (§4.5: the Manager only broadcasts this while every tick-blocking agent
/// is blocked, so there is no concurrent mutation to race with the snapshot).
fn handle_save_checkpoint(runtime: &Arc<AgentRuntime>, controller: &dyn Controller, ack_to: &AgentId) {
    let Some(dir) = runtime.checkpoint_dir.lock().clone() else {
        warn!(agent = %runtime.id, "save checkpoint requested but no checkpoint_dir configured");
        return;
    };
    let state = runtime.snapshot();
    let blob = controller.save_state();
    if let Err(e) = crate::checkpoint::save_agent(&dir, &runtime.id, &state, &blob) {
        warn!(agent = %runtime.id, error = %e, "failed to save agent checkpoint");
        return;
    }
    let _ = runtime.send(Packet::targeted(
        runtime.id.clone(),
        ack_to.clone(),
        PacketBody::SaveCheckpointAck,
    ));
}

/// §4.3.10 `loadCheckpoint`: replace the full state atomically before the
/// next packet is processed (we are already between packets here, since the
/// dispatch loop is single-threaded per agent).
fn handle_load_checkpoint(runtime: &Arc<AgentRuntime>, controller: &mut dyn Controller) {
    let Some(dir) = runtime.checkpoint_dir.lock().clone() else {
        warn!(agent = %runtime.id, "load checkpoint requested but no checkpoint_dir configured");
        return;
    };
    match crate::checkpoint::load_agent(&dir, &runtime.id) {
        Ok((state, blob)) => {
            runtime.restore(state);
            controller.load_state(&blob);
        }
        Err(e) => warn!(agent = %runtime.id, error = %e, "failed to load agent checkpoint"),
    }
}

fn is_ack(body: &PacketBody) -> bool {
    matches!(
        body,
        PacketBody::CurrencyTransferAck { .. }
            | PacketBody::ItemTransferAck { .. }
            | PacketBody::TradeReqAck { .. }
            | PacketBody::LandTransferAck { .. }
            | PacketBody::LandTradeReqAck { .. }
            | PacketBody::LaborApplicationAck { .. }
            | PacketBody::LaborContractCancelAck { .. }
            | PacketBody::ItemMarketSampleAck { .. }
            | PacketBody::LaborMarketSampleAck { .. }
            | PacketBody::LandMarketSampleAck { .. }
            | PacketBody::InfoResp { .. }
            | PacketBody::TickBlockedAck
            | PacketBody::SaveCheckpointAck
    )
}
