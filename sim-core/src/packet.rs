//! The wire protocol. §6 "Packets" is binding: every packet named there has
//! a variant here. Grounded in the corpus's actor message-enum style (see
//! `other_examples` Torq `messages::Message`), adapted to a single flat enum
//! since the Network routes on packet *type*, not on a per-actor mailbox type.

use serde::{Deserialize, Serialize};

use crate::types::{
    AgentId, Cents, ItemContainer, ItemListing, LandListing, LandTradeRequest, LaborContract,
    LaborListing, TradeRequest, TransferPurpose,
};

/// Every packet carries an optional `transactionId` for correlation, a
/// sender, and (for targeted packets) a destination. Broadcasts have no
/// single destination — the Network fans them out to the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub sender: AgentId,
    pub destination: Destination,
    pub transaction_id: Option<uuid::Uuid>,
    /// Set by the Network when forwarding a copy to a snoop observer, so the
    /// observer's own outbound traffic is never re-snooped (no amplification).
    pub incoming: bool,
    pub body: PacketBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Destination {
    Agent(AgentId),
    Broadcast,
}

impl Packet {
    pub fn targeted(sender: AgentId, destination: AgentId, body: PacketBody) -> Self {
        Self {
            sender,
            destination: Destination::Agent(destination),
            transaction_id: None,
            incoming: true,
            body,
        }
    }

    pub fn broadcast(sender: AgentId, body: PacketBody) -> Self {
        Self {
            sender,
            destination: Destination::Broadcast,
            transaction_id: None,
            incoming: true,
            body,
        }
    }

    pub fn with_transaction(mut self, id: uuid::Uuid) -> Self {
        self.transaction_id = Some(id);
        self
    }

    /// The packet's type tag, as used by the snoop table and by broadcast
    /// suffix detection (`_BROADCAST`).
    pub fn kind(&self) -> PacketKind {
        self.body.kind()
    }
}

/// Type tags, matching the enumeration in §6 verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    KillPipeNetwork,
    KillPipeAgent,
    KillAllBroadcast,
    SnoopStart,
    Error,
    CurrencyTransfer,
    CurrencyTransferAck,
    ItemTransfer,
    ItemTransferAck,
    TradeReq,
    TradeReqAck,
    LandTransfer,
    LandTransferAck,
    LandTradeReq,
    LandTradeReqAck,
    LaborApplication,
    LaborApplicationAck,
    LaborTimeSend,
    LaborContractCancel,
    LaborContractCancelAck,
    ItemMarketUpdate,
    ItemMarketRemove,
    ItemMarketSample,
    ItemMarketSampleAck,
    LaborMarketUpdate,
    LaborMarketRemove,
    LaborMarketSample,
    LaborMarketSampleAck,
    LandMarketUpdate,
    LandMarketRemove,
    LandMarketSample,
    LandMarketSampleAck,
    ProductionNotification,
    InfoReq,
    InfoReqBroadcast,
    InfoResp,
    ControllerStart,
    ControllerStartBroadcast,
    ControllerMsg,
    ControllerMsgBroadcast,
    ErrorControllerStart,
    TickBlockSubscribe,
    TickBlocked,
    TickBlockedAck,
    TickGrant,
    TickGrantBroadcast,
    TerminateSimulation,
    ProcStop,
    SaveCheckpoint,
    SaveCheckpointBroadcast,
    SaveCheckpointAck,
    LoadCheckpoint,
    LoadCheckpointBroadcast,
    AdvanceStep,
}

impl PacketKind {
    /// Packet types whose destination is every registered agent except the
    /// sender (the `_BROADCAST` suffix family of §4.2 rule 3).
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            PacketKind::KillAllBroadcast
                | PacketKind::InfoReqBroadcast
                | PacketKind::ControllerStartBroadcast
                | PacketKind::ControllerMsgBroadcast
                | PacketKind::TickGrantBroadcast
                | PacketKind::SaveCheckpointBroadcast
                | PacketKind::LoadCheckpointBroadcast
        )
    }
}

/// Identity of a market, used to route `*_MARKET_*` packets to the right
/// co-resident marketplace agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketKind {
    Item,
    Labor,
    Land,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PacketBody {
    // --- lifecycle ---
    KillPipeNetwork,
    KillPipeAgent,
    KillAllBroadcast,
    SnoopStart { packet_kinds: Vec<PacketKind> },
    Error { reason: String },

    // --- currency transfer (§4.3.1) ---
    CurrencyTransfer { payment_id: uuid::Uuid, cents: Cents, purpose: TransferPurpose },
    CurrencyTransferAck { payment_id: uuid::Uuid, transfer_success: bool },

    // --- item transfer (§4.3.2) ---
    ItemTransfer { transfer_id: uuid::Uuid, item: ItemContainer },
    ItemTransferAck { transfer_id: uuid::Uuid, transfer_success: bool },

    // --- trade (§4.3.3) ---
    TradeReq { req: TradeRequest },
    TradeReqAck { accepted: bool },

    // --- land transfer / trade (§4.3.4) ---
    LandTransfer { transfer_id: uuid::Uuid, allocation: String, hectares: f64 },
    LandTransferAck { transfer_id: uuid::Uuid, transfer_success: bool },
    LandTradeReq { req: LandTradeRequest },
    LandTradeReqAck { accepted: bool },

    // --- labor (§4.3.5) ---
    LaborApplication { contract: LaborContract },
    LaborApplicationAck { accepted: bool },
    LaborTimeSend { ticks: u32, skill_level: f64 },
    LaborContractCancel { contract_id: uuid::Uuid },
    LaborContractCancelAck { contract_id: uuid::Uuid, accepted: bool },

    // --- marketplace surface (§4.3.7 / §4.4) ---
    ItemMarketUpdate { listing: ItemListing },
    ItemMarketRemove { item_id: String },
    ItemMarketSample { item_id: String, sample_size: usize },
    ItemMarketSampleAck { listings: Vec<ItemListing> },

    LaborMarketUpdate { listing: LaborListing },
    LaborMarketRemove { listing_tag: String },
    LaborMarketSample { min_skill: f64, max_skill: f64, sample_size: usize },
    LaborMarketSampleAck { listings: Vec<LaborListing> },

    LandMarketUpdate { listing: LandListing },
    LandMarketRemove { allocation: String },
    LandMarketSample { allocation: Option<String>, sample_size: usize },
    LandMarketSampleAck { listings: Vec<LandListing> },

    // --- observation ---
    ProductionNotification { item: ItemContainer, producer: AgentId },
    InfoReq,
    InfoReqBroadcast,
    InfoResp { balance: Cents, inventory: Vec<ItemContainer> },

    // --- controller plumbing ---
    ControllerStart,
    ControllerStartBroadcast,
    ControllerMsg { payload: Vec<u8> },
    ControllerMsgBroadcast { payload: Vec<u8> },
    ErrorControllerStart { reason: String },

    // --- simulation management (§4.5) ---
    TickBlockSubscribe,
    TickBlocked,
    TickBlockedAck,
    TickGrant { ticks: u32 },
    TickGrantBroadcast { ticks: u32 },
    TerminateSimulation,
    ProcStop,
    SaveCheckpoint,
    SaveCheckpointBroadcast { step: u64 },
    SaveCheckpointAck,
    LoadCheckpoint { step: u64 },
    LoadCheckpointBroadcast { step: u64 },
    /// Network-internal: emitted to the Manager once every tick-blocking
    /// agent for the current step has acked `TICK_BLOCKED`.
    AdvanceStep,
}

impl PacketBody {
    pub fn kind(&self) -> PacketKind {
        match self {
            PacketBody::KillPipeNetwork => PacketKind::KillPipeNetwork,
            PacketBody::KillPipeAgent => PacketKind::KillPipeAgent,
            PacketBody::KillAllBroadcast => PacketKind::KillAllBroadcast,
            PacketBody::SnoopStart { .. } => PacketKind::SnoopStart,
            PacketBody::Error { .. } => PacketKind::Error,
            PacketBody::CurrencyTransfer { .. } => PacketKind::CurrencyTransfer,
            PacketBody::CurrencyTransferAck { .. } => PacketKind::CurrencyTransferAck,
            PacketBody::ItemTransfer { .. } => PacketKind::ItemTransfer,
            PacketBody::ItemTransferAck { .. } => PacketKind::ItemTransferAck,
            PacketBody::TradeReq { .. } => PacketKind::TradeReq,
            PacketBody::TradeReqAck { .. } => PacketKind::TradeReqAck,
            PacketBody::LandTransfer { .. } => PacketKind::LandTransfer,
            PacketBody::LandTransferAck { .. } => PacketKind::LandTransferAck,
            PacketBody::LandTradeReq { .. } => PacketKind::LandTradeReq,
            PacketBody::LandTradeReqAck { .. } => PacketKind::LandTradeReqAck,
            PacketBody::LaborApplication { .. } => PacketKind::LaborApplication,
            PacketBody::LaborApplicationAck { .. } => PacketKind::LaborApplicationAck,
            PacketBody::LaborTimeSend { .. } => PacketKind::LaborTimeSend,
            PacketBody::LaborContractCancel { .. } => PacketKind::LaborContractCancel,
            PacketBody::LaborContractCancelAck { .. } => PacketKind::LaborContractCancelAck,
            PacketBody::ItemMarketUpdate { .. } => PacketKind::ItemMarketUpdate,
            PacketBody::ItemMarketRemove { .. } => PacketKind::ItemMarketRemove,
            PacketBody::ItemMarketSample { .. } => PacketKind::ItemMarketSample,
            PacketBody::ItemMarketSampleAck { .. } => PacketKind::ItemMarketSampleAck,
            PacketBody::LaborMarketUpdate { .. } => PacketKind::LaborMarketUpdate,
            PacketBody::LaborMarketRemove { .. } => PacketKind::LaborMarketRemove,
            PacketBody::LaborMarketSample { .. } => PacketKind::LaborMarketSample,
            PacketBody::LaborMarketSampleAck { .. } => PacketKind::LaborMarketSampleAck,
            PacketBody::LandMarketUpdate { .. } => PacketKind::LandMarketUpdate,
            PacketBody::LandMarketRemove { .. } => PacketKind::LandMarketRemove,
            PacketBody::LandMarketSample { .. } => PacketKind::LandMarketSample,
            PacketBody::LandMarketSampleAck { .. } => PacketKind::LandMarketSampleAck,
            PacketBody::ProductionNotification { .. } => PacketKind::ProductionNotification,
            PacketBody::InfoReq => PacketKind::InfoReq,
            PacketBody::InfoReqBroadcast => PacketKind::InfoReqBroadcast,
            PacketBody::InfoResp { .. } => PacketKind::InfoResp,
            PacketBody::ControllerStart => PacketKind::ControllerStart,
            PacketBody::ControllerStartBroadcast => PacketKind::ControllerStartBroadcast,
            PacketBody::ControllerMsg { .. } => PacketKind::ControllerMsg,
            PacketBody::ControllerMsgBroadcast { .. } => PacketKind::ControllerMsgBroadcast,
            PacketBody::ErrorControllerStart { .. } => PacketKind::ErrorControllerStart,
            PacketBody::TickBlockSubscribe => PacketKind::TickBlockSubscribe,
            PacketBody::TickBlocked => PacketKind::TickBlocked,
            PacketBody::TickBlockedAck => PacketKind::TickBlockedAck,
            PacketBody::TickGrant { .. } => PacketKind::TickGrant,
            PacketBody::TickGrantBroadcast { .. } => PacketKind::TickGrantBroadcast,
            PacketBody::TerminateSimulation => PacketKind::TerminateSimulation,
            PacketBody::ProcStop => PacketKind::ProcStop,
            PacketBody::SaveCheckpoint => PacketKind::SaveCheckpoint,
            PacketBody::SaveCheckpointBroadcast { .. } => PacketKind::SaveCheckpointBroadcast,
            PacketBody::SaveCheckpointAck => PacketKind::SaveCheckpointAck,
            PacketBody::LoadCheckpoint { .. } => PacketKind::LoadCheckpoint,
            PacketBody::LoadCheckpointBroadcast { .. } => PacketKind::LoadCheckpointBroadcast,
            PacketBody::AdvanceStep => PacketKind::AdvanceStep,
        }
    }
}
