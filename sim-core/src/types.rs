//! Core data model: §3 of the design doc.
//!
//! `AgentId` is the address used by the routing layer; every other type here
//! is plain data carried inside packets or held in `AgentState`. Nothing in
//! this module owns a lock or a channel — those live in `agent`/`network`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque, unique address for routing. Cheaply cloned, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Integer monetary unit. All currency arithmetic is exact integer cents.
pub type Cents = i64;

/// Correlates a request with its ack across an asynchronous round trip.
pub type TransactionId = Uuid;

/// `{ itemId: string, quantity: real }`. Containers of the same `itemId`
/// compose by addition; quantities are non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemContainer {
    pub item_id: String,
    pub quantity: f64,
}

impl ItemContainer {
    pub fn new(item_id: impl Into<String>, quantity: f64) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

/// A seller has at most one active listing per item: identity is
/// `(seller_id, item_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemListing {
    pub seller_id: AgentId,
    pub item_id: String,
    pub unit_price: Cents,
    pub max_quantity: f64,
    pub last_updated: u64,
}

impl ItemListing {
    pub fn identity(&self) -> (AgentId, String) {
        (self.seller_id.clone(), self.item_id.clone())
    }
}

/// Identity is `(employer_id, listing_tag)` — an employer may run several
/// concurrent labor listings (e.g. by skill band), distinguished by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborListing {
    pub employer_id: AgentId,
    pub listing_tag: String,
    pub skill_level: f64,
    pub wage_per_tick: Cents,
    pub ticks_per_step: u32,
    pub contract_length: u32,
    pub applicants_considered: u32,
    pub last_updated: u64,
}

impl LaborListing {
    pub fn identity(&self) -> (AgentId, String) {
        (self.employer_id.clone(), self.listing_tag.clone())
    }
}

/// Identity `(seller_id, allocation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandListing {
    pub seller_id: AgentId,
    pub allocation: String,
    pub hectares: f64,
    pub unit_price: Cents,
}

impl LandListing {
    pub fn identity(&self) -> (AgentId, String) {
        (self.seller_id.clone(), self.allocation.clone())
    }
}

/// Tags a currency transfer so the recipient can post the credit to the
/// right accounting bucket (§4.3.8) instead of only the generic inflow
/// counter. Trade/land settlement is already attributed via the seller's
/// reservation bookkeeping, so only the wage leg needs a tag here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPurpose {
    General,
    Wage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub item: ItemContainer,
    pub currency_amount: Cents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandTradeRequest {
    pub buyer_id: AgentId,
    pub seller_id: AgentId,
    pub allocation: String,
    pub hectares: f64,
    pub currency_amount: Cents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborContract {
    pub contract_id: Uuid,
    pub employer_id: AgentId,
    pub worker_id: AgentId,
    pub skill_level: f64,
    pub wage_per_tick: Cents,
    pub ticks_per_step: u32,
    pub start_step: u64,
    pub end_step: u64,
}

impl LaborContract {
    /// At most one active contract per `(employer, worker, skill_level)`.
    pub fn identity(&self) -> (AgentId, AgentId, OrderedF64) {
        (
            self.employer_id.clone(),
            self.worker_id.clone(),
            OrderedF64(self.skill_level),
        )
    }
}

/// `f64` wrapper usable as a hash/ordered key. Skill levels and quantities in
/// this domain are always finite, so total ordering is safe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}
impl std::hash::Hash for OrderedF64 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}
impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Two allocation states for held land: only `Unallocated` hectares may be
/// transferred away; `Allocated` hectares are committed to production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LandState {
    Allocated,
    Unallocated,
}

pub type Inventory = HashMap<String, f64>;
pub type LandHoldings = HashMap<(String, LandState), f64>;
