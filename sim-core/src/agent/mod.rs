//! §4.3 Agent Runtime module tree.

pub mod accounting;
pub mod nutrition;
pub mod protocols;
pub mod runtime;
pub mod state;
pub mod transactions;

pub use protocols::{
    apply_for_labor, cancel_labor_contract, consume_item, initiate_currency_transfer,
    initiate_item_transfer, land_trade, produce_item, run_step_nutrition, send_labor_time, trade,
};
pub use runtime::{AgentRuntime, run_dispatch_loop};
pub use state::AgentState;
