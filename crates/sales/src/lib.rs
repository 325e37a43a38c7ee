//! Deal lifecycle (commercial engagements).
//!
//! Pure transition rules only: no IO, no persistence. Request handlers and job
//! handlers call [`transition_deal_status`] before writing a deal row.

pub mod deal;

pub use deal::{
    DEAL_TERMINAL_STATES, DealStatus, InvalidDealTransition, allowed_deal_transitions,
    is_deal_terminal, transition_deal_status,
};
