//! Payout ledger entry lifecycle.
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod entry;

pub use entry::{
    InvalidLedgerTransition, LEDGER_TERMINAL_STATES, LedgerEntryStatus, is_ledger_terminal,
    transition_ledger_status,
};
