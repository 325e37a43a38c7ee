use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{DomainError, Lifecycle};

/// Status of a payout ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryStatus {
    /// Earned by a delivered deal, not yet reviewed.
    Earned,
    /// Approved for payout.
    Approved,
    Paid,
    /// Cancelled, e.g. after a refund.
    Void,
}

pub const LEDGER_TERMINAL_STATES: [LedgerEntryStatus; 2] =
    [LedgerEntryStatus::Paid, LedgerEntryStatus::Void];

impl LedgerEntryStatus {
    pub const ALL: [LedgerEntryStatus; 4] = [
        LedgerEntryStatus::Earned,
        LedgerEntryStatus::Approved,
        LedgerEntryStatus::Paid,
        LedgerEntryStatus::Void,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerEntryStatus::Earned => "EARNED",
            LedgerEntryStatus::Approved => "APPROVED",
            LedgerEntryStatus::Paid => "PAID",
            LedgerEntryStatus::Void => "VOID",
        }
    }
}

impl core::fmt::Display for LedgerEntryStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LedgerEntryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown ledger entry status: {s}")))
    }
}

impl Lifecycle for LedgerEntryStatus {
    const ALL: &'static [Self] = &LedgerEntryStatus::ALL;
    const TERMINAL: &'static [Self] = &LEDGER_TERMINAL_STATES;

    fn successors(self) -> &'static [Self] {
        match self {
            LedgerEntryStatus::Earned => &[LedgerEntryStatus::Approved, LedgerEntryStatus::Void],
            LedgerEntryStatus::Approved => &[LedgerEntryStatus::Paid, LedgerEntryStatus::Void],
            LedgerEntryStatus::Paid | LedgerEntryStatus::Void => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid_ledger_transition: {from} -> {to}")]
pub struct InvalidLedgerTransition {
    pub from: LedgerEntryStatus,
    pub to: LedgerEntryStatus,
}

impl InvalidLedgerTransition {
    pub const CODE: &'static str = "invalid_ledger_transition";

    pub fn code(&self) -> &'static str {
        Self::CODE
    }
}

impl From<InvalidLedgerTransition> for DomainError {
    fn from(err: InvalidLedgerTransition) -> Self {
        DomainError::invalid_transition(
            InvalidLedgerTransition::CODE,
            err.from.as_str(),
            err.to.as_str(),
        )
    }
}

/// Validate a ledger entry status change and return the new status.
pub fn transition_ledger_status(
    from: LedgerEntryStatus,
    to: LedgerEntryStatus,
) -> Result<LedgerEntryStatus, InvalidLedgerTransition> {
    if from.permits(to) {
        Ok(to)
    } else {
        Err(InvalidLedgerTransition { from, to })
    }
}

pub fn is_ledger_terminal(status: LedgerEntryStatus) -> bool {
    status.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::lifecycle::edges;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = LedgerEntryStatus> {
        prop::sample::select(LedgerEntryStatus::ALL.to_vec())
    }

    #[test]
    fn earned_approved_paid() {
        let approved =
            transition_ledger_status(LedgerEntryStatus::Earned, LedgerEntryStatus::Approved)
                .unwrap();
        let paid = transition_ledger_status(approved, LedgerEntryStatus::Paid).unwrap();
        assert_eq!(paid, LedgerEntryStatus::Paid);
    }

    #[test]
    fn every_table_edge_is_accepted() {
        let all: Vec<_> = edges::<LedgerEntryStatus>().collect();
        assert_eq!(all.len(), 4);
        for (from, to) in all {
            assert_eq!(transition_ledger_status(from, to), Ok(to));
        }
    }

    #[test]
    fn cannot_pay_without_approval() {
        let err = transition_ledger_status(LedgerEntryStatus::Earned, LedgerEntryStatus::Paid)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_ledger_transition");
        assert_eq!(err.from, LedgerEntryStatus::Earned);
        assert_eq!(err.to, LedgerEntryStatus::Paid);
    }

    #[test]
    fn paid_entries_cannot_be_voided() {
        assert!(
            transition_ledger_status(LedgerEntryStatus::Paid, LedgerEntryStatus::Void).is_err()
        );
        assert!(
            transition_ledger_status(LedgerEntryStatus::Void, LedgerEntryStatus::Earned).is_err()
        );
    }

    #[test]
    fn terminal_constants_match_the_table() {
        for status in LedgerEntryStatus::ALL {
            assert_eq!(
                is_ledger_terminal(status),
                status.successors().is_empty(),
                "{status}"
            );
        }
    }

    #[test]
    fn status_names_round_trip_through_serde() {
        for status in LedgerEntryStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(serde_json::from_str::<LedgerEntryStatus>(&json).unwrap(), status);
            assert_eq!(status.as_str().parse::<LedgerEntryStatus>(), Ok(status));
        }
        assert_eq!(
            serde_json::to_string(&LedgerEntryStatus::Approved).unwrap(),
            "\"APPROVED\""
        );
        assert!("approved".parse::<LedgerEntryStatus>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: identity is a no-op and anything else follows the table.
        #[test]
        fn transition_matches_table(from in any_status(), to in any_status()) {
            let expected_ok = from == to || from.successors().contains(&to);
            let result = transition_ledger_status(from, to);
            prop_assert_eq!(result.is_ok(), expected_ok);
            if let Ok(next) = result {
                prop_assert_eq!(next, to);
            }
        }
    }
}
