use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{DomainError, Lifecycle};

/// Deal status lifecycle.
///
/// Stored in the database as the SCREAMING_SNAKE name (`MAESTRO_APPROVED`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStatus {
    Queued,
    Assigned,
    MaestroApproved,
    Paid,
    InProgress,
    Delivered,
    Closed,
    Refunded,
}

/// Deal states with no way out.
pub const DEAL_TERMINAL_STATES: [DealStatus; 2] = [DealStatus::Closed, DealStatus::Refunded];

impl DealStatus {
    pub const ALL: [DealStatus; 8] = [
        DealStatus::Queued,
        DealStatus::Assigned,
        DealStatus::MaestroApproved,
        DealStatus::Paid,
        DealStatus::InProgress,
        DealStatus::Delivered,
        DealStatus::Closed,
        DealStatus::Refunded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DealStatus::Queued => "QUEUED",
            DealStatus::Assigned => "ASSIGNED",
            DealStatus::MaestroApproved => "MAESTRO_APPROVED",
            DealStatus::Paid => "PAID",
            DealStatus::InProgress => "IN_PROGRESS",
            DealStatus::Delivered => "DELIVERED",
            DealStatus::Closed => "CLOSED",
            DealStatus::Refunded => "REFUNDED",
        }
    }
}

impl core::fmt::Display for DealStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DealStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown deal status: {s}")))
    }
}

impl Lifecycle for DealStatus {
    const ALL: &'static [Self] = &DealStatus::ALL;
    const TERMINAL: &'static [Self] = &DEAL_TERMINAL_STATES;

    fn successors(self) -> &'static [Self] {
        use DealStatus::*;
        match self {
            Queued => &[Assigned, Paid],
            Assigned => &[MaestroApproved, Paid],
            MaestroApproved => &[Paid, InProgress],
            Paid => &[InProgress, Delivered, Refunded],
            InProgress => &[Delivered, Refunded],
            Delivered => &[Closed, Refunded],
            Closed | Refunded => &[],
        }
    }
}

/// A deal status change that is not in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid_deal_transition: {from} -> {to}")]
pub struct InvalidDealTransition {
    pub from: DealStatus,
    pub to: DealStatus,
}

impl InvalidDealTransition {
    pub const CODE: &'static str = "invalid_deal_transition";

    pub fn code(&self) -> &'static str {
        Self::CODE
    }
}

impl From<InvalidDealTransition> for DomainError {
    fn from(err: InvalidDealTransition) -> Self {
        DomainError::invalid_transition(
            InvalidDealTransition::CODE,
            err.from.as_str(),
            err.to.as_str(),
        )
    }
}

/// Validate a deal status change and return the new status.
///
/// Pure: callers persist the returned status themselves. A self-transition
/// is accepted as a no-op.
pub fn transition_deal_status(
    from: DealStatus,
    to: DealStatus,
) -> Result<DealStatus, InvalidDealTransition> {
    if from.permits(to) {
        Ok(to)
    } else {
        Err(InvalidDealTransition { from, to })
    }
}

pub fn is_deal_terminal(status: DealStatus) -> bool {
    status.is_terminal()
}

/// Statuses reachable from `status` in one step.
pub fn allowed_deal_transitions(status: DealStatus) -> &'static [DealStatus] {
    status.successors()
}
