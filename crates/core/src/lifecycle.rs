//! Transition-table state machines for domain entity status fields.
//!
//! A lifecycle is a closed set of states plus a fixed adjacency table. Entity
//! modules implement [`Lifecycle`] for their status enum and expose a pure
//! `transition(from, to)` function that consults [`Lifecycle::permits`].
//!
//! Rules shared by every lifecycle:
//! - a self-transition is always legal (no-op);
//! - any other pair must appear in the adjacency table;
//! - terminal states have no outgoing edges.

/// A status enum with an explicit transition table.
pub trait Lifecycle: Copy + Eq + core::fmt::Debug + 'static {
    /// Every state, in declaration order.
    const ALL: &'static [Self];

    /// States with no outgoing edges.
    const TERMINAL: &'static [Self];

    /// Legal targets from `self`, excluding the implicit self-transition.
    fn successors(self) -> &'static [Self];

    fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether moving from `self` to `to` is legal.
    fn permits(self, to: Self) -> bool {
        self == to || self.successors().contains(&to)
    }
}

/// Every `(from, to)` edge of the table, excluding self-transitions.
pub fn edges<S: Lifecycle>() -> impl Iterator<Item = (S, S)> {
    S::ALL
        .iter()
        .flat_map(|from| from.successors().iter().map(move |to| (*from, *to)))
}
