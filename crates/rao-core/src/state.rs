//! Operating states: a contingency (or none, for the base case) observed at
//! an instant.

use serde::{Deserialize, Serialize};

use crate::{ContingencyId, StateId};

/// Kind of instant, in chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstantKind {
    Preventive,
    Outage,
    Auto,
    Curative,
}

/// An instant of the time sequence. `order` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instant {
    pub id: String,
    pub kind: InstantKind,
    pub order: u32,
}

impl Instant {
    pub fn new(id: impl Into<String>, kind: InstantKind, order: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            order,
        }
    }

    pub fn preventive() -> Self {
        Self::new("preventive", InstantKind::Preventive, 0)
    }

    pub fn curative() -> Self {
        Self::new("curative", InstantKind::Curative, 3)
    }

    pub fn comes_before(&self, other: &Instant) -> bool {
        self.order < other.order
    }
}

/// An operating state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub instant: Instant,
    pub contingency: Option<ContingencyId>,
}

impl State {
    pub fn new(id: impl Into<StateId>, instant: Instant, contingency: Option<ContingencyId>) -> Self {
        Self {
            id: id.into(),
            instant,
            contingency,
        }
    }

    /// Base-case state.
    pub fn preventive(id: impl Into<StateId>) -> Self {
        Self::new(id, Instant::preventive(), None)
    }

    /// Post-contingency state at the default curative instant.
    pub fn curative(id: impl Into<StateId>, contingency: impl Into<ContingencyId>) -> Self {
        Self::new(id, Instant::curative(), Some(contingency.into()))
    }

    pub fn is_preventive(&self) -> bool {
        self.instant.kind == InstantKind::Preventive
    }

    pub fn is_curative(&self) -> bool {
        self.instant.kind == InstantKind::Curative
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curative_state_carries_contingency() {
        let state = State::curative("co1-curative", "co1");
        assert!(state.is_curative());
        assert_eq!(state.contingency.as_ref().map(|c| c.as_str()), Some("co1"));
        assert!(Instant::preventive().comes_before(&state.instant));
    }
}
