//! # rao-core: Remedial-Action Optimization Data Model
//!
//! Plain data structures consumed and produced by the iterative linear
//! optimizer in `rao-algo`:
//!
//! - [`FlowCnec`] - a monitored branch (critical network element under
//!   contingency) with per-side thresholds
//! - [`RangeAction`] - a control device with a continuous or tapped domain
//!   ([`RangeActionKind`] is a closed sum type: PST, HVDC, injection)
//! - [`NetworkAction`] - a topology switch with an activation cost
//! - [`State`] - an operating state, i.e. a (contingency, instant) pair
//! - [`FlowResult`], [`SensitivityResult`], [`RangeActionActivationResult`] -
//!   immutable per-iteration snapshots
//! - [`Perimeter`] - everything one optimization call works on
//!
//! Nothing here talks to a solver or a network simulator. Entities are
//! built once (the import layer is outside this crate) and stay immutable
//! for the duration of an optimization call; only results change between
//! iterations.
//!
//! ## Quick Start
//!
//! ```
//! use rao_core::*;
//!
//! let preventive = State::preventive("preventive");
//! let cnec = FlowCnec::new("line-fr-be", preventive.id.clone())
//!     .with_operator("FR")
//!     .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
//!     .optimized();
//!
//! let flows = FlowResult::new().with_flow(cnec.id.clone(), Side::One, 120.0);
//! assert!((flows.margin(&cnec, Unit::Megawatt) + 20.0).abs() < 1e-9);
//! ```

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod cnec;
pub mod error;
pub mod perimeter;
pub mod range_action;
pub mod results;
pub mod state;
pub mod units;

pub use cnec::{BranchThreshold, FlowCnec, LoopFlowThreshold};
pub use error::{RaoError, RaoResult};
pub use perimeter::Perimeter;
pub use range_action::{ActionKind, NetworkAction, PstTapTable, RangeAction, RangeActionKind};
pub use results::{
    ComputationStatus, FlowResult, NetworkActionsResult, RangeActionActivationResult,
    SensitivityResult,
};
pub use state::{Instant, InstantKind, State};
pub use units::{Side, Unit};

/// Defines a string-backed identifier newtype.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[inline]
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                $name(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name(value)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a monitored flow constraint
    CnecId
);
string_id!(
    /// Identifier of a range action (PST, HVDC, injection)
    RangeActionId
);
string_id!(
    /// Identifier of a topological network action
    NetworkActionId
);
string_id!(
    /// Identifier of an operating state
    StateId
);
string_id!(
    /// Identifier of a contingency (N-1, N-k outage)
    ContingencyId
);
