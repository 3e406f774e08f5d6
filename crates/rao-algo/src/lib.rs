//! # rao-algo: Iterative Linear Remedial-Action Optimization
//!
//! Finds set-points of range actions (phase-shifting transformers, HVDC
//! links, injections) that maximize the worst flow margin of a power
//! network, or minimize remedial-action cost under margin penalties, by
//! solving a sequence of linearized problems around successive load-flow
//! results.
//!
//! ## Building Blocks
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | [`RaoParameters`], loaded from TOML |
//! | [`margin`] | Margin of a cnec under a flow result, absolute or relative |
//! | [`cost`] | Cost evaluators: min margin, remedial-action cost, penalties |
//! | [`objective`] | Functional plus virtual costs, contingency exclusion |
//! | [`linear`] | Problem fillers writing the linear relaxation with `good_lp` |
//! | [`optimizer`] | The iterating loop and best-tap rounding |
//!
//! ### Architecture
//!
//! The load-flow / sensitivity engine stays outside the crate, behind
//! [`optimizer::SensitivityOracle`]. The linear problem is reached through
//! [`linear::RelaxedProblem`], so the loop can be driven by any solver
//! backend or a scripted problem:
//!
//! ```text
//! solve ──▶ round ──▶ oracle ──▶ evaluate ──▶ keep best / relinearize
//!   ▲                                                │
//!   └────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use rao_algo::optimizer::{optimize, OptimizationInputs};
//!
//! let result = optimize(
//!     OptimizationInputs {
//!         perimeter: &perimeter,
//!         parameters: &parameters,
//!         initial_flow: &initial.flow,
//!         pre_perimeter: &initial,
//!         network_actions: &NetworkActionsResult::default(),
//!         range_shrinking: true,
//!     },
//!     &mut load_flow_engine,
//! )?;
//! println!("{:?} after {} iterations, cost {:.2}", result.status, result.iterations, result.total_cost());
//! ```

pub mod config;
pub mod cost;
pub mod linear;
pub mod margin;
pub mod objective;
pub mod optimizer;

pub use config::{load_parameters, ObjectiveKind, PstModel, RangeShrinking, RaoParameters};
pub use cost::{Cost, CostEvaluator, CostInput};
pub use linear::{LinearProblem, LinearProblemStatus, LinearizationPoint, RelaxedProblem};
pub use margin::MarginEvaluator;
pub use objective::{EvaluatedObjective, ObjectiveCosts, UnevaluatedObjective};
pub use optimizer::{
    optimize, IteratingLinearOptimizer, IteratingParameters, LinearOptimizationResult, LinearOptimizationStatus,
    OptimizationInputs, SensitivityComputation, SensitivityOracle,
};
