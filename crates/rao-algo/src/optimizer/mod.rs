//! Iterating linear optimizer.
//!
//! Each iteration solves the linear problem, rounds the solution to
//! reachable set-points, re-simulates the network with the external
//! [`SensitivityOracle`] and evaluates the objective. The best result so far
//! is kept and returned with a [`LinearOptimizationStatus`] telling why the
//! loop stopped:
//!
//! | Status | Reason |
//! |--------|--------|
//! | `Optimal` | set-points converged, or an iteration brought no improvement |
//! | `Infeasible`, `Unbounded`, `Abnormal` | the first solve failed |
//! | `Feasible` | a later solve failed |
//! | `SensitivityComputationFailed` | the oracle reported a failure |
//! | `MaxIterationReached` | the iteration budget was exhausted |
//!
//! The linear problem is taken by value: it is dropped on every exit path.

use rao_core::results::SETPOINT_EPSILON;
use rao_core::{
    ComputationStatus, FlowResult, NetworkActionsResult, Perimeter, RangeActionActivationResult, RaoResult,
    SensitivityResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{PstModel, RaoParameters};
use crate::cost::CostInput;
use crate::linear::{FillerConfig, FillerContext, LinearProblem, LinearProblemStatus, LinearizationPoint, RelaxedProblem};
use crate::objective::{ObjectiveCosts, UnevaluatedObjective};

mod best_tap;
mod rounding;
mod scratch;

pub use best_tap::{BestTapFinder, BEST_TAP_LIMITING_ELEMENTS, BEST_TAP_MIDPOINT_THRESHOLD};
pub use scratch::{ScratchArena, ScratchMap};

use rounding::round_activation;

/// Most limiting elements logged after each evaluation.
const LOGGED_LIMITING_ELEMENTS: usize = 5;

/// Loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IteratingParameters {
    pub max_iterations: usize,
    /// Keep iterating around rejected points, with shrinking ranges
    pub range_shrinking: bool,
    pub pst_model: PstModel,
}

impl Default for IteratingParameters {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            range_shrinking: false,
            pst_model: PstModel::Continuous,
        }
    }
}

impl IteratingParameters {
    /// Loop settings of one optimization call; whether this call shrinks
    /// ranges is decided by the caller.
    pub fn from_parameters(parameters: &RaoParameters, range_shrinking: bool) -> Self {
        Self {
            max_iterations: parameters.range_actions.max_mip_iterations,
            range_shrinking: range_shrinking && parameters.range_actions.range_shrinking.is_enabled(),
            pst_model: parameters.range_actions.pst_model,
        }
    }
}

/// Why the optimizer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinearOptimizationStatus {
    Optimal,
    Feasible,
    Infeasible,
    Unbounded,
    Abnormal,
    SensitivityComputationFailed,
    MaxIterationReached,
}

impl From<LinearProblemStatus> for LinearOptimizationStatus {
    fn from(status: LinearProblemStatus) -> Self {
        match status {
            LinearProblemStatus::Optimal => LinearOptimizationStatus::Optimal,
            LinearProblemStatus::Feasible => LinearOptimizationStatus::Feasible,
            LinearProblemStatus::Infeasible => LinearOptimizationStatus::Infeasible,
            LinearProblemStatus::Unbounded => LinearOptimizationStatus::Unbounded,
            LinearProblemStatus::Abnormal => LinearOptimizationStatus::Abnormal,
        }
    }
}

/// Best situation found by the optimizer.
#[derive(Debug, Clone)]
pub struct LinearOptimizationResult {
    pub activation: RangeActionActivationResult,
    pub flow: FlowResult,
    pub sensitivity: SensitivityResult,
    pub costs: ObjectiveCosts,
    /// Linear solves performed; 0 for the pre-optimization situation
    pub iterations: usize,
    pub status: LinearOptimizationStatus,
}

impl LinearOptimizationResult {
    pub fn total_cost(&self) -> f64 {
        self.costs.total_cost()
    }

    pub fn functional_cost(&self) -> f64 {
        self.costs.functional_cost()
    }

    pub fn virtual_cost(&self, name: &str) -> Option<f64> {
        self.costs.virtual_cost(name)
    }

    fn linearization_point(&self) -> LinearizationPoint {
        LinearizationPoint {
            flow: self.flow.clone(),
            sensitivity: self.sensitivity.clone(),
            activation: self.activation.clone(),
        }
    }

    fn with_status(mut self, status: LinearOptimizationStatus) -> Self {
        self.status = status;
        self
    }
}

/// Flows and sensitivities of the network with some set-points applied.
#[derive(Debug, Clone)]
pub struct SensitivityComputation {
    pub flow: FlowResult,
    pub sensitivity: SensitivityResult,
}

impl SensitivityComputation {
    /// Whether the computation as a whole failed.
    pub fn failed(&self) -> bool {
        self.flow.computation_status() == ComputationStatus::Failure
            || self.sensitivity.computation_status() == ComputationStatus::Failure
    }
}

/// The load-flow / sensitivity engine.
///
/// A FAILURE status is reported in the returned results; `Err` is reserved
/// for an oracle that could not be invoked at all.
pub trait SensitivityOracle {
    fn compute(
        &mut self,
        activation: &RangeActionActivationResult,
        network_actions: &NetworkActionsResult,
    ) -> RaoResult<SensitivityComputation>;
}

/// The solve, round, re-simulate, evaluate loop.
pub struct IteratingLinearOptimizer<'a> {
    perimeter: &'a Perimeter,
    objective: &'a UnevaluatedObjective<'a>,
    network_actions: &'a NetworkActionsResult,
    parameters: IteratingParameters,
}

impl<'a> IteratingLinearOptimizer<'a> {
    pub fn new(
        perimeter: &'a Perimeter,
        objective: &'a UnevaluatedObjective<'a>,
        network_actions: &'a NetworkActionsResult,
        parameters: IteratingParameters,
    ) -> Self {
        Self {
            perimeter,
            objective,
            network_actions,
            parameters,
        }
    }

    fn evaluate(&self, flow: &FlowResult, activation: &RangeActionActivationResult, iteration: usize) -> ObjectiveCosts {
        let costs = self
            .objective
            .evaluate(CostInput {
                flow,
                activation,
                network_actions: self.network_actions,
            })
            .into_costs();
        let limiting = costs
            .functional
            .limiting
            .iter()
            .take(LOGGED_LIMITING_ELEMENTS)
            .map(|id| id.as_str())
            .collect::<Vec<_>>();
        info!(
            iteration,
            cost = costs.total_cost(),
            functional = costs.functional_cost(),
            virtual_cost = costs.total_virtual_cost(),
            ?limiting,
            "situation evaluated"
        );
        costs
    }

    /// Runs the loop from the pre-optimization situation `initial`.
    ///
    /// `problem` must be built for this perimeter; it is filled here.
    pub fn optimize<P: RelaxedProblem>(
        &self,
        mut problem: P,
        oracle: &mut dyn SensitivityOracle,
        initial: &LinearizationPoint,
    ) -> RaoResult<LinearOptimizationResult> {
        let mut scratch = ScratchArena::new();
        let mut best = LinearOptimizationResult {
            activation: initial.activation.clone(),
            flow: initial.flow.clone(),
            sensitivity: initial.sensitivity.clone(),
            costs: self.evaluate(&initial.flow, &initial.activation, 0),
            iterations: 0,
            status: LinearOptimizationStatus::Optimal,
        };
        info!(
            max_iterations = self.parameters.max_iterations,
            range_shrinking = self.parameters.range_shrinking,
            cost = best.total_cost(),
            "linear optimization started"
        );
        problem.update_between_sensi_iteration(initial)?;
        let mut previous_activation = best.activation.clone();

        for iteration in 1..=self.parameters.max_iterations {
            scratch.reset();
            let status = problem.solve()?;
            best.iterations = iteration;
            if !status.is_usable() {
                let fallback = if iteration == 1 {
                    LinearOptimizationStatus::from(status)
                } else {
                    LinearOptimizationStatus::Feasible
                };
                warn!(iteration, ?status, ?fallback, "linear problem could not be solved");
                return Ok(best.with_status(fallback));
            }

            let mut rounded = round_activation(self.perimeter, &problem, self.parameters.pst_model, &best, &scratch)?;
            if self.parameters.pst_model == PstModel::ApproximatedIntegers {
                problem.update_between_mip_iteration(&rounded)?;
                let status = problem.solve()?;
                if status.is_usable() {
                    rounded = round_activation(self.perimeter, &problem, self.parameters.pst_model, &best, &scratch)?;
                } else {
                    debug!(iteration, ?status, "refined integer problem unsolved, keeping first rounding");
                }
            }

            if !rounded.differs_from(&previous_activation, SETPOINT_EPSILON) {
                info!(iteration, cost = best.total_cost(), "set-points unchanged, linear optimization converged");
                return Ok(best.with_status(LinearOptimizationStatus::Optimal));
            }

            let computation = oracle.compute(&rounded, self.network_actions)?;
            if computation.failed() {
                warn!(iteration, "sensitivity computation failed");
                return Ok(best.with_status(LinearOptimizationStatus::SensitivityComputationFailed));
            }
            let costs = self.evaluate(&computation.flow, &rounded, iteration);
            let current = LinearOptimizationResult {
                activation: rounded,
                flow: computation.flow,
                sensitivity: computation.sensitivity,
                costs,
                iterations: iteration,
                status: LinearOptimizationStatus::Optimal,
            };
            previous_activation = current.activation.clone();

            if current.total_cost() < best.total_cost() {
                info!(
                    iteration,
                    previous = best.total_cost(),
                    cost = current.total_cost(),
                    "linear optimization improved"
                );
                problem.update_between_sensi_iteration(&current.linearization_point())?;
                best = current;
            } else if self.parameters.range_shrinking {
                debug!(
                    iteration,
                    cost = current.total_cost(),
                    best = best.total_cost(),
                    "no improvement, relinearizing around rejected point"
                );
                problem.update_between_sensi_iteration(&current.linearization_point())?;
            } else {
                info!(
                    iteration,
                    cost = current.total_cost(),
                    best = best.total_cost(),
                    "no improvement, linear optimization stopped"
                );
                return Ok(best.with_status(LinearOptimizationStatus::Optimal));
            }
        }

        info!(
            iterations = best.iterations,
            cost = best.total_cost(),
            "maximum number of linear iterations reached"
        );
        Ok(best.with_status(LinearOptimizationStatus::MaxIterationReached))
    }
}

/// Everything one optimization call reads.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationInputs<'a> {
    pub perimeter: &'a Perimeter,
    pub parameters: &'a RaoParameters,
    /// Flows before any optimization (MNEC and loop-flow references)
    pub initial_flow: &'a FlowResult,
    /// Situation at the start of this perimeter
    pub pre_perimeter: &'a LinearizationPoint,
    pub network_actions: &'a NetworkActionsResult,
    /// Whether this call may shrink ranges, if the parameters enable it
    pub range_shrinking: bool,
}

/// Builds the objective and the linear problem, then runs the loop.
pub fn optimize(inputs: OptimizationInputs<'_>, oracle: &mut dyn SensitivityOracle) -> RaoResult<LinearOptimizationResult> {
    inputs.parameters.validate()?;
    inputs.perimeter.validate()?;
    let context = FillerContext {
        perimeter: inputs.perimeter,
        parameters: inputs.parameters,
        initial_flow: inputs.initial_flow,
        pre_perimeter_flow: &inputs.pre_perimeter.flow,
    };
    let iterating = IteratingParameters::from_parameters(inputs.parameters, inputs.range_shrinking);
    let config = FillerConfig::new(inputs.parameters, inputs.perimeter, iterating.range_shrinking)?;
    let problem = LinearProblem::build(context, &config)?;
    let objective = UnevaluatedObjective::build(context, &inputs.pre_perimeter.sensitivity)?;
    IteratingLinearOptimizer::new(inputs.perimeter, &objective, inputs.network_actions, iterating).optimize(
        problem,
        oracle,
        inputs.pre_perimeter,
    )
}
