//! The linear relaxation of the network response.
//!
//! A [`LinearProblem`] owns the fillers selected for one optimization call
//! and the [`LpModel`] they write into. Each (re)linearization clears the
//! model and lets every filler contribute again around the new
//! [`LinearizationPoint`]; between the two solves of an approximated-integer
//! iteration the fillers only patch the existing model.
//!
//! The optimizer only sees the [`RelaxedProblem`] trait, so scenarios can be
//! driven by scripted problems in tests.

use rao_core::{
    FlowResult, RangeActionActivationResult, RangeActionId, RaoError, RaoResult,
    SensitivityResult, StateId,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod fillers;
pub mod model;
pub mod solver;

pub use fillers::{select_fillers, FillerConfig, FillerContext, FillerSpec, ProblemFiller};
pub use model::{ConstraintKey, LpModel, VarKey};
pub use solver::{solve, LpSolution, LpSolverKind};

use crate::config::LinearSolverParameters;

/// Outcome of a linear solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinearProblemStatus {
    Optimal,
    Feasible,
    Infeasible,
    Unbounded,
    Abnormal,
}

impl LinearProblemStatus {
    /// Whether the solution can be read.
    pub fn is_usable(self) -> bool {
        matches!(self, LinearProblemStatus::Optimal | LinearProblemStatus::Feasible)
    }
}

/// Flows, sensitivities and set-points around which the problem is linearized.
#[derive(Debug, Clone)]
pub struct LinearizationPoint {
    pub flow: FlowResult,
    pub sensitivity: SensitivityResult,
    pub activation: RangeActionActivationResult,
}

/// What the iterating optimizer needs from the linear problem.
pub trait RelaxedProblem {
    /// Rebuilds the problem around a new sensitivity computation.
    fn update_between_sensi_iteration(&mut self, point: &LinearizationPoint) -> RaoResult<()>;

    /// Recenters integer tap variables on the rounded solution.
    fn update_between_mip_iteration(&mut self, activation: &RangeActionActivationResult) -> RaoResult<()>;

    fn solve(&mut self) -> RaoResult<LinearProblemStatus>;

    /// Solved set-point of `range_action` in `state`.
    fn setpoint(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64>;

    /// Solved tap of a PST under the integer tap model.
    fn tap(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64>;
}

/// Fillers plus model, solved with `good_lp`.
pub struct LinearProblem<'a> {
    fillers: Vec<Box<dyn ProblemFiller + 'a>>,
    model: LpModel,
    solver: LinearSolverParameters,
    solution: Option<LpSolution>,
}

impl<'a> LinearProblem<'a> {
    /// Instantiates the fillers selected by `config`. The model stays empty
    /// until the first [`fill`](Self::fill).
    pub fn build(context: FillerContext<'a>, config: &FillerConfig) -> RaoResult<Self> {
        let specs = select_fillers(config);
        let solver = context.parameters.solver.clone();
        let needs_integers = specs.iter().any(|spec| match spec {
            FillerSpec::MaxMinRelativeMargin
            | FillerSpec::UnoptimizedCnec(_)
            | FillerSpec::DiscretePstTap { .. }
            | FillerSpec::RaUsageLimits(_) => true,
            // activation costs are carried by variation binaries
            FillerSpec::Core {
                cost_optimization: true,
                ..
            } => context.perimeter.range_actions().any(|ra| ra.activation_cost > 0.0),
            _ => false,
        });
        if needs_integers && !solver.solver.supports_integers() {
            return Err(RaoError::Config(format!(
                "solver '{}' cannot handle the integer variables of fillers {:?}",
                solver.solver,
                specs.iter().map(FillerSpec::name).collect::<Vec<_>>()
            )));
        }
        let fillers = specs
            .into_iter()
            .map(|spec| spec.into_filler(context))
            .collect::<RaoResult<Vec<_>>>()?;
        debug!(
            fillers = ?fillers.iter().map(|f| f.name()).collect::<Vec<_>>(),
            "linear problem built"
        );
        Ok(Self {
            fillers,
            model: LpModel::new(),
            solver,
            solution: None,
        })
    }

    /// Clears the model and lets every filler contribute around `point`.
    pub fn fill(&mut self, point: &LinearizationPoint) -> RaoResult<()> {
        self.model.clear();
        self.solution = None;
        for filler in &mut self.fillers {
            filler.fill(&mut self.model, point)?;
            debug!(
                filler = filler.name(),
                variables = self.model.num_variables(),
                constraints = self.model.num_constraints(),
                "filler applied"
            );
        }
        Ok(())
    }

    pub fn filler_names(&self) -> Vec<&'static str> {
        self.fillers.iter().map(|f| f.name()).collect()
    }
}

impl RelaxedProblem for LinearProblem<'_> {
    fn update_between_sensi_iteration(&mut self, point: &LinearizationPoint) -> RaoResult<()> {
        self.fill(point)
    }

    fn update_between_mip_iteration(&mut self, activation: &RangeActionActivationResult) -> RaoResult<()> {
        self.solution = None;
        for filler in &mut self.fillers {
            filler.update_between_mip_iteration(&mut self.model, activation)?;
        }
        Ok(())
    }

    fn solve(&mut self) -> RaoResult<LinearProblemStatus> {
        let solution = solve(&self.model, &self.solver)?;
        let status = solution.status;
        debug!(?status, objective = solution.objective, "linear problem solved");
        self.solution = Some(solution);
        Ok(status)
    }

    fn setpoint(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64> {
        self.solution
            .as_ref()?
            .value(&VarKey::Setpoint(range_action.clone(), state.clone()))
    }

    fn tap(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64> {
        self.solution
            .as_ref()?
            .value(&VarKey::Tap(range_action.clone(), state.clone()))
    }
}
