//! Problem fillers: the building blocks of the linear problem.
//!
//! Which fillers take part in an optimization is a pure function of the
//! configuration ([`select_fillers`]); each [`FillerSpec`] then becomes a
//! boxed [`ProblemFiller`] bound to the static inputs of the call.
//!
//! | Spec | Adds |
//! |------|------|
//! | `Core` | flow and set-point variables, sensitivity constraints, penalties |
//! | `MaxMinMargin` / `MaxMinRelativeMargin` | worst-margin variable maximized |
//! | `MinMarginViolation` | penalized negative margin (cost mode) |
//! | `Mnec` | soft limits on monitored elements |
//! | `LoopFlow` | soft limits on loop flows |
//! | `UnoptimizedCnec` | binaries removing cnecs from the min margin |
//! | `DiscretePstTap` / `DiscretePstGroup` | integer tap variables |
//! | `ContinuousGroup` | equal set-points inside a group |
//! | `RaUsageLimits` | cardinality limits on activated devices |

use std::collections::BTreeSet;

use rao_core::{
    FlowCnec, FlowResult, Perimeter, RangeAction, RangeActionActivationResult, RangeActionId,
    RaoResult, State, StateId, Unit,
};

use super::model::{ConstraintKey, Direction, LpModel, VarKey};
use super::LinearizationPoint;
use crate::config::{
    LoopFlowParameters, MnecParameters, ObjectiveKind, PstModel, RaUsageLimits, RaoParameters,
};

mod core_problem;
mod discrete_tap;
mod groups;
mod loop_flow;
mod max_min_margin;
mod mnec;
mod unoptimized_cnec;
mod usage_limits;

pub use core_problem::CoreFiller;
pub use discrete_tap::DiscretePstTapFiller;
pub use groups::{ContinuousGroupFiller, DiscretePstGroupFiller};
pub use loop_flow::LoopFlowFiller;
pub use max_min_margin::{
    MaxMinMarginFiller, MaxMinRelativeMarginFiller, MinMarginViolationFiller, MARGIN_PENALTY_COEFFICIENT,
};
pub use mnec::MnecFiller;
pub use unoptimized_cnec::{UnoptimizedCnecFiller, UnoptimizedCnecRule};
pub use usage_limits::RaUsageLimitsFiller;

/// Bound slack added around admissible set-points.
pub(crate) const SETPOINT_BOUND_TOLERANCE: f64 = 1e-5;

/// A contribution to the linear problem.
///
/// `fill` is called on an empty model whenever the problem is
/// (re)linearized; `update_between_mip_iteration` edits the filled model in
/// place between the two solves of an approximated-integer iteration.
pub trait ProblemFiller {
    fn name(&self) -> &'static str;

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()>;

    fn update_between_mip_iteration(
        &mut self,
        _model: &mut LpModel,
        _activation: &RangeActionActivationResult,
    ) -> RaoResult<()> {
        Ok(())
    }
}

/// Inputs that stay fixed during one optimization call.
#[derive(Debug, Clone, Copy)]
pub struct FillerContext<'a> {
    pub perimeter: &'a Perimeter,
    pub parameters: &'a RaoParameters,
    /// Flows before any optimization (MNEC and loop-flow references)
    pub initial_flow: &'a FlowResult,
    /// Flows at the start of this perimeter (unoptimized cnec references)
    pub pre_perimeter_flow: &'a FlowResult,
}

/// Every option that influences filler selection.
#[derive(Debug, Clone, PartialEq)]
pub struct FillerConfig {
    pub objective: ObjectiveKind,
    pub unit: Unit,
    pub pst_model: PstModel,
    pub range_shrinking: bool,
    pub mnec: Option<MnecParameters>,
    pub loop_flow: Option<LoopFlowParameters>,
    pub unoptimized_cnec_rule: Option<UnoptimizedCnecRule>,
    pub has_monitored_cnecs: bool,
    pub has_loop_flow_cnecs: bool,
    pub has_groups: bool,
    pub has_psts: bool,
    /// Instants carrying at least one finite usage limit
    pub limited_instants: BTreeSet<String>,
}

impl FillerConfig {
    /// Derives the selection options from parameters and perimeter.
    pub fn new(parameters: &RaoParameters, perimeter: &Perimeter, range_shrinking: bool) -> RaoResult<Self> {
        parameters.validate()?;
        let unoptimized_cnec_rule = unoptimized_cnec_rule(parameters, perimeter);
        let instants_in_perimeter: BTreeSet<&str> =
            perimeter.states().iter().map(|s| s.instant.id.as_str()).collect();
        Ok(Self {
            objective: parameters.objective.kind,
            unit: parameters.objective.unit,
            pst_model: parameters.range_actions.pst_model,
            range_shrinking,
            mnec: parameters.mnec.clone(),
            loop_flow: parameters.loop_flow.clone(),
            unoptimized_cnec_rule,
            has_monitored_cnecs: perimeter.monitored_cnecs().next().is_some(),
            has_loop_flow_cnecs: perimeter.loop_flow_cnecs().next().is_some(),
            has_groups: !perimeter.groups().is_empty(),
            has_psts: perimeter.range_actions().any(RangeAction::is_pst),
            limited_instants: parameters
                .usage_limits
                .iter()
                .filter(|(instant, limits)| {
                    limits.is_limited() && instants_in_perimeter.contains(instant.as_str())
                })
                .map(|(instant, _)| instant.clone())
                .collect(),
        })
    }
}

/// Rule removing cnecs from the min margin, if any applies to `perimeter`.
///
/// Unoptimized-cnec rules only apply to curative perimeters.
pub fn unoptimized_cnec_rule(parameters: &RaoParameters, perimeter: &Perimeter) -> Option<UnoptimizedCnecRule> {
    let unoptimized = &parameters.unoptimized_cnecs;
    if !perimeter.is_curative() {
        None
    } else if !unoptimized.operators_not_to_optimize.is_empty() {
        Some(UnoptimizedCnecRule::MarginDecrease(
            unoptimized.operators_not_to_optimize.clone(),
        ))
    } else if !unoptimized.cnecs_secured_by_pst.is_empty() {
        Some(UnoptimizedCnecRule::PstLimitation(unoptimized.cnecs_secured_by_pst.clone()))
    } else {
        None
    }
}

/// A filler to instantiate, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum FillerSpec {
    Core { cost_optimization: bool, range_shrinking: bool },
    MaxMinMargin,
    MaxMinRelativeMargin,
    MinMarginViolation,
    Mnec(MnecParameters),
    LoopFlow(LoopFlowParameters),
    UnoptimizedCnec(UnoptimizedCnecRule),
    DiscretePstTap { cost_optimization: bool },
    DiscretePstGroup,
    ContinuousGroup { include_psts: bool },
    RaUsageLimits(BTreeSet<String>),
}

impl FillerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            FillerSpec::Core { .. } => "core",
            FillerSpec::MaxMinMargin => "max-min-margin",
            FillerSpec::MaxMinRelativeMargin => "max-min-relative-margin",
            FillerSpec::MinMarginViolation => "min-margin-violation",
            FillerSpec::Mnec(_) => "mnec",
            FillerSpec::LoopFlow(_) => "loop-flow",
            FillerSpec::UnoptimizedCnec(_) => "unoptimized-cnec",
            FillerSpec::DiscretePstTap { .. } => "discrete-pst-tap",
            FillerSpec::DiscretePstGroup => "discrete-pst-group",
            FillerSpec::ContinuousGroup { .. } => "continuous-group",
            FillerSpec::RaUsageLimits(_) => "ra-usage-limits",
        }
    }

    /// Binds the spec to the inputs of one optimization call.
    pub fn into_filler<'a>(self, context: FillerContext<'a>) -> RaoResult<Box<dyn ProblemFiller + 'a>> {
        let filler: Box<dyn ProblemFiller + 'a> = match self {
            FillerSpec::Core {
                cost_optimization,
                range_shrinking,
            } => Box::new(CoreFiller::new(context, cost_optimization, range_shrinking)),
            FillerSpec::MaxMinMargin => Box::new(MaxMinMarginFiller::new(context)),
            FillerSpec::MaxMinRelativeMargin => Box::new(MaxMinRelativeMarginFiller::new(context)),
            FillerSpec::MinMarginViolation => Box::new(MinMarginViolationFiller::new(context)),
            FillerSpec::Mnec(parameters) => Box::new(MnecFiller::new(context, parameters)),
            FillerSpec::LoopFlow(parameters) => Box::new(LoopFlowFiller::new(context, parameters)),
            FillerSpec::UnoptimizedCnec(rule) => Box::new(UnoptimizedCnecFiller::new(context, rule)?),
            FillerSpec::DiscretePstTap { cost_optimization } => {
                Box::new(DiscretePstTapFiller::new(context, cost_optimization))
            }
            FillerSpec::DiscretePstGroup => Box::new(DiscretePstGroupFiller::new(context)),
            FillerSpec::ContinuousGroup { include_psts } => {
                Box::new(ContinuousGroupFiller::new(context, include_psts))
            }
            FillerSpec::RaUsageLimits(instants) => Box::new(RaUsageLimitsFiller::new(context, instants)),
        };
        Ok(filler)
    }
}

/// Ordered list of fillers required by `config`.
pub fn select_fillers(config: &FillerConfig) -> Vec<FillerSpec> {
    let cost_optimization = config.objective.is_cost_optimization();
    let mut specs = vec![FillerSpec::Core {
        cost_optimization,
        range_shrinking: config.range_shrinking,
    }];

    specs.push(match config.objective {
        ObjectiveKind::MaxMinMargin => FillerSpec::MaxMinMargin,
        ObjectiveKind::MaxMinRelativeMargin => FillerSpec::MaxMinRelativeMargin,
        ObjectiveKind::MinCost => FillerSpec::MinMarginViolation,
    });

    if let Some(mnec) = &config.mnec {
        if config.has_monitored_cnecs {
            specs.push(FillerSpec::Mnec(mnec.clone()));
        }
    }
    if let Some(loop_flow) = &config.loop_flow {
        if config.has_loop_flow_cnecs {
            specs.push(FillerSpec::LoopFlow(loop_flow.clone()));
        }
    }
    if let Some(rule) = &config.unoptimized_cnec_rule {
        specs.push(FillerSpec::UnoptimizedCnec(rule.clone()));
    }

    match config.pst_model {
        PstModel::ApproximatedIntegers if config.has_psts => {
            specs.push(FillerSpec::DiscretePstTap { cost_optimization });
            if config.has_groups {
                specs.push(FillerSpec::DiscretePstGroup);
                specs.push(FillerSpec::ContinuousGroup { include_psts: false });
            }
        }
        _ => {
            if config.has_groups {
                specs.push(FillerSpec::ContinuousGroup { include_psts: true });
            }
        }
    }

    if !config.limited_instants.is_empty() {
        specs.push(FillerSpec::RaUsageLimits(config.limited_instants.clone()));
    }
    specs
}

/// Usage limits configured for the instant of `state`.
pub(crate) fn usage_limits_for<'p>(parameters: &'p RaoParameters, state: &State) -> Option<&'p RaUsageLimits> {
    parameters.usage_limits.get(&state.instant.id)
}

/// State whose set-point variable of `range_action` drives flows in `state`.
///
/// That is the latest perimeter state, not after `state` and on the same
/// contingency (or preventive), where the device is available.
pub(crate) fn acting_state<'p>(
    perimeter: &'p Perimeter,
    state: &StateId,
    range_action: &RangeActionId,
) -> Option<&'p State> {
    let target = perimeter.state(state)?;
    perimeter
        .states()
        .iter()
        .filter(|s| {
            s.instant.order <= target.instant.order
                && (s.is_preventive() || s.contingency == target.contingency)
        })
        .filter(|s| {
            perimeter
                .range_actions_for(&s.id)
                .iter()
                .any(|ra| &ra.id == range_action)
        })
        .last()
}

/// Earlier perimeter state in which `range_action` was already available.
pub(crate) fn previous_acting_state<'p>(
    perimeter: &'p Perimeter,
    state: &State,
    range_action: &RangeActionId,
) -> Option<&'p State> {
    perimeter
        .states()
        .iter()
        .take_while(|s| s.id != state.id)
        .filter(|s| s.is_preventive() || s.contingency == state.contingency)
        .filter(|s| {
            perimeter
                .range_actions_for(&s.id)
                .iter()
                .any(|ra| &ra.id == range_action)
        })
        .last()
}

/// MW represented by one unit of the objective `unit` on `cnec`.
pub(crate) fn megawatt_per_unit(cnec: &FlowCnec, unit: Unit) -> f64 {
    cnec.convert(1.0, unit, Unit::Megawatt)
}

/// Largest threshold among optimized cnecs, in MW.
pub(crate) fn highest_threshold_mw(perimeter: &Perimeter) -> f64 {
    perimeter
        .optimized_cnecs()
        .map(|cnec| cnec.largest_threshold(Unit::Megawatt))
        .fold(0.0, f64::max)
}

/// Creates, once, the binary telling whether `range_action` moves in `state`.
///
/// `Variation(Up) + Variation(Down) <= binary · (range + relaxation)`.
pub(crate) fn ensure_variation_binary(
    model: &mut LpModel,
    range_action: &RangeAction,
    state: &StateId,
    relaxation: f64,
) -> RaoResult<VarKey> {
    let binary = VarKey::VariationBinary(range_action.id.clone(), state.clone());
    if model.has_variable(&binary) {
        return Ok(binary);
    }
    model.add_binary_variable(binary.clone())?;
    let range = range_action.max_admissible_setpoint() - range_action.min_admissible_setpoint();
    let up = VarKey::Variation(range_action.id.clone(), state.clone(), Direction::Upward);
    let down = VarKey::Variation(range_action.id.clone(), state.clone(), Direction::Downward);
    model
        .add_constraint(
            ConstraintKey::IsVariation(range_action.id.clone(), state.clone()),
            f64::NEG_INFINITY,
            relaxation,
        )?
        .set_coefficient(up, 1.0)
        .set_coefficient(down, 1.0)
        .set_coefficient(binary.clone(), -(range + relaxation));
    Ok(binary)
}
