//! Flow and set-point variables, linearized flow constraints and variation
//! penalties.
//!
//! ```text
//! F[c,s]   = ref[c,s] + Σ sens[c,s,r] · (S[r,t] − S_lin[r,t])
//! AV[r,t]  = U[r,t] + D[r,t]
//! S[r,t]   = pre[r] + U[r,t] − D[r,t]              (first state of r)
//! S[r,t]   = S[r,t'] + U[r,t] − D[r,t]             (r already available in t')
//! ```

use rao_core::{ComputationStatus, RangeAction, RaoError, RaoResult, State, Unit};
use tracing::debug;

use super::{
    acting_state, ensure_variation_binary, previous_acting_state, FillerContext, ProblemFiller,
    SETPOINT_BOUND_TOLERANCE,
};
use crate::config::PstModel;
use crate::linear::model::{ConstraintKey, Direction, LpModel, VarKey};
use crate::linear::LinearizationPoint;

/// Factor applied to the allowed set-point range at each relinearization.
pub const RANGE_SHRINK_RATE: f64 = 0.667;

pub struct CoreFiller<'a> {
    context: FillerContext<'a>,
    cost_optimization: bool,
    range_shrinking: bool,
    /// Number of fills performed while shrinking is active
    iteration: i32,
}

impl<'a> CoreFiller<'a> {
    pub fn new(context: FillerContext<'a>, cost_optimization: bool, range_shrinking: bool) -> Self {
        Self {
            context,
            cost_optimization,
            range_shrinking,
            iteration: 0,
        }
    }

    fn add_range_action_variables(&self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        let perimeter = self.context.perimeter;
        for (state, range_actions) in perimeter.range_actions_per_state() {
            for range_action in range_actions {
                let previous = previous_acting_state(perimeter, state, &range_action.id);
                let pre_perimeter = point
                    .activation
                    .pre_perimeter_setpoint(&range_action.id)
                    .unwrap_or(range_action.initial_setpoint);
                let (min, max) = match previous {
                    Some(_) => (
                        range_action.min_admissible_setpoint(),
                        range_action.max_admissible_setpoint(),
                    ),
                    None => (
                        range_action.min_admissible_setpoint().min(pre_perimeter),
                        range_action.max_admissible_setpoint().max(pre_perimeter),
                    ),
                };

                let (id, state_id) = (&range_action.id, &state.id);
                let setpoint = VarKey::Setpoint(id.clone(), state_id.clone());
                let absolute = VarKey::AbsoluteVariation(id.clone(), state_id.clone());
                let up = VarKey::Variation(id.clone(), state_id.clone(), Direction::Upward);
                let down = VarKey::Variation(id.clone(), state_id.clone(), Direction::Downward);

                model.add_variable(setpoint.clone(), min - SETPOINT_BOUND_TOLERANCE, max + SETPOINT_BOUND_TOLERANCE)?;
                model.add_variable(absolute.clone(), 0.0, f64::INFINITY)?;
                model.add_variable(up.clone(), 0.0, f64::INFINITY)?;
                model.add_variable(down.clone(), 0.0, f64::INFINITY)?;

                model
                    .add_constraint(ConstraintKey::AbsoluteVariation(id.clone(), state_id.clone()), 0.0, 0.0)?
                    .set_coefficient(absolute, 1.0)
                    .set_coefficient(up.clone(), -1.0)
                    .set_coefficient(down.clone(), -1.0);

                let rhs = if previous.is_some() { 0.0 } else { pre_perimeter };
                let variation = model
                    .add_constraint(ConstraintKey::SetpointVariation(id.clone(), state_id.clone()), rhs, rhs)?
                    .set_coefficient(setpoint, 1.0)
                    .set_coefficient(up, -1.0)
                    .set_coefficient(down, 1.0);
                if let Some(previous) = previous {
                    variation.set_coefficient(VarKey::Setpoint(id.clone(), previous.id.clone()), -1.0);
                }
            }
        }
        Ok(())
    }

    fn add_flow_constraints(&self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        let perimeter = self.context.perimeter;
        let thresholds = &self.context.parameters.range_actions;
        for cnec in perimeter.cnecs() {
            if point.sensitivity.computation_status_for(&cnec.state) == ComputationStatus::Failure {
                debug!(cnec = %cnec.id, state = %cnec.state, "sensitivity failed, cnec left out of the linear problem");
                continue;
            }
            for side in cnec.sides() {
                let reference = point.flow.flow(cnec, side, Unit::Megawatt);
                if reference.is_nan() {
                    return Err(RaoError::Sensitivity(format!(
                        "no reference flow for cnec '{}' on {side}",
                        cnec.id
                    )));
                }
                let flow = VarKey::Flow(cnec.id.clone(), side);
                model.add_variable(flow.clone(), f64::NEG_INFINITY, f64::INFINITY)?;

                let mut rhs = reference;
                let mut terms = Vec::new();
                for range_action in perimeter.range_actions() {
                    let Some(acting) = acting_state(perimeter, &cnec.state, &range_action.id) else {
                        continue;
                    };
                    let sensitivity = point.sensitivity.sensitivity_mw(&cnec.id, side, &range_action.id);
                    if sensitivity.abs() < thresholds.sensitivity_threshold(range_action.action_kind())
                        || sensitivity == 0.0
                    {
                        continue;
                    }
                    let current = point
                        .activation
                        .optimized_setpoint(&range_action.id, &acting.id)
                        .unwrap_or(range_action.initial_setpoint);
                    rhs -= sensitivity * current;
                    terms.push((VarKey::Setpoint(range_action.id.clone(), acting.id.clone()), -sensitivity));
                }

                let constraint = model.add_constraint(ConstraintKey::Flow(cnec.id.clone(), side), rhs, rhs)?;
                constraint.set_coefficient(flow, 1.0);
                for (setpoint, coefficient) in terms {
                    constraint.set_coefficient(setpoint, coefficient);
                }
            }
        }
        Ok(())
    }

    /// Keeps each set-point within a shrinking window around the linearization point.
    fn add_range_shrink(&self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        let factor = RANGE_SHRINK_RATE.powi(self.iteration);
        for (state, range_actions) in self.context.perimeter.range_actions_per_state() {
            for range_action in range_actions {
                let current = point
                    .activation
                    .optimized_setpoint(&range_action.id, &state.id)
                    .unwrap_or(range_action.initial_setpoint);
                let half_width =
                    (range_action.max_admissible_setpoint() - range_action.min_admissible_setpoint()) * factor;
                model
                    .add_constraint(
                        ConstraintKey::RangeShrink(range_action.id.clone(), state.id.clone()),
                        current - half_width,
                        current + half_width,
                    )?
                    .set_coefficient(VarKey::Setpoint(range_action.id.clone(), state.id.clone()), 1.0);
            }
        }
        Ok(())
    }

    fn fill_objective(&self, model: &mut LpModel) -> RaoResult<()> {
        let penalties = &self.context.parameters.range_actions;
        for (state, range_actions) in self.context.perimeter.range_actions_per_state() {
            for range_action in range_actions {
                model.add_objective_coefficient(
                    VarKey::AbsoluteVariation(range_action.id.clone(), state.id.clone()),
                    penalties.penalty_cost(range_action.action_kind()),
                );
                if self.cost_optimization {
                    self.add_activation_costs(model, range_action, state)?;
                }
            }
        }
        Ok(())
    }

    fn add_activation_costs(&self, model: &mut LpModel, range_action: &RangeAction, state: &State) -> RaoResult<()> {
        // integer PST models put the per-tap cost on the tap variables
        let per_setpoint_unit = match range_action.tap_table() {
            Some(_) if self.context.parameters.range_actions.pst_model == PstModel::ApproximatedIntegers => None,
            Some(taps) if taps.average_step() > 0.0 => Some(1.0 / taps.average_step()),
            Some(_) => None,
            None => Some(1.0),
        };
        if let Some(scale) = per_setpoint_unit {
            let (id, state_id) = (&range_action.id, &state.id);
            model.add_objective_coefficient(
                VarKey::Variation(id.clone(), state_id.clone(), Direction::Upward),
                range_action.variation_cost_up * scale,
            );
            model.add_objective_coefficient(
                VarKey::Variation(id.clone(), state_id.clone(), Direction::Downward),
                range_action.variation_cost_down * scale,
            );
        }
        if range_action.activation_cost > 0.0 {
            let binary = ensure_variation_binary(model, range_action, &state.id, SETPOINT_BOUND_TOLERANCE)?;
            model.add_objective_coefficient(binary, range_action.activation_cost);
        }
        Ok(())
    }
}

impl ProblemFiller for CoreFiller<'_> {
    fn name(&self) -> &'static str {
        "core"
    }

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        self.add_range_action_variables(model, point)?;
        self.add_flow_constraints(model, point)?;
        if self.range_shrinking {
            if self.iteration > 0 {
                self.add_range_shrink(model, point)?;
            }
            self.iteration += 1;
        }
        self.fill_objective(model)
    }
}
