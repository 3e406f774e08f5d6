//! Cardinality limits on activated devices.
//!
//! Every limited device gets a binary `b` telling whether it moves in the
//! state. In a curative state the count also includes the devices already
//! activated at earlier curative instants of the same contingency.
//!
//! ```text
//! Σ b                       ≤ max_ra
//! Σ tso_used                ≤ max_tso        (tso_used ≥ b of each of its devices)
//! Σ b[tso]                  ≤ max_ra_per_tso
//! Σ b[tso, PST]             ≤ max_pst_per_tso
//! Σ |tap − pre_perimeter|   ≤ max_elementary_actions_per_tso
//! ```

use std::collections::{BTreeMap, BTreeSet};

use rao_core::{RangeAction, RangeActionActivationResult, RaoError, RaoResult, State, StateId};
use tracing::debug;

use super::{ensure_variation_binary, usage_limits_for, FillerContext, ProblemFiller, SETPOINT_BOUND_TOLERANCE};
use crate::config::{PstModel, RaUsageLimits};
use crate::linear::model::{ConstraintKey, Direction, LpModel, VarKey};
use crate::linear::LinearizationPoint;

/// Share of a tap step by which the initial angle may sit off a tap.
const PST_SETPOINT_RELAXATION: f64 = 0.3;

pub struct RaUsageLimitsFiller<'a> {
    context: FillerContext<'a>,
    instants: BTreeSet<String>,
}

impl<'a> RaUsageLimitsFiller<'a> {
    pub fn new(context: FillerContext<'a>, instants: BTreeSet<String>) -> Self {
        Self { context, instants }
    }

    fn approximated_taps(&self) -> bool {
        self.context.parameters.range_actions.pst_model == PstModel::ApproximatedIntegers
    }

    fn limited_states(&self) -> Vec<(&'a State, &'a RaUsageLimits)> {
        let parameters = self.context.parameters;
        self.context
            .perimeter
            .states()
            .iter()
            .filter(|state| self.instants.contains(&state.instant.id))
            .filter_map(|state| usage_limits_for(parameters, state).map(|limits| (state, limits)))
            .collect()
    }

    /// `state` plus the earlier curative states sharing its contingency.
    fn cumulative_states(&self, state: &State) -> Vec<(&'a State, Vec<&'a RangeAction>)> {
        self.context
            .perimeter
            .range_actions_per_state()
            .into_iter()
            .filter(|(candidate, _)| {
                if state.is_preventive() {
                    candidate.is_preventive()
                } else {
                    candidate.is_curative()
                        && candidate.contingency == state.contingency
                        && candidate.instant.order <= state.instant.order
                }
            })
            .collect()
    }

    fn relaxation(&self, range_action: &RangeAction) -> f64 {
        match range_action.tap_table() {
            Some(taps) if self.approximated_taps() => PST_SETPOINT_RELAXATION * taps.average_step(),
            _ => SETPOINT_BOUND_TOLERANCE,
        }
    }

    fn add_max_ra(&self, model: &mut LpModel, state: &State, max_ra: usize) -> RaoResult<()> {
        let considered = self.cumulative_states(state);
        let count: usize = considered.iter().map(|(_, ras)| ras.len()).sum();
        if max_ra >= count {
            return Ok(());
        }
        let constraint = model.add_constraint(ConstraintKey::MaxRa(state.id.clone()), 0.0, max_ra as f64)?;
        for (acting, ras) in considered {
            for ra in ras {
                constraint.set_coefficient(VarKey::VariationBinary(ra.id.clone(), acting.id.clone()), 1.0);
            }
        }
        Ok(())
    }

    /// `tso_used(tso, state) ≥ b` for every device of `tso` in `state`.
    fn ensure_tso_used(&self, model: &mut LpModel, tso: &str, state: &StateId) -> RaoResult<VarKey> {
        let used = VarKey::TsoUsed(tso.to_string(), state.clone());
        if model.has_variable(&used) {
            return Ok(used);
        }
        model.add_variable(used.clone(), 0.0, 1.0)?;
        for ra in self.context.perimeter.range_actions_for(state) {
            if ra.operator.as_deref() != Some(tso) {
                continue;
            }
            model
                .add_constraint(
                    ConstraintKey::TsoUsed(tso.to_string(), ra.id.clone(), state.clone()),
                    0.0,
                    f64::INFINITY,
                )?
                .set_coefficient(used.clone(), 1.0)
                .set_coefficient(VarKey::VariationBinary(ra.id.clone(), state.clone()), -1.0);
        }
        Ok(used)
    }

    fn add_max_tso(&self, model: &mut LpModel, state: &State, max_tso: usize) -> RaoResult<()> {
        let parameters = self.context.parameters;
        let considered = self.cumulative_states(state);
        let excluded: BTreeSet<&str> = considered
            .iter()
            .filter_map(|(s, _)| usage_limits_for(parameters, s))
            .flat_map(|limits| limits.max_tso_exclusion.iter().map(String::as_str))
            .collect();
        // operator -> states in which it owns a device
        let mut tsos: BTreeMap<&str, Vec<&StateId>> = BTreeMap::new();
        for (acting, ras) in &considered {
            for tso in ras.iter().filter_map(|ra| ra.operator.as_deref()) {
                if excluded.contains(tso) {
                    continue;
                }
                let states = tsos.entry(tso).or_default();
                if !states.contains(&&acting.id) {
                    states.push(&acting.id);
                }
            }
        }
        if max_tso >= tsos.len() {
            return Ok(());
        }

        let mut cumulative_vars = Vec::with_capacity(tsos.len());
        for (tso, states) in tsos {
            let cumulative = VarKey::TsoUsedCumulative(tso.to_string(), state.id.clone());
            model.add_variable(cumulative.clone(), 0.0, 1.0)?;
            let mut used = Vec::with_capacity(states.len());
            for acting in states {
                used.push(self.ensure_tso_used(model, tso, acting)?);
            }
            let constraint = model
                .add_constraint(
                    ConstraintKey::TsoUsedCumulative(tso.to_string(), state.id.clone()),
                    0.0,
                    f64::INFINITY,
                )?
                .set_coefficient(cumulative.clone(), 1.0);
            for var in used {
                constraint.set_coefficient(var, -1.0);
            }
            cumulative_vars.push(cumulative);
        }
        let constraint = model.add_constraint(ConstraintKey::MaxTso(state.id.clone()), 0.0, max_tso as f64)?;
        for var in cumulative_vars {
            constraint.set_coefficient(var, 1.0);
        }
        Ok(())
    }

    fn add_max_per_tso(
        &self,
        model: &mut LpModel,
        state: &State,
        limits: &BTreeMap<String, usize>,
        psts_only: bool,
    ) -> RaoResult<()> {
        let ras = self.context.perimeter.range_actions_for(&state.id);
        for (tso, limit) in limits {
            let key = if psts_only {
                ConstraintKey::MaxPstPerTso(tso.clone(), state.id.clone())
            } else {
                ConstraintKey::MaxRaPerTso(tso.clone(), state.id.clone())
            };
            let constraint = model.add_constraint(key, 0.0, *limit as f64)?;
            for ra in ras
                .iter()
                .filter(|ra| ra.operator.as_deref() == Some(tso.as_str()))
                .filter(|ra| !psts_only || ra.is_pst())
            {
                constraint.set_coefficient(VarKey::VariationBinary(ra.id.clone(), state.id.clone()), 1.0);
            }
        }
        Ok(())
    }

    /// Taps of `pst` before the perimeter and at the linearization point.
    fn tap_positions(
        activation: &RangeActionActivationResult,
        pst: &RangeAction,
        state: &StateId,
    ) -> RaoResult<(i32, i32)> {
        let taps = pst
            .tap_table()
            .ok_or_else(|| RaoError::Validation(format!("range action '{}' is not a PST", pst.id)))?;
        let pre_perimeter = activation
            .pre_perimeter_setpoint(&pst.id)
            .unwrap_or(pst.initial_setpoint);
        let current = activation
            .optimized_tap(pst, state)
            .unwrap_or_else(|| taps.closest_tap(pre_perimeter));
        Ok((taps.closest_tap(pre_perimeter), current))
    }

    /// Bounds `TFP[up] ≥ tap − pre_tap` and `TFP[down] ≥ pre_tap − tap`,
    /// expressed on the tap variations around the current tap.
    fn set_tap_distance_bounds(
        model: &mut LpModel,
        pst: &RangeAction,
        state: &StateId,
        pre_perimeter_tap: i32,
        current_tap: i32,
    ) -> RaoResult<()> {
        let shift = f64::from(current_tap - pre_perimeter_tap);
        model
            .constraint_mut(&ConstraintKey::TapFromPrePerimeter(pst.id.clone(), state.clone(), Direction::Upward))?
            .set_bounds(shift, f64::INFINITY);
        model
            .constraint_mut(&ConstraintKey::TapFromPrePerimeter(pst.id.clone(), state.clone(), Direction::Downward))?
            .set_bounds(-shift, f64::INFINITY);
        Ok(())
    }

    /// Absolute tap distance from the pre-perimeter tap.
    fn add_tap_distance(
        &self,
        model: &mut LpModel,
        point: &LinearizationPoint,
        pst: &RangeAction,
        state: &StateId,
    ) -> RaoResult<VarKey> {
        let distance = VarKey::TapFromPrePerimeter(pst.id.clone(), state.clone());
        model.add_variable(distance.clone(), 0.0, f64::INFINITY)?;
        let up_key = ConstraintKey::TapFromPrePerimeter(pst.id.clone(), state.clone(), Direction::Upward);
        let down_key = ConstraintKey::TapFromPrePerimeter(pst.id.clone(), state.clone(), Direction::Downward);
        let tap_up = VarKey::TapVariation(pst.id.clone(), state.clone(), Direction::Upward);

        if model.has_variable(&tap_up) {
            let tap_down = VarKey::TapVariation(pst.id.clone(), state.clone(), Direction::Downward);
            let (pre_perimeter_tap, current_tap) = Self::tap_positions(&point.activation, pst, state)?;
            model
                .add_constraint(up_key, f64::NEG_INFINITY, f64::INFINITY)?
                .set_coefficient(distance.clone(), 1.0)
                .set_coefficient(tap_up.clone(), -1.0)
                .set_coefficient(tap_down.clone(), 1.0);
            model
                .add_constraint(down_key, f64::NEG_INFINITY, f64::INFINITY)?
                .set_coefficient(distance.clone(), 1.0)
                .set_coefficient(tap_up, 1.0)
                .set_coefficient(tap_down, -1.0);
            Self::set_tap_distance_bounds(model, pst, state, pre_perimeter_tap, current_tap)?;
        } else {
            // continuous angle: distance in average tap steps
            let taps = pst
                .tap_table()
                .ok_or_else(|| RaoError::Validation(format!("range action '{}' is not a PST", pst.id)))?;
            let step = taps.average_step();
            let setpoint = VarKey::Setpoint(pst.id.clone(), state.clone());
            let pre_perimeter = point
                .activation
                .pre_perimeter_setpoint(&pst.id)
                .unwrap_or(pst.initial_setpoint);
            model
                .add_constraint(up_key, -pre_perimeter / step, f64::INFINITY)?
                .set_coefficient(distance.clone(), 1.0)
                .set_coefficient(setpoint.clone(), -1.0 / step);
            model
                .add_constraint(down_key, pre_perimeter / step, f64::INFINITY)?
                .set_coefficient(distance.clone(), 1.0)
                .set_coefficient(setpoint, 1.0 / step);
        }
        Ok(distance)
    }

    fn add_max_elementary_actions(
        &self,
        model: &mut LpModel,
        point: &LinearizationPoint,
        state: &State,
        limits: &BTreeMap<String, usize>,
    ) -> RaoResult<()> {
        let psts: Vec<&RangeAction> = self
            .context
            .perimeter
            .range_actions_for(&state.id)
            .into_iter()
            .filter(|ra| ra.is_pst())
            .collect();
        for (tso, limit) in limits {
            let mut distances = Vec::new();
            for pst in psts.iter().filter(|ra| ra.operator.as_deref() == Some(tso.as_str())) {
                distances.push(self.add_tap_distance(model, point, pst, &state.id)?);
            }
            let constraint = model.add_constraint(
                ConstraintKey::MaxElementaryActions(tso.clone(), state.id.clone()),
                0.0,
                *limit as f64,
            )?;
            for distance in distances {
                constraint.set_coefficient(distance, 1.0);
            }
        }
        Ok(())
    }
}

impl ProblemFiller for RaUsageLimitsFiller<'_> {
    fn name(&self) -> &'static str {
        "ra-usage-limits"
    }

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        let limited = self.limited_states();

        // binaries first: curative limits also count earlier curative states
        let counted: BTreeMap<&StateId, Vec<&RangeAction>> = limited
            .iter()
            .flat_map(|(state, _)| self.cumulative_states(state))
            .map(|(state, ras)| (&state.id, ras))
            .collect();
        for (state, ras) in counted {
            for ra in ras {
                ensure_variation_binary(model, ra, state, self.relaxation(ra))?;
            }
        }

        let mut ordered = limited;
        ordered.sort_by_key(|(state, _)| state.instant.order);
        for (state, limits) in ordered {
            debug!(state = %state.id, filler = self.name(), "adding usage limits");
            if let Some(max_ra) = limits.max_ra {
                self.add_max_ra(model, state, max_ra)?;
            }
            if let Some(max_tso) = limits.max_tso {
                self.add_max_tso(model, state, max_tso)?;
            }
            self.add_max_per_tso(model, state, &limits.max_ra_per_tso, false)?;
            self.add_max_per_tso(model, state, &limits.max_pst_per_tso, true)?;
            self.add_max_elementary_actions(model, point, state, &limits.max_elementary_actions_per_tso)?;
        }
        Ok(())
    }

    fn update_between_mip_iteration(
        &mut self,
        model: &mut LpModel,
        activation: &RangeActionActivationResult,
    ) -> RaoResult<()> {
        for (state, limits) in self.limited_states() {
            for pst in self.context.perimeter.range_actions_for(&state.id) {
                let tracked = pst
                    .operator
                    .as_ref()
                    .is_some_and(|tso| limits.max_elementary_actions_per_tso.contains_key(tso));
                let tap_up = VarKey::TapVariation(pst.id.clone(), state.id.clone(), Direction::Upward);
                if !pst.is_pst() || !tracked || !model.has_variable(&tap_up) {
                    continue;
                }
                let (pre_perimeter_tap, current_tap) = Self::tap_positions(activation, pst, &state.id)?;
                Self::set_tap_distance_bounds(model, pst, &state.id, pre_perimeter_tap, current_tap)?;
            }
        }
        Ok(())
    }
}
