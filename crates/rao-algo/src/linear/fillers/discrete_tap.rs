//! Integer tap model of PSTs.
//!
//! The angle stays continuous and is tied to integer tap variations:
//!
//! ```text
//! S[p,t] = angle_cur + up_factor·TU[p,t] − down_factor·TD[p,t]
//! Tap[p,t] = tap_cur + TU[p,t] − TD[p,t]
//! TU ≤ max_up·BU,  TD ≤ max_down·BD,  BU + BD ≤ 1
//! ```
//!
//! On the first fill the factors span the whole admissible range; afterwards
//! (and between MIP iterations) they are refined to a one-tap step around
//! the current tap.

use rao_core::{PstTapTable, RangeAction, RangeActionActivationResult, RaoError, RaoResult, State};

use super::{previous_acting_state, FillerContext, ProblemFiller};
use crate::linear::model::{ConstraintKey, Direction, LpModel, VarKey};
use crate::linear::LinearizationPoint;

pub struct DiscretePstTapFiller<'a> {
    context: FillerContext<'a>,
    cost_optimization: bool,
    fills: usize,
}

fn taps_of(range_action: &RangeAction) -> RaoResult<&PstTapTable> {
    range_action
        .tap_table()
        .ok_or_else(|| RaoError::Validation(format!("range action '{}' is not a PST", range_action.id)))
}

impl<'a> DiscretePstTapFiller<'a> {
    pub fn new(context: FillerContext<'a>, cost_optimization: bool) -> Self {
        Self {
            context,
            cost_optimization,
            fills: 0,
        }
    }

    fn psts_per_state(&self) -> Vec<(&'a State, Vec<&'a RangeAction>)> {
        self.context
            .perimeter
            .range_actions_per_state()
            .into_iter()
            .map(|(state, ras)| (state, ras.into_iter().filter(|ra| ra.is_pst()).collect::<Vec<_>>()))
            .filter(|(_, psts)| !psts.is_empty())
            .collect()
    }

    fn pre_perimeter_angle(&self, activation: &RangeActionActivationResult, pst: &RangeAction) -> f64 {
        activation
            .pre_perimeter_setpoint(&pst.id)
            .unwrap_or(pst.initial_setpoint)
    }

    /// Tap bounds reachable in `state`; the whole table when an earlier state
    /// may already have moved the PST.
    fn admissible_taps(
        &self,
        activation: &RangeActionActivationResult,
        pst: &RangeAction,
        state: &State,
    ) -> RaoResult<(i32, i32)> {
        let taps = taps_of(pst)?;
        if previous_acting_state(self.context.perimeter, state, &pst.id).is_some() {
            return Ok((taps.min_tap(), taps.max_tap()));
        }
        let pre_perimeter = self.pre_perimeter_angle(activation, pst);
        let first = taps.closest_tap(pst.min_admissible_setpoint().min(pre_perimeter));
        let second = taps.closest_tap(pst.max_admissible_setpoint().max(pre_perimeter));
        Ok((first.min(second), first.max(second)))
    }

    fn current_position(
        activation: &RangeActionActivationResult,
        pst: &RangeAction,
        state: &State,
    ) -> RaoResult<(f64, i32)> {
        let taps = taps_of(pst)?;
        let angle = activation
            .optimized_setpoint(&pst.id, &state.id)
            .unwrap_or(pst.initial_setpoint);
        Ok((angle, taps.closest_tap(angle)))
    }

    fn build(&self, model: &mut LpModel, point: &LinearizationPoint, pst: &RangeAction, state: &State) -> RaoResult<()> {
        let taps = taps_of(pst)?;
        let (angle, tap) = Self::current_position(&point.activation, pst, state)?;
        let (min_tap, max_tap) = self.admissible_taps(&point.activation, pst, state)?;
        let max_down = (tap - min_tap).max(0);
        let max_up = (max_tap - tap).max(0);
        let (id, state_id) = (&pst.id, &state.id);

        let up = VarKey::TapVariation(id.clone(), state_id.clone(), Direction::Upward);
        let down = VarKey::TapVariation(id.clone(), state_id.clone(), Direction::Downward);
        let up_binary = VarKey::TapVariationBinary(id.clone(), state_id.clone(), Direction::Upward);
        let down_binary = VarKey::TapVariationBinary(id.clone(), state_id.clone(), Direction::Downward);
        let span = f64::from(max_down + max_up);
        model.add_integer_variable(up.clone(), 0.0, span)?;
        model.add_integer_variable(down.clone(), 0.0, span)?;
        model.add_binary_variable(up_binary.clone())?;
        model.add_binary_variable(down_binary.clone())?;

        let conversion = model
            .add_constraint(ConstraintKey::TapToAngle(id.clone(), state_id.clone()), angle, angle)?
            .set_coefficient(VarKey::Setpoint(id.clone(), state_id.clone()), 1.0);
        if max_down > 0 {
            let factor = (taps.angle(tap)? - taps.angle(min_tap)?) / f64::from(max_down);
            conversion.set_coefficient(down.clone(), factor);
        }
        if max_up > 0 {
            let factor = (taps.angle(max_tap)? - taps.angle(tap)?) / f64::from(max_up);
            conversion.set_coefficient(up.clone(), -factor);
        }

        model
            .add_constraint(ConstraintKey::UpOrDown(id.clone(), state_id.clone()), f64::NEG_INFINITY, 1.0)?
            .set_coefficient(up_binary.clone(), 1.0)
            .set_coefficient(down_binary.clone(), 1.0);
        model
            .add_constraint(
                ConstraintKey::TapDirection(id.clone(), state_id.clone(), Direction::Downward),
                f64::NEG_INFINITY,
                0.0,
            )?
            .set_coefficient(down.clone(), 1.0)
            .set_coefficient(down_binary, -f64::from(max_down));
        model
            .add_constraint(
                ConstraintKey::TapDirection(id.clone(), state_id.clone(), Direction::Upward),
                f64::NEG_INFINITY,
                0.0,
            )?
            .set_coefficient(up.clone(), 1.0)
            .set_coefficient(up_binary, -f64::from(max_up));

        let tap_variable = VarKey::Tap(id.clone(), state_id.clone());
        model.add_variable(tap_variable.clone(), f64::from(taps.min_tap()), f64::from(taps.max_tap()))?;
        model
            .add_constraint(ConstraintKey::Tap(id.clone(), state_id.clone()), f64::from(tap), f64::from(tap))?
            .set_coefficient(tap_variable.clone(), 1.0)
            .set_coefficient(up, -1.0)
            .set_coefficient(down, 1.0);

        if self.cost_optimization {
            // TTU − TTD = Tap − reference tap
            let total_up = VarKey::TotalTapVariation(id.clone(), state_id.clone(), Direction::Upward);
            let total_down = VarKey::TotalTapVariation(id.clone(), state_id.clone(), Direction::Downward);
            model.add_variable(total_up.clone(), 0.0, f64::INFINITY)?;
            model.add_variable(total_down.clone(), 0.0, f64::INFINITY)?;
            let previous = previous_acting_state(self.context.perimeter, state, id);
            let rhs = match previous {
                Some(_) => 0.0,
                None => -f64::from(taps.closest_tap(self.pre_perimeter_angle(&point.activation, pst))),
            };
            let total = model
                .add_constraint(ConstraintKey::TotalTapVariation(id.clone(), state_id.clone()), rhs, rhs)?
                .set_coefficient(total_up, 1.0)
                .set_coefficient(total_down, -1.0)
                .set_coefficient(tap_variable, -1.0);
            if let Some(previous) = previous {
                total.set_coefficient(VarKey::Tap(id.clone(), previous.id.clone()), 1.0);
            }
        }
        Ok(())
    }

    /// Recenters the tap model on the tap reached in `activation`.
    fn refine(&self, model: &mut LpModel, activation: &RangeActionActivationResult, pst: &RangeAction, state: &State) -> RaoResult<()> {
        let taps = taps_of(pst)?;
        let (angle, tap) = Self::current_position(activation, pst, state)?;
        let (min_tap, max_tap) = self.admissible_taps(activation, pst, state)?;
        let max_down = (tap - min_tap).max(0);
        let max_up = (max_tap - tap).max(0);
        let (id, state_id) = (&pst.id, &state.id);
        let up = VarKey::TapVariation(id.clone(), state_id.clone(), Direction::Upward);
        let down = VarKey::TapVariation(id.clone(), state_id.clone(), Direction::Downward);

        let conversion = model.constraint_mut(&ConstraintKey::TapToAngle(id.clone(), state_id.clone()))?;
        conversion.set_bounds(angle, angle);
        if taps.contains(tap + 1) {
            conversion.set_coefficient(up, -(taps.angle(tap + 1)? - taps.angle(tap)?));
        }
        if taps.contains(tap - 1) {
            conversion.set_coefficient(down, taps.angle(tap)? - taps.angle(tap - 1)?);
        }

        model
            .constraint_mut(&ConstraintKey::TapDirection(id.clone(), state_id.clone(), Direction::Downward))?
            .set_coefficient(
                VarKey::TapVariationBinary(id.clone(), state_id.clone(), Direction::Downward),
                -f64::from(max_down),
            );
        model
            .constraint_mut(&ConstraintKey::TapDirection(id.clone(), state_id.clone(), Direction::Upward))?
            .set_coefficient(
                VarKey::TapVariationBinary(id.clone(), state_id.clone(), Direction::Upward),
                -f64::from(max_up),
            );
        model
            .constraint_mut(&ConstraintKey::Tap(id.clone(), state_id.clone()))?
            .set_bounds(f64::from(tap), f64::from(tap));
        Ok(())
    }

    fn refine_all(&self, model: &mut LpModel, activation: &RangeActionActivationResult) -> RaoResult<()> {
        for (state, psts) in self.psts_per_state() {
            for pst in psts {
                self.refine(model, activation, pst, state)?;
            }
        }
        Ok(())
    }
}

impl ProblemFiller for DiscretePstTapFiller<'_> {
    fn name(&self) -> &'static str {
        "discrete-pst-tap"
    }

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        self.fills += 1;
        for (state, psts) in self.psts_per_state() {
            for pst in psts {
                self.build(model, point, pst, state)?;
            }
        }
        if self.fills > 1 {
            self.refine_all(model, &point.activation)?;
        }
        if self.cost_optimization {
            let default_cost = self.context.parameters.range_actions.pst_penalty_cost;
            for (state, psts) in self.psts_per_state() {
                for pst in psts {
                    let cost = |c: f64| if c > 0.0 { c } else { default_cost };
                    model.add_objective_coefficient(
                        VarKey::TotalTapVariation(pst.id.clone(), state.id.clone(), Direction::Upward),
                        cost(pst.variation_cost_up),
                    );
                    model.add_objective_coefficient(
                        VarKey::TotalTapVariation(pst.id.clone(), state.id.clone(), Direction::Downward),
                        cost(pst.variation_cost_down),
                    );
                }
            }
        }
        Ok(())
    }

    fn update_between_mip_iteration(
        &mut self,
        model: &mut LpModel,
        activation: &RangeActionActivationResult,
    ) -> RaoResult<()> {
        self.refine_all(model, activation)
    }
}
