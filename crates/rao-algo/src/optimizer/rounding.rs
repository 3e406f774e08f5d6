//! Solved set-points to physically reachable ones.

use rao_core::{Perimeter, RangeActionActivationResult, RaoResult};

use super::best_tap::BestTapFinder;
use super::scratch::ScratchArena;
use super::LinearOptimizationResult;
use crate::config::PstModel;
use crate::linear::RelaxedProblem;

/// Continuous solution of `problem`, on top of the pre-perimeter set-points.
pub(crate) fn linear_activation(
    perimeter: &Perimeter,
    problem: &impl RelaxedProblem,
    base: &RangeActionActivationResult,
) -> RangeActionActivationResult {
    let mut activation = RangeActionActivationResult::new(base.pre_perimeter_setpoints().clone(), base.states().to_vec());
    for (state, range_actions) in perimeter.range_actions_per_state() {
        for range_action in range_actions {
            if let Some(setpoint) = problem.setpoint(&range_action.id, &state.id) {
                activation.set_setpoint(range_action.id.clone(), state.id.clone(), setpoint);
            }
        }
    }
    activation
}

/// Rounds the solution of `problem`.
///
/// Only devices the solver moved are set; the others keep the set-point of
/// the preceding state. Non-PST devices go to the nearest integer. PSTs take
/// the tap of the integer tap variable under the integer model, and the
/// best tap around `best` otherwise.
pub(crate) fn round_activation(
    perimeter: &Perimeter,
    problem: &impl RelaxedProblem,
    pst_model: PstModel,
    best: &LinearOptimizationResult,
    scratch: &ScratchArena,
) -> RaoResult<RangeActionActivationResult> {
    let linear = linear_activation(perimeter, problem, &best.activation);
    let mut rounded =
        RangeActionActivationResult::new(best.activation.pre_perimeter_setpoints().clone(), best.activation.states().to_vec());
    let finder = BestTapFinder::new(
        perimeter,
        &best.flow,
        &best.sensitivity,
        &best.activation,
        &best.costs.functional.limiting,
    );

    for (state, range_actions) in perimeter.range_actions_per_state() {
        let activated = linear.activated_range_actions(&state.id);
        let mut continuous_psts = scratch.alloc_vec();
        for range_action in range_actions.into_iter().filter(|ra| activated.contains(&ra.id)) {
            let Some(setpoint) = linear.optimized_setpoint(&range_action.id, &state.id) else {
                continue;
            };
            match (range_action.tap_table(), pst_model) {
                (None, _) => rounded.set_setpoint(range_action.id.clone(), state.id.clone(), setpoint.round()),
                (Some(_), PstModel::Continuous) => continuous_psts.push((range_action, setpoint)),
                (Some(taps), PstModel::ApproximatedIntegers) => {
                    let tap = match problem.tap(&range_action.id, &state.id) {
                        Some(tap) => (tap.round() as i32).clamp(taps.min_tap(), taps.max_tap()),
                        None => taps.closest_tap(setpoint),
                    };
                    rounded.set_setpoint(range_action.id.clone(), state.id.clone(), taps.angle(tap)?);
                }
            }
        }
        if continuous_psts.is_empty() {
            continue;
        }
        for (id, tap) in finder.best_taps(&continuous_psts, &state.id, scratch) {
            if let Some(taps) = perimeter.range_action(&id).and_then(|ra| ra.tap_table()) {
                rounded.set_setpoint(id, state.id.clone(), taps.angle(tap)?);
            }
        }
    }
    Ok(rounded)
}
