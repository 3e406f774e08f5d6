//! Devices sharing a group id move together.
//!
//! Each member is tied to a shared group variable per state: the set-point
//! for continuous devices, the tap for PSTs under the integer tap model.

use rao_core::{RangeAction, RaoResult, State};

use super::{FillerContext, ProblemFiller};
use crate::linear::model::{ConstraintKey, LpModel, VarKey};
use crate::linear::LinearizationPoint;

/// Grouped members available in each state.
fn grouped<'p>(
    context: &FillerContext<'p>,
    keep: impl Fn(&RangeAction) -> bool,
) -> Vec<(&'p State, Vec<(&'p str, &'p RangeAction)>)> {
    context
        .perimeter
        .range_actions_per_state()
        .into_iter()
        .map(|(state, ras)| {
            let members = ras
                .into_iter()
                .filter(|ra| keep(ra))
                .filter_map(|ra| ra.group_id.as_deref().map(|group| (group, ra)))
                .collect::<Vec<_>>();
            (state, members)
        })
        .filter(|(_, members)| !members.is_empty())
        .collect()
}

/// Equal set-points inside a group.
pub struct ContinuousGroupFiller<'a> {
    context: FillerContext<'a>,
    include_psts: bool,
}

impl<'a> ContinuousGroupFiller<'a> {
    pub fn new(context: FillerContext<'a>, include_psts: bool) -> Self {
        Self { context, include_psts }
    }
}

impl ProblemFiller for ContinuousGroupFiller<'_> {
    fn name(&self) -> &'static str {
        "continuous-group"
    }

    fn fill(&mut self, model: &mut LpModel, _point: &LinearizationPoint) -> RaoResult<()> {
        let include_psts = self.include_psts;
        for (state, members) in grouped(&self.context, |ra| include_psts || !ra.is_pst()) {
            for (group, range_action) in members {
                let shared = VarKey::GroupSetpoint(group.to_string(), state.id.clone());
                if !model.has_variable(&shared) {
                    model.add_variable(shared.clone(), f64::NEG_INFINITY, f64::INFINITY)?;
                }
                model
                    .add_constraint(ConstraintKey::GroupSetpoint(range_action.id.clone(), state.id.clone()), 0.0, 0.0)?
                    .set_coefficient(VarKey::Setpoint(range_action.id.clone(), state.id.clone()), 1.0)
                    .set_coefficient(shared, -1.0);
            }
        }
        Ok(())
    }
}

/// Equal taps inside a PST group.
pub struct DiscretePstGroupFiller<'a> {
    context: FillerContext<'a>,
}

impl<'a> DiscretePstGroupFiller<'a> {
    pub fn new(context: FillerContext<'a>) -> Self {
        Self { context }
    }
}

impl ProblemFiller for DiscretePstGroupFiller<'_> {
    fn name(&self) -> &'static str {
        "discrete-pst-group"
    }

    fn fill(&mut self, model: &mut LpModel, _point: &LinearizationPoint) -> RaoResult<()> {
        for (state, members) in grouped(&self.context, RangeAction::is_pst) {
            for (group, pst) in members {
                let shared = VarKey::GroupTap(group.to_string(), state.id.clone());
                if !model.has_variable(&shared) {
                    model.add_variable(shared.clone(), f64::NEG_INFINITY, f64::INFINITY)?;
                }
                model
                    .add_constraint(ConstraintKey::GroupTap(pst.id.clone(), state.id.clone()), 0.0, 0.0)?
                    .set_coefficient(VarKey::Tap(pst.id.clone(), state.id.clone()), 1.0)
                    .set_coefficient(shared, -1.0);
            }
        }
        Ok(())
    }
}
