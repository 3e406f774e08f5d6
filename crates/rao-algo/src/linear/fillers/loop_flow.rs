//! Soft limits on loop flows.
//!
//! `|F − commercial| ≤ max(threshold, |initial loop flow| + increase)`, the
//! commercial part taken from the current linearization point so it follows
//! each new sensitivity computation.

use rao_core::{RaoResult, Unit};
use tracing::debug;

use super::{FillerContext, ProblemFiller};
use crate::config::LoopFlowParameters;
use crate::linear::model::{Bound, ConstraintKey, LpModel, VarKey};
use crate::linear::LinearizationPoint;

pub struct LoopFlowFiller<'a> {
    context: FillerContext<'a>,
    parameters: LoopFlowParameters,
}

impl<'a> LoopFlowFiller<'a> {
    pub fn new(context: FillerContext<'a>, parameters: LoopFlowParameters) -> Self {
        Self { context, parameters }
    }
}

impl ProblemFiller for LoopFlowFiller<'_> {
    fn name(&self) -> &'static str {
        "loop-flow"
    }

    fn fill(&mut self, model: &mut LpModel, point: &LinearizationPoint) -> RaoResult<()> {
        for cnec in self.context.perimeter.loop_flow_cnecs() {
            let Some(threshold) = cnec.loop_flow_threshold(Unit::Megawatt) else {
                continue;
            };
            for side in cnec.sides() {
                let flow = VarKey::Flow(cnec.id.clone(), side);
                if !model.has_variable(&flow) {
                    continue;
                }
                let Some(commercial) = point.flow.commercial_flow(cnec, side, Unit::Megawatt) else {
                    debug!(cnec = %cnec.id, %side, "no commercial flow, loop flow not constrained");
                    continue;
                };
                let initial = self
                    .context
                    .initial_flow
                    .loop_flow(cnec, side, Unit::Megawatt)
                    .unwrap_or(0.0);
                let limit = threshold.max(initial.abs() + self.parameters.acceptable_increase)
                    - self.parameters.constraint_adjustment_coefficient;

                let violation = VarKey::LoopFlowViolation(cnec.id.clone(), side);
                model.add_variable(violation.clone(), 0.0, f64::INFINITY)?;
                model
                    .add_constraint(
                        ConstraintKey::LoopFlow(cnec.id.clone(), side, Bound::Upper),
                        f64::NEG_INFINITY,
                        limit + commercial,
                    )?
                    .set_coefficient(flow.clone(), 1.0)
                    .set_coefficient(violation.clone(), -1.0);
                model
                    .add_constraint(
                        ConstraintKey::LoopFlow(cnec.id.clone(), side, Bound::Lower),
                        -limit + commercial,
                        f64::INFINITY,
                    )?
                    .set_coefficient(flow, 1.0)
                    .set_coefficient(violation.clone(), 1.0);
                model.add_objective_coefficient(violation, self.parameters.violation_cost);
            }
        }
        Ok(())
    }
}
