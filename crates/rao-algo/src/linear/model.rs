//! Owned, mutable representation of the linear problem.
//!
//! Fillers write variables, constraints and objective coefficients into an
//! [`LpModel`] under typed keys, and may later retrieve and modify them
//! (bounds, coefficients) between MIP iterations. The model is only turned
//! into a `good_lp` problem when it is solved, so it can be inspected in
//! tests without a solver.
//!
//! ```text
//!   fillers ──► LpModel { variables, constraints, objective } ──► good_lp ──► LpSolution
//!                  ▲                                                            │
//!                  └──────────── update_between_mip_iteration ◄─────────────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use rao_core::{CnecId, RangeActionId, RaoError, RaoResult, Side, StateId};

/// Direction of a set-point or tap variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Upward,
    Downward,
}

/// Which threshold a two-sided constraint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bound {
    /// `flow <= max`
    Upper,
    /// `flow >= min`
    Lower,
}

/// Key of a variable of the linear problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VarKey {
    Flow(CnecId, Side),
    Setpoint(RangeActionId, StateId),
    AbsoluteVariation(RangeActionId, StateId),
    Variation(RangeActionId, StateId, Direction),
    VariationBinary(RangeActionId, StateId),
    TapVariation(RangeActionId, StateId, Direction),
    TapVariationBinary(RangeActionId, StateId, Direction),
    Tap(RangeActionId, StateId),
    TotalTapVariation(RangeActionId, StateId, Direction),
    GroupSetpoint(String, StateId),
    GroupTap(String, StateId),
    MinMargin,
    MinRelativeMargin,
    MinRelativeMarginSign,
    MinMarginViolation,
    MnecViolation(CnecId, Side),
    LoopFlowViolation(CnecId, Side),
    OptimizeCnec(CnecId, Side),
    TsoUsed(String, StateId),
    TsoUsedCumulative(String, StateId),
    TapFromPrePerimeter(RangeActionId, StateId),
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Key of a constraint of the linear problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintKey {
    Flow(CnecId, Side),
    AbsoluteVariation(RangeActionId, StateId),
    SetpointVariation(RangeActionId, StateId),
    RangeShrink(RangeActionId, StateId),
    MinMargin(CnecId, Side, Bound),
    MinRelativeMargin(CnecId, Side, Bound),
    RelativeMarginSign,
    MinMarginSign,
    MinMarginViolation(CnecId, Side, Bound),
    MnecFlow(CnecId, Side, Bound),
    LoopFlow(CnecId, Side, Bound),
    MarginDecrease(CnecId, Side, Bound),
    PstSecured(CnecId, Side, Bound),
    TapToAngle(RangeActionId, StateId),
    UpOrDown(RangeActionId, StateId),
    TapDirection(RangeActionId, StateId, Direction),
    Tap(RangeActionId, StateId),
    TotalTapVariation(RangeActionId, StateId),
    GroupSetpoint(RangeActionId, StateId),
    GroupTap(RangeActionId, StateId),
    IsVariation(RangeActionId, StateId),
    MaxRa(StateId),
    MaxTso(StateId),
    TsoUsed(String, RangeActionId, StateId),
    TsoUsedCumulative(String, StateId),
    MaxRaPerTso(String, StateId),
    MaxPstPerTso(String, StateId),
    MaxElementaryActions(String, StateId),
    TapFromPrePerimeter(RangeActionId, StateId, Direction),
}

impl fmt::Display for ConstraintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Bounds and integrality of a variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariableDef {
    pub lb: f64,
    pub ub: f64,
    pub integer: bool,
}

/// `lb <= Σ coefficient·variable <= ub`; infinite bounds are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub lb: f64,
    pub ub: f64,
    terms: BTreeMap<VarKey, f64>,
}

impl LinearConstraint {
    fn new(lb: f64, ub: f64) -> Self {
        Self {
            lb,
            ub,
            terms: BTreeMap::new(),
        }
    }

    /// Sets (not adds) the coefficient of `variable`.
    pub fn set_coefficient(&mut self, variable: VarKey, coefficient: f64) -> &mut Self {
        self.terms.insert(variable, coefficient);
        self
    }

    pub fn add_coefficient(&mut self, variable: VarKey, coefficient: f64) -> &mut Self {
        *self.terms.entry(variable).or_insert(0.0) += coefficient;
        self
    }

    pub fn coefficient(&self, variable: &VarKey) -> f64 {
        self.terms.get(variable).copied().unwrap_or(0.0)
    }

    pub fn set_bounds(&mut self, lb: f64, ub: f64) -> &mut Self {
        self.lb = lb;
        self.ub = ub;
        self
    }

    pub fn terms(&self) -> impl Iterator<Item = (&VarKey, f64)> {
        self.terms.iter().map(|(k, c)| (k, *c))
    }
}

/// The linear problem under construction. Always a minimization.
#[derive(Debug, Clone, Default)]
pub struct LpModel {
    variables: BTreeMap<VarKey, VariableDef>,
    constraints: BTreeMap<ConstraintKey, LinearConstraint>,
    objective: BTreeMap<VarKey, f64>,
}

impl LpModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every variable, constraint and objective term.
    pub fn clear(&mut self) {
        self.variables.clear();
        self.constraints.clear();
        self.objective.clear();
    }

    fn insert_variable(&mut self, key: VarKey, def: VariableDef) -> RaoResult<()> {
        if self.variables.contains_key(&key) {
            return Err(RaoError::Solver(format!("variable {key} already created")));
        }
        self.variables.insert(key, def);
        Ok(())
    }

    pub fn add_variable(&mut self, key: VarKey, lb: f64, ub: f64) -> RaoResult<()> {
        self.insert_variable(key, VariableDef { lb, ub, integer: false })
    }

    pub fn add_integer_variable(&mut self, key: VarKey, lb: f64, ub: f64) -> RaoResult<()> {
        self.insert_variable(key, VariableDef { lb, ub, integer: true })
    }

    pub fn add_binary_variable(&mut self, key: VarKey) -> RaoResult<()> {
        self.add_integer_variable(key, 0.0, 1.0)
    }

    pub fn has_variable(&self, key: &VarKey) -> bool {
        self.variables.contains_key(key)
    }

    pub fn variable(&self, key: &VarKey) -> RaoResult<&VariableDef> {
        self.variables
            .get(key)
            .ok_or_else(|| RaoError::Solver(format!("variable {key} has not been created yet")))
    }

    pub fn set_variable_bounds(&mut self, key: &VarKey, lb: f64, ub: f64) -> RaoResult<()> {
        let def = self
            .variables
            .get_mut(key)
            .ok_or_else(|| RaoError::Solver(format!("variable {key} has not been created yet")))?;
        def.lb = lb;
        def.ub = ub;
        Ok(())
    }

    pub fn add_constraint(&mut self, key: ConstraintKey, lb: f64, ub: f64) -> RaoResult<&mut LinearConstraint> {
        if self.constraints.contains_key(&key) {
            return Err(RaoError::Solver(format!("constraint {key} already created")));
        }
        Ok(self
            .constraints
            .entry(key)
            .or_insert_with(|| LinearConstraint::new(lb, ub)))
    }

    pub fn constraint(&self, key: &ConstraintKey) -> RaoResult<&LinearConstraint> {
        self.constraints
            .get(key)
            .ok_or_else(|| RaoError::Solver(format!("constraint {key} has not been created yet")))
    }

    pub fn constraint_mut(&mut self, key: &ConstraintKey) -> RaoResult<&mut LinearConstraint> {
        self.constraints
            .get_mut(key)
            .ok_or_else(|| RaoError::Solver(format!("constraint {key} has not been created yet")))
    }

    pub fn has_constraint(&self, key: &ConstraintKey) -> bool {
        self.constraints.contains_key(key)
    }

    /// Keys of the constraints matching `predicate`.
    pub fn constraint_keys_where(&self, predicate: impl Fn(&ConstraintKey) -> bool) -> Vec<ConstraintKey> {
        self.constraints.keys().filter(|k| predicate(k)).cloned().collect()
    }

    pub fn set_objective_coefficient(&mut self, key: VarKey, coefficient: f64) {
        self.objective.insert(key, coefficient);
    }

    pub fn add_objective_coefficient(&mut self, key: VarKey, coefficient: f64) {
        *self.objective.entry(key).or_insert(0.0) += coefficient;
    }

    pub fn objective_coefficient(&self, key: &VarKey) -> f64 {
        self.objective.get(key).copied().unwrap_or(0.0)
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn has_integer_variables(&self) -> bool {
        self.variables.values().any(|v| v.integer)
    }

    pub(crate) fn variables(&self) -> impl Iterator<Item = (&VarKey, &VariableDef)> {
        self.variables.iter()
    }

    pub(crate) fn constraints(&self) -> impl Iterator<Item = (&ConstraintKey, &LinearConstraint)> {
        self.constraints.iter()
    }

    pub(crate) fn objective_terms(&self) -> impl Iterator<Item = (&VarKey, f64)> {
        self.objective.iter().map(|(k, c)| (k, *c))
    }

    /// Checks that every referenced variable exists.
    pub fn check_references(&self) -> RaoResult<()> {
        for (key, constraint) in &self.constraints {
            if let Some(missing) = constraint.terms.keys().find(|v| !self.variables.contains_key(v)) {
                return Err(RaoError::Solver(format!(
                    "constraint {key} uses variable {missing} which has not been created"
                )));
            }
            if constraint.lb > constraint.ub {
                return Err(RaoError::Solver(format!(
                    "constraint {key} has lower bound {} above upper bound {}",
                    constraint.lb, constraint.ub
                )));
            }
        }
        if let Some(missing) = self.objective.keys().find(|v| !self.variables.contains_key(v)) {
            return Err(RaoError::Solver(format!(
                "objective uses variable {missing} which has not been created"
            )));
        }
        Ok(())
    }
}
