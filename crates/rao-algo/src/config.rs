//! Optimization parameters.
//!
//! Every section uses `#[serde(default)]`, so partial TOML files are
//! accepted and unspecified values take the defaults below:
//!
//! ```toml
//! [objective]
//! kind = "max_min_margin"
//! unit = "megawatt"
//!
//! [range_actions]
//! max_mip_iterations = 10
//! pst_model = "approximated_integers"
//! range_shrinking = "enabled"
//!
//! [solver]
//! solver = "microlp"
//! relative_mip_gap = 1e-4
//!
//! [mnec]
//! acceptable_margin_decrease = 50.0
//! violation_cost = 10.0
//!
//! [usage_limits.curative]
//! max_ra = 3
//! max_ra_per_tso = { FR = 1 }
//! ```
//!
//! Optional sections (`mnec`, `loop_flow`) switch the matching evaluators
//! and fillers on by their mere presence.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use rao_core::{ActionKind, CnecId, RangeActionId, RaoError, RaoResult, Unit};
use serde::{Deserialize, Serialize};

use crate::linear::LpSolverKind;

/// Functional objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    /// Maximize the worst absolute margin
    #[default]
    MaxMinMargin,
    /// Maximize the worst margin divided by its zonal PTDF sum
    MaxMinRelativeMargin,
    /// Minimize remedial-action costs, heavily penalizing negative margins
    MinCost,
}

impl ObjectiveKind {
    pub fn is_cost_optimization(self) -> bool {
        self == ObjectiveKind::MinCost
    }

    pub fn is_relative(self) -> bool {
        self == ObjectiveKind::MaxMinRelativeMargin
    }
}

/// How PST taps are represented in the linear problem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PstModel {
    /// Continuous angle, rounded afterwards with the best-tap heuristic
    #[default]
    Continuous,
    /// Integer tap variations with angle conversion factors refreshed around
    /// the current tap
    ApproximatedIntegers,
}

/// Shrinking of the admissible set-point range between iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeShrinking {
    #[default]
    Disabled,
    Enabled,
    /// Only in the first preventive and curative optimizations; the search
    /// tree decides which calls qualify and passes `Enabled` or `Disabled`.
    EnabledInFirstPraoAndCra,
}

impl RangeShrinking {
    pub fn is_enabled(self) -> bool {
        !matches!(self, RangeShrinking::Disabled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveFunctionParameters {
    pub kind: ObjectiveKind,
    /// Unit of margins and of the functional cost (MW or A)
    pub unit: Unit,
}

impl Default for ObjectiveFunctionParameters {
    fn default() -> Self {
        Self {
            kind: ObjectiveKind::default(),
            unit: Unit::Megawatt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeActionsOptimizationParameters {
    pub max_mip_iterations: usize,
    pub pst_model: PstModel,
    pub range_shrinking: RangeShrinking,
    /// Cost per degree of PST variation, discourages useless moves
    pub pst_penalty_cost: f64,
    /// Cost per MW of HVDC variation
    pub hvdc_penalty_cost: f64,
    /// Cost per MW of injection variation
    pub injection_penalty_cost: f64,
    /// Sensitivities below these thresholds are ignored
    pub pst_sensitivity_threshold: f64,
    pub hvdc_sensitivity_threshold: f64,
    pub injection_sensitivity_threshold: f64,
}

impl Default for RangeActionsOptimizationParameters {
    fn default() -> Self {
        Self {
            max_mip_iterations: 10,
            pst_model: PstModel::default(),
            range_shrinking: RangeShrinking::default(),
            pst_penalty_cost: 0.01,
            hvdc_penalty_cost: 0.001,
            injection_penalty_cost: 0.001,
            pst_sensitivity_threshold: 1e-6,
            hvdc_sensitivity_threshold: 1e-6,
            injection_sensitivity_threshold: 1e-6,
        }
    }
}

impl RangeActionsOptimizationParameters {
    /// Penalty cost per set-point unit of variation for a device kind.
    pub fn penalty_cost(&self, kind: ActionKind) -> f64 {
        match kind {
            ActionKind::Pst => self.pst_penalty_cost,
            ActionKind::Hvdc => self.hvdc_penalty_cost,
            ActionKind::Injection => self.injection_penalty_cost,
            ActionKind::Topology => 0.0,
        }
    }

    /// Smallest sensitivity kept in the linear problem for a device kind.
    pub fn sensitivity_threshold(&self, kind: ActionKind) -> f64 {
        match kind {
            ActionKind::Pst => self.pst_sensitivity_threshold,
            ActionKind::Hvdc => self.hvdc_sensitivity_threshold,
            ActionKind::Injection => self.injection_sensitivity_threshold,
            ActionKind::Topology => f64::INFINITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverParameters {
    pub solver: LpSolverKind,
    pub relative_mip_gap: f64,
    /// Backend-specific tuning, passed through untouched
    pub solver_specific_parameters: Option<String>,
}

impl Default for LinearSolverParameters {
    fn default() -> Self {
        Self {
            solver: LpSolverKind::default(),
            relative_mip_gap: 1e-4,
            solver_specific_parameters: None,
        }
    }
}

/// Monitored-element (MNEC) tolerance and penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MnecParameters {
    /// MW (or A) a monitored element may lose with respect to its initial margin
    pub acceptable_margin_decrease: f64,
    /// Cost per MW of excess degradation
    pub violation_cost: f64,
    /// Tightens the linear constraint to anticipate linearization errors
    pub constraint_adjustment_coefficient: f64,
}

impl Default for MnecParameters {
    fn default() -> Self {
        Self {
            acceptable_margin_decrease: 50.0,
            violation_cost: 10.0,
            constraint_adjustment_coefficient: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopFlowParameters {
    /// Allowed increase of |loop flow| with respect to the initial situation
    pub acceptable_increase: f64,
    /// Cost per MW of loop-flow excess
    pub violation_cost: f64,
    pub constraint_adjustment_coefficient: f64,
}

impl Default for LoopFlowParameters {
    fn default() -> Self {
        Self {
            acceptable_increase: 0.0,
            violation_cost: 10.0,
            constraint_adjustment_coefficient: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeMarginsParameters {
    pub ptdf_sum_lower_bound: f64,
}

impl Default for RelativeMarginsParameters {
    fn default() -> Self {
        Self {
            ptdf_sum_lower_bound: 0.01,
        }
    }
}

/// Cnecs that should not drive remedial-action selection.
///
/// At most one of the two rules may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnoptimizedCnecParameters {
    /// Operators without curative remedial actions: their cnecs only count
    /// when their margin decreases
    pub operators_not_to_optimize: BTreeSet<String>,
    /// Cnecs secured by a dedicated PST, as long as its range suffices
    pub cnecs_secured_by_pst: BTreeMap<CnecId, RangeActionId>,
}

/// Limits on how many remedial actions may be used in one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaUsageLimits {
    pub max_ra: Option<usize>,
    pub max_tso: Option<usize>,
    /// Operators not counted in `max_tso`
    pub max_tso_exclusion: BTreeSet<String>,
    pub max_ra_per_tso: BTreeMap<String, usize>,
    pub max_pst_per_tso: BTreeMap<String, usize>,
    /// Maximum number of taps moved per operator
    pub max_elementary_actions_per_tso: BTreeMap<String, usize>,
}

impl RaUsageLimits {
    /// Whether at least one limit is finite.
    pub fn is_limited(&self) -> bool {
        self.max_ra.is_some()
            || self.max_tso.is_some()
            || !self.max_ra_per_tso.is_empty()
            || !self.max_pst_per_tso.is_empty()
            || !self.max_elementary_actions_per_tso.is_empty()
    }
}

/// Complete parameter set of the linear optimization engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaoParameters {
    pub objective: ObjectiveFunctionParameters,
    pub range_actions: RangeActionsOptimizationParameters,
    pub solver: LinearSolverParameters,
    pub mnec: Option<MnecParameters>,
    pub loop_flow: Option<LoopFlowParameters>,
    pub relative_margins: RelativeMarginsParameters,
    pub unoptimized_cnecs: UnoptimizedCnecParameters,
    /// Usage limits per instant id
    pub usage_limits: BTreeMap<String, RaUsageLimits>,
    /// Virtual cost added when a sensitivity computation fails
    pub sensitivity_failure_overcost: f64,
}

impl Default for RaoParameters {
    fn default() -> Self {
        Self {
            objective: ObjectiveFunctionParameters::default(),
            range_actions: RangeActionsOptimizationParameters::default(),
            solver: LinearSolverParameters::default(),
            mnec: None,
            loop_flow: None,
            relative_margins: RelativeMarginsParameters::default(),
            unoptimized_cnecs: UnoptimizedCnecParameters::default(),
            usage_limits: BTreeMap::new(),
            sensitivity_failure_overcost: 10_000.0,
        }
    }
}

impl RaoParameters {
    /// Parse and validate parameters from TOML text.
    pub fn from_toml_str(text: &str) -> RaoResult<Self> {
        let parameters: RaoParameters =
            toml::from_str(text).map_err(|e| RaoError::Parse(format!("parameters: {e}")))?;
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn to_toml_string(&self) -> RaoResult<String> {
        toml::to_string_pretty(self).map_err(|e| RaoError::Parse(format!("parameters: {e}")))
    }

    /// Whether the configured fillers may create integer variables.
    pub fn requires_integer_variables(&self) -> bool {
        self.range_actions.pst_model == PstModel::ApproximatedIntegers
            || self.objective.kind.is_relative()
            || self.usage_limits.values().any(RaUsageLimits::is_limited)
            || !self.unoptimized_cnecs.operators_not_to_optimize.is_empty()
            || !self.unoptimized_cnecs.cnecs_secured_by_pst.is_empty()
    }

    /// Reports conflicting or out-of-range settings.
    pub fn validate(&self) -> RaoResult<()> {
        if !self.objective.unit.is_flow_unit() {
            return Err(RaoError::Config(format!(
                "objective unit must be MW or A, got {}",
                self.objective.unit
            )));
        }
        if self.range_actions.max_mip_iterations == 0 {
            return Err(RaoError::Config("max_mip_iterations must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.solver.relative_mip_gap) {
            return Err(RaoError::Config(format!(
                "relative MIP gap {} outside [0, 1)",
                self.solver.relative_mip_gap
            )));
        }
        let rates = [
            ("pst_penalty_cost", self.range_actions.pst_penalty_cost),
            ("hvdc_penalty_cost", self.range_actions.hvdc_penalty_cost),
            ("injection_penalty_cost", self.range_actions.injection_penalty_cost),
            ("sensitivity_failure_overcost", self.sensitivity_failure_overcost),
        ];
        if let Some((name, value)) = rates.iter().find(|(_, v)| *v < 0.0 || v.is_nan()) {
            return Err(RaoError::Config(format!("{name} must be non-negative, got {value}")));
        }
        if let Some(mnec) = &self.mnec {
            if mnec.violation_cost < 0.0 || mnec.acceptable_margin_decrease < 0.0 {
                return Err(RaoError::Config("mnec parameters must be non-negative".into()));
            }
        }
        if let Some(loop_flow) = &self.loop_flow {
            if loop_flow.violation_cost < 0.0 || loop_flow.acceptable_increase < 0.0 {
                return Err(RaoError::Config("loop_flow parameters must be non-negative".into()));
            }
        }
        let unoptimized = &self.unoptimized_cnecs;
        if !unoptimized.operators_not_to_optimize.is_empty() && !unoptimized.cnecs_secured_by_pst.is_empty() {
            return Err(RaoError::Config(format!(
                "unoptimized cnecs: operators {:?} and PST-secured cnecs {:?} cannot both be set",
                unoptimized.operators_not_to_optimize,
                unoptimized.cnecs_secured_by_pst.keys().collect::<Vec<_>>()
            )));
        }
        if self.requires_integer_variables() && !self.solver.solver.supports_integers() {
            return Err(RaoError::Config(format!(
                "solver '{}' cannot handle the integer variables required by the configuration",
                self.solver.solver.as_str()
            )));
        }
        Ok(())
    }
}

/// Load parameters from a TOML file.
pub fn load_parameters(path: impl AsRef<Path>) -> anyhow::Result<RaoParameters> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading parameters '{}'", path.display()))?;
    RaoParameters::from_toml_str(&text)
        .with_context(|| format!("loading parameters '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let parameters = RaoParameters::default();
        assert_eq!(parameters.range_actions.max_mip_iterations, 10);
        assert_eq!(parameters.sensitivity_failure_overcost, 10_000.0);
        assert!(parameters.mnec.is_none());
        assert!(parameters.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parameters = RaoParameters::from_toml_str(
            r#"
            [objective]
            kind = "max_min_relative_margin"

            [mnec]
            violation_cost = 5.0
            "#,
        )
        .unwrap();
        assert!(parameters.objective.kind.is_relative());
        let mnec = parameters.mnec.unwrap();
        assert_eq!(mnec.violation_cost, 5.0);
        assert_eq!(mnec.acceptable_margin_decrease, 50.0);
        assert_eq!(parameters.range_actions.pst_penalty_cost, 0.01);
    }

    #[test]
    fn test_conflicting_unoptimized_rules() {
        let mut parameters = RaoParameters::default();
        parameters.unoptimized_cnecs.operators_not_to_optimize.insert("BE".into());
        parameters
            .unoptimized_cnecs
            .cnecs_secured_by_pst
            .insert(CnecId::new("cnec"), RangeActionId::new("pst"));
        let err = parameters.validate().unwrap_err();
        assert!(matches!(err, RaoError::Config(_)));
        assert!(err.to_string().contains("BE"));
    }

    #[test]
    fn test_penalty_cost_per_kind() {
        let ra = RangeActionsOptimizationParameters::default();
        assert_eq!(ra.penalty_cost(ActionKind::Pst), 0.01);
        assert_eq!(ra.penalty_cost(ActionKind::Hvdc), 0.001);
        assert_eq!(ra.penalty_cost(ActionKind::Topology), 0.0);
    }

    #[test]
    fn test_unknown_solver_is_a_parse_error() {
        let err = RaoParameters::from_toml_str("[solver]\nsolver = \"xpress\"\n").unwrap_err();
        assert!(matches!(err, RaoError::Parse(_)));
        assert!(err.to_string().contains("xpress"));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut parameters = RaoParameters::default();
        parameters.range_actions.pst_model = PstModel::ApproximatedIntegers;
        parameters.usage_limits.insert(
            "curative".into(),
            RaUsageLimits {
                max_ra: Some(2),
                ..RaUsageLimits::default()
            },
        );
        let text = parameters.to_toml_string().unwrap();
        assert_eq!(RaoParameters::from_toml_str(&text).unwrap(), parameters);
    }
}
