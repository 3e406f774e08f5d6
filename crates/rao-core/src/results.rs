//! Per-iteration snapshots produced by the sensitivity oracle and the
//! optimizer.
//!
//! | Type | Produced by | Content |
//! |------|-------------|---------|
//! | [`FlowResult`] | oracle, or [`FlowResult::shifted`] | flows (MW), PTDF sums, commercial flows, status |
//! | [`SensitivityResult`] | oracle | ∂flow/∂setpoint (MW per unit), status |
//! | [`RangeActionActivationResult`] | optimizer | set-point per (device, state) |
//! | [`NetworkActionsResult`] | caller (search tree) | activated topological actions |
//!
//! Flow results are immutable once handed to the optimizer; a "new" result
//! is always a new value.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cnec::FlowCnec;
use crate::range_action::RangeAction;
use crate::units::{Side, Unit};
use crate::{CnecId, NetworkActionId, RangeActionId, StateId};

/// Set-points closer than this are considered identical.
pub const SETPOINT_EPSILON: f64 = 1e-6;

/// Status of a sensitivity / load-flow computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputationStatus {
    #[default]
    Default,
    Failure,
}

type PerSide<T> = BTreeMap<CnecId, BTreeMap<Side, T>>;

fn side_value<T: Copy>(map: &PerSide<T>, cnec: &CnecId, side: Side) -> Option<T> {
    map.get(cnec).and_then(|sides| sides.get(&side)).copied()
}

/// Flows on monitored elements for one network situation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    flows_mw: PerSide<f64>,
    ptdf_zonal_sums: PerSide<f64>,
    commercial_flows_mw: PerSide<f64>,
    status: ComputationStatus,
    state_status: BTreeMap<StateId, ComputationStatus>,
}

impl FlowResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(mut self, cnec: CnecId, side: Side, flow_mw: f64) -> Self {
        self.set_flow(cnec, side, flow_mw);
        self
    }

    pub fn with_ptdf_zonal_sum(mut self, cnec: CnecId, side: Side, sum: f64) -> Self {
        self.ptdf_zonal_sums.entry(cnec).or_default().insert(side, sum);
        self
    }

    pub fn with_commercial_flow(mut self, cnec: CnecId, side: Side, flow_mw: f64) -> Self {
        self.commercial_flows_mw.entry(cnec).or_default().insert(side, flow_mw);
        self
    }

    pub fn with_status(mut self, status: ComputationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_state_status(mut self, state: StateId, status: ComputationStatus) -> Self {
        self.state_status.insert(state, status);
        self
    }

    pub fn set_flow(&mut self, cnec: CnecId, side: Side, flow_mw: f64) {
        self.flows_mw.entry(cnec).or_default().insert(side, flow_mw);
    }

    /// Flow on `side` in `unit`; NaN when the oracle did not report it.
    pub fn flow(&self, cnec: &FlowCnec, side: Side, unit: Unit) -> f64 {
        side_value(&self.flows_mw, &cnec.id, side)
            .map_or(f64::NAN, |mw| cnec.convert(mw, Unit::Megawatt, unit))
    }

    /// Worst margin over the cnec's monitored sides.
    pub fn margin(&self, cnec: &FlowCnec, unit: Unit) -> f64 {
        cnec.sides()
            .into_iter()
            .map(|side| cnec.margin_for_flow(self.flow(cnec, side, unit), side, unit))
            .fold(f64::INFINITY, nan_aware_min)
    }

    /// Absolute zonal PTDF sum; 1.0 when not provided.
    pub fn ptdf_zonal_sum(&self, cnec: &CnecId, side: Side) -> f64 {
        side_value(&self.ptdf_zonal_sums, cnec, side).unwrap_or(1.0)
    }

    pub fn commercial_flow(&self, cnec: &FlowCnec, side: Side, unit: Unit) -> Option<f64> {
        side_value(&self.commercial_flows_mw, &cnec.id, side)
            .map(|mw| cnec.convert(mw, Unit::Megawatt, unit))
    }

    /// Physical flow minus commercial flow.
    pub fn loop_flow(&self, cnec: &FlowCnec, side: Side, unit: Unit) -> Option<f64> {
        self.commercial_flow(cnec, side, unit)
            .map(|commercial| self.flow(cnec, side, unit) - commercial)
    }

    pub fn computation_status(&self) -> ComputationStatus {
        self.status
    }

    /// Status for one state, falling back to the global status.
    pub fn computation_status_for(&self, state: &StateId) -> ComputationStatus {
        self.state_status.get(state).copied().unwrap_or(self.status)
    }

    /// Whether the global status or any per-state status is FAILURE.
    pub fn has_failure(&self) -> bool {
        self.status == ComputationStatus::Failure
            || self.state_status.values().any(|s| *s == ComputationStatus::Failure)
    }

    /// Flows estimated by propagating set-point changes through sensitivities.
    ///
    /// `deltas` holds `new − linearization` set-point differences.
    pub fn shifted(
        &self,
        sensitivities: &SensitivityResult,
        deltas: &BTreeMap<RangeActionId, f64>,
    ) -> FlowResult {
        let mut shifted = self.clone();
        for (cnec, sides) in shifted.flows_mw.iter_mut() {
            for (side, flow) in sides.iter_mut() {
                *flow += deltas
                    .iter()
                    .map(|(ra, delta)| sensitivities.sensitivity_mw(cnec, *side, ra) * delta)
                    .sum::<f64>();
            }
        }
        shifted
    }
}

fn nan_aware_min(acc: f64, value: f64) -> f64 {
    if acc.is_nan() || value.is_nan() {
        f64::NAN
    } else {
        acc.min(value)
    }
}

/// Linear sensitivities of monitored flows with respect to set-points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivityResult {
    sensitivities_mw: BTreeMap<CnecId, BTreeMap<Side, BTreeMap<RangeActionId, f64>>>,
    status: ComputationStatus,
    state_status: BTreeMap<StateId, ComputationStatus>,
}

impl SensitivityResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensitivity(mut self, cnec: CnecId, side: Side, range_action: RangeActionId, mw_per_unit: f64) -> Self {
        self.sensitivities_mw
            .entry(cnec)
            .or_default()
            .entry(side)
            .or_default()
            .insert(range_action, mw_per_unit);
        self
    }

    pub fn with_status(mut self, status: ComputationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_state_status(mut self, state: StateId, status: ComputationStatus) -> Self {
        self.state_status.insert(state, status);
        self
    }

    /// Sensitivity in MW per set-point unit; 0 when not computed.
    pub fn sensitivity_mw(&self, cnec: &CnecId, side: Side, range_action: &RangeActionId) -> f64 {
        self.sensitivities_mw
            .get(cnec)
            .and_then(|sides| sides.get(&side))
            .and_then(|ras| ras.get(range_action))
            .copied()
            .unwrap_or(0.0)
    }

    /// Sensitivity expressed in the cnec's `unit`.
    pub fn sensitivity(&self, cnec: &FlowCnec, side: Side, range_action: &RangeActionId, unit: Unit) -> f64 {
        cnec.convert(self.sensitivity_mw(&cnec.id, side, range_action), Unit::Megawatt, unit)
    }

    pub fn computation_status(&self) -> ComputationStatus {
        self.status
    }

    pub fn computation_status_for(&self, state: &StateId) -> ComputationStatus {
        self.state_status.get(state).copied().unwrap_or(self.status)
    }
}

/// Set-points chosen for each range action in each optimized state.
///
/// A device without an explicit set-point in a state keeps the set-point
/// of the latest earlier state, or its pre-perimeter set-point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeActionActivationResult {
    pre_perimeter: BTreeMap<RangeActionId, f64>,
    states: Vec<StateId>,
    setpoints: BTreeMap<RangeActionId, BTreeMap<StateId, f64>>,
}

impl RangeActionActivationResult {
    /// `states` must be given in chronological order.
    pub fn new(pre_perimeter: BTreeMap<RangeActionId, f64>, states: Vec<StateId>) -> Self {
        Self {
            pre_perimeter,
            states,
            setpoints: BTreeMap::new(),
        }
    }

    pub fn with_setpoint(mut self, range_action: RangeActionId, state: StateId, setpoint: f64) -> Self {
        self.set_setpoint(range_action, state, setpoint);
        self
    }

    pub fn set_setpoint(&mut self, range_action: RangeActionId, state: StateId, setpoint: f64) {
        self.setpoints.entry(range_action).or_default().insert(state, setpoint);
    }

    pub fn states(&self) -> &[StateId] {
        &self.states
    }

    pub fn range_actions(&self) -> impl Iterator<Item = &RangeActionId> {
        self.pre_perimeter.keys()
    }

    pub fn pre_perimeter_setpoint(&self, range_action: &RangeActionId) -> Option<f64> {
        self.pre_perimeter.get(range_action).copied()
    }

    pub fn pre_perimeter_setpoints(&self) -> &BTreeMap<RangeActionId, f64> {
        &self.pre_perimeter
    }

    fn state_index(&self, state: &StateId) -> Option<usize> {
        self.states.iter().position(|s| s == state)
    }

    fn latest_setpoint(&self, range_action: &RangeActionId, upto: Option<usize>) -> Option<f64> {
        let fallback = self.pre_perimeter_setpoint(range_action)?;
        let Some(upto) = upto else {
            return Some(fallback);
        };
        let explicit = self.setpoints.get(range_action);
        let found = self.states[..upto]
            .iter()
            .rev()
            .find_map(|s| explicit.and_then(|by_state| by_state.get(s)).copied());
        Some(found.unwrap_or(fallback))
    }

    /// Set-point in `state` (inherited from earlier states when not set).
    pub fn optimized_setpoint(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64> {
        match self.state_index(state) {
            Some(index) => self.latest_setpoint(range_action, Some(index + 1)),
            None => self
                .setpoints
                .get(range_action)
                .and_then(|by_state| by_state.get(state))
                .copied()
                .or_else(|| self.pre_perimeter_setpoint(range_action)),
        }
    }

    /// Set-point just before `state`: previous state's, or pre-perimeter.
    pub fn previous_setpoint(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64> {
        self.latest_setpoint(range_action, self.state_index(state))
    }

    /// Tap reached by a PST in `state`; `None` for non-PST devices.
    pub fn optimized_tap(&self, range_action: &RangeAction, state: &StateId) -> Option<i32> {
        let taps = range_action.tap_table()?;
        self.optimized_setpoint(&range_action.id, state)
            .map(|angle| taps.closest_tap(angle))
    }

    /// Devices whose set-point in `state` differs from the preceding one.
    pub fn activated_range_actions(&self, state: &StateId) -> BTreeSet<RangeActionId> {
        self.setpoints
            .iter()
            .filter(|(ra, by_state)| {
                by_state.get(state).is_some_and(|setpoint| {
                    self.previous_setpoint(ra, state)
                        .is_some_and(|previous| (setpoint - previous).abs() > SETPOINT_EPSILON)
                })
            })
            .map(|(ra, _)| ra.clone())
            .collect()
    }

    /// Whether some device in some state moved by more than `epsilon`.
    pub fn differs_from(&self, other: &RangeActionActivationResult, epsilon: f64) -> bool {
        self.pre_perimeter.keys().any(|ra| {
            self.states.iter().any(|state| {
                match (self.optimized_setpoint(ra, state), other.optimized_setpoint(ra, state)) {
                    (Some(a), Some(b)) => (a - b).abs() >= epsilon,
                    (a, b) => a.is_some() != b.is_some(),
                }
            })
        })
    }
}

/// Topological actions applied before this optimization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkActionsResult {
    activated: BTreeSet<NetworkActionId>,
}

impl NetworkActionsResult {
    pub fn new(activated: impl IntoIterator<Item = NetworkActionId>) -> Self {
        Self {
            activated: activated.into_iter().collect(),
        }
    }

    pub fn activated(&self) -> &BTreeSet<NetworkActionId> {
        &self.activated
    }

    pub fn is_activated(&self, id: &NetworkActionId) -> bool {
        self.activated.contains(id)
    }
}
