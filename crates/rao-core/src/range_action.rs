//! Control devices: range actions (continuous or tapped set-points) and
//! topological network actions.
//!
//! Device kinds form a closed set. Everything that needs per-kind behaviour
//! (penalty rates, sensitivity thresholds, rounding) matches on
//! [`ActionKind`] exhaustively instead of dispatching through a trait.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RaoError, RaoResult};
use crate::{NetworkActionId, RangeActionId};

/// Kind of remedial action, used to select per-kind rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Pst,
    Hvdc,
    Injection,
    Topology,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Pst => write!(f, "pst"),
            ActionKind::Hvdc => write!(f, "hvdc"),
            ActionKind::Injection => write!(f, "injection"),
            ActionKind::Topology => write!(f, "topology"),
        }
    }
}

/// Tap → angle (degrees) mapping of a phase-shifting transformer.
///
/// The mapping is strictly monotonic, so the closest tap of an angle and
/// the neighbour "in the direction of" an angle are well defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<i32, f64>", into = "BTreeMap<i32, f64>")]
pub struct PstTapTable {
    tap_to_angle: BTreeMap<i32, f64>,
}

impl PstTapTable {
    pub fn new(tap_to_angle: BTreeMap<i32, f64>) -> RaoResult<Self> {
        if tap_to_angle.is_empty() {
            return Err(RaoError::Validation("empty tap-to-angle table".into()));
        }
        let taps: Vec<i32> = tap_to_angle.keys().copied().collect();
        if taps.windows(2).any(|w| w[1] != w[0] + 1) {
            return Err(RaoError::Validation("tap-to-angle table has gaps between taps".into()));
        }
        let angles: Vec<f64> = tap_to_angle.values().copied().collect();
        let increasing = angles.windows(2).all(|w| w[1] > w[0]);
        let decreasing = angles.windows(2).all(|w| w[1] < w[0]);
        if !(increasing || decreasing) {
            return Err(RaoError::Validation(
                "tap-to-angle table is not strictly monotonic".into(),
            ));
        }
        Ok(Self { tap_to_angle })
    }

    /// Evenly spaced table from `min_tap` with `step` degrees per tap.
    pub fn linear(min_tap: i32, max_tap: i32, angle_at_min: f64, step: f64) -> RaoResult<Self> {
        let table = (min_tap..=max_tap)
            .map(|tap| (tap, angle_at_min + step * f64::from(tap - min_tap)))
            .collect();
        Self::new(table)
    }

    pub fn angle(&self, tap: i32) -> RaoResult<f64> {
        self.tap_to_angle
            .get(&tap)
            .copied()
            .ok_or_else(|| RaoError::Validation(format!("tap {tap} is outside the tap table")))
    }

    pub fn contains(&self, tap: i32) -> bool {
        self.tap_to_angle.contains_key(&tap)
    }

    /// Tap whose angle is the closest to `angle`.
    pub fn closest_tap(&self, angle: f64) -> i32 {
        let mut best = (self.min_tap(), f64::INFINITY);
        for (&tap, &a) in &self.tap_to_angle {
            let distance = (a - angle).abs();
            if distance < best.1 {
                best = (tap, distance);
            }
        }
        best.0
    }

    /// Neighbour of `closest` lying on the same side as `angle`, if any.
    ///
    /// Returns `None` when `angle` sits exactly on the tap or when the tap
    /// is at the edge of the table in the direction of `angle`.
    pub fn other_tap(&self, closest: i32, angle: f64) -> Option<i32> {
        let closest_angle = self.tap_to_angle.get(&closest).copied()?;
        let direction = (angle - closest_angle).signum();
        if angle == closest_angle {
            return None;
        }
        [closest + 1, closest - 1].into_iter().find(|tap| {
            self.tap_to_angle
                .get(tap)
                .is_some_and(|a| (a - closest_angle).signum() == direction)
        })
    }

    pub fn min_tap(&self) -> i32 {
        self.tap_to_angle.keys().next().copied().unwrap_or_default()
    }

    pub fn max_tap(&self) -> i32 {
        self.tap_to_angle.keys().next_back().copied().unwrap_or_default()
    }

    pub fn min_angle(&self) -> f64 {
        self.tap_to_angle.values().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max_angle(&self) -> f64 {
        self.tap_to_angle.values().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Mean absolute angle step between two consecutive taps.
    pub fn average_step(&self) -> f64 {
        let span = self.max_tap() - self.min_tap();
        if span == 0 {
            return 0.0;
        }
        (self.max_angle() - self.min_angle()) / f64::from(span)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, f64)> + '_ {
        self.tap_to_angle.iter().map(|(&t, &a)| (t, a))
    }
}

impl TryFrom<BTreeMap<i32, f64>> for PstTapTable {
    type Error = RaoError;

    fn try_from(value: BTreeMap<i32, f64>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PstTapTable> for BTreeMap<i32, f64> {
    fn from(value: PstTapTable) -> Self {
        value.tap_to_angle
    }
}

/// Domain of a range action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeActionKind {
    Pst { taps: PstTapTable },
    Hvdc,
    Injection,
}

/// A control device with a set-point range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeAction {
    pub id: RangeActionId,
    pub operator: Option<String>,
    pub kind: RangeActionKind,
    pub min_setpoint: f64,
    pub max_setpoint: f64,
    pub initial_setpoint: f64,
    pub activation_cost: f64,
    /// Cost per unit of upward variation (per tap for PSTs)
    pub variation_cost_up: f64,
    /// Cost per unit of downward variation (per tap for PSTs)
    pub variation_cost_down: f64,
    /// Devices sharing a group id must reach the same position
    pub group_id: Option<String>,
    pub speed: Option<u32>,
}

impl RangeAction {
    fn with_kind(id: impl Into<RangeActionId>, kind: RangeActionKind, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            operator: None,
            kind,
            min_setpoint: min,
            max_setpoint: max,
            initial_setpoint: 0.0,
            activation_cost: 0.0,
            variation_cost_up: 0.0,
            variation_cost_down: 0.0,
            group_id: None,
            speed: None,
        }
    }

    /// PST spanning its whole tap table.
    pub fn pst(id: impl Into<RangeActionId>, taps: PstTapTable) -> Self {
        let (min, max) = (taps.min_angle(), taps.max_angle());
        Self::with_kind(id, RangeActionKind::Pst { taps }, min, max)
    }

    pub fn hvdc(id: impl Into<RangeActionId>, min: f64, max: f64) -> Self {
        Self::with_kind(id, RangeActionKind::Hvdc, min, max)
    }

    pub fn injection(id: impl Into<RangeActionId>, min: f64, max: f64) -> Self {
        Self::with_kind(id, RangeActionKind::Injection, min, max)
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_initial_setpoint(mut self, setpoint: f64) -> Self {
        self.initial_setpoint = setpoint;
        self
    }

    pub fn with_activation_cost(mut self, cost: f64) -> Self {
        self.activation_cost = cost;
        self
    }

    pub fn with_variation_costs(mut self, up: f64, down: f64) -> Self {
        self.variation_cost_up = up;
        self.variation_cost_down = down;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min_setpoint = min;
        self.max_setpoint = max;
        self
    }

    pub fn action_kind(&self) -> ActionKind {
        match self.kind {
            RangeActionKind::Pst { .. } => ActionKind::Pst,
            RangeActionKind::Hvdc => ActionKind::Hvdc,
            RangeActionKind::Injection => ActionKind::Injection,
        }
    }

    pub fn tap_table(&self) -> Option<&PstTapTable> {
        match &self.kind {
            RangeActionKind::Pst { taps } => Some(taps),
            _ => None,
        }
    }

    pub fn is_pst(&self) -> bool {
        self.tap_table().is_some()
    }

    /// Lowest reachable set-point (the tap table bounds PSTs).
    pub fn min_admissible_setpoint(&self) -> f64 {
        match self.tap_table() {
            Some(taps) => self.min_setpoint.max(taps.min_angle()),
            None => self.min_setpoint,
        }
    }

    /// Highest reachable set-point (the tap table bounds PSTs).
    pub fn max_admissible_setpoint(&self) -> f64 {
        match self.tap_table() {
            Some(taps) => self.max_setpoint.min(taps.max_angle()),
            None => self.max_setpoint,
        }
    }

    pub fn validate(&self) -> RaoResult<()> {
        if self.min_admissible_setpoint() > self.max_admissible_setpoint() {
            return Err(RaoError::Validation(format!(
                "range action '{}' has an empty set-point range [{}, {}]",
                self.id,
                self.min_admissible_setpoint(),
                self.max_admissible_setpoint()
            )));
        }
        if [self.activation_cost, self.variation_cost_up, self.variation_cost_down]
            .iter()
            .any(|c| *c < 0.0 || c.is_nan())
        {
            return Err(RaoError::Validation(format!(
                "range action '{}' has a negative or undefined cost",
                self.id
            )));
        }
        if let Some(taps) = self.tap_table() {
            let tolerance = 1e-6;
            if self.initial_setpoint < taps.min_angle() - tolerance
                || self.initial_setpoint > taps.max_angle() + tolerance
            {
                return Err(RaoError::Validation(format!(
                    "PST '{}' initial angle {} lies outside its tap table",
                    self.id, self.initial_setpoint
                )));
            }
        }
        Ok(())
    }
}

/// Topological remedial action (switch opening/closing, bus-bar change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAction {
    pub id: NetworkActionId,
    pub operator: Option<String>,
    pub activation_cost: f64,
    /// Number of elementary switching operations
    pub elementary_actions: usize,
}

impl NetworkAction {
    pub fn new(id: impl Into<NetworkActionId>, activation_cost: f64) -> Self {
        Self {
            id: id.into(),
            operator: None,
            activation_cost,
            elementary_actions: 1,
        }
    }

    pub fn action_kind(&self) -> ActionKind {
        ActionKind::Topology
    }
}
