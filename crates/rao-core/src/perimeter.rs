//! The set of states, monitored elements and control devices that one
//! optimization call works on.

use std::collections::{BTreeMap, BTreeSet};

use crate::cnec::FlowCnec;
use crate::error::{RaoError, RaoResult};
use crate::range_action::{NetworkAction, RangeAction};
use crate::results::RangeActionActivationResult;
use crate::state::State;
use crate::{NetworkActionId, RangeActionId, StateId};

/// Optimization perimeter.
///
/// `states` are kept in chronological order; the first one is the main
/// state of the perimeter (preventive, or the first curative state of a
/// contingency).
#[derive(Debug, Clone, Default)]
pub struct Perimeter {
    states: Vec<State>,
    cnecs: Vec<FlowCnec>,
    range_actions: BTreeMap<RangeActionId, RangeAction>,
    available: BTreeMap<StateId, BTreeSet<RangeActionId>>,
    network_actions: BTreeMap<NetworkActionId, NetworkAction>,
}

impl Perimeter {
    pub fn new(states: Vec<State>) -> Self {
        Self {
            states,
            ..Self::default()
        }
    }

    pub fn with_cnec(mut self, cnec: FlowCnec) -> Self {
        self.cnecs.push(cnec);
        self
    }

    /// Registers `range_action` as available in `state`.
    pub fn with_range_action(mut self, state: &StateId, range_action: RangeAction) -> Self {
        self.available
            .entry(state.clone())
            .or_default()
            .insert(range_action.id.clone());
        self.range_actions.insert(range_action.id.clone(), range_action);
        self
    }

    pub fn with_network_action(mut self, network_action: NetworkAction) -> Self {
        self.network_actions.insert(network_action.id.clone(), network_action);
        self
    }

    /// Checks referential integrity and device consistency.
    pub fn validate(&self) -> RaoResult<()> {
        if self.states.is_empty() {
            return Err(RaoError::Validation("perimeter has no state".into()));
        }
        if self.states.windows(2).any(|w| w[1].instant.order < w[0].instant.order) {
            return Err(RaoError::Validation("perimeter states are not in chronological order".into()));
        }
        for cnec in &self.cnecs {
            if self.state(&cnec.state).is_none() {
                return Err(RaoError::Validation(format!(
                    "cnec '{}' refers to unknown state '{}'",
                    cnec.id, cnec.state
                )));
            }
            cnec.validate()?;
        }
        for state in self.available.keys() {
            if self.state(state).is_none() {
                return Err(RaoError::Validation(format!(
                    "range actions registered for unknown state '{state}'"
                )));
            }
        }
        for range_action in self.range_actions.values() {
            range_action.validate()?;
        }
        self.validate_groups()
    }

    fn validate_groups(&self) -> RaoResult<()> {
        for (group, members) in self.groups() {
            let Some(first) = members.first() else {
                continue;
            };
            for other in &members[1..] {
                if first.action_kind() != other.action_kind() {
                    return Err(RaoError::Validation(format!(
                        "group '{group}' mixes {} '{}' and {} '{}'",
                        first.action_kind(),
                        first.id,
                        other.action_kind(),
                        other.id
                    )));
                }
                if first.tap_table() != other.tap_table() {
                    return Err(RaoError::Validation(format!(
                        "group '{group}': PSTs '{}' and '{}' have different tap tables",
                        first.id, other.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state_ids(&self) -> Vec<StateId> {
        self.states.iter().map(|s| s.id.clone()).collect()
    }

    pub fn state(&self, id: &StateId) -> Option<&State> {
        self.states.iter().find(|s| &s.id == id)
    }

    pub fn main_state(&self) -> Option<&State> {
        self.states.first()
    }

    /// Curative perimeters are the ones whose main state is curative.
    pub fn is_curative(&self) -> bool {
        self.main_state().is_some_and(State::is_curative)
    }

    pub fn cnecs(&self) -> &[FlowCnec] {
        &self.cnecs
    }

    pub fn cnec(&self, id: &str) -> Option<&FlowCnec> {
        self.cnecs.iter().find(|c| c.id.as_str() == id)
    }

    pub fn optimized_cnecs(&self) -> impl Iterator<Item = &FlowCnec> {
        self.cnecs.iter().filter(|c| c.optimized)
    }

    pub fn monitored_cnecs(&self) -> impl Iterator<Item = &FlowCnec> {
        self.cnecs.iter().filter(|c| c.monitored)
    }

    pub fn loop_flow_cnecs(&self) -> impl Iterator<Item = &FlowCnec> {
        self.cnecs.iter().filter(|c| c.loop_flow_threshold.is_some())
    }

    pub fn range_action(&self, id: &RangeActionId) -> Option<&RangeAction> {
        self.range_actions.get(id)
    }

    pub fn range_actions(&self) -> impl Iterator<Item = &RangeAction> {
        self.range_actions.values()
    }

    /// Devices available in `state`, in id order.
    pub fn range_actions_for(&self, state: &StateId) -> Vec<&RangeAction> {
        self.available
            .get(state)
            .into_iter()
            .flatten()
            .filter_map(|id| self.range_actions.get(id))
            .collect()
    }

    /// Every (state, device) pair of the perimeter, states in order.
    pub fn range_actions_per_state(&self) -> Vec<(&State, Vec<&RangeAction>)> {
        self.states
            .iter()
            .map(|state| (state, self.range_actions_for(&state.id)))
            .filter(|(_, ras)| !ras.is_empty())
            .collect()
    }

    /// Members of each range-action group, by group id.
    pub fn groups(&self) -> BTreeMap<String, Vec<&RangeAction>> {
        let mut groups: BTreeMap<String, Vec<&RangeAction>> = BTreeMap::new();
        for range_action in self.range_actions.values() {
            if let Some(group) = &range_action.group_id {
                groups.entry(group.clone()).or_default().push(range_action);
            }
        }
        groups
    }

    pub fn network_action(&self, id: &NetworkActionId) -> Option<&NetworkAction> {
        self.network_actions.get(id)
    }

    /// Activation result holding only the devices' initial set-points.
    pub fn initial_activation(&self) -> RangeActionActivationResult {
        let pre_perimeter = self
            .range_actions
            .values()
            .map(|ra| (ra.id.clone(), ra.initial_setpoint))
            .collect();
        RangeActionActivationResult::new(pre_perimeter, self.state_ids())
    }
}
