//! Continuous PST angles to taps.
//!
//! The closest tap wins unless the angle sits near the middle of two taps.
//! In that case both candidates are compared on the most limiting elements
//! of the best result, with flows estimated through the cached
//! sensitivities (no new load flow). PSTs of a group settle on the tap that
//! maximizes the worst margin across members.

use std::collections::BTreeMap;

use rao_core::{
    CnecId, FlowCnec, FlowResult, Perimeter, RangeAction, RangeActionActivationResult, RangeActionId,
    SensitivityResult, StateId, Unit,
};

use super::scratch::{ScratchArena, ScratchMap};

/// Relative distance to the midpoint of two taps below which both are
/// evaluated.
pub const BEST_TAP_MIDPOINT_THRESHOLD: f64 = 0.15;

/// Number of limiting elements on which candidate taps are compared.
pub const BEST_TAP_LIMITING_ELEMENTS: usize = 10;

/// The other tap must improve the worst margin by this share to beat the
/// closest one.
const MARGIN_GAIN_THRESHOLD: f64 = 0.1;

/// Flow estimates around the best result found so far.
pub struct BestTapFinder<'a> {
    flow: &'a FlowResult,
    sensitivity: &'a SensitivityResult,
    activation: &'a RangeActionActivationResult,
    limiting: Vec<&'a FlowCnec>,
}

impl<'a> BestTapFinder<'a> {
    /// `most_limiting` is ordered worst first; unknown ids are skipped.
    pub fn new(
        perimeter: &'a Perimeter,
        flow: &'a FlowResult,
        sensitivity: &'a SensitivityResult,
        activation: &'a RangeActionActivationResult,
        most_limiting: &[CnecId],
    ) -> Self {
        let limiting = most_limiting
            .iter()
            .filter_map(|id| perimeter.cnec(id.as_str()))
            .take(BEST_TAP_LIMITING_ELEMENTS)
            .collect();
        Self {
            flow,
            sensitivity,
            activation,
            limiting,
        }
    }

    /// Worst MW margin on the limiting elements with `pst` set to `angle`.
    fn min_margin(&self, pst: &RangeAction, state: &StateId, angle: f64) -> f64 {
        let current = self
            .activation
            .optimized_setpoint(&pst.id, state)
            .unwrap_or(pst.initial_setpoint);
        let shifted = self
            .flow
            .shifted(self.sensitivity, &BTreeMap::from([(pst.id.clone(), angle - current)]));
        let mut worst = f64::INFINITY;
        for cnec in &self.limiting {
            for side in cnec.sides() {
                let margin = cnec.margin_for_flow(shifted.flow(cnec, side, Unit::Megawatt), side, Unit::Megawatt);
                if !margin.is_nan() {
                    worst = worst.min(margin);
                }
            }
        }
        worst
    }

    /// Candidate taps of `pst` for the solved `angle`, with their worst
    /// margin. A single candidate is given `f64::MAX`.
    pub fn min_margin_per_tap<'s>(
        &self,
        pst: &RangeAction,
        state: &StateId,
        angle: f64,
        scratch: &'s ScratchArena,
    ) -> ScratchMap<'s, i32, f64> {
        let mut margins = scratch.alloc_map();
        let Some(taps) = pst.tap_table() else {
            return margins;
        };
        let closest = taps.closest_tap(angle);
        let (Ok(closest_angle), Some(other)) = (taps.angle(closest), taps.other_tap(closest, angle)) else {
            margins.insert(closest, f64::MAX);
            return margins;
        };
        let Ok(other_angle) = taps.angle(other) else {
            margins.insert(closest, f64::MAX);
            return margins;
        };
        let midpoint = 0.5 * (closest_angle + other_angle);
        if (angle - midpoint).abs() / (closest_angle - other_angle).abs() >= BEST_TAP_MIDPOINT_THRESHOLD {
            margins.insert(closest, f64::MAX);
            return margins;
        }
        let closest_margin = self.min_margin(pst, state, closest_angle);
        let other_margin = self.min_margin(pst, state, other_angle);
        if other_margin > closest_margin + MARGIN_GAIN_THRESHOLD * closest_margin.abs() {
            margins.insert(closest, closest_margin);
            margins.insert(other, other_margin);
        } else {
            margins.insert(closest, f64::MAX);
        }
        margins
    }

    /// Best tap of each PST given its solved angle in `state`.
    pub fn best_taps(
        &self,
        psts: &[(&RangeAction, f64)],
        state: &StateId,
        scratch: &ScratchArena,
    ) -> BTreeMap<RangeActionId, i32> {
        let mut per_pst = scratch.alloc_map::<&RangeActionId, ScratchMap<'_, i32, f64>>();
        let mut groups = scratch.alloc_map::<&str, Vec<&RangeActionId>>();
        for (pst, angle) in psts {
            per_pst.insert(&pst.id, self.min_margin_per_tap(pst, state, *angle, scratch));
            if let Some(group) = pst.group_id.as_deref() {
                groups.entry(group).or_default().push(&pst.id);
            }
        }

        let mut group_taps = scratch.alloc_map::<&str, i32>();
        for (group, members) in &groups {
            let mut candidates = scratch.alloc_vec::<i32>();
            for member in members {
                candidates.extend(per_pst.get(member).into_iter().flat_map(|m| m.keys().copied()));
            }
            candidates.sort_unstable();
            candidates.dedup();
            let joint = candidates.iter().map(|tap| {
                let worst = members
                    .iter()
                    .map(|member| {
                        per_pst
                            .get(member)
                            .and_then(|margins| margins.get(tap))
                            .copied()
                            .unwrap_or(f64::MIN)
                    })
                    .fold(f64::INFINITY, f64::min);
                (*tap, worst)
            });
            if let Some(tap) = argmax(joint) {
                group_taps.insert(*group, tap);
            }
        }

        psts.iter()
            .filter_map(|(pst, _)| {
                let tap = match pst.group_id.as_deref().and_then(|group| group_taps.get(group)) {
                    Some(tap) => *tap,
                    None => {
                        let margins = per_pst.get(&pst.id)?;
                        let mut own = margins.iter().map(|(tap, margin)| (*tap, *margin)).collect::<Vec<_>>();
                        own.sort_unstable_by_key(|(tap, _)| *tap);
                        argmax(own)?
                    }
                };
                Some((pst.id.clone(), tap))
            })
            .collect()
    }
}

/// Tap with the largest margin, the lowest tap on ties.
fn argmax(candidates: impl IntoIterator<Item = (i32, f64)>) -> Option<i32> {
    let mut best: Option<(i32, f64)> = None;
    for (tap, margin) in candidates {
        if best.map_or(true, |(_, best_margin)| margin > best_margin) {
            best = Some((tap, margin));
        }
    }
    best.map(|(tap, _)| tap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rao_core::{PstTapTable, Side, State};

    fn state() -> State {
        State::preventive("preventive")
    }

    fn pst(id: &str) -> RangeAction {
        RangeAction::pst(id, PstTapTable::linear(-16, 16, -6.4, 0.4).unwrap())
    }

    fn cnec(id: &str) -> FlowCnec {
        FlowCnec::new(id, state().id)
            .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
            .optimized()
    }

    struct Fixture {
        perimeter: Perimeter,
        flow: FlowResult,
        sensitivity: SensitivityResult,
        activation: RangeActionActivationResult,
    }

    /// `pst-a` pushes cnec-1 towards its limit; `pst-b` has no influence.
    fn fixture() -> Fixture {
        let perimeter = Perimeter::new(vec![state()])
            .with_cnec(cnec("cnec-1"))
            .with_cnec(cnec("cnec-2"))
            .with_range_action(&state().id, pst("pst-a").with_group("g"))
            .with_range_action(&state().id, pst("pst-b").with_group("g"));
        Fixture {
            flow: FlowResult::new()
                .with_flow("cnec-1".into(), Side::One, 90.0)
                .with_flow("cnec-2".into(), Side::One, 0.0),
            sensitivity: SensitivityResult::new().with_sensitivity("cnec-1".into(), Side::One, "pst-a".into(), 20.0),
            activation: perimeter.initial_activation(),
            perimeter,
        }
    }

    fn finder(f: &Fixture) -> BestTapFinder<'_> {
        let limiting = [CnecId::new("cnec-1"), CnecId::new("cnec-2"), CnecId::new("unknown")];
        BestTapFinder::new(&f.perimeter, &f.flow, &f.sensitivity, &f.activation, &limiting)
    }

    #[test]
    fn test_far_from_midpoint_keeps_closest_tap() {
        let f = fixture();
        let scratch = ScratchArena::new();
        let margins = finder(&f).min_margin_per_tap(&pst("pst-a"), &state().id, 0.85, &scratch);
        assert_eq!(margins.len(), 1);
        assert_eq!(margins.get(&2), Some(&f64::MAX));
    }

    #[test]
    fn test_rounding_a_tap_angle_is_idempotent() {
        let f = fixture();
        let scratch = ScratchArena::new();
        let taps = finder(&f).best_taps(&[(&pst("pst-c"), 1.2)], &state().id, &scratch);
        assert_eq!(taps[&RangeActionId::new("pst-c")], 3);
    }

    #[test]
    fn test_near_midpoint_prefers_better_margin() {
        let f = fixture();
        let scratch = ScratchArena::new();
        // 0.19° sits between tap 0 (0.0°) and tap 1 (0.4°), closer to 0;
        // moving up costs 8 MW of margin on cnec-1, moving down gains it
        let margins = finder(&f).min_margin_per_tap(&pst("pst-a"), &state().id, 0.19, &scratch);
        assert_eq!(margins.get(&0), Some(&f64::MAX));

        // negative sensitivity: tap 1 relieves cnec-1 by 8 MW
        let reversed = Fixture {
            sensitivity: SensitivityResult::new().with_sensitivity("cnec-1".into(), Side::One, "pst-a".into(), -20.0),
            ..fixture()
        };
        let margins = finder(&reversed).min_margin_per_tap(&pst("pst-a"), &state().id, 0.19, &scratch);
        assert!((margins[&0] - 10.0).abs() < 1e-9);
        assert!((margins[&1] - 18.0).abs() < 1e-9);
        let taps = finder(&reversed).best_taps(&[(&pst("pst-a").with_group("solo"), 0.19)], &state().id, &scratch);
        assert_eq!(taps[&RangeActionId::new("pst-a")], 1);
    }

    #[test]
    fn test_group_members_share_best_tap() {
        let f = Fixture {
            sensitivity: SensitivityResult::new().with_sensitivity("cnec-1".into(), Side::One, "pst-a".into(), -20.0),
            ..fixture()
        };
        let scratch = ScratchArena::new();
        let a = pst("pst-a").with_group("g");
        let b = pst("pst-b").with_group("g");
        let taps = finder(&f).best_taps(&[(&a, 0.19), (&b, 0.21)], &state().id, &scratch);
        assert_eq!(taps[&a.id], taps[&b.id]);
        assert_eq!(taps[&a.id], 1);
    }
}
