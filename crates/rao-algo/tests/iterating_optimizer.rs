use std::cell::Cell;
use std::collections::BTreeMap;
use std::io::Write;

use rao_algo::linear::FillerContext;
use rao_algo::optimizer::{optimize, IteratingLinearOptimizer, OptimizationInputs};
use rao_algo::{
    load_parameters, IteratingParameters, LinearOptimizationStatus, LinearProblemStatus, LinearizationPoint,
    PstModel, RangeShrinking, RaoParameters, RelaxedProblem, SensitivityComputation, SensitivityOracle,
    UnevaluatedObjective,
};
use rao_core::{
    ComputationStatus, FlowCnec, FlowResult, NetworkActionsResult, Perimeter, PstTapTable, RangeAction,
    RangeActionActivationResult, RangeActionId, RaoResult, SensitivityResult, Side, State, StateId, Unit,
};

/// One line limited to 100 MW and a 0-30 MW injection relieving it.
fn perimeter() -> Perimeter {
    let state = State::preventive("preventive");
    Perimeter::new(vec![state.clone()])
        .with_cnec(
            FlowCnec::new("line", state.id.clone())
                .with_operator("FR")
                .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
                .optimized(),
        )
        .with_range_action(
            &state.id,
            RangeAction::injection("gen", 0.0, 30.0)
                .with_operator("FR")
                .with_initial_setpoint(0.0),
        )
}

fn preventive() -> StateId {
    StateId::new("preventive")
}

fn computation(flow: f64, status: ComputationStatus) -> SensitivityComputation {
    SensitivityComputation {
        flow: FlowResult::new()
            .with_flow("line".into(), Side::One, flow)
            .with_status(status),
        sensitivity: SensitivityResult::new().with_sensitivity("line".into(), Side::One, "gen".into(), -1.0),
    }
}

fn initial_point(perimeter: &Perimeter) -> LinearizationPoint {
    let SensitivityComputation { flow, sensitivity } = computation(120.0, ComputationStatus::Default);
    LinearizationPoint {
        flow,
        sensitivity,
        activation: perimeter.initial_activation(),
    }
}

/// Network whose response to the injection is weaker than its sensitivity:
/// 30 MW injected only relieve the line by 25 MW.
struct DampedNetwork {
    calls: usize,
    fail_at_call: Option<usize>,
}

impl DampedNetwork {
    fn new() -> Self {
        Self {
            calls: 0,
            fail_at_call: None,
        }
    }
}

impl SensitivityOracle for DampedNetwork {
    fn compute(
        &mut self,
        activation: &RangeActionActivationResult,
        _network_actions: &NetworkActionsResult,
    ) -> RaoResult<SensitivityComputation> {
        self.calls += 1;
        let setpoint = activation
            .optimized_setpoint(&RangeActionId::new("gen"), &preventive())
            .unwrap_or(0.0);
        let status = if self.fail_at_call == Some(self.calls) {
            ComputationStatus::Failure
        } else {
            ComputationStatus::Default
        };
        Ok(computation(120.0 - setpoint * 5.0 / 6.0, status))
    }
}

/// Network on which nothing the optimizer does helps.
struct StubbornNetwork;

impl SensitivityOracle for StubbornNetwork {
    fn compute(
        &mut self,
        _activation: &RangeActionActivationResult,
        _network_actions: &NetworkActionsResult,
    ) -> RaoResult<SensitivityComputation> {
        Ok(computation(130.0, ComputationStatus::Default))
    }
}

/// Replays one scripted solve per call, repeating the last one.
struct ScriptedProblem<'c> {
    solves: Vec<(LinearProblemStatus, f64)>,
    next: usize,
    current: Option<f64>,
    relinearizations: &'c Cell<usize>,
}

impl<'c> ScriptedProblem<'c> {
    fn new(solves: Vec<(LinearProblemStatus, f64)>, relinearizations: &'c Cell<usize>) -> Self {
        Self {
            solves,
            next: 0,
            current: None,
            relinearizations,
        }
    }
}

impl RelaxedProblem for ScriptedProblem<'_> {
    fn update_between_sensi_iteration(&mut self, _point: &LinearizationPoint) -> RaoResult<()> {
        self.relinearizations.set(self.relinearizations.get() + 1);
        Ok(())
    }

    fn update_between_mip_iteration(&mut self, _activation: &RangeActionActivationResult) -> RaoResult<()> {
        Ok(())
    }

    fn solve(&mut self) -> RaoResult<LinearProblemStatus> {
        let (status, setpoint) = self.solves[self.next.min(self.solves.len() - 1)];
        self.next += 1;
        self.current = status.is_usable().then_some(setpoint);
        Ok(status)
    }

    fn setpoint(&self, range_action: &RangeActionId, state: &StateId) -> Option<f64> {
        (range_action.as_str() == "gen" && *state == preventive())
            .then_some(self.current)
            .flatten()
    }

    fn tap(&self, _range_action: &RangeActionId, _state: &StateId) -> Option<f64> {
        None
    }
}

struct Scenario {
    perimeter: Perimeter,
    parameters: RaoParameters,
    initial: LinearizationPoint,
    network_actions: NetworkActionsResult,
}

impl Scenario {
    fn new() -> Self {
        let perimeter = perimeter();
        Self {
            initial: initial_point(&perimeter),
            perimeter,
            parameters: RaoParameters::default(),
            network_actions: NetworkActionsResult::default(),
        }
    }

    fn context(&self) -> FillerContext<'_> {
        FillerContext {
            perimeter: &self.perimeter,
            parameters: &self.parameters,
            initial_flow: &self.initial.flow,
            pre_perimeter_flow: &self.initial.flow,
        }
    }

    fn iterating(&self, max_iterations: usize, range_shrinking: bool) -> IteratingParameters {
        IteratingParameters {
            max_iterations,
            range_shrinking,
            pst_model: PstModel::Continuous,
        }
    }
}

fn gen_setpoint(activation: &RangeActionActivationResult) -> Option<f64> {
    activation.optimized_setpoint(&RangeActionId::new("gen"), &preventive())
}

#[test]
fn test_improvement_then_convergence() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(vec![(LinearProblemStatus::Optimal, 30.0)], &relinearizations);
    let mut network = DampedNetwork::new();

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(10, false),
    )
    .optimize(problem, &mut network, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::Optimal);
    assert_eq!(result.iterations, 2);
    assert!((result.functional_cost() + 5.0).abs() < 1e-9);
    assert!((result.flow.flow(scenario.perimeter.cnec("line").unwrap(), Side::One, Unit::Megawatt) - 95.0).abs() < 1e-9);
    assert_eq!(gen_setpoint(&result.activation), Some(30.0));
    assert_eq!(network.calls, 1);
    assert_eq!(relinearizations.get(), 2);
}

#[test]
fn test_first_solve_failure_returns_initial_situation() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(vec![(LinearProblemStatus::Infeasible, 0.0)], &relinearizations);
    let mut network = DampedNetwork::new();

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(10, false),
    )
    .optimize(problem, &mut network, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::Infeasible);
    assert_eq!(result.iterations, 1);
    assert!((result.functional_cost() - 20.0).abs() < 1e-9);
    assert_eq!(network.calls, 0);
}

#[test]
fn test_later_solve_failure_keeps_best_as_feasible() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(
        vec![(LinearProblemStatus::Optimal, 12.0), (LinearProblemStatus::Abnormal, 0.0)],
        &relinearizations,
    );
    let mut network = DampedNetwork::new();

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(10, false),
    )
    .optimize(problem, &mut network, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::Feasible);
    assert_eq!(result.iterations, 2);
    // 12 MW injected relieve the line by 10 MW
    assert!((result.functional_cost() - 10.0).abs() < 1e-9);
    assert_eq!(gen_setpoint(&result.activation), Some(12.0));
}

#[test]
fn test_sensitivity_failure_stops_without_adopting_result() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(vec![(LinearProblemStatus::Optimal, 30.0)], &relinearizations);
    let mut network = DampedNetwork {
        calls: 0,
        fail_at_call: Some(1),
    };

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(10, false),
    )
    .optimize(problem, &mut network, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::SensitivityComputationFailed);
    assert!((result.functional_cost() - 20.0).abs() < 1e-9);
    assert_eq!(gen_setpoint(&result.activation), Some(0.0));
    assert_eq!(relinearizations.get(), 1);
}

#[test]
fn test_no_improvement_without_shrinking_stops() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(vec![(LinearProblemStatus::Optimal, 5.0)], &relinearizations);

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(10, false),
    )
    .optimize(problem, &mut StubbornNetwork, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::Optimal);
    assert_eq!(result.iterations, 1);
    assert!((result.functional_cost() - 20.0).abs() < 1e-9);
    assert_eq!(gen_setpoint(&result.activation), Some(0.0));
}

#[test]
fn test_shrinking_relinearizes_around_rejected_points() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(
        vec![
            (LinearProblemStatus::Optimal, 5.0),
            (LinearProblemStatus::Optimal, 6.0),
            (LinearProblemStatus::Optimal, 7.0),
        ],
        &relinearizations,
    );

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(3, true),
    )
    .optimize(problem, &mut StubbornNetwork, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::MaxIterationReached);
    assert_eq!(result.iterations, 3);
    assert!((result.functional_cost() - 20.0).abs() < 1e-9);
    assert_eq!(relinearizations.get(), 4);
}

#[test]
fn test_iteration_budget_returns_last_improvement() {
    let scenario = Scenario::new();
    let objective = UnevaluatedObjective::build(scenario.context(), &scenario.initial.sensitivity).unwrap();
    let relinearizations = Cell::new(0);
    let problem = ScriptedProblem::new(
        vec![
            (LinearProblemStatus::Optimal, 6.0),
            (LinearProblemStatus::Optimal, 18.0),
            (LinearProblemStatus::Optimal, 24.0),
        ],
        &relinearizations,
    );
    let mut network = DampedNetwork::new();

    let result = IteratingLinearOptimizer::new(
        &scenario.perimeter,
        &objective,
        &scenario.network_actions,
        scenario.iterating(2, false),
    )
    .optimize(problem, &mut network, &scenario.initial)
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::MaxIterationReached);
    assert_eq!(result.iterations, 2);
    assert_eq!(gen_setpoint(&result.activation), Some(18.0));
    assert!((result.functional_cost() - 5.0).abs() < 1e-9);
}

#[test]
fn test_sample_scenario_with_linear_solver() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let scenario = Scenario::new();
    let mut network = DampedNetwork::new();
    let result = optimize(
        OptimizationInputs {
            perimeter: &scenario.perimeter,
            parameters: &scenario.parameters,
            initial_flow: &scenario.initial.flow,
            pre_perimeter: &scenario.initial,
            network_actions: &scenario.network_actions,
            range_shrinking: false,
        },
        &mut network,
    )
    .unwrap();

    assert_eq!(result.status, LinearOptimizationStatus::Optimal);
    assert_eq!(result.iterations, 2);
    assert!((gen_setpoint(&result.activation).unwrap() - 30.0).abs() < 1e-6);
    assert!((result.functional_cost() + 5.0).abs() < 1e-6);
    assert_eq!(result.virtual_cost("sensitivity-failure-cost"), Some(0.0));
}

/// Two PSTs of one group in series with the line, each shifting 25 MW/°
/// in the linear model but only 22 MW/° on the network.
struct PstCorridor;

impl PstCorridor {
    fn pst(id: &str) -> RangeAction {
        RangeAction::pst(id, PstTapTable::linear(-16, 16, -6.4, 0.4).unwrap())
            .with_operator("FR")
            .with_group("corridor")
    }

    fn perimeter() -> Perimeter {
        let state = State::preventive("preventive");
        Perimeter::new(vec![state.clone()])
            .with_cnec(
                FlowCnec::new("line", state.id.clone())
                    .with_threshold(Side::One, Unit::Megawatt, Some(-100.0), Some(100.0))
                    .optimized(),
            )
            .with_range_action(&state.id, Self::pst("pst-a"))
            .with_range_action(&state.id, Self::pst("pst-b"))
    }

    fn computation(flow: f64) -> SensitivityComputation {
        SensitivityComputation {
            flow: FlowResult::new().with_flow("line".into(), Side::One, flow),
            sensitivity: SensitivityResult::new()
                .with_sensitivity("line".into(), Side::One, "pst-a".into(), -25.0)
                .with_sensitivity("line".into(), Side::One, "pst-b".into(), -25.0),
        }
    }
}

impl SensitivityOracle for PstCorridor {
    fn compute(
        &mut self,
        activation: &RangeActionActivationResult,
        _network_actions: &NetworkActionsResult,
    ) -> RaoResult<SensitivityComputation> {
        let angles: f64 = ["pst-a", "pst-b"]
            .into_iter()
            .map(|id| activation.optimized_setpoint(&RangeActionId::new(id), &preventive()).unwrap_or(0.0))
            .sum();
        Ok(Self::computation(120.0 - 22.0 * angles))
    }
}

fn optimize_corridor(pst_model: PstModel) -> (rao_algo::LinearOptimizationResult, Perimeter) {
    let perimeter = PstCorridor::perimeter();
    let mut parameters = RaoParameters::default();
    parameters.range_actions.pst_model = pst_model;
    let SensitivityComputation { flow, sensitivity } = PstCorridor::computation(120.0);
    let initial = LinearizationPoint {
        flow,
        sensitivity,
        activation: perimeter.initial_activation(),
    };
    let result = optimize(
        OptimizationInputs {
            perimeter: &perimeter,
            parameters: &parameters,
            initial_flow: &initial.flow,
            pre_perimeter: &initial,
            network_actions: &NetworkActionsResult::default(),
            range_shrinking: false,
        },
        &mut PstCorridor,
    )
    .unwrap();
    (result, perimeter)
}

#[test]
fn test_grouped_psts_end_on_the_same_tap() {
    for pst_model in [PstModel::Continuous, PstModel::ApproximatedIntegers] {
        let (result, perimeter) = optimize_corridor(pst_model);
        let taps: Vec<Option<i32>> = ["pst-a", "pst-b"]
            .into_iter()
            .map(|id| {
                let pst = perimeter.range_action(&RangeActionId::new(id)).unwrap();
                result.activation.optimized_tap(pst, &preventive())
            })
            .collect();

        assert_eq!(taps[0], taps[1], "{pst_model:?}");
        // relinearized around tap 6, the balanced angle 2.688° rounds to tap 7
        assert_eq!(taps[0], Some(7), "{pst_model:?}");
        assert_eq!(result.status, LinearOptimizationStatus::Optimal, "{pst_model:?}");
        assert!((result.functional_cost() + 96.8).abs() < 1e-6, "{pst_model:?}");
    }
}

#[test]
fn test_invalid_parameters_are_rejected_before_solving() {
    let mut scenario = Scenario::new();
    scenario.parameters.range_actions.max_mip_iterations = 0;
    let mut network = DampedNetwork::new();
    let result = optimize(
        OptimizationInputs {
            perimeter: &scenario.perimeter,
            parameters: &scenario.parameters,
            initial_flow: &scenario.initial.flow,
            pre_perimeter: &scenario.initial,
            network_actions: &scenario.network_actions,
            range_shrinking: false,
        },
        &mut network,
    );
    assert!(result.is_err());
    assert_eq!(network.calls, 0);
}

#[test]
fn test_loop_settings_from_parameter_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[range_actions]
max_mip_iterations = 4
pst_model = "approximated_integers"
range_shrinking = "enabled"
"#
    )
    .unwrap();

    let parameters = load_parameters(file.path()).unwrap();
    assert_eq!(parameters.range_actions.range_shrinking, RangeShrinking::Enabled);
    let iterating = IteratingParameters::from_parameters(&parameters, true);
    assert_eq!(iterating.max_iterations, 4);
    assert_eq!(iterating.pst_model, PstModel::ApproximatedIntegers);
    assert!(iterating.range_shrinking);
}

#[test]
fn test_missing_parameter_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let error = load_parameters(&path).unwrap_err();
    assert!(format!("{error:#}").contains("absent.toml"));
}

#[test]
fn test_status_of_each_exit_serializes() {
    let statuses = BTreeMap::from([
        ("OPTIMAL", LinearOptimizationStatus::Optimal),
        ("MAX_ITERATION_REACHED", LinearOptimizationStatus::MaxIterationReached),
    ]);
    for (text, status) in statuses {
        assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{text}\""));
    }
}
