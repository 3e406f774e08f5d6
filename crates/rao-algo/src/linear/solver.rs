//! Backend selection and translation of an [`LpModel`] into `good_lp`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use good_lp::solvers::microlp::microlp as microlp_solver;
#[cfg(feature = "solver-clarabel")]
use good_lp::solvers::clarabel::clarabel as clarabel_solver;
#[cfg(feature = "solver-highs")]
use good_lp::solvers::highs::highs as highs_solver;
use good_lp::{
    constraint, variable, variables, Constraint, Expression, ProblemVariables, ResolutionError,
    Solution, SolverModel, Variable,
};
use rao_core::{RaoError, RaoResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::model::{LpModel, VarKey};
use super::LinearProblemStatus;
use crate::config::LinearSolverParameters;

/// Linear / mixed-integer backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LpSolverKind {
    /// Pure-Rust simplex with branch and bound
    #[default]
    Microlp,
    /// Interior point, continuous problems only
    #[cfg(feature = "solver-clarabel")]
    Clarabel,
    #[cfg(feature = "solver-highs")]
    Highs,
}

impl LpSolverKind {
    pub fn available() -> &'static [&'static str] {
        AVAILABLE_LP_SOLVERS
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LpSolverKind::Microlp => "microlp",
            #[cfg(feature = "solver-clarabel")]
            LpSolverKind::Clarabel => "clarabel",
            #[cfg(feature = "solver-highs")]
            LpSolverKind::Highs => "highs",
        }
    }

    /// Whether the backend handles integer variables.
    pub fn supports_integers(&self) -> bool {
        match self {
            LpSolverKind::Microlp => true,
            #[cfg(feature = "solver-clarabel")]
            LpSolverKind::Clarabel => false,
            #[cfg(feature = "solver-highs")]
            LpSolverKind::Highs => true,
        }
    }
}

const AVAILABLE_LP_SOLVERS: &[&str] = &[
    "microlp",
    #[cfg(feature = "solver-clarabel")]
    "clarabel",
    #[cfg(feature = "solver-highs")]
    "highs",
];

fn unknown_solver_error(label: &str) -> RaoError {
    RaoError::Config(format!(
        "unknown lp solver '{}'; supported values: {}",
        label,
        LpSolverKind::available().join(", ")
    ))
}

impl FromStr for LpSolverKind {
    type Err = RaoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.to_ascii_lowercase();
        match normalized.as_str() {
            "microlp" => Ok(LpSolverKind::Microlp),
            "clarabel" => {
                #[cfg(feature = "solver-clarabel")]
                {
                    Ok(LpSolverKind::Clarabel)
                }
                #[cfg(not(feature = "solver-clarabel"))]
                {
                    Err(unknown_solver_error(&normalized))
                }
            }
            "highs" => {
                #[cfg(feature = "solver-highs")]
                {
                    Ok(LpSolverKind::Highs)
                }
                #[cfg(not(feature = "solver-highs"))]
                {
                    Err(unknown_solver_error(&normalized))
                }
            }
            other => Err(unknown_solver_error(other)),
        }
    }
}

impl TryFrom<String> for LpSolverKind {
    type Error = RaoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LpSolverKind> for String {
    fn from(value: LpSolverKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for LpSolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one solve.
#[derive(Debug, Clone)]
pub struct LpSolution {
    pub status: LinearProblemStatus,
    pub objective: f64,
    values: BTreeMap<VarKey, f64>,
}

impl LpSolution {
    fn failed(status: LinearProblemStatus) -> Self {
        Self {
            status,
            objective: f64::NAN,
            values: BTreeMap::new(),
        }
    }

    pub fn value(&self, key: &VarKey) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// One `key=value` pair of the solver-specific parameter string.
#[derive(Debug, Clone, PartialEq)]
pub enum SolverOption {
    Float(f64),
    Int(i32),
    Bool(bool),
    Text(String),
}

/// Parses `"key=value;key2=value2"`; ints before floats before bools.
pub fn parse_solver_options(text: &str) -> RaoResult<Vec<(String, SolverOption)>> {
    text.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                RaoError::Config(format!("solver parameter '{item}' is not of the form key=value"))
            })?;
            let value = value.trim();
            let parsed = if let Ok(int) = value.parse::<i32>() {
                SolverOption::Int(int)
            } else if let Ok(float) = value.parse::<f64>() {
                SolverOption::Float(float)
            } else if let Ok(flag) = value.parse::<bool>() {
                SolverOption::Bool(flag)
            } else {
                SolverOption::Text(value.to_string())
            };
            Ok((key.trim().to_string(), parsed))
        })
        .collect()
}

struct Translated {
    vars: ProblemVariables,
    handles: BTreeMap<VarKey, Variable>,
    objective: Expression,
    constraints: Vec<Constraint>,
}

fn expression_of<'a>(
    handles: &BTreeMap<VarKey, Variable>,
    terms: impl Iterator<Item = (&'a VarKey, f64)>,
) -> Expression {
    let mut expr = Expression::from(0.0);
    for (key, coefficient) in terms {
        if let Some(var) = handles.get(key) {
            expr += coefficient * *var;
        }
    }
    expr
}

fn translate(model: &LpModel) -> Translated {
    let mut vars = variables!();
    let mut handles = BTreeMap::new();
    for (key, def) in model.variables() {
        let mut definition = variable();
        if def.integer {
            definition = definition.integer();
        }
        if def.lb.is_finite() {
            definition = definition.min(def.lb);
        }
        if def.ub.is_finite() {
            definition = definition.max(def.ub);
        }
        handles.insert(key.clone(), vars.add(definition));
    }

    let objective = expression_of(&handles, model.objective_terms());
    let mut constraints = Vec::with_capacity(model.num_constraints());
    for (_, linear) in model.constraints() {
        let expr = expression_of(&handles, linear.terms());
        if linear.lb == linear.ub {
            constraints.push(constraint!(expr == linear.ub));
            continue;
        }
        if linear.lb.is_finite() {
            constraints.push(constraint!(expr.clone() >= linear.lb));
        }
        if linear.ub.is_finite() {
            constraints.push(constraint!(expr <= linear.ub));
        }
    }

    Translated {
        vars,
        handles,
        objective,
        constraints,
    }
}

fn add_constraints<M: SolverModel>(mut problem: M, constraints: Vec<Constraint>) -> M {
    for constraint in constraints {
        problem.add_constraint(constraint);
    }
    problem
}

fn collect_solution<S: Solution>(
    solution: &S,
    handles: &BTreeMap<VarKey, Variable>,
    model: &LpModel,
) -> LpSolution {
    let values: BTreeMap<VarKey, f64> = handles
        .iter()
        .map(|(key, var)| (key.clone(), solution.value(*var)))
        .collect();
    let objective = model
        .objective_terms()
        .map(|(key, coefficient)| coefficient * values.get(key).copied().unwrap_or(0.0))
        .sum();
    LpSolution {
        status: LinearProblemStatus::Optimal,
        objective,
        values,
    }
}

fn status_of(error: &ResolutionError) -> LinearProblemStatus {
    match error {
        ResolutionError::Infeasible => LinearProblemStatus::Infeasible,
        ResolutionError::Unbounded => LinearProblemStatus::Unbounded,
        _ => LinearProblemStatus::Abnormal,
    }
}

/// Solves `model` with the configured backend.
///
/// Solver failures (infeasible, unbounded, numerical trouble) are reported
/// through the returned status; `Err` means the model itself is malformed.
pub fn solve(model: &LpModel, parameters: &LinearSolverParameters) -> RaoResult<LpSolution> {
    model.check_references()?;
    let kind = parameters.solver;
    if model.has_integer_variables() && !kind.supports_integers() {
        return Err(RaoError::Solver(format!(
            "solver '{kind}' cannot handle the integer variables of the linear problem"
        )));
    }
    let options = match &parameters.solver_specific_parameters {
        Some(text) => parse_solver_options(text)?,
        None => Vec::new(),
    };
    debug!(
        solver = kind.as_str(),
        variables = model.num_variables(),
        constraints = model.num_constraints(),
        integer = model.has_integer_variables(),
        "solving linear problem"
    );

    let Translated {
        vars,
        handles,
        objective,
        constraints,
    } = translate(model);
    let unsolved = vars.minimise(objective);

    let outcome = match kind {
        LpSolverKind::Microlp => {
            if !options.is_empty() {
                warn!(solver = "microlp", "solver-specific parameters are ignored");
            }
            let problem = add_constraints(unsolved.using(microlp_solver), constraints);
            problem
                .solve()
                .map(|solution| collect_solution(&solution, &handles, model))
        }
        #[cfg(feature = "solver-clarabel")]
        LpSolverKind::Clarabel => {
            if !options.is_empty() {
                warn!(solver = "clarabel", "solver-specific parameters are ignored");
            }
            let problem = add_constraints(unsolved.using(clarabel_solver), constraints);
            problem
                .solve()
                .map(|solution| collect_solution(&solution, &handles, model))
        }
        #[cfg(feature = "solver-highs")]
        LpSolverKind::Highs => {
            let mut problem = unsolved
                .using(highs_solver)
                .set_option("mip_rel_gap", parameters.relative_mip_gap);
            for (key, value) in options {
                problem = match value {
                    SolverOption::Float(v) => problem.set_option(key, v),
                    SolverOption::Int(v) => problem.set_option(key, v),
                    SolverOption::Bool(v) => problem.set_option(key, v),
                    SolverOption::Text(v) => problem.set_option(key, v.as_str()),
                };
            }
            let problem = add_constraints(problem, constraints);
            problem
                .solve()
                .map(|solution| collect_solution(&solution, &handles, model))
        }
    };

    Ok(match outcome {
        Ok(solution) => solution,
        Err(error) => {
            debug!(solver = kind.as_str(), %error, "linear problem not solved");
            LpSolution::failed(status_of(&error))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::model::ConstraintKey;
    use rao_core::StateId;

    #[test]
    fn test_parse_solver_options() {
        let options = parse_solver_options("presolve=off; threads=4;mip_rel_gap=0.01;parallel=true").unwrap();
        assert_eq!(options[0], ("presolve".into(), SolverOption::Text("off".into())));
        assert_eq!(options[1], ("threads".into(), SolverOption::Int(4)));
        assert_eq!(options[2], ("mip_rel_gap".into(), SolverOption::Float(0.01)));
        assert_eq!(options[3], ("parallel".into(), SolverOption::Bool(true)));
        assert!(parse_solver_options("no-equal-sign").is_err());
    }

    #[test]
    fn test_unknown_solver_lists_alternatives() {
        let err = "xpress".parse::<LpSolverKind>().unwrap_err().to_string();
        assert!(err.contains("xpress"));
        assert!(err.contains("microlp"));
        assert_eq!("MicroLP".parse::<LpSolverKind>().unwrap(), LpSolverKind::Microlp);
    }

    #[test]
    fn test_microlp_solves_small_mip() {
        // minimise -x - y  s.t. x + y <= 2.5, x integer in [0, 2], y in [0, 1]
        let mut model = LpModel::new();
        let x = VarKey::MinMargin;
        let y = VarKey::MinRelativeMargin;
        model.add_integer_variable(x.clone(), 0.0, 2.0).unwrap();
        model.add_variable(y.clone(), 0.0, 1.0).unwrap();
        model
            .add_constraint(ConstraintKey::MaxRa(StateId::new("s")), f64::NEG_INFINITY, 2.5)
            .unwrap()
            .set_coefficient(x.clone(), 1.0)
            .set_coefficient(y.clone(), 1.0);
        model.set_objective_coefficient(x.clone(), -1.0);
        model.set_objective_coefficient(y.clone(), -1.0);

        let solution = solve(&model, &LinearSolverParameters::default()).unwrap();
        assert_eq!(solution.status, LinearProblemStatus::Optimal);
        assert!((solution.value(&x).unwrap() - 2.0).abs() < 1e-6);
        assert!((solution.value(&y).unwrap() - 0.5).abs() < 1e-6);
        assert!((solution.objective + 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_infeasible_model_reports_status() {
        let mut model = LpModel::new();
        model.add_variable(VarKey::MinMargin, 0.0, 1.0).unwrap();
        model
            .add_constraint(ConstraintKey::MinMarginSign, 2.0, f64::INFINITY)
            .unwrap()
            .set_coefficient(VarKey::MinMargin, 1.0);
        let solution = solve(&model, &LinearSolverParameters::default()).unwrap();
        assert_eq!(solution.status, LinearProblemStatus::Infeasible);
        assert!(solution.value(&VarKey::MinMargin).is_none());
    }
}
