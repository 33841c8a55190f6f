//! Quantitative model checking of [`Formula`]s on concrete models.
//!
//! Unbounded properties are reduced to a fixpoint system over the states whose
//! value is not fixed by graph analysis; bounded properties are computed by
//! repeated matrix-vector multiplication (uniformized for continuous time).

use crate::environment::SolverEnvironment;
use crate::graph;
use crate::model::{ConcreteModel, TimeModel};
use crate::property::{Bound, Direction, Formula, Objective};
use crate::solvers::{solve_linear, solve_min_max, FixpointSystem, SolverOutcome};
use crate::traits::{CheckEngine, CheckResult};
use anyhow::{anyhow, bail, Context, Result};
use nalgebra_sparse::CsrMatrix;
use tracing::{debug, info};

/// The sparse engine used for every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelChecker;

impl CheckEngine for ModelChecker {
    fn check(
        &self,
        model: &ConcreteModel,
        formula: &Formula,
        environment: &SolverEnvironment,
    ) -> Result<CheckResult> {
        if model.variant.is_nondeterministic() && formula.direction.is_none() {
            bail!("Property `{}` needs a direction on a {}.", formula, model.variant);
        }
        let time_model = model.variant.time_model();
        let values = match (formula.objective, formula.bound, time_model) {
            (Objective::Probability, None, TimeModel::Discrete) => {
                until(model, formula, environment)?
            }
            (Objective::Probability, None, TimeModel::Continuous) => {
                until(&embedded(model)?, formula, environment)?
            }
            (Objective::Probability, Some(Bound::Steps(steps)), TimeModel::Discrete) => {
                bounded_until(model, formula, steps)
            }
            (Objective::Probability, Some(Bound::Time(time)), TimeModel::Continuous) => {
                time_bounded_until(model, formula, time, environment)?
            }
            (Objective::Reward, None, TimeModel::Discrete) => {
                reachability_reward(model, formula, environment)?
            }
            (Objective::Reward, None, TimeModel::Continuous) => {
                reachability_reward(&embedded(model)?, formula, environment)?
            }
            (objective, Some(bound), _) => {
                bail!("{:?} bound {:?} does not apply to a {}.", objective, bound, model.variant)
            }
        };
        Ok(CheckResult { values })
    }
}

fn indicator(set: &[bool]) -> Vec<f64> {
    set.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect()
}

fn optimum(direction: Option<Direction>, values: impl Iterator<Item = f64>) -> f64 {
    match direction {
        Some(Direction::Minimize) => values.fold(f64::INFINITY, f64::min),
        Some(Direction::Maximize) | None => values.fold(f64::NEG_INFINITY, f64::max),
    }
}

fn until(model: &ConcreteModel, formula: &Formula, environment: &SolverEnvironment) -> Result<Vec<f64>> {
    let (phi, psi) = (&formula.phi, &formula.psi);
    let (zero, one) = match formula.direction {
        None => (graph::prob0(model, phi, psi), graph::prob1(model, phi, psi)),
        Some(Direction::Maximize) => (graph::prob0(model, phi, psi), graph::prob1e(model, phi, psi)),
        Some(Direction::Minimize) => (graph::prob0e(model, phi, psi), graph::prob1a(model, phi, psi)),
    };
    let maybe: Vec<bool> = zero.iter().zip(&one).map(|(&z, &o)| !z && !o).collect();
    solve_maybe_states(
        model,
        &maybe,
        indicator(&one),
        None,
        Some(1.0),
        formula.direction,
        environment,
    )
}

fn reachability_reward(
    model: &ConcreteModel,
    formula: &Formula,
    environment: &SolverEnvironment,
) -> Result<Vec<f64>> {
    let rewards = model
        .state_rewards
        .as_deref()
        .context("The model has no rewards.")?;
    let psi = &formula.psi;
    let all = vec![true; model.state_count()];
    // Rewards are finite exactly where the target is reached almost surely.
    let finite = match formula.direction {
        None => graph::prob1(model, &all, psi),
        Some(Direction::Maximize) => graph::prob1a(model, &all, psi),
        Some(Direction::Minimize) => graph::prob1e(model, &all, psi),
    };
    let known: Vec<f64> = finite
        .iter()
        .map(|&f| if f { 0.0 } else { f64::INFINITY })
        .collect();
    let maybe: Vec<bool> = finite.iter().zip(psi).map(|(&f, &t)| f && !t).collect();
    solve_maybe_states(
        model,
        &maybe,
        known,
        Some(rewards),
        None,
        formula.direction,
        environment,
    )
}

/// Solves for the `maybe` states; every other state keeps its `known` value.
fn solve_maybe_states(
    model: &ConcreteModel,
    maybe: &[bool],
    mut known: Vec<f64>,
    state_rewards: Option<&[f64]>,
    upper_bound: Option<f64>,
    direction: Option<Direction>,
    environment: &SolverEnvironment,
) -> Result<Vec<f64>> {
    let states: Vec<usize> = (0..model.state_count()).filter(|&s| maybe[s]).collect();
    if states.is_empty() {
        return Ok(known);
    }
    let mut local = vec![usize::MAX; model.state_count()];
    for (idx, &state) in states.iter().enumerate() {
        local[state] = idx;
    }

    let mut row_groups = vec![0];
    let mut offsets = vec![0];
    let mut columns = Vec::new();
    let mut entries = Vec::new();
    let mut rhs = Vec::new();
    for &state in &states {
        let group_start = rhs.len();
        for choice in model.structure.choices(state) {
            let mut b = state_rewards.map_or(0.0, |rewards| rewards[state]);
            let row_start = columns.len();
            for (target, p) in model.row(choice) {
                if p == 0.0 {
                    continue;
                }
                match local[target] {
                    usize::MAX => b += p * known[target],
                    idx => {
                        columns.push(idx);
                        entries.push(p);
                    }
                }
            }
            if b.is_infinite() {
                // Only possible when minimizing rewards; such a choice is never optimal.
                columns.truncate(row_start);
                entries.truncate(row_start);
                continue;
            }
            offsets.push(columns.len());
            rhs.push(b);
        }
        if rhs.len() == group_start {
            bail!("State {} has no choice with a finite value.", state);
        }
        row_groups.push(rhs.len());
    }

    let matrix = CsrMatrix::try_from_csr_data(rhs.len(), states.len(), offsets, columns, entries)
        .map_err(|e| anyhow!("Invalid equation system: {}", e))?;
    let system = FixpointSystem::new(matrix, row_groups, rhs, upper_bound);
    let outcome = match direction {
        None => solve_linear(&system, environment)?,
        Some(direction) => solve_min_max(&system, direction, environment)?,
    };
    report(&outcome, states.len(), environment);

    for (&state, value) in states.iter().zip(outcome.values) {
        known[state] = value;
    }
    Ok(known)
}

fn report(outcome: &SolverOutcome, size: usize, environment: &SolverEnvironment) {
    if environment.print_diagnostics {
        info!(
            "Solved {} states with {} in {} iterations.",
            size, outcome.method, outcome.iterations
        );
    } else {
        debug!(
            "Solved {} states with {} in {} iterations.",
            size, outcome.method, outcome.iterations
        );
    }
}

fn bounded_until(model: &ConcreteModel, formula: &Formula, steps: usize) -> Vec<f64> {
    let mut values = indicator(&formula.psi);
    let mut next = values.clone();
    for _ in 0..steps {
        for state in 0..model.state_count() {
            if formula.psi[state] || !formula.phi[state] {
                continue;
            }
            next[state] = optimum(
                formula.direction,
                model.structure.choices(state).map(|choice| {
                    model
                        .row(choice)
                        .map(|(target, p)| p * values[target])
                        .sum::<f64>()
                }),
            );
        }
        std::mem::swap(&mut values, &mut next);
    }
    values
}

/// Transition probabilities of the jump chain; rewards become the expected
/// reward per visit.
fn embedded(model: &ConcreteModel) -> Result<ConcreteModel> {
    let exit_rates = model
        .exit_rates
        .as_deref()
        .context("Continuous-time model without exit rates.")?;
    let mut embedded = model.clone();
    let offsets = embedded.matrix.row_offsets().to_vec();
    let values = embedded.matrix.values_mut();
    for (state, &rate) in exit_rates.iter().enumerate() {
        if rate > 0.0 {
            for choice in model.structure.choices(state) {
                for value in &mut values[offsets[choice]..offsets[choice + 1]] {
                    *value /= rate;
                }
            }
        }
    }
    if let Some(rewards) = embedded.state_rewards.as_mut() {
        for (reward, &rate) in rewards.iter_mut().zip(exit_rates) {
            *reward = if rate > 0.0 { *reward / rate } else { 0.0 };
        }
    }
    embedded.exit_rates = None;
    Ok(embedded)
}

/// `phi U<=t psi` on a CTMC by uniformization. Poisson weights are computed in
/// log space so that large `q * t` does not underflow the first terms.
fn time_bounded_until(
    model: &ConcreteModel,
    formula: &Formula,
    time: f64,
    environment: &SolverEnvironment,
) -> Result<Vec<f64>> {
    let exit_rates = model
        .exit_rates
        .as_deref()
        .context("Continuous-time model without exit rates.")?;
    let n = model.state_count();
    let transient: Vec<bool> = (0..n).map(|s| formula.phi[s] && !formula.psi[s]).collect();
    let fixed = indicator(&formula.psi);

    let q = (0..n)
        .filter(|&s| transient[s])
        .map(|s| exit_rates[s])
        .fold(0.0, f64::max);
    if time == 0.0 || q == 0.0 {
        return Ok(fixed);
    }

    let qt = q * time;
    let epsilon = environment.linear.precision;
    let cap = (qt + 10.0 * qt.sqrt() + 100.0).ceil() as usize;
    let mut current = fixed.clone();
    let mut next = fixed.clone();
    let mut result = vec![0.0; n];
    let mut log_factorial = 0.0;
    let mut total = 0.0;
    let mut terms = 0;
    for k in 0..=cap {
        if k > 0 {
            log_factorial += (k as f64).ln();
            for state in (0..n).filter(|&s| transient[s]) {
                let mut acc = (1.0 - exit_rates[state] / q) * current[state];
                for choice in model.structure.choices(state) {
                    for (target, rate) in model.row(choice) {
                        acc += rate / q * current[target];
                    }
                }
                next[state] = acc;
            }
            std::mem::swap(&mut current, &mut next);
        }
        let weight = (k as f64 * qt.ln() - qt - log_factorial).exp();
        for (r, v) in result.iter_mut().zip(&current) {
            *r += weight * v;
        }
        total += weight;
        terms = k + 1;
        if k as f64 >= qt && 1.0 - total <= epsilon {
            break;
        }
    }
    debug!("Uniformization with rate {} used {} Poisson terms.", q, terms);

    for state in (0..n).filter(|&s| !transient[s]) {
        result[state] = fixed[state];
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiate::Instantiator;
    use crate::loader::{build_model, parse_description, ModelKind};
    use crate::property::load_property;
    use crate::traits::Instantiate;
    use crate::valuation::decode_valuation;

    fn check_with(text: &str, property: &str, valuation: &str, env: &SolverEnvironment) -> Result<f64> {
        let description = parse_description(ModelKind::Explicit, text).expect("parses");
        let parametric = build_model(&description, "").expect("builds");
        let formula = load_property(property, &parametric).expect("property");
        let mut inst = Instantiator::new(&parametric).expect("instantiator");
        let valuation = decode_valuation(valuation, inst.parameters()).expect("valuation");
        let model = inst.instantiate(&valuation)?;
        let result = ModelChecker.check(model, &formula, env)?;
        Ok(result.at(model.initial_states()[0]).expect("initial state"))
    }

    fn check(text: &str, property: &str, valuation: &str) -> f64 {
        let mut env = SolverEnvironment::default();
        env.linear.precision = 1e-10;
        env.min_max.precision = 1e-10;
        check_with(text, property, valuation, &env).expect("checks")
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6 * expected.abs().max(1.0),
            "{actual} vs {expected}"
        );
    }

    const COIN: &str = "type: dtmc\nconst p\nstates: 3\nlabel heads: 1\n0 -> 1 : p\n0 -> 2 : 1 - p\n";

    // Retry until success; every attempt costs one.
    const RETRY: &str = "type: dtmc\nconst p\nstates: 2\nlabel goal: 1\nreward 0: 1\n\
        0 -> 1 : p\n0 -> 0 : 1 - p\n";

    #[test]
    fn dtmc_reachability() {
        assert_close(check(COIN, "P=? [ F \"heads\" ]", "p=0.3"), 0.3);
        assert_close(check(COIN, "P=? [ F \"heads\" ]", "p=0"), 0.0);
        assert_close(check(RETRY, "P=? [ F \"goal\" ]", "p=0.1"), 1.0);
    }

    #[test]
    fn every_linear_method_gives_the_same_answer() {
        // Two-step chain with a retry at each step.
        let chain = "type: dtmc\nconst p\nstates: 4\nlabel goal: 2\n\
            0 -> 1 : p\n0 -> 3 : 1 - p\n1 -> 2 : 0.5\n1 -> 0 : 0.5\n";
        // x0 = p x1, x1 = 0.5 + 0.5 x0  =>  x0 = 0.5 p / (1 - 0.5 p)
        let expected = 0.5 * 0.6 / (1.0 - 0.5 * 0.6);
        for method in ["vi", "jacobi", "gs", "ii", "pi", "lu"] {
            for topological in [false, true] {
                let mut env = SolverEnvironment::default();
                env.apply_method_directive(method);
                env.topological.enabled = topological;
                env.linear.precision = 1e-10;
                let value = check_with(chain, "P=? [ F \"goal\" ]", "p=0.6", &env).expect("checks");
                assert_close(value, expected);
            }
        }
    }

    #[test]
    fn dtmc_bounded_and_rewards() {
        assert_close(check(RETRY, "P=? [ F<=2 \"goal\" ]", "p=0.25"), 1.0 - 0.75 * 0.75);
        assert_close(check(RETRY, "P=? [ F<=0 \"goal\" ]", "p=0.25"), 0.0);
        assert_close(check(RETRY, "R=? [ F \"goal\" ]", "p=0.25"), 4.0);
        assert!(check(RETRY, "R=? [ F \"goal\" ]", "p=0").is_infinite());
    }

    #[test]
    fn constrained_until() {
        // Reaching 2 through 1 only.
        let text = "type: dtmc\nconst p\nstates: 4\nlabel safe: 0 1\nlabel goal: 2\n\
            0 -> 1 : p\n0 -> 3 : 1 - p\n1 -> 2 : 1\n3 -> 2 : 1\n";
        assert_close(check(text, "P=? [ \"safe\" U \"goal\" ]", "p=0.7"), 0.7);
        assert_close(check(text, "P=? [ F \"goal\" ]", "p=0.7"), 1.0);
    }

    // From 0: `safe` reaches the goal with probability p, `risky` with 0.5 but
    // may also go back to 0.
    const MDP: &str = "type: mdp\nconst p\nstates: 3\nlabel goal: 1\nreward 0: 1\n\
        0 [safe] -> 1 : p\n0 [safe] -> 2 : 1 - p\n\
        0 [risky] -> 1 : 0.5\n0 [risky] -> 0 : 0.5\n";

    #[test]
    fn mdp_extremal_probabilities() {
        assert_close(check(MDP, "Pmax=? [ F \"goal\" ]", "p=0.3"), 1.0);
        assert_close(check(MDP, "Pmin=? [ F \"goal\" ]", "p=0.3"), 0.3);
        assert_close(check(MDP, "Pmax=? [ F<=1 \"goal\" ]", "p=0.3"), 0.5);
        assert_close(check(MDP, "Pmin=? [ F<=2 \"goal\" ]", "p=0.3"), 0.3);
        // Rmin only counts schedulers that reach the goal surely.
        assert_close(check(MDP, "Rmin=? [ F \"goal\" ]", "p=0.3"), 2.0);
        assert!(check(MDP, "Rmax=? [ F \"goal\" ]", "p=0.3").is_infinite());
    }

    #[test]
    fn mdp_methods_agree() {
        for method in ["vi", "jacobi", "gs", "ii", "pi", "lu"] {
            let mut env = SolverEnvironment::default();
            env.apply_method_directive(method);
            env.min_max.precision = 1e-10;
            let min = check_with(MDP, "Pmin=? [ F \"goal\" ]", "p=0.3", &env).expect("checks");
            assert_close(min, 0.3);
            let reward = check_with(MDP, "Rmin=? [ F \"goal\" ]", "p=0.3", &env).expect("checks");
            assert_close(reward, 2.0);
        }
    }

    // Idling at 0 is free but never reaches the goal; moving on costs 5.
    const IDLE: &str = "type: mdp\nstates: 3\nlabel goal: 2\nreward 1: 5\n\
        0 [idle] -> 0 : 1\n0 [go] -> 1 : 1\n1 -> 2 : 1\n";

    #[test]
    fn rmin_skips_zero_reward_cycles() {
        for method in ["vi", "jacobi", "gs", "ii", "pi", "lu"] {
            let mut env = SolverEnvironment::default();
            env.apply_method_directive(method);
            env.min_max.precision = 1e-10;
            let reward = check_with(IDLE, "Rmin=? [ F \"goal\" ]", "", &env).expect("checks");
            assert_close(reward, 5.0);
            let max = check_with(IDLE, "Rmax=? [ F \"goal\" ]", "", &env).expect("checks");
            assert!(max.is_infinite(), "{method}: {max}");
        }
    }

    const DECAY: &str = "type: ctmc\nconst lambda\nstates: 2\nlabel done: 1\nreward 0: 3\n\
        0 -> 1 : lambda\n";

    #[test]
    fn ctmc_properties() {
        assert_close(check(DECAY, "P=? [ F<=0.5 \"done\" ]", "lambda=2"), 1.0 - (-1.0f64).exp());
        assert_close(check(DECAY, "P=? [ F<=0 \"done\" ]", "lambda=2"), 0.0);
        assert_close(check(DECAY, "P=? [ F \"done\" ]", "lambda=2"), 1.0);
        // Three per time unit for an expected sojourn of 1/2.
        assert_close(check(DECAY, "R=? [ F \"done\" ]", "lambda=2"), 1.5);
    }

    #[test]
    fn ctmc_uniformization_with_competing_rates() {
        // 0 -> 1 at rate a, 0 -> 2 at rate b; P(reach 1 by t) = a/(a+b) (1 - e^{-(a+b)t}).
        let text = "type: ctmc\nconst a\nconst b\nstates: 3\nlabel one: 1\n0 -> 1 : a\n0 -> 2 : b\n";
        let expected = 1.0 / 3.0 * (1.0 - (-3.0f64 * 0.8).exp());
        assert_close(check(text, "P=? [ F<=0.8 \"one\" ]", "a=1,b=2"), expected);
        assert_close(check(text, "P=? [ F \"one\" ]", "a=1,b=2"), 1.0 / 3.0);
    }

    #[test]
    fn iteration_limit_surfaces_as_error() {
        let mut env = SolverEnvironment::default();
        env.max_iterations = 1;
        env.linear.precision = 1e-12;
        let chain = "type: dtmc\nconst p\nstates: 3\nlabel goal: 1\n\
            0 -> 1 : p\n0 -> 0 : 0.5 - p\n0 -> 2 : 0.5\n";
        let err = check_with(chain, "P=? [ F \"goal\" ]", "p=0.25", &env).expect_err("too few");
        assert!(format!("{err:#}").contains("within 1 iterations"));
    }
}
