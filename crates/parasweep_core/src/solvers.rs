//! Numeric solvers for the fixpoint systems produced by the model checker.
//!
//! A system has the form `x = opt_c (A_c x + b_c)`, where `c` ranges over the
//! choices of a state. Deterministic models give linear systems with a single
//! choice per state; nondeterministic models are solved for the minimum or
//! maximum over choices.

use crate::environment::{NumericMethod, SolverEnvironment};
use crate::graph::strongly_connected_components;
use crate::property::Direction;
use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use std::collections::VecDeque;
use tracing::debug;

/// Row mass below `1 - EXIT_TOLERANCE` means the choice leaves the system.
const EXIT_TOLERANCE: f64 = 1e-12;
/// Minimal gain for policy iteration to switch choices.
const IMPROVEMENT_TOLERANCE: f64 = 1e-12;

pub struct FixpointSystem {
    /// Rows are choices, columns are states of the system.
    pub matrix: CsrMatrix<f64>,
    /// `row_groups[s]..row_groups[s + 1]` are the choices of state `s`.
    pub row_groups: Vec<usize>,
    /// Constant part of every choice.
    pub rhs: Vec<f64>,
    /// Known upper bound of the solution, if any.
    pub upper_bound: Option<f64>,
}

impl FixpointSystem {
    pub fn new(
        matrix: CsrMatrix<f64>,
        row_groups: Vec<usize>,
        rhs: Vec<f64>,
        upper_bound: Option<f64>,
    ) -> Self {
        debug_assert_eq!(row_groups.len(), matrix.ncols() + 1);
        debug_assert_eq!(rhs.len(), matrix.nrows());
        Self {
            matrix,
            row_groups,
            rhs,
            upper_bound,
        }
    }

    /// A system with exactly one choice per state.
    pub fn linear(matrix: CsrMatrix<f64>, rhs: Vec<f64>, upper_bound: Option<f64>) -> Self {
        let row_groups = (0..=matrix.nrows()).collect();
        Self::new(matrix, row_groups, rhs, upper_bound)
    }

    /// Number of states.
    pub fn len(&self) -> usize {
        self.row_groups.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn choices(&self, state: usize) -> std::ops::Range<usize> {
        self.row_groups[state]..self.row_groups[state + 1]
    }

    fn row(&self, choice: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let offsets = self.matrix.row_offsets();
        let range = offsets[choice]..offsets[choice + 1];
        self.matrix.col_indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.matrix.values()[range].iter().copied())
    }

    fn choice_value(&self, choice: usize, values: &[f64]) -> f64 {
        self.rhs[choice]
            + self
                .row(choice)
                .map(|(target, p)| p * values[target])
                .sum::<f64>()
    }

    fn leaves(&self, choice: usize) -> bool {
        self.row(choice).map(|(_, p)| p).sum::<f64>() < 1.0 - EXIT_TOLERANCE
    }

    /// The linear system obtained by fixing one choice per state.
    fn restrict(&self, policy: &[usize]) -> Result<FixpointSystem> {
        let mut offsets = Vec::with_capacity(policy.len() + 1);
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut rhs = Vec::with_capacity(policy.len());
        offsets.push(0);
        for &choice in policy {
            for (target, p) in self.row(choice) {
                columns.push(target);
                values.push(p);
            }
            offsets.push(columns.len());
            rhs.push(self.rhs[choice]);
        }
        let n = self.len();
        let matrix = CsrMatrix::try_from_csr_data(n, n, offsets, columns, values)
            .map_err(|e| anyhow!("Invalid policy system: {}", e))?;
        Ok(FixpointSystem::linear(matrix, rhs, self.upper_bound))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutcome {
    pub values: Vec<f64>,
    pub iterations: usize,
    pub method: NumericMethod,
}

#[derive(Debug, Clone, Copy)]
struct Criterion {
    precision: f64,
    relative: bool,
}

impl Criterion {
    fn within(&self, old: f64, new: f64) -> bool {
        if old == new {
            return true;
        }
        let diff = (new - old).abs();
        if self.relative && new != 0.0 {
            diff / new.abs() <= self.precision
        } else {
            diff <= self.precision
        }
    }
}

fn optimum(direction: Option<Direction>, values: impl Iterator<Item = f64>) -> f64 {
    match direction {
        Some(Direction::Minimize) => values.fold(f64::INFINITY, f64::min),
        Some(Direction::Maximize) | None => values.fold(f64::NEG_INFINITY, f64::max),
    }
}

/// One pass of an iterative method over all states.
trait Sweep {
    /// Updates `values` and reports whether every state changed by less than
    /// the criterion allows.
    fn sweep(
        &mut self,
        system: &FixpointSystem,
        direction: Option<Direction>,
        values: &mut [f64],
        criterion: Criterion,
    ) -> bool;
}

/// Power method: every state is updated from the previous iterate.
struct ValueIteration {
    next: Vec<f64>,
}

impl ValueIteration {
    fn new(dim: usize) -> Self {
        Self {
            next: vec![0.0; dim],
        }
    }
}

impl Sweep for ValueIteration {
    fn sweep(
        &mut self,
        system: &FixpointSystem,
        direction: Option<Direction>,
        values: &mut [f64],
        criterion: Criterion,
    ) -> bool {
        for state in 0..system.len() {
            self.next[state] = optimum(
                direction,
                system
                    .choices(state)
                    .map(|choice| system.choice_value(choice, values)),
            );
        }
        let converged = values
            .iter()
            .zip(&self.next)
            .all(|(&old, &new)| criterion.within(old, new));
        values.copy_from_slice(&self.next);
        converged
    }
}

/// Like value iteration, but self-loops are solved for analytically.
struct Jacobi {
    next: Vec<f64>,
}

impl Jacobi {
    fn new(dim: usize) -> Self {
        Self {
            next: vec![0.0; dim],
        }
    }
}

impl Sweep for Jacobi {
    fn sweep(
        &mut self,
        system: &FixpointSystem,
        direction: Option<Direction>,
        values: &mut [f64],
        criterion: Criterion,
    ) -> bool {
        for state in 0..system.len() {
            self.next[state] = optimum(
                direction,
                system.choices(state).map(|choice| {
                    let mut diagonal = 0.0;
                    let mut sum = system.rhs[choice];
                    for (target, p) in system.row(choice) {
                        if target == state {
                            diagonal += p;
                        } else {
                            sum += p * values[target];
                        }
                    }
                    if diagonal < 1.0 - EXIT_TOLERANCE {
                        sum / (1.0 - diagonal)
                    } else {
                        sum + diagonal * values[state]
                    }
                }),
            );
        }
        let converged = values
            .iter()
            .zip(&self.next)
            .all(|(&old, &new)| criterion.within(old, new));
        values.copy_from_slice(&self.next);
        converged
    }
}

/// In-place updates: later states already see this pass's values.
struct GaussSeidel;

impl Sweep for GaussSeidel {
    fn sweep(
        &mut self,
        system: &FixpointSystem,
        direction: Option<Direction>,
        values: &mut [f64],
        criterion: Criterion,
    ) -> bool {
        let mut converged = true;
        for state in 0..system.len() {
            let new = optimum(
                direction,
                system
                    .choices(state)
                    .map(|choice| system.choice_value(choice, values)),
            );
            converged &= criterion.within(values[state], new);
            values[state] = new;
        }
        converged
    }
}

fn iterate(
    system: &FixpointSystem,
    direction: Option<Direction>,
    sweeper: &mut impl Sweep,
    values: &mut [f64],
    criterion: Criterion,
    max_iterations: usize,
) -> Result<usize> {
    for iteration in 1..=max_iterations {
        if sweeper.sweep(system, direction, values, criterion) {
            return Ok(iteration);
        }
    }
    bail!("No convergence within {} iterations.", max_iterations)
}

/// Iterates a lower and an upper bound until they meet; returns their midpoint.
fn interval_iteration(
    system: &FixpointSystem,
    direction: Option<Direction>,
    upper_bound: f64,
    criterion: Criterion,
    max_iterations: usize,
) -> Result<(Vec<f64>, usize)> {
    let n = system.len();
    let mut lower = vec![0.0; n];
    let mut upper = vec![upper_bound; n];
    let mut lower_sweep = ValueIteration::new(n);
    let mut upper_sweep = ValueIteration::new(n);
    for iteration in 1..=max_iterations {
        lower_sweep.sweep(system, direction, &mut lower, criterion);
        upper_sweep.sweep(system, direction, &mut upper, criterion);
        if lower
            .iter()
            .zip(&upper)
            .all(|(&lo, &hi)| criterion.within(lo, hi))
        {
            let midpoint = lower
                .iter()
                .zip(&upper)
                .map(|(lo, hi)| 0.5 * (lo + hi))
                .collect();
            return Ok((midpoint, iteration));
        }
    }
    bail!(
        "Lower and upper bounds did not meet within {} iterations.",
        max_iterations
    )
}

/// Solves `(I - A) x = b` by LU decomposition. Linear systems only.
fn solve_direct(system: &FixpointSystem) -> Result<Vec<f64>> {
    let n = system.len();
    let mut a = DMatrix::<f64>::identity(n, n);
    for state in 0..n {
        for (target, p) in system.row(state) {
            a[(state, target)] -= p;
        }
    }
    let b = DVector::from_column_slice(&system.rhs);
    let solution = a
        .lu()
        .solve(&b)
        .ok_or_else(|| anyhow!("The equation system is singular."))?;
    if solution.iter().any(|x| !x.is_finite()) {
        bail!("The equation system is ill-conditioned.");
    }
    Ok(solution.iter().copied().collect())
}

/// Whether every state of a linear system eventually leaves it, which makes
/// `I - A` invertible.
fn is_proper(system: &FixpointSystem) -> bool {
    let n = system.len();
    let mut predecessors = vec![Vec::new(); n];
    let mut reached = vec![false; n];
    let mut queue = VecDeque::new();
    for state in 0..n {
        for (target, p) in system.row(state) {
            if p > 0.0 {
                predecessors[target].push(state);
            }
        }
        if system.leaves(state) {
            reached[state] = true;
            queue.push_back(state);
        }
    }
    while let Some(state) = queue.pop_front() {
        for &pred in &predecessors[state] {
            if !reached[pred] {
                reached[pred] = true;
                queue.push_back(pred);
            }
        }
    }
    reached.into_iter().all(|r| r)
}

/// Picks, for every state, a choice that makes progress towards leaving the
/// system wherever that is possible.
fn initial_policy(system: &FixpointSystem) -> Vec<usize> {
    let n = system.len();
    let mut policy: Vec<usize> = (0..n).map(|s| system.row_groups[s]).collect();
    let mut attracted = vec![false; n];
    let mut changed = true;
    while changed {
        changed = false;
        for state in 0..n {
            if attracted[state] {
                continue;
            }
            let progressing = system.choices(state).find(|&choice| {
                system.leaves(choice)
                    || system
                        .row(choice)
                        .any(|(target, p)| p > 0.0 && attracted[target])
            });
            if let Some(choice) = progressing {
                policy[state] = choice;
                attracted[state] = true;
                changed = true;
            }
        }
    }
    policy
}

/// Values of the initial policy, an upper bound for minimizing systems whose
/// states can all leave; all zeros when that policy is not proper.
fn proper_policy_values(system: &FixpointSystem) -> Vec<f64> {
    if system.is_empty() {
        return Vec::new();
    }
    let restricted = match system.restrict(&initial_policy(system)) {
        Ok(restricted) => restricted,
        Err(err) => {
            debug!("Starting from zero: {}", err);
            return vec![0.0; system.len()];
        }
    };
    if !is_proper(&restricted) {
        debug!("The initial policy does not leave the system; starting from zero.");
        return vec![0.0; system.len()];
    }
    solve_direct(&restricted).unwrap_or_else(|err| {
        debug!("Starting from zero: {}", err);
        vec![0.0; system.len()]
    })
}

fn evaluate_policy(
    system: &FixpointSystem,
    criterion: Criterion,
    max_iterations: usize,
) -> Result<(Vec<f64>, usize)> {
    if is_proper(system) {
        match solve_direct(system) {
            Ok(values) => return Ok((values, 1)),
            Err(err) => debug!("Falling back to value iteration: {}", err),
        }
    }
    // Improper policies are evaluated as least fixpoints.
    let mut values = vec![0.0; system.len()];
    let iterations = iterate(
        system,
        None,
        &mut ValueIteration::new(system.len()),
        &mut values,
        criterion,
        max_iterations,
    )?;
    Ok((values, iterations))
}

fn policy_iteration(
    system: &FixpointSystem,
    direction: Direction,
    criterion: Criterion,
    max_iterations: usize,
) -> Result<(Vec<f64>, usize)> {
    let mut policy = initial_policy(system);
    let mut total = 0;
    for _ in 0..max_iterations {
        let (values, iterations) = evaluate_policy(&system.restrict(&policy)?, criterion, max_iterations)?;
        total += iterations;

        let mut improved = false;
        for state in 0..system.len() {
            let current = values[state];
            let tolerance = IMPROVEMENT_TOLERANCE * current.abs().max(1.0);
            for choice in system.choices(state) {
                let candidate = system.choice_value(choice, &values);
                let better = match direction {
                    Direction::Maximize => candidate > current + tolerance,
                    Direction::Minimize => candidate < current - tolerance,
                };
                if better && choice != policy[state] {
                    policy[state] = choice;
                    improved = true;
                    break;
                }
            }
        }
        if !improved {
            return Ok((values, total));
        }
    }
    bail!("Policy iteration did not stabilize within {} rounds.", max_iterations)
}

fn criterion(environment: &SolverEnvironment, precision: f64) -> Criterion {
    Criterion {
        precision,
        relative: environment.relative,
    }
}

/// Solves a linear system with the configured linear (or topological) method.
pub fn solve_linear(system: &FixpointSystem, environment: &SolverEnvironment) -> Result<SolverOutcome> {
    let precision = environment.linear.precision;
    if environment.topological.enabled {
        solve_topological(system, environment.topological.underlying_linear, environment, precision)
    } else {
        solve_linear_with(system, environment.linear.method, environment, precision)
    }
}

fn solve_linear_with(
    system: &FixpointSystem,
    method: NumericMethod,
    environment: &SolverEnvironment,
    precision: f64,
) -> Result<SolverOutcome> {
    let n = system.len();
    let criterion = criterion(environment, precision);
    let max_iterations = environment.max_iterations;
    let mut values = vec![0.0; n];
    let (method, iterations) = match method {
        NumericMethod::ValueIteration => (
            method,
            iterate(system, None, &mut ValueIteration::new(n), &mut values, criterion, max_iterations)?,
        ),
        NumericMethod::Jacobi => (
            method,
            iterate(system, None, &mut Jacobi::new(n), &mut values, criterion, max_iterations)?,
        ),
        NumericMethod::GaussSeidel => (
            method,
            iterate(system, None, &mut GaussSeidel, &mut values, criterion, max_iterations)?,
        ),
        NumericMethod::IntervalIteration => match system.upper_bound {
            Some(bound) => {
                let (result, iterations) =
                    interval_iteration(system, None, bound, criterion, max_iterations)?;
                values = result;
                (method, iterations)
            }
            None => {
                debug!("No upper bound known; using value iteration instead of interval iteration.");
                let fallback = NumericMethod::ValueIteration;
                (
                    fallback,
                    iterate(system, None, &mut ValueIteration::new(n), &mut values, criterion, max_iterations)?,
                )
            }
        },
        NumericMethod::PolicyIteration | NumericMethod::Direct => {
            values = solve_direct(system)?;
            (NumericMethod::Direct, 1)
        }
    };
    Ok(SolverOutcome {
        values,
        iterations,
        method,
    })
}

/// Solves the strongly connected components one by one, each after all
/// components it depends on.
fn solve_topological(
    system: &FixpointSystem,
    method: NumericMethod,
    environment: &SolverEnvironment,
    precision: f64,
) -> Result<SolverOutcome> {
    let n = system.len();
    let successors: Vec<Vec<usize>> = (0..n)
        .map(|state| {
            system
                .row(state)
                .filter(|&(_, p)| p > 0.0)
                .map(|(target, _)| target)
                .collect()
        })
        .collect();
    let components = strongly_connected_components(&successors);

    let mut values = vec![0.0; n];
    let mut local = vec![usize::MAX; n];
    let mut iterations = 0;
    for component in &components {
        if let [state] = component.as_slice() {
            if !successors[*state].contains(state) {
                values[*state] = system.choice_value(*state, &values);
                continue;
            }
        }

        for (idx, &state) in component.iter().enumerate() {
            local[state] = idx;
        }
        let mut offsets = vec![0];
        let mut columns = Vec::new();
        let mut entries = Vec::new();
        let mut rhs = Vec::with_capacity(component.len());
        for &state in component {
            let mut b = system.rhs[state];
            let mut row: Vec<(usize, f64)> = Vec::new();
            for (target, p) in system.row(state) {
                match local[target] {
                    usize::MAX => b += p * values[target],
                    idx => row.push((idx, p)),
                }
            }
            row.sort_unstable_by_key(|&(idx, _)| idx);
            for (idx, p) in row {
                columns.push(idx);
                entries.push(p);
            }
            offsets.push(columns.len());
            rhs.push(b);
        }
        let size = component.len();
        let matrix = CsrMatrix::try_from_csr_data(size, size, offsets, columns, entries)
            .map_err(|e| anyhow!("Invalid component system: {}", e))?;
        let subsystem = FixpointSystem::linear(matrix, rhs, system.upper_bound);
        let outcome = solve_linear_with(&subsystem, method, environment, precision)?;
        iterations += outcome.iterations;
        for (&state, value) in component.iter().zip(outcome.values) {
            values[state] = value;
            local[state] = usize::MAX;
        }
    }
    debug!("Solved {} components topologically.", components.len());
    Ok(SolverOutcome {
        values,
        iterations,
        method,
    })
}

/// Solves for the minimum or maximum over all choices.
pub fn solve_min_max(
    system: &FixpointSystem,
    direction: Direction,
    environment: &SolverEnvironment,
) -> Result<SolverOutcome> {
    let n = system.len();
    let criterion = criterion(environment, environment.min_max.precision);
    let max_iterations = environment.max_iterations;
    let goal = Some(direction);
    let method = environment.min_max.method;
    let iterative = !matches!(method, NumericMethod::PolicyIteration | NumericMethod::Direct);
    let mut values = if iterative && direction == Direction::Minimize && system.upper_bound.is_none() {
        // Iterating down from a proper policy keeps zero-cost cycles from
        // pulling the values below the optimum.
        proper_policy_values(system)
    } else {
        vec![0.0; n]
    };
    let (method, iterations) = match method {
        NumericMethod::ValueIteration => (
            method,
            iterate(system, goal, &mut ValueIteration::new(n), &mut values, criterion, max_iterations)?,
        ),
        NumericMethod::Jacobi => (
            method,
            iterate(system, goal, &mut Jacobi::new(n), &mut values, criterion, max_iterations)?,
        ),
        NumericMethod::GaussSeidel => (
            method,
            iterate(system, goal, &mut GaussSeidel, &mut values, criterion, max_iterations)?,
        ),
        NumericMethod::IntervalIteration => match (direction, system.upper_bound) {
            (Direction::Minimize, Some(bound)) => {
                let (result, iterations) =
                    interval_iteration(system, goal, bound, criterion, max_iterations)?;
                values = result;
                (method, iterations)
            }
            _ => {
                debug!("Interval iteration needs a minimizing bounded system; using value iteration.");
                (
                    NumericMethod::ValueIteration,
                    iterate(system, goal, &mut ValueIteration::new(n), &mut values, criterion, max_iterations)?,
                )
            }
        },
        NumericMethod::PolicyIteration | NumericMethod::Direct => {
            let (result, iterations) = policy_iteration(system, direction, criterion, max_iterations)?;
            values = result;
            (NumericMethod::PolicyIteration, iterations)
        }
    };
    Ok(SolverOutcome {
        values,
        iterations,
        method,
    })
}
