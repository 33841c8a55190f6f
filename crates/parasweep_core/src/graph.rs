//! Qualitative analyses on the transition graph of a concrete model.
//!
//! All functions only look at which transitions carry positive values, so
//! their results are shared by every valuation that keeps the same support.
//! State sets are membership vectors.

use crate::model::ConcreteModel;
use std::collections::VecDeque;

/// Predecessor lists: `predecessors[t]` holds every state with a choice that
/// moves to `t` with positive value.
pub fn predecessors(model: &ConcreteModel) -> Vec<Vec<usize>> {
    let mut predecessors = vec![Vec::new(); model.state_count()];
    for state in 0..model.state_count() {
        for choice in model.structure.choices(state) {
            for (target, value) in model.row(choice) {
                if value > 0.0 && predecessors[target].last() != Some(&state) {
                    predecessors[target].push(state);
                }
            }
        }
    }
    predecessors
}

/// States that can reach `targets` along states in `through`, for some
/// resolution of nondeterminism. `targets` are always included.
fn reach_backward(
    predecessors: &[Vec<usize>],
    through: &[bool],
    targets: &[bool],
) -> Vec<bool> {
    let mut reached = targets.to_vec();
    let mut queue: VecDeque<usize> = (0..targets.len()).filter(|&s| targets[s]).collect();
    while let Some(state) = queue.pop_front() {
        for &pred in &predecessors[state] {
            if through[pred] && !reached[pred] {
                reached[pred] = true;
                queue.push_back(pred);
            }
        }
    }
    reached
}

fn complement(set: &[bool]) -> Vec<bool> {
    set.iter().map(|&b| !b).collect()
}

fn phi_and_not_psi(phi: &[bool], psi: &[bool]) -> Vec<bool> {
    phi.iter().zip(psi).map(|(&a, &b)| a && !b).collect()
}

/// States from which `phi U psi` has probability zero under every
/// scheduler (for deterministic models: has probability zero).
pub fn prob0(model: &ConcreteModel, phi: &[bool], psi: &[bool]) -> Vec<bool> {
    complement(&reach_backward(&predecessors(model), phi, psi))
}

/// States from which `phi U psi` has probability one. Deterministic models only.
pub fn prob1(model: &ConcreteModel, phi: &[bool], psi: &[bool]) -> Vec<bool> {
    let predecessors = predecessors(model);
    let zero = complement(&reach_backward(&predecessors, phi, psi));
    complement(&reach_backward(&predecessors, &phi_and_not_psi(phi, psi), &zero))
}

/// States with a scheduler under which `phi U psi` has probability zero.
pub fn prob0e(model: &ConcreteModel, phi: &[bool], psi: &[bool]) -> Vec<bool> {
    // Least fixpoint of the states forced to reach psi with positive probability.
    let mut forced = psi.to_vec();
    let candidates = phi_and_not_psi(phi, psi);
    let mut changed = true;
    while changed {
        changed = false;
        for state in 0..model.state_count() {
            if forced[state] || !candidates[state] {
                continue;
            }
            let every_choice_progresses = model.structure.choices(state).all(|choice| {
                model
                    .row(choice)
                    .any(|(target, value)| value > 0.0 && forced[target])
            });
            if every_choice_progresses {
                forced[state] = true;
                changed = true;
            }
        }
    }
    complement(&forced)
}

/// States from which every scheduler satisfies `phi U psi` with probability one.
pub fn prob1a(model: &ConcreteModel, phi: &[bool], psi: &[bool]) -> Vec<bool> {
    let zero = prob0e(model, phi, psi);
    complement(&reach_backward(
        &predecessors(model),
        &phi_and_not_psi(phi, psi),
        &zero,
    ))
}

/// States with a scheduler under which `phi U psi` has probability one.
pub fn prob1e(model: &ConcreteModel, phi: &[bool], psi: &[bool]) -> Vec<bool> {
    let candidates = phi_and_not_psi(phi, psi);
    let mut outer = vec![true; model.state_count()];
    loop {
        let mut inner = psi.to_vec();
        let mut changed = true;
        while changed {
            changed = false;
            for state in 0..model.state_count() {
                if inner[state] || !candidates[state] || !outer[state] {
                    continue;
                }
                let has_choice = model.structure.choices(state).any(|choice| {
                    let mut stays = true;
                    let mut progresses = false;
                    for (target, value) in model.row(choice) {
                        if value > 0.0 {
                            stays &= outer[target];
                            progresses |= inner[target];
                        }
                    }
                    stays && progresses
                });
                if has_choice {
                    inner[state] = true;
                    changed = true;
                }
            }
        }
        if inner == outer {
            return outer;
        }
        outer = inner;
    }
}

/// Tarjan's algorithm over an adjacency list; components are returned so that
/// every component comes after all components it can reach.
pub fn strongly_connected_components(successors: &[Vec<usize>]) -> Vec<Vec<usize>> {
    const UNVISITED: usize = usize::MAX;
    let n = successors.len();
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut components = Vec::new();
    let mut next_index = 0;

    // Explicit call stack of (node, next successor position).
    let mut frames: Vec<(usize, usize)> = Vec::new();
    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        frames.push((root, 0));
        while let Some(frame) = frames.last_mut() {
            let (node, pos) = *frame;
            if pos == 0 {
                index[node] = next_index;
                lowlink[node] = next_index;
                next_index += 1;
                stack.push(node);
                on_stack[node] = true;
            }
            if let Some(&succ) = successors[node].get(pos) {
                frame.1 += 1;
                if index[succ] == UNVISITED {
                    frames.push((succ, 0));
                } else if on_stack[succ] {
                    lowlink[node] = lowlink[node].min(index[succ]);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[node]);
            }
            if lowlink[node] == index[node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                component.sort_unstable();
                components.push(component);
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instantiate::Instantiator;
    use crate::loader::{build_model, parse_description, ModelKind};
    use crate::traits::Instantiate;
    use crate::valuation::ParameterValuation;

    fn concrete(text: &str) -> ConcreteModel {
        let description = parse_description(ModelKind::Explicit, text).expect("parses");
        let model = build_model(&description, "").expect("builds");
        let mut inst = Instantiator::new(&model).expect("instantiator");
        inst.instantiate(&ParameterValuation::default())
            .expect("instantiates")
            .clone()
    }

    fn set(n: usize, members: &[usize]) -> Vec<bool> {
        let mut set = vec![false; n];
        for &m in members {
            set[m] = true;
        }
        set
    }

    fn members(set: &[bool]) -> Vec<usize> {
        (0..set.len()).filter(|&s| set[s]).collect()
    }

    // 0 -> {1, 2}; 1 is the goal, 2 a trap, 3 loops between itself and 0.
    const CHAIN: &str = "type: dtmc\nstates: 5\n\
        0 -> 1 : 0.5\n0 -> 2 : 0.5\n3 -> 0 : 0.5\n3 -> 3 : 0.5\n4 -> 1 : 1\n";

    #[test]
    fn deterministic_zero_and_one_sets() {
        let model = concrete(CHAIN);
        let all = vec![true; 5];
        let goal = set(5, &[1]);
        assert_eq!(members(&prob0(&model, &all, &goal)), vec![2]);
        assert_eq!(members(&prob1(&model, &all, &goal)), vec![1, 4]);

        // Restricting phi cuts state 3 off.
        let phi = set(5, &[0, 1, 2, 4]);
        assert_eq!(members(&prob0(&model, &phi, &goal)), vec![2, 3]);
    }

    // State 0 can go left (to goal 1) or right (to trap 2); state 3 flips a
    // coin between 0 and the goal.
    const GAME: &str = "type: mdp\nstates: 4\n\
        0 [left] -> 1 : 1\n0 [right] -> 2 : 1\n3 [go] -> 0 : 0.5\n3 [go] -> 1 : 0.5\n";

    #[test]
    fn nondeterministic_zero_and_one_sets() {
        let model = concrete(GAME);
        let all = vec![true; 4];
        let goal = set(4, &[1]);
        assert_eq!(members(&prob0(&model, &all, &goal)), vec![2]);
        assert_eq!(members(&prob0e(&model, &all, &goal)), vec![0, 2]);
        assert_eq!(members(&prob1a(&model, &all, &goal)), vec![1]);
        assert_eq!(members(&prob1e(&model, &all, &goal)), vec![0, 1, 3]);
    }

    #[test]
    fn prob1e_excludes_escaping_end_components() {
        // 0 can stay in {0, 1} forever or gamble on the goal.
        let model = concrete(
            "type: mdp\nstates: 4\n\
             0 [stay] -> 1 : 1\n1 [back] -> 0 : 1\n\
             0 [risk] -> 2 : 0.5\n0 [risk] -> 3 : 0.5\n",
        );
        let all = vec![true; 4];
        let goal = set(4, &[2]);
        assert_eq!(members(&prob1e(&model, &all, &goal)), vec![2]);
        assert_eq!(members(&prob0e(&model, &all, &goal)), vec![0, 1, 3]);
    }

    #[test]
    fn components_come_in_reverse_topological_order() {
        // 0 -> 1 <-> 2 -> 3, plus a disconnected 4.
        let successors = vec![vec![1], vec![2], vec![1, 3], vec![], vec![4]];
        let components = strongly_connected_components(&successors);
        assert_eq!(components.len(), 4);
        let position = |s: usize| components.iter().position(|c| c.contains(&s)).unwrap();
        assert!(position(3) < position(1));
        assert!(position(1) < position(0));
        assert_eq!(components[position(1)], vec![1, 2]);
        assert_eq!(components[position(4)], vec![4]);
    }
}
