use crate::error::StartupError;
use crate::expression::Bytecode;
use nalgebra_sparse::CsrMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Model type as declared by a model description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Dtmc,
    Ctmc,
    Mdp,
    Pomdp,
    /// Markov automaton: continuous time with nondeterminism.
    Ma,
}

impl ModelType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "dtmc" => Some(ModelType::Dtmc),
            "ctmc" => Some(ModelType::Ctmc),
            "mdp" => Some(ModelType::Mdp),
            "pomdp" => Some(ModelType::Pomdp),
            "ma" => Some(ModelType::Ma),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeModel {
    Discrete,
    Continuous,
}

/// The supported model variants; fixed once a model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVariant {
    Dtmc,
    Ctmc,
    Mdp,
}

impl ModelVariant {
    pub fn time_model(self) -> TimeModel {
        match self {
            ModelVariant::Ctmc => TimeModel::Continuous,
            ModelVariant::Dtmc | ModelVariant::Mdp => TimeModel::Discrete,
        }
    }

    pub fn is_nondeterministic(self) -> bool {
        matches!(self, ModelVariant::Mdp)
    }
}

impl TryFrom<ModelType> for ModelVariant {
    type Error = StartupError;

    fn try_from(model_type: ModelType) -> Result<Self, Self::Error> {
        match model_type {
            ModelType::Dtmc => Ok(ModelVariant::Dtmc),
            ModelType::Ctmc => Ok(ModelVariant::Ctmc),
            ModelType::Mdp => Ok(ModelVariant::Mdp),
            ModelType::Pomdp => Err(StartupError::PartiallyObservable),
            ModelType::Ma => Err(StartupError::ContinuousNondeterministic),
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelVariant::Dtmc => "DTMC",
            ModelVariant::Ctmc => "CTMC",
            ModelVariant::Mdp => "MDP",
        })
    }
}

/// Named sets of states, stored as membership vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateLabeling {
    labels: BTreeMap<String, Vec<bool>>,
}

impl StateLabeling {
    pub fn insert(&mut self, name: String, states: Vec<bool>) {
        self.labels.insert(name, states);
    }

    pub fn get(&self, name: &str) -> Option<&[bool]> {
        self.labels.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.labels.keys().map(String::as_str)
    }
}

/// Transition structure shared by the parametric model and its instances.
///
/// Rows are choices; `row_groups[s]..row_groups[s + 1]` are the choices of
/// state `s`. Deterministic models have exactly one choice per state.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    pub state_count: usize,
    pub row_groups: Vec<usize>,
    pub initial_states: Vec<usize>,
    pub labeling: StateLabeling,
}

impl Structure {
    pub fn choice_count(&self) -> usize {
        self.row_groups.last().copied().unwrap_or(0)
    }

    pub fn choices(&self, state: usize) -> std::ops::Range<usize> {
        self.row_groups[state]..self.row_groups[state + 1]
    }
}

/// A model whose transition values are expressions over parameters.
#[derive(Debug, Clone)]
pub struct ParametricModel {
    pub variant: ModelVariant,
    pub parameters: Vec<String>,
    pub structure: Arc<Structure>,
    /// CSR layout of the transition matrix: `row_offsets` has one entry per
    /// choice plus one, `columns` and `values` one per nonzero entry.
    pub row_offsets: Vec<usize>,
    pub columns: Vec<usize>,
    pub values: Vec<Bytecode>,
    pub state_rewards: Option<Vec<Bytecode>>,
}

impl ParametricModel {
    pub fn state_count(&self) -> usize {
        self.structure.state_count
    }

    pub fn transition_count(&self) -> usize {
        self.values.len()
    }
}

/// A numeric instance of a [`ParametricModel`].
#[derive(Debug, Clone)]
pub struct ConcreteModel {
    pub variant: ModelVariant,
    pub structure: Arc<Structure>,
    /// Probabilities (discrete time) or rates (continuous time); rows are choices.
    pub matrix: CsrMatrix<f64>,
    /// Total outgoing rate per state, continuous-time models only.
    pub exit_rates: Option<Vec<f64>>,
    pub state_rewards: Option<Vec<f64>>,
}

impl ConcreteModel {
    pub fn state_count(&self) -> usize {
        self.structure.state_count
    }

    pub fn initial_states(&self) -> &[usize] {
        &self.structure.initial_states
    }

    pub fn labeling(&self) -> &StateLabeling {
        &self.structure.labeling
    }

    /// Successor entries `(target, value)` of a choice.
    pub fn row(&self, choice: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let offsets = self.matrix.row_offsets();
        let range = offsets[choice]..offsets[choice + 1];
        self.matrix.col_indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.matrix.values()[range].iter().copied())
    }
}
