//! Model descriptions and their translation into parametric models.
//!
//! Two description languages are supported: a line-oriented explicit format
//! (see [`explicit`]) and the JSON representation of [`ModelDescription`].
//! Constants left undefined after applying the constant definitions become
//! the parameters of the model.

pub mod explicit;

use crate::error::StartupError;
use crate::expression::{self, evaluate_constant, Bytecode, Compiler, Expr};
use crate::model::{ModelType, ModelVariant, ParametricModel, StateLabeling, Structure};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Label that always denotes the initial states.
pub const INIT_LABEL: &str = "init";

/// Description language of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Explicit,
    Json,
}

impl FromStr for ModelKind {
    type Err = StartupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(ModelKind::Explicit),
            "json" => Ok(ModelKind::Json),
            other => Err(StartupError::UnknownModelKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantDecl {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionDecl {
    pub source: usize,
    #[serde(default)]
    pub action: Option<String>,
    pub target: usize,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewardDecl {
    pub state: usize,
    pub value: String,
}

/// Language-independent content of a model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDescription {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub constants: Vec<ConstantDecl>,
    pub states: usize,
    #[serde(default = "default_initial")]
    pub initial: Vec<usize>,
    #[serde(default)]
    pub labels: BTreeMap<String, Vec<usize>>,
    #[serde(default)]
    pub rewards: Vec<RewardDecl>,
    pub transitions: Vec<TransitionDecl>,
}

fn default_initial() -> Vec<usize> {
    vec![0]
}

/// Reads, parses and builds the model at `path`.
pub fn load_model(
    kind: ModelKind,
    path: &Path,
    constant_definitions: &str,
) -> Result<ParametricModel, StartupError> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read model file {}.", path.display()))?;
    let description = parse_description(kind, &text)
        .with_context(|| format!("Failed to parse model file {}.", path.display()))?;
    build_model(&description, constant_definitions)
}

pub fn parse_description(kind: ModelKind, text: &str) -> Result<ModelDescription> {
    match kind {
        ModelKind::Explicit => explicit::parse(text),
        ModelKind::Json => serde_json::from_str(text).context("Invalid JSON model description."),
    }
}

/// Builds a parametric model, resolving constants with `constant_definitions`
/// (`name=expr,name=expr,...`).
pub fn build_model(
    description: &ModelDescription,
    constant_definitions: &str,
) -> Result<ParametricModel, StartupError> {
    let variant = ModelVariant::try_from(description.model_type)?;
    validate_indices(description)?;

    let (constants, parameters) = resolve_constants(&description.constants, constant_definitions)?;
    let compiler = Compiler::new(&parameters, &constants);

    let layout = TransitionLayout::build(description, variant)?;
    let mut values = Vec::with_capacity(layout.entries.len());
    for ((row, column), expr) in &layout.entries {
        let code = compiler
            .compile(expr)
            .with_context(|| format!("Invalid value on choice {} towards state {}.", row, column))?;
        values.push(code);
    }

    let state_rewards = if description.rewards.is_empty() {
        None
    } else {
        let mut sums: Vec<Option<Expr>> = vec![None; description.states];
        for reward in &description.rewards {
            let expr = expression::parse(&reward.value)
                .with_context(|| format!("Invalid reward for state {}.", reward.state))?;
            let slot = &mut sums[reward.state];
            *slot = Some(match slot.take() {
                Some(previous) => previous.sum(expr),
                None => expr,
            });
        }
        let mut codes = Vec::with_capacity(description.states);
        for (state, expr) in sums.into_iter().enumerate() {
            codes.push(match expr {
                Some(expr) => compiler
                    .compile(&expr)
                    .with_context(|| format!("Invalid reward for state {}.", state))?,
                None => Bytecode::constant(0.0),
            });
        }
        Some(codes)
    };

    let mut labeling = StateLabeling::default();
    for (name, states) in &description.labels {
        if name == INIT_LABEL {
            return Err(anyhow::anyhow!("Label `{}` is reserved.", INIT_LABEL).into());
        }
        labeling.insert(name.clone(), membership(description.states, states));
    }
    labeling.insert(
        INIT_LABEL.to_string(),
        membership(description.states, &description.initial),
    );

    let model = ParametricModel {
        variant,
        parameters,
        structure: Arc::new(Structure {
            state_count: description.states,
            row_groups: layout.row_groups,
            initial_states: description.initial.clone(),
            labeling,
        }),
        row_offsets: layout.row_offsets,
        columns: layout.entries.keys().map(|&(_, column)| column).collect(),
        values,
        state_rewards,
    };

    info!(
        "Loaded {} with {} states, {} choices and {} transitions; parameters: [{}].",
        model.variant,
        model.state_count(),
        model.structure.choice_count(),
        model.transition_count(),
        model.parameters.join(", ")
    );
    Ok(model)
}

fn membership(state_count: usize, states: &[usize]) -> Vec<bool> {
    let mut set = vec![false; state_count];
    for &state in states {
        set[state] = true;
    }
    set
}

fn validate_indices(description: &ModelDescription) -> Result<()> {
    let n = description.states;
    if n == 0 {
        bail!("Model has no states.");
    }
    if description.initial.is_empty() {
        bail!("Model has no initial state.");
    }
    let check = |state: usize, what: &str| -> Result<()> {
        if state >= n {
            bail!("{} refers to state {}, but the model has {} states.", what, state, n);
        }
        Ok(())
    };
    for &state in &description.initial {
        check(state, "Initial state")?;
    }
    for (name, states) in &description.labels {
        for &state in states {
            check(state, &format!("Label `{}`", name))?;
        }
    }
    for reward in &description.rewards {
        check(reward.state, "Reward")?;
    }
    for transition in &description.transitions {
        check(transition.source, "Transition source")?;
        check(transition.target, "Transition target")?;
    }
    Ok(())
}

/// Evaluates defined constants and returns them with the remaining
/// (undefined) constant names, which become parameters.
fn resolve_constants(
    declarations: &[ConstantDecl],
    constant_definitions: &str,
) -> Result<(HashMap<String, f64>, Vec<String>)> {
    let mut definitions = parse_constant_definitions(constant_definitions)?;

    for name in definitions.keys() {
        match declarations.iter().find(|decl| &decl.name == name) {
            None => bail!("Constant `{}` is not declared by the model.", name),
            Some(decl) if decl.value.is_some() => {
                bail!("Constant `{}` is already defined by the model.", name)
            }
            Some(_) => {}
        }
    }

    let mut constants = HashMap::new();
    let mut parameters = Vec::new();
    for decl in declarations {
        if constants.contains_key(&decl.name) || parameters.contains(&decl.name) {
            bail!("Constant `{}` is declared more than once.", decl.name);
        }
        let expr = match (&decl.value, definitions.remove(&decl.name)) {
            (Some(text), _) => Some(
                expression::parse(text)
                    .with_context(|| format!("Invalid value for constant `{}`.", decl.name))?,
            ),
            (None, defined) => defined,
        };
        match expr {
            Some(expr) => {
                let value = evaluate_constant(&expr, &constants)
                    .with_context(|| format!("Cannot evaluate constant `{}`.", decl.name))?;
                debug!("Constant {} = {}.", decl.name, value);
                constants.insert(decl.name.clone(), value);
            }
            None => parameters.push(decl.name.clone()),
        }
    }
    Ok((constants, parameters))
}

/// Parses `name=expr,name=expr`; commas inside parentheses belong to the expression.
pub fn parse_constant_definitions(text: &str) -> Result<BTreeMap<String, Expr>> {
    let mut definitions = BTreeMap::new();
    for fragment in split_top_level(text) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }
        let (name, value) = fragment
            .split_once('=')
            .with_context(|| format!("Malformed constant definition `{}`.", fragment))?;
        let name = name.trim();
        let expr = expression::parse(value)
            .with_context(|| format!("Invalid definition for constant `{}`.", name))?;
        if definitions.insert(name.to_string(), expr).is_some() {
            bail!("Constant `{}` is defined more than once.", name);
        }
    }
    Ok(definitions)
}

fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Choices grouped per state and transition entries in CSR order.
struct TransitionLayout {
    row_groups: Vec<usize>,
    row_offsets: Vec<usize>,
    /// Keyed by (choice row, target state); duplicate transitions are summed.
    entries: BTreeMap<(usize, usize), Expr>,
}

impl TransitionLayout {
    fn build(description: &ModelDescription, variant: ModelVariant) -> Result<Self> {
        let n = description.states;

        // Actions per state, in order of first appearance.
        let mut actions: Vec<Vec<Option<&str>>> = vec![Vec::new(); n];
        for transition in &description.transitions {
            let action = transition.action.as_deref();
            let list = &mut actions[transition.source];
            if !list.contains(&action) {
                list.push(action);
            }
        }

        let mut row_groups = Vec::with_capacity(n + 1);
        row_groups.push(0);
        for (state, list) in actions.iter().enumerate() {
            if !variant.is_nondeterministic() && list.len() > 1 {
                bail!(
                    "State {} has {} actions, but a {} allows only one.",
                    state,
                    list.len(),
                    variant
                );
            }
            // Deadlock states get a single self-loop choice.
            let choices = list.len().max(1);
            row_groups.push(row_groups[state] + choices);
        }

        let mut entries: BTreeMap<(usize, usize), Expr> = BTreeMap::new();
        for transition in &description.transitions {
            let local = actions[transition.source]
                .iter()
                .position(|a| *a == transition.action.as_deref())
                .unwrap_or(0);
            let row = row_groups[transition.source] + local;
            let expr = expression::parse(&transition.value).with_context(|| {
                format!(
                    "Invalid value on transition {} -> {}.",
                    transition.source, transition.target
                )
            })?;
            let key = (row, transition.target);
            let merged = match entries.remove(&key) {
                Some(previous) => previous.sum(expr),
                None => expr,
            };
            entries.insert(key, merged);
        }
        for (state, list) in actions.iter().enumerate() {
            if list.is_empty() {
                debug!("State {} is a deadlock; adding a self-loop.", state);
                entries.insert((row_groups[state], state), Expr::Number(1.0));
            }
        }

        let rows = row_groups[n];
        let mut row_offsets = vec![0usize; rows + 1];
        for &(row, _) in entries.keys() {
            row_offsets[row + 1] += 1;
        }
        for row in 0..rows {
            row_offsets[row + 1] += row_offsets[row];
        }

        Ok(Self {
            row_groups,
            row_offsets,
            entries,
        })
    }
}
