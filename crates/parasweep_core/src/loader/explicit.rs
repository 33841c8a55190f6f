//! Line-oriented explicit model format.
//!
//! ```text
//! # biased coin
//! type: dtmc
//! const p
//! const N = 4
//! states: 3
//! init: 0
//! label heads: 1
//! reward 0: N
//! 0 -> 1 : p
//! 0 -> 2 : 1 - p
//! ```
//!
//! Nondeterministic models name their choices: `0 [left] -> 1 : p`.

use super::{ConstantDecl, ModelDescription, RewardDecl, TransitionDecl};
use crate::model::ModelType;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;

pub fn parse(text: &str) -> Result<ModelDescription> {
    let mut model_type = None;
    let mut states = None;
    let mut initial = None;
    let mut constants = Vec::new();
    let mut labels = BTreeMap::new();
    let mut rewards = Vec::new();
    let mut transitions = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        let parsed: Result<()> = (|| {
            if let Some(rest) = line.strip_prefix("type:") {
                let name = rest.trim();
                model_type = Some(
                    ModelType::from_name(name)
                        .ok_or_else(|| anyhow!("Unknown model type `{}`.", name))?,
                );
            } else if let Some(rest) = line.strip_prefix("states:") {
                states = Some(parse_index(rest)?);
            } else if let Some(rest) = line.strip_prefix("init:") {
                initial = Some(parse_index_list(rest)?);
            } else if let Some(rest) = line.strip_prefix("const ") {
                constants.push(parse_constant(rest)?);
            } else if let Some(rest) = line.strip_prefix("label ") {
                let (name, list) = rest
                    .split_once(':')
                    .ok_or_else(|| anyhow!("Expected `label <name>: <states>`."))?;
                let name = name.trim();
                if labels.insert(name.to_string(), parse_index_list(list)?).is_some() {
                    bail!("Label `{}` is defined more than once.", name);
                }
            } else if let Some(rest) = line.strip_prefix("reward ") {
                let (state, value) = rest
                    .split_once(':')
                    .ok_or_else(|| anyhow!("Expected `reward <state>: <expr>`."))?;
                rewards.push(RewardDecl {
                    state: parse_index(state)?,
                    value: value.trim().to_string(),
                });
            } else if line.contains("->") {
                transitions.push(parse_transition(line)?);
            } else {
                bail!("Unrecognized line `{}`.", line);
            }
            Ok(())
        })();
        parsed.with_context(|| format!("line {}", line_no))?;
    }

    Ok(ModelDescription {
        model_type: model_type.context("Missing `type:` line.")?,
        constants,
        states: states.context("Missing `states:` line.")?,
        initial: initial.unwrap_or_else(|| vec![0]),
        labels,
        rewards,
        transitions,
    })
}

fn parse_index(text: &str) -> Result<usize> {
    let text = text.trim();
    text.parse()
        .map_err(|_| anyhow!("Expected a state index, got `{}`.", text))
}

fn parse_index_list(text: &str) -> Result<Vec<usize>> {
    text.split_whitespace().map(parse_index).collect()
}

fn parse_constant(text: &str) -> Result<ConstantDecl> {
    let (name, value) = match text.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.trim().to_string())),
        None => (text.trim(), None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        bail!("Invalid constant name `{}`.", name);
    }
    Ok(ConstantDecl {
        name: name.to_string(),
        value,
    })
}

// `<src> [<action>] -> <dst> : <expr>`
fn parse_transition(line: &str) -> Result<TransitionDecl> {
    let (lhs, rhs) = line
        .split_once("->")
        .ok_or_else(|| anyhow!("Expected `->`."))?;
    let (target, value) = rhs
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected `: <value>` after the target state."))?;

    let lhs = lhs.trim();
    let (source, action) = match lhs.split_once('[') {
        Some((source, action)) => {
            let action = action
                .trim()
                .strip_suffix(']')
                .ok_or_else(|| anyhow!("Unterminated action name."))?
                .trim();
            (source, Some(action.to_string()))
        }
        None => (lhs, None),
    };

    Ok(TransitionDecl {
        source: parse_index(source)?,
        action,
        target: parse_index(target)?,
        value: value.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COIN: &str = "\
# biased coin
type: mdp
const p
const N = 4

states: 3
init: 0
label heads: 1
label done: 1 2
reward 0: N
0 [flip] -> 1 : p
0 [flip] -> 2 : 1 - p   # tails
0 [stop] -> 2 : 1
";

    #[test]
    fn parses_full_description() {
        let description = parse(COIN).expect("parses");
        assert_eq!(description.model_type, ModelType::Mdp);
        assert_eq!(description.states, 3);
        assert_eq!(description.initial, vec![0]);
        assert_eq!(
            description.constants,
            vec![
                ConstantDecl {
                    name: "p".into(),
                    value: None
                },
                ConstantDecl {
                    name: "N".into(),
                    value: Some("4".into())
                },
            ]
        );
        assert_eq!(description.labels["done"], vec![1, 2]);
        assert_eq!(description.rewards.len(), 1);
        assert_eq!(description.transitions.len(), 3);
        assert_eq!(description.transitions[1].action.as_deref(), Some("flip"));
        assert_eq!(description.transitions[1].value, "1 - p");
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse("type: dtmc\nstates: 2\n0 -> x : 1\n").expect_err("bad target");
        let message = format!("{err:#}");
        assert!(message.contains("line 3"), "{message}");
        assert!(message.contains("state index"), "{message}");

        let err = parse("type: dtmc\nstates: 2\nwhatever\n").expect_err("bad line");
        assert!(format!("{err:#}").contains("Unrecognized line"));

        let err = parse("type: pta\n").expect_err("bad type");
        assert!(format!("{err:#}").contains("Unknown model type"));
    }

    #[test]
    fn requires_header_lines() {
        let err = parse("states: 1\n").expect_err("no type");
        assert!(err.to_string().contains("type:"));
        let err = parse("type: ctmc\n").expect_err("no states");
        assert!(err.to_string().contains("states:"));
    }
}
