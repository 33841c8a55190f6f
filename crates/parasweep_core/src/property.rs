//! Quantitative properties: `P=? [ F "goal" ]`, `Pmax=? [ "safe" U<=10 "goal" ]`,
//! `R=? [ F "done" ]` and friends.

use crate::model::{ModelVariant, ParametricModel, StateLabeling, TimeModel};
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Probability,
    Reward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Minimize,
    Maximize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    /// Step bound of a discrete-time model.
    Steps(usize),
    /// Time bound of a continuous-time model.
    Time(f64),
}

/// A property whose state formulas are resolved against a model's labels.
///
/// The path formula is `phi U psi`; eventually-formulas use `phi = true`.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub objective: Objective,
    pub direction: Option<Direction>,
    pub bound: Option<Bound>,
    pub phi: Vec<bool>,
    pub psi: Vec<bool>,
    text: String,
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Parses the first property of `text` (properties are separated by `;`).
pub fn load_property(text: &str, model: &ParametricModel) -> Result<Formula> {
    let first = text
        .split(';')
        .map(str::trim)
        .find(|p| !p.is_empty())
        .ok_or_else(|| anyhow!("No property given."))?;
    let parsed = parse_property(first).with_context(|| format!("Invalid property `{}`.", first))?;
    resolve(parsed, first, model).with_context(|| format!("Unsupported property `{}`.", first))
}

fn resolve(parsed: ParsedProperty, text: &str, model: &ParametricModel) -> Result<Formula> {
    let variant = model.variant;
    let direction = match (parsed.direction, variant.is_nondeterministic()) {
        (None, true) => bail!("A nondeterministic model needs `min` or `max` in the operator."),
        (Some(direction), false) => {
            warn!("Ignoring {:?} on a deterministic model.", direction);
            None
        }
        (direction, _) => direction,
    };

    if parsed.objective == Objective::Reward {
        if parsed.bound.is_some() {
            bail!("Bounded reward properties are not supported.");
        }
        if model.state_rewards.is_none() {
            bail!("The model has no rewards.");
        }
    }

    let bound = match parsed.bound {
        None => None,
        Some(value) => Some(resolve_bound(value, variant)?),
    };

    let labeling = &model.structure.labeling;
    let n = model.state_count();
    let phi = match &parsed.left {
        Some(state) => state.evaluate(labeling, n)?,
        None => vec![true; n],
    };
    let psi = parsed.right.evaluate(labeling, n)?;

    Ok(Formula {
        objective: parsed.objective,
        direction,
        bound,
        phi,
        psi,
        text: text.to_string(),
    })
}

fn resolve_bound(value: f64, variant: ModelVariant) -> Result<Bound> {
    if !value.is_finite() || value < 0.0 {
        bail!("Bounds must be non-negative.");
    }
    match variant.time_model() {
        TimeModel::Discrete => {
            if value.fract() != 0.0 {
                bail!("Step bounds of discrete-time models must be integers.");
            }
            Ok(Bound::Steps(value as usize))
        }
        TimeModel::Continuous => Ok(Bound::Time(value)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StateFormula {
    True,
    False,
    Label(String),
    Not(Box<StateFormula>),
    And(Box<StateFormula>, Box<StateFormula>),
    Or(Box<StateFormula>, Box<StateFormula>),
}

impl StateFormula {
    fn evaluate(&self, labeling: &StateLabeling, n: usize) -> Result<Vec<bool>> {
        Ok(match self {
            StateFormula::True => vec![true; n],
            StateFormula::False => vec![false; n],
            StateFormula::Label(name) => labeling
                .get(name)
                .ok_or_else(|| {
                    let known: Vec<&str> = labeling.names().collect();
                    anyhow!("Unknown label \"{}\" (known: {}).", name, known.join(", "))
                })?
                .to_vec(),
            StateFormula::Not(inner) => inner.evaluate(labeling, n)?.iter().map(|b| !b).collect(),
            StateFormula::And(a, b) => {
                let (a, b) = (a.evaluate(labeling, n)?, b.evaluate(labeling, n)?);
                a.iter().zip(&b).map(|(x, y)| *x && *y).collect()
            }
            StateFormula::Or(a, b) => {
                let (a, b) = (a.evaluate(labeling, n)?, b.evaluate(labeling, n)?);
                a.iter().zip(&b).map(|(x, y)| *x || *y).collect()
            }
        })
    }
}

#[derive(Debug)]
struct ParsedProperty {
    objective: Objective,
    direction: Option<Direction>,
    bound: Option<f64>,
    left: Option<StateFormula>,
    right: StateFormula,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(f64),
    Label(String),
    Query, // =?
    LessEq,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Not,
    And,
    Or,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '"' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&c| c == '"')
                    .map(|offset| start + offset)
                    .ok_or_else(|| anyhow!("Unterminated label."))?;
                tokens.push(Token::Label(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '=' if chars.get(i + 1) == Some(&'?') => {
                tokens.push(Token::Query);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::LessEq);
                i += 2;
            }
            '[' | ']' | '(' | ')' | '!' | '&' | '|' => {
                tokens.push(match c {
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '!' => Token::Not,
                    '&' => Token::And,
                    _ => Token::Or,
                });
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| anyhow!("Invalid number `{}`.", text))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => bail!("Unexpected character `{}`.", other),
        }
    }
    Ok(tokens)
}

fn parse_property(input: &str) -> Result<ParsedProperty> {
    let mut cursor = Cursor {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let property = cursor.property()?;
    if let Some(token) = cursor.peek() {
        bail!("Unexpected trailing {:?}.", token);
    }
    Ok(property)
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => bail!("Expected {:?}, found {:?}.", expected, other),
        }
    }

    fn property(&mut self) -> Result<ParsedProperty> {
        let operator = match self.next() {
            Some(Token::Word(word)) => word,
            other => bail!("Expected an operator such as `P=?`, found {:?}.", other),
        };
        let (objective, direction) = match operator.as_str() {
            "P" => (Objective::Probability, None),
            "Pmin" => (Objective::Probability, Some(Direction::Minimize)),
            "Pmax" => (Objective::Probability, Some(Direction::Maximize)),
            "R" => (Objective::Reward, None),
            "Rmin" => (Objective::Reward, Some(Direction::Minimize)),
            "Rmax" => (Objective::Reward, Some(Direction::Maximize)),
            other => bail!("Unknown operator `{}`.", other),
        };
        self.expect(Token::Query)?;
        self.expect(Token::LBracket)?;

        let (left, bound, right) = if self.peek() == Some(&Token::Word("F".into())) {
            self.next();
            let bound = self.bound()?;
            (None, bound, self.state_formula()?)
        } else {
            let left = self.state_formula()?;
            match self.next() {
                Some(Token::Word(word)) if word == "U" => {}
                other => bail!("Expected `U`, found {:?}.", other),
            }
            let bound = self.bound()?;
            (Some(left), bound, self.state_formula()?)
        };
        self.expect(Token::RBracket)?;

        if objective == Objective::Reward && left.is_some() {
            bail!("Reward properties support only `F`.");
        }

        Ok(ParsedProperty {
            objective,
            direction,
            bound,
            left,
            right,
        })
    }

    fn bound(&mut self) -> Result<Option<f64>> {
        if self.peek() != Some(&Token::LessEq) {
            return Ok(None);
        }
        self.next();
        match self.next() {
            Some(Token::Number(value)) => Ok(Some(value)),
            other => bail!("Expected a bound, found {:?}.", other),
        }
    }

    fn state_formula(&mut self) -> Result<StateFormula> {
        let mut left = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.conjunction()?;
            left = StateFormula::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<StateFormula> {
        let mut left = self.atom()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.atom()?;
            left = StateFormula::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn atom(&mut self) -> Result<StateFormula> {
        match self.next() {
            Some(Token::Not) => Ok(StateFormula::Not(Box::new(self.atom()?))),
            Some(Token::Label(name)) => Ok(StateFormula::Label(name)),
            Some(Token::Word(word)) if word == "true" => Ok(StateFormula::True),
            Some(Token::Word(word)) if word == "false" => Ok(StateFormula::False),
            Some(Token::LParen) => {
                let inner = self.state_formula()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => bail!("Expected a state formula, found {:?}.", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{build_model, parse_description, ModelKind};

    fn model(model_type: &str) -> ParametricModel {
        let text = format!(
            "type: {model_type}\nconst p\nstates: 3\nlabel goal: 2\nlabel safe: 0 2\nreward 0: 1\n\
             0 [a] -> 1 : p\n0 [a] -> 2 : 1 - p\n"
        );
        let description = parse_description(ModelKind::Explicit, &text).expect("parses");
        build_model(&description, "").expect("builds")
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn resolves_eventually() {
        let formula = load_property("P=? [ F \"goal\" ]", &model("dtmc")).expect("loads");
        assert_eq!(formula.objective, Objective::Probability);
        assert_eq!(formula.direction, None);
        assert_eq!(formula.phi, vec![true; 3]);
        assert_eq!(formula.psi, vec![false, false, true]);
        assert_eq!(formula.to_string(), "P=? [ F \"goal\" ]");
    }

    #[test]
    fn deterministic_models_take_any_operator() {
        for (text, objective) in [
            ("P=? [ F \"goal\" ]", Objective::Probability),
            ("Pmax=? [ F \"goal\" ]", Objective::Probability),
            ("R=? [ F \"goal\" ]", Objective::Reward),
            ("Rmin=? [ F \"goal\" ]", Objective::Reward),
        ] {
            for model_type in ["dtmc", "ctmc"] {
                let formula = load_property(text, &model(model_type)).expect("loads");
                assert_eq!(formula.objective, objective);
                assert_eq!(formula.direction, None, "{text} on {model_type}");
            }
        }
    }

    #[test]
    fn resolves_bounded_until_with_boolean_operators() {
        let formula = load_property(
            "Pmax=? [ \"safe\" & !\"goal\" U<=4 (\"goal\" | false) ]; P=? [F \"goal\"]",
            &model("mdp"),
        )
        .expect("loads");
        assert_eq!(formula.direction, Some(Direction::Maximize));
        assert_eq!(formula.bound, Some(Bound::Steps(4)));
        assert_eq!(formula.phi, vec![true, false, false]);
        assert_eq!(formula.psi, vec![false, false, true]);
    }

    #[test]
    fn continuous_time_bounds_are_real() {
        let formula = load_property("P=? [ F<=0.5 \"goal\" ]", &model("ctmc")).expect("loads");
        assert_eq!(formula.bound, Some(Bound::Time(0.5)));
        assert_err_contains(
            load_property("P=? [ F<=0.5 \"goal\" ]", &model("dtmc")),
            "must be integers",
        );
    }

    #[test]
    fn rejects_unsupported_properties() {
        assert_err_contains(load_property("P=? [ F \"goal\" ]", &model("mdp")), "`min` or `max`");
        assert_err_contains(load_property("R=? [ F<=3 \"goal\" ]", &model("dtmc")), "Bounded reward");
        assert_err_contains(load_property("P=? [ F \"nope\" ]", &model("dtmc")), "Unknown label");
        assert_err_contains(load_property("Q=? [ F \"goal\" ]", &model("dtmc")), "Unknown operator");
        assert_err_contains(load_property("P=? [ F \"goal\" ] x", &model("dtmc")), "trailing");
        assert_err_contains(load_property("  ;  ", &model("dtmc")), "No property");
    }

    #[test]
    fn init_label_is_available() {
        let formula = load_property("Pmin=? [ !\"init\" U \"goal\" ]", &model("mdp")).expect("loads");
        assert_eq!(formula.phi, vec![false, true, true]);
    }
}
