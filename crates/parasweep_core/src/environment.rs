use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Numeric method used by the solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NumericMethod {
    #[default]
    ValueIteration,
    Jacobi,
    GaussSeidel,
    IntervalIteration,
    PolicyIteration,
    Direct,
}

impl NumericMethod {
    /// Resolves a method name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vi" | "value-iteration" | "power" => Some(NumericMethod::ValueIteration),
            "jacobi" => Some(NumericMethod::Jacobi),
            "gs" | "gauss-seidel" | "gaussseidel" => Some(NumericMethod::GaussSeidel),
            "ii" | "interval-iteration" => Some(NumericMethod::IntervalIteration),
            "pi" | "policy-iteration" => Some(NumericMethod::PolicyIteration),
            "lu" | "direct" | "elimination" => Some(NumericMethod::Direct),
            _ => None,
        }
    }

    /// Like [`NumericMethod::from_name`], but unknown names select the default method.
    pub fn from_name_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            let fallback = NumericMethod::default();
            warn!("Unknown numeric method `{}`; using {}.", name.trim(), fallback);
            fallback
        })
    }
}

impl fmt::Display for NumericMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NumericMethod::ValueIteration => "value iteration",
            NumericMethod::Jacobi => "jacobi",
            NumericMethod::GaussSeidel => "gauss-seidel",
            NumericMethod::IntervalIteration => "interval iteration",
            NumericMethod::PolicyIteration => "policy iteration",
            NumericMethod::Direct => "direct (LU)",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearSolverSettings {
    pub method: NumericMethod,
    pub precision: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxSolverSettings {
    pub method: NumericMethod,
    pub precision: f64,
}

/// Meta-solver that splits a system into strongly connected components and
/// delegates each component to an underlying method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TopologicalSettings {
    pub enabled: bool,
    pub underlying_linear: NumericMethod,
    pub underlying_min_max: NumericMethod,
}

/// The single piece of mutable solver state shared by all evaluations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverEnvironment {
    pub linear: LinearSolverSettings,
    pub min_max: MinMaxSolverSettings,
    pub topological: TopologicalSettings,
    pub max_iterations: usize,
    /// Convergence is measured relative to the magnitude of the iterate.
    pub relative: bool,
    pub print_diagnostics: bool,
    /// Number of decimals in rendered results; `None` prints the shortest
    /// representation that round-trips.
    pub output_precision: Option<usize>,
}

pub const DEFAULT_PRECISION: f64 = 1e-6;
pub const DEFAULT_MAX_ITERATIONS: usize = 20_000;

impl Default for SolverEnvironment {
    fn default() -> Self {
        let method = NumericMethod::default();
        Self {
            linear: LinearSolverSettings {
                method,
                precision: DEFAULT_PRECISION,
            },
            min_max: MinMaxSolverSettings {
                method,
                precision: DEFAULT_PRECISION,
            },
            topological: TopologicalSettings {
                enabled: false,
                underlying_linear: method,
                underlying_min_max: method,
            },
            max_iterations: DEFAULT_MAX_ITERATIONS,
            relative: true,
            print_diagnostics: false,
            output_precision: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed option `{0}` (expected `KEY=VALUE`)")]
    MalformedOption(String),
    #[error("invalid value `{value}` for option {key}")]
    InvalidOption { key: String, value: String },
}

/// A validated change to one tuning knob.
#[derive(Debug, Clone, Copy, PartialEq)]
enum OptionUpdate {
    MaxIterations(usize),
    Precision(f64),
    Relative(bool),
    Topological(bool),
    Diagnostics(bool),
    OutputPrecision(Option<usize>),
}

impl SolverEnvironment {
    /// Selects `method` for every solver role at once.
    pub fn set_method(&mut self, method: NumericMethod) {
        self.linear.method = method;
        self.min_max.method = method;
        self.topological.underlying_linear = method;
        self.topological.underlying_min_max = method;
        debug!("Numeric method set to {}.", method);
    }

    /// Applies the payload of a `METHOD:` directive.
    pub fn apply_method_directive(&mut self, payload: &str) {
        self.set_method(NumericMethod::from_name_or_default(payload));
    }

    /// Applies the payload of an `OPTIONS:` directive.
    ///
    /// The directive is all-or-nothing: when any recognized key carries an
    /// invalid value, the environment is left untouched. Unrecognized keys
    /// are ignored.
    pub fn apply_options_directive(&mut self, payload: &str) -> Result<(), ConfigError> {
        let mut updates = Vec::new();
        for fragment in payload.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, value) = fragment
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedOption(fragment.to_string()))?;
            let (key, value) = (key.trim(), value.trim());
            match parse_option(key, value) {
                Some(Ok(update)) => updates.push(update),
                Some(Err(())) => {
                    return Err(ConfigError::InvalidOption {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                }
                None => debug!("Ignoring unrecognized option `{}`.", key),
            }
        }

        for update in updates {
            self.apply_update(update);
        }
        Ok(())
    }

    fn apply_update(&mut self, update: OptionUpdate) {
        match update {
            OptionUpdate::MaxIterations(limit) => self.max_iterations = limit,
            OptionUpdate::Precision(precision) => {
                self.linear.precision = precision;
                self.min_max.precision = precision;
            }
            OptionUpdate::Relative(relative) => self.relative = relative,
            OptionUpdate::Topological(enabled) => self.topological.enabled = enabled,
            OptionUpdate::Diagnostics(enabled) => self.print_diagnostics = enabled,
            OptionUpdate::OutputPrecision(digits) => self.output_precision = digits,
        }
        if self.print_diagnostics {
            info!("Solver option updated: {:?}.", update);
        } else {
            debug!("Solver option updated: {:?}.", update);
        }
    }
}

/// `None` for unknown keys, `Some(Err(()))` for a bad value.
fn parse_option(key: &str, value: &str) -> Option<Result<OptionUpdate, ()>> {
    let update = match key.to_ascii_uppercase().as_str() {
        "MAX-ITER" => match value.parse::<usize>() {
            Ok(limit) if limit > 0 => Ok(OptionUpdate::MaxIterations(limit)),
            _ => Err(()),
        },
        "PRECISION" | "EPSILON" => match value.parse::<f64>() {
            Ok(precision) if precision.is_finite() && precision > 0.0 => {
                Ok(OptionUpdate::Precision(precision))
            }
            _ => Err(()),
        },
        "RELATIVE" => parse_bool(value).map(OptionUpdate::Relative),
        "TOPOLOGICAL" => parse_bool(value).map(OptionUpdate::Topological),
        "DIAGNOSTICS" => parse_bool(value).map(OptionUpdate::Diagnostics),
        "OUTPUT-PRECISION" => {
            if value.eq_ignore_ascii_case("default") {
                Ok(OptionUpdate::OutputPrecision(None))
            } else {
                value
                    .parse::<usize>()
                    .map(|digits| OptionUpdate::OutputPrecision(Some(digits)))
                    .map_err(|_| ())
            }
        }
        _ => return None,
    };
    Some(update)
}

fn parse_bool(value: &str) -> Result<bool, ()> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(()),
    }
}
