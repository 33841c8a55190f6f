//! Decoding of `name=value,...` payloads into complete parameter valuations.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};
use std::collections::BTreeMap;
use thiserror::Error;

/// Exact coefficient type used for parameter values.
pub type Coefficient = BigRational;

const MAX_DECIMAL_SCALE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValuationError {
    #[error("malformed assignment `{0}` (expected exactly one `=`)")]
    MalformedAssignment(String),
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("parameter `{0}` is assigned more than once")]
    DuplicateParameter(String),
    #[error("missing value for parameter `{0}`")]
    MissingParameter(String),
    #[error("invalid value `{value}` for parameter `{name}`")]
    InvalidValue { name: String, value: String },
}

/// A complete assignment of exact values to the parameters of a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterValuation {
    values: BTreeMap<String, Coefficient>,
}

impl ParameterValuation {
    pub fn get(&self, name: &str) -> Option<&Coefficient> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Coefficient)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Floating-point values in the order of `parameters`.
    pub fn to_f64_vec(&self, parameters: &[String]) -> Result<Vec<f64>, ValuationError> {
        parameters
            .iter()
            .map(|name| {
                self.values
                    .get(name)
                    .and_then(|value| value.to_f64())
                    .ok_or_else(|| ValuationError::MissingParameter(name.clone()))
            })
            .collect()
    }
}

/// Decodes `payload` against the declared `parameters`.
///
/// Every declared parameter must be assigned exactly once; partial valuations
/// are rejected rather than defaulted.
pub fn decode_valuation(
    payload: &str,
    parameters: &[String],
) -> Result<ParameterValuation, ValuationError> {
    let mut values = BTreeMap::new();

    let payload = payload.trim();
    if !payload.is_empty() {
        for fragment in payload.split(',') {
            let mut parts = fragment.split('=');
            let (name, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(name), Some(value), None) => (name.trim(), value.trim()),
                _ => return Err(ValuationError::MalformedAssignment(fragment.to_string())),
            };
            if name.is_empty() {
                return Err(ValuationError::MalformedAssignment(fragment.to_string()));
            }
            if !parameters.iter().any(|p| p == name) {
                return Err(ValuationError::UnknownParameter(name.to_string()));
            }
            let coefficient =
                parse_coefficient(value).ok_or_else(|| ValuationError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
            if values.insert(name.to_string(), coefficient).is_some() {
                return Err(ValuationError::DuplicateParameter(name.to_string()));
            }
        }
    }

    if let Some(missing) = parameters.iter().find(|p| !values.contains_key(*p)) {
        return Err(ValuationError::MissingParameter(missing.clone()));
    }

    Ok(ParameterValuation { values })
}

/// Parses an exact coefficient: integers, fractions (`1/3`), decimals and
/// scientific notation (`2.5e-3`). Returns `None` for anything else.
pub fn parse_coefficient(text: &str) -> Option<Coefficient> {
    let text = text.trim();
    if let Some((numerator, denominator)) = text.split_once('/') {
        let numerator = parse_decimal(numerator.trim())?;
        let denominator = parse_decimal(denominator.trim())?;
        if denominator.is_zero() {
            return None;
        }
        return Some(numerator / denominator);
    }
    parse_decimal(text)
}

fn parse_decimal(text: &str) -> Option<Coefficient> {
    let (mantissa, exponent) = match text.find(['e', 'E']) {
        Some(idx) => (&text[..idx], text[idx + 1..].parse::<i32>().ok()?),
        None => (text, 0),
    };

    let (negative, digits) = match mantissa.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, mantissa.strip_prefix('+').unwrap_or(mantissa)),
    };
    let (integral, fractional) = match digits.split_once('.') {
        Some((integral, fractional)) => (integral, fractional),
        None => (digits, ""),
    };
    if integral.is_empty() && fractional.is_empty() {
        return None;
    }
    if !integral.chars().chain(fractional.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let all_digits = format!("{integral}{fractional}");
    let mut numerator: BigInt = all_digits.parse().ok()?;
    if negative {
        numerator = -numerator;
    }
    let scale = exponent.checked_sub(i32::try_from(fractional.len()).ok()?)?;
    if scale.unsigned_abs() > MAX_DECIMAL_SCALE {
        return None;
    }
    let ten = BigInt::from(10u32);
    let value = if scale >= 0 {
        BigRational::from_integer(numerator * num_traits::pow(ten, scale as usize))
    } else {
        BigRational::new(numerator, num_traits::pow(ten, scale.unsigned_abs() as usize))
    };
    Some(value)
}
