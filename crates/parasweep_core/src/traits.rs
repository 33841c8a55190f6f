use crate::environment::SolverEnvironment;
use crate::model::ConcreteModel;
use crate::property::Formula;
use crate::valuation::ParameterValuation;
use anyhow::Result;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that transition expressions can be evaluated over.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Produces concrete models of a fixed topology from parameter valuations.
///
/// Implementations are expected to keep structural information between calls,
/// so that every instantiation after the first only re-evaluates values.
pub trait Instantiate {
    /// Names of the parameters a valuation must assign, in declaration order.
    fn parameters(&self) -> &[String];

    /// Evaluates the parametric model at `valuation`.
    /// The returned model is only valid until the next call.
    fn instantiate(&mut self, valuation: &ParameterValuation) -> Result<&ConcreteModel>;
}

/// Per-state values computed by a [`CheckEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub values: Vec<f64>,
}

impl CheckResult {
    pub fn at(&self, state: usize) -> Option<f64> {
        self.values.get(state).copied()
    }
}

/// Computes the quantitative value of a formula on a concrete model.
pub trait CheckEngine {
    fn check(
        &self,
        model: &ConcreteModel,
        formula: &Formula,
        environment: &SolverEnvironment,
    ) -> Result<CheckResult>;
}
