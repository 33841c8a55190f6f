use crate::expression::{Bytecode, VM};
use crate::model::{ConcreteModel, ModelVariant, ParametricModel, TimeModel};
use crate::traits::Instantiate;
use crate::valuation::ParameterValuation;
use anyhow::{anyhow, bail, Context, Result};
use nalgebra_sparse::CsrMatrix;
use tracing::debug;

/// Tolerance for probability distributions that must sum to one.
const DISTRIBUTION_TOLERANCE: f64 = 1e-9;

/// Instantiates a parametric model over and over again.
///
/// Everything that does not depend on the valuation is computed once: the
/// sparsity pattern, the row groups, the labels and all parameter-free
/// entries. An instantiation only re-runs the bytecode of the entries that
/// mention a parameter and validates the rows they touch.
pub struct Instantiator {
    parameters: Vec<String>,
    /// (slot in the CSR value array, compiled value)
    parametric_entries: Vec<(usize, Bytecode)>,
    /// Rows containing at least one parametric entry.
    parametric_rows: Vec<usize>,
    parametric_rewards: Vec<(usize, Bytecode)>,
    model: ConcreteModel,
    params: Vec<f64>,
    stack: Vec<f64>,
    instantiations: usize,
}

impl Instantiator {
    pub fn new(parametric: &ParametricModel) -> Result<Self> {
        let mut stack = Vec::with_capacity(64);
        let mut values = vec![0.0; parametric.values.len()];
        let mut parametric_entries = Vec::new();
        for (slot, code) in parametric.values.iter().enumerate() {
            if code.is_constant() {
                values[slot] = VM::execute(code, &[], &mut stack);
            } else {
                parametric_entries.push((slot, code.clone()));
            }
        }

        let rows = parametric.row_offsets.len() - 1;
        let mut depends = vec![false; rows];
        let mut row = 0;
        for (slot, _) in &parametric_entries {
            while parametric.row_offsets[row + 1] <= *slot {
                row += 1;
            }
            depends[row] = true;
        }
        let (parametric_rows, constant_rows): (Vec<usize>, Vec<usize>) =
            (0..rows).partition(|&row| depends[row]);

        let matrix = CsrMatrix::try_from_csr_data(
            rows,
            parametric.state_count(),
            parametric.row_offsets.clone(),
            parametric.columns.clone(),
            values,
        )
        .map_err(|e| anyhow!("Invalid transition structure: {}", e))?;

        let (state_rewards, parametric_rewards) = match &parametric.state_rewards {
            None => (None, Vec::new()),
            Some(codes) => {
                let mut rewards = vec![0.0; codes.len()];
                let mut pending = Vec::new();
                for (state, code) in codes.iter().enumerate() {
                    if code.is_constant() {
                        rewards[state] = VM::execute(code, &[], &mut stack);
                    } else {
                        pending.push((state, code.clone()));
                    }
                }
                validate_rewards(&rewards)?;
                (Some(rewards), pending)
            }
        };

        let exit_rates = match parametric.variant.time_model() {
            TimeModel::Continuous => Some(vec![0.0; parametric.state_count()]),
            TimeModel::Discrete => None,
        };

        let model = ConcreteModel {
            variant: parametric.variant,
            structure: parametric.structure.clone(),
            matrix,
            exit_rates,
            state_rewards,
        };
        validate_rows(&model, &constant_rows).context("The model is invalid for every valuation.")?;

        debug!(
            "Instantiator ready: {} of {} transitions and {} rewards depend on parameters.",
            parametric_entries.len(),
            parametric.transition_count(),
            parametric_rewards.len()
        );

        let mut instantiator = Self {
            parameters: parametric.parameters.clone(),
            parametric_entries,
            parametric_rows,
            parametric_rewards,
            model,
            params: Vec::with_capacity(parametric.parameters.len()),
            stack,
            instantiations: 0,
        };
        instantiator.update_exit_rates();
        Ok(instantiator)
    }

    /// Number of successful instantiations so far.
    pub fn instantiations(&self) -> usize {
        self.instantiations
    }

    fn update_exit_rates(&mut self) {
        let Some(exit_rates) = self.model.exit_rates.as_mut() else {
            return;
        };
        let offsets = self.model.matrix.row_offsets();
        let values = self.model.matrix.values();
        let row_groups = &self.model.structure.row_groups;
        for (state, rate) in exit_rates.iter_mut().enumerate() {
            let rows = row_groups[state]..row_groups[state + 1];
            *rate = values[offsets[rows.start]..offsets[rows.end]].iter().sum();
        }
    }
}

impl Instantiate for Instantiator {
    fn parameters(&self) -> &[String] {
        &self.parameters
    }

    fn instantiate(&mut self, valuation: &ParameterValuation) -> Result<&ConcreteModel> {
        self.params = valuation.to_f64_vec(&self.parameters)?;

        let values = self.model.matrix.values_mut();
        for (slot, code) in &self.parametric_entries {
            values[*slot] = VM::execute(code, &self.params, &mut self.stack);
        }
        validate_rows(&self.model, &self.parametric_rows)?;
        self.update_exit_rates();

        if let Some(rewards) = self.model.state_rewards.as_mut() {
            for (state, code) in &self.parametric_rewards {
                rewards[*state] = VM::execute(code, &self.params, &mut self.stack);
            }
            validate_rewards(rewards)?;
        }

        self.instantiations += 1;
        Ok(&self.model)
    }
}

fn validate_rows(model: &ConcreteModel, rows: &[usize]) -> Result<()> {
    let is_probabilistic = model.variant != ModelVariant::Ctmc;
    for &row in rows {
        let mut sum = 0.0;
        for (target, value) in model.row(row) {
            if !value.is_finite() || value < 0.0 {
                bail!("Transition value {} on choice {} towards state {} is invalid.", value, row, target);
            }
            if is_probabilistic && value > 1.0 + DISTRIBUTION_TOLERANCE {
                bail!("Probability {} on choice {} towards state {} exceeds one.", value, row, target);
            }
            sum += value;
        }
        if is_probabilistic && (sum - 1.0).abs() > DISTRIBUTION_TOLERANCE {
            bail!("Probabilities of choice {} sum to {} instead of one.", row, sum);
        }
    }
    Ok(())
}

fn validate_rewards(rewards: &[f64]) -> Result<()> {
    if let Some((state, value)) = rewards
        .iter()
        .enumerate()
        .find(|(_, r)| !r.is_finite() || **r < 0.0)
    {
        bail!("Reward {} of state {} is not a non-negative number.", value, state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{build_model, parse_description, ModelKind};
    use crate::valuation::decode_valuation;

    fn instantiator(text: &str) -> Instantiator {
        let description = parse_description(ModelKind::Explicit, text).expect("parses");
        let model = build_model(&description, "").expect("builds");
        Instantiator::new(&model).expect("instantiator")
    }

    fn assert_err_contains<T>(result: Result<T>, needle: &str) {
        let message = match result {
            Ok(_) => panic!("expected error"),
            Err(err) => format!("{err:#}"),
        };
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    const COIN: &str = "type: dtmc\nconst p\nstates: 3\nreward 0: 2*p\n0 -> 1 : p\n0 -> 2 : 1 - p\n";

    #[test]
    fn evaluates_parametric_entries_only() {
        let mut inst = instantiator(COIN);
        assert_eq!(inst.parametric_entries.len(), 2);
        assert_eq!(inst.parametric_rows, vec![0]);

        let valuation = decode_valuation("p=0.25", inst.parameters()).expect("valuation");
        let model = inst.instantiate(&valuation).expect("instantiates");
        let row: Vec<(usize, f64)> = model.row(0).collect();
        assert_eq!(row, vec![(1, 0.25), (2, 0.75)]);
        assert_eq!(model.row(1).collect::<Vec<_>>(), vec![(1, 1.0)]);
        assert_eq!(model.state_rewards.as_deref(), Some(&[0.5, 0.0, 0.0][..]));

        let valuation = decode_valuation("p=1/2", inst.parameters()).expect("valuation");
        let model = inst.instantiate(&valuation).expect("instantiates");
        assert_eq!(model.row(0).collect::<Vec<_>>(), vec![(1, 0.5), (2, 0.5)]);
        assert_eq!(inst.instantiations(), 2);
    }

    #[test]
    fn rejects_invalid_distributions() {
        let mut inst = instantiator(COIN);
        let valuation = decode_valuation("p=1.5", inst.parameters()).expect("valuation");
        assert_err_contains(inst.instantiate(&valuation), "exceeds one");

        let mut inst = instantiator("type: dtmc\nconst p\nstates: 2\n0 -> 1 : p\n");
        let valuation = decode_valuation("p=0.5", inst.parameters()).expect("valuation");
        assert_err_contains(inst.instantiate(&valuation), "sum to 0.5");
    }

    #[test]
    fn rejects_models_invalid_for_every_valuation() {
        let description =
            parse_description(ModelKind::Explicit, "type: dtmc\nstates: 2\n0 -> 1 : 0.3\n")
                .expect("parses");
        let model = build_model(&description, "").expect("builds");
        assert_err_contains(Instantiator::new(&model), "invalid for every valuation");
    }

    #[test]
    fn computes_exit_rates_for_ctmc() {
        let mut inst = instantiator("type: ctmc\nconst r\nstates: 2\n0 -> 1 : 2*r\n1 -> 0 : 3\n");
        let valuation = decode_valuation("r=1.5", inst.parameters()).expect("valuation");
        let model = inst.instantiate(&valuation).expect("instantiates");
        assert_eq!(model.exit_rates.as_deref(), Some(&[3.0, 3.0][..]));

        let valuation = decode_valuation("r=-1", inst.parameters()).expect("valuation");
        assert_err_contains(inst.instantiate(&valuation), "invalid");
    }
}
