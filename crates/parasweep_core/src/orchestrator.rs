//! The request loop.
//!
//! One line is read, fully processed and answered before the next one is
//! read, so results come out in request order and every evaluation sees all
//! directives that preceded it.

use crate::emitter::ResultEmitter;
use crate::environment::SolverEnvironment;
use crate::error::RequestError;
use crate::property::Formula;
use crate::protocol::{parse_request, DirectiveKind, ProtocolError, Request};
use crate::traits::{CheckEngine, Instantiate};
use crate::valuation::decode_valuation;
use anyhow::anyhow;
use std::io::{self, BufRead, Write};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Evaluation requests answered, successfully or not.
    pub evaluated: usize,
    /// Error lines written, including those for malformed lines.
    pub errors: usize,
    pub directives: usize,
    pub rejected_directives: usize,
    /// Whether the loop stopped on the terminator rather than end of input.
    pub terminated: bool,
}

pub struct Evaluator<I: Instantiate, C: CheckEngine> {
    instantiator: I,
    engine: C,
    formula: Formula,
    environment: SolverEnvironment,
}

impl<I: Instantiate, C: CheckEngine> Evaluator<I, C> {
    pub fn new(instantiator: I, engine: C, formula: Formula, environment: SolverEnvironment) -> Self {
        Self {
            instantiator,
            engine,
            formula,
            environment,
        }
    }

    pub fn environment(&self) -> &SolverEnvironment {
        &self.environment
    }

    /// Processes requests from `input` until the terminator or end of input.
    ///
    /// Request failures become error lines; only I/O failures on the channels
    /// end the loop early.
    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, output: W) -> io::Result<RunSummary> {
        let mut emitter = ResultEmitter::new(output);
        let mut summary = RunSummary::default();
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            if input.read_until(b'\n', &mut buffer)? == 0 {
                break;
            }
            let line = match std::str::from_utf8(&buffer) {
                Ok(line) => line.trim_end_matches(&['\n', '\r'][..]),
                Err(_) => {
                    self.reject_undecodable(&buffer, &mut emitter, &mut summary)?;
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_request(line) {
                Ok(Request::Terminate) => {
                    summary.terminated = true;
                    break;
                }
                Ok(Request::Configure { kind, payload }) => {
                    summary.directives += 1;
                    if !self.configure(kind, payload) {
                        summary.rejected_directives += 1;
                    }
                }
                Ok(Request::Evaluate {
                    identifier,
                    payload,
                }) => {
                    let identifier = identifier.trim();
                    summary.evaluated += 1;
                    match self.evaluate(payload) {
                        Ok(value) => {
                            emitter.emit_value(identifier, value, self.environment.output_precision)?
                        }
                        Err(err) => {
                            warn!("Request `{}` failed: {}", identifier, err);
                            summary.errors += 1;
                            emitter.emit_error(identifier, &err.to_string())?;
                        }
                    }
                }
                Err(err) => {
                    let err = RequestError::from(err);
                    warn!("Skipping line: {}", err);
                    summary.errors += 1;
                    emitter.emit_error("", &err.to_string())?;
                }
            }
        }

        debug!(
            "Request loop finished: {} evaluated, {} errors, {} directives ({} rejected), {}.",
            summary.evaluated,
            summary.errors,
            summary.directives,
            summary.rejected_directives,
            if summary.terminated {
                "terminated"
            } else {
                "end of input"
            }
        );
        Ok(summary)
    }

    /// Answers a line that is not valid UTF-8 without ending the loop. The
    /// identifier is recovered from a lossy decoding where possible.
    fn reject_undecodable<W: Write>(
        &self,
        bytes: &[u8],
        emitter: &mut ResultEmitter<W>,
        summary: &mut RunSummary,
    ) -> io::Result<()> {
        let lossy = String::from_utf8_lossy(bytes);
        let line = lossy.trim();
        let err = RequestError::from(ProtocolError::InvalidUtf8(line.to_string()));
        match parse_request(line) {
            Ok(Request::Configure { .. }) => {
                warn!("Ignoring directive: {}", err);
                summary.directives += 1;
                summary.rejected_directives += 1;
                Ok(())
            }
            Ok(Request::Evaluate { identifier, .. }) => {
                warn!("Request `{}` failed: {}", identifier.trim(), err);
                summary.evaluated += 1;
                summary.errors += 1;
                emitter.emit_error(identifier.trim(), &err.to_string())
            }
            Ok(Request::Terminate) | Err(_) => {
                warn!("Skipping line: {}", err);
                summary.errors += 1;
                emitter.emit_error("", &err.to_string())
            }
        }
    }

    /// Applies a directive; returns whether it took effect.
    fn configure(&mut self, kind: DirectiveKind, payload: &str) -> bool {
        match kind {
            DirectiveKind::Method => {
                self.environment.apply_method_directive(payload);
                true
            }
            DirectiveKind::Options => match self.environment.apply_options_directive(payload) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Ignoring options directive: {}", err);
                    false
                }
            },
        }
    }

    /// Decodes, instantiates and checks one valuation; returns the value at the
    /// first initial state.
    pub fn evaluate(&mut self, payload: &str) -> Result<f64, RequestError> {
        let started = Instant::now();
        let valuation = decode_valuation(payload, self.instantiator.parameters())?;
        let model = self
            .instantiator
            .instantiate(&valuation)
            .map_err(RequestError::Instantiation)?;
        let result = self
            .engine
            .check(model, &self.formula, &self.environment)
            .map_err(RequestError::Check)?;
        let state = model
            .initial_states()
            .first()
            .copied()
            .ok_or_else(|| RequestError::Check(anyhow!("The model has no initial state.")))?;
        let value = result.at(state).ok_or_else(|| {
            RequestError::Check(anyhow!("No result for initial state {}.", state))
        })?;

        if self.environment.print_diagnostics {
            info!("Evaluated `{}` in {:?}.", payload.trim(), started.elapsed());
        }
        Ok(value)
    }
}
