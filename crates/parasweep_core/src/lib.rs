pub mod checker;
pub mod emitter;
pub mod environment;
pub mod error;
pub mod expression;
pub mod graph;
pub mod instantiate;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod property;
pub mod protocol;
pub mod solvers;
/// The `parasweep_core` crate evaluates one parametric probabilistic model
/// against a stream of parameter valuations.
///
/// Key components:
/// - **Loader**: explicit and JSON model descriptions, compiled into a `ParametricModel`.
/// - **Expression engine**: a bytecode VM for transition values over parameters.
/// - **Instantiator**: cheap repeated instantiation of a fixed topology.
/// - **Checker and solvers**: graph pre-computation plus linear and min-max solvers.
/// - **Orchestrator**: the line protocol loop (`<id>:<valuation>`, `METHOD:`, `OPTIONS:`, `EOF`).
pub mod traits;
pub mod valuation;
