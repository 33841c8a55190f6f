use anyhow::Context;
use clap::Parser;
use parasweep_core::checker::ModelChecker;
use parasweep_core::environment::SolverEnvironment;
use parasweep_core::error::StartupError;
use parasweep_core::instantiate::Instantiator;
use parasweep_core::loader::{load_model, ModelKind};
use parasweep_core::orchestrator::Evaluator;
use parasweep_core::property::load_property;
use std::io;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parasweep", version)]
#[command(
    about = "Evaluates a parametric Markov model for a stream of parameter valuations",
    long_about = "Reads `<id>:<name>=<value>,...` lines from stdin and answers each with \
                  `Parasweep_RESULT:<id>:<value>` on stdout. `METHOD:<name>` and \
                  `OPTIONS:<key>=<value>,...` reconfigure the solver; `EOF` stops."
)]
struct Cli {
    /// Model description language: `explicit` or `json`
    #[arg(value_name = "KIND")]
    kind: String,

    /// Model description file
    #[arg(value_name = "MODEL")]
    model: PathBuf,

    /// Property to check; only the first of several `;`-separated properties is used
    #[arg(value_name = "PROPERTY")]
    property: String,

    /// Constant definitions, e.g. `N=10,K=N/2`
    #[arg(value_name = "CONSTANTS", default_value = "")]
    constants: String,

    /// Initial numeric method (vi, jacobi, gs, ii, pi, lu)
    #[arg(value_name = "METHOD")]
    method: Option<String>,

    /// Initial solver options, in `OPTIONS:` directive syntax
    #[arg(long, value_name = "KEY=VALUE,...")]
    options: Option<String>,

    /// Log debug output to stderr
    #[arg(short, long)]
    verbose: bool,
}

fn start(cli: &Cli) -> Result<Evaluator<Instantiator, ModelChecker>, StartupError> {
    // The kind is validated before the model file is touched.
    let kind: ModelKind = cli.kind.parse()?;
    let model = load_model(kind, &cli.model, &cli.constants)?;
    let formula = load_property(&cli.property, &model)?;
    let instantiator = Instantiator::new(&model)?;

    let mut environment = SolverEnvironment::default();
    if let Some(method) = &cli.method {
        environment.apply_method_directive(method);
    }
    if let Some(options) = &cli.options {
        environment
            .apply_options_directive(options)
            .context("Invalid --options")?;
    }

    info!(
        "Checking {} with {}; waiting for valuations of [{}].",
        formula,
        environment.linear.method,
        model.parameters.join(", ")
    );
    Ok(Evaluator::new(instantiator, ModelChecker, formula, environment))
}

fn main() {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr only.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .init();

    let mut evaluator = match start(&cli) {
        Ok(evaluator) => evaluator,
        Err(err) => {
            error!("{:#}", err);
            process::exit(err.exit_code());
        }
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    if let Err(err) = evaluator.run(stdin.lock(), stdout.lock()) {
        error!("I/O failure on the request channels: {}", err);
        process::exit(1);
    }
}
