use std::error::Error as _;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use relonar::config::{self, Cli};
use relonar::pipeline::Pipeline;
use relonar::PatchNarError;
use relonar_rewrite::Patcher;
use tracing::{debug, error};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
            let _ = err.print();
            return code;
        }
    };

    init_tracing(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            let mut source = err.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), PatchNarError> {
    let settings = config::build_settings(&cli)?;
    let highlighter = config::build_highlighter(&cli);
    let patcher = Arc::new(Patcher::new(settings, highlighter));

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = worker_threads_from_env() {
        builder.worker_threads(threads);
    }
    let runtime = builder
        .build()
        .map_err(|err| PatchNarError::io("failed to start runtime", err))?;

    let window = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4);
    let pipeline = Pipeline::new(Arc::clone(&patcher), window);

    runtime.block_on(pipeline.run(tokio::io::stdin(), tokio::io::stdout()))?;

    let stats = patcher.stats();
    debug!(
        files_patched = stats.files_patched(),
        symlinks_patched = stats.symlinks_patched(),
        directories_processed = stats.directories_processed(),
        total_bytes = stats.total_bytes(),
        "archive rewritten"
    );
    Ok(())
}

fn worker_threads_from_env() -> Option<usize> {
    std::env::var("RELONAR_NUM_THREADS")
        .ok()?
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
