//! `pyexec`: run Python files through a sandboxed execution pool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use pyexec_pool::config::{self, PyExecConfig};
use pyexec_pool::logging::{init_and_store_logging, LogLevel};
use pyexec_pool::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "pyexec", version, about = "Run Python programs in a pool of sandboxed interpreters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./pyexec.toml, then ~/.config/pyexec/config.toml)
    #[arg(long, short, global = true, env = "PYEXEC_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one or more files concurrently
    Run {
        /// Python source files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Line served to input(); repeat for more lines
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,

        /// Per-program time limit in milliseconds (0 disables it)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Number of interpreters running at once
        #[arg(long)]
        pool_size: Option<usize>,

        /// Divider printed after each program
        #[arg(long, default_value = "----")]
        divider: String,
    },
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<PyExecConfig> {
    let config = match path {
        Some(path) => config::from_path(path),
        None => config::load(),
    };
    config.context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    if cli.verbose {
        config.logging.level = LogLevel::Debug;
    }
    init_and_store_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            for path in config::search_paths() {
                println!("# searched: {}", path.display());
            }
            Ok(())
        }
        Commands::Run {
            files,
            inputs,
            timeout_ms,
            pool_size,
            divider,
        } => {
            if let Some(ms) = timeout_ms {
                config.pool.max_execution_time_ms = ms;
            }
            if let Some(size) = pool_size {
                config.pool.pool_size = size;
            }
            run_files(config, files, inputs, divider).await
        }
    }
}

async fn run_files(
    config: PyExecConfig,
    files: Vec<PathBuf>,
    inputs: Vec<String>,
    divider: String,
) -> Result<()> {
    let mut programs = Vec::with_capacity(files.len());
    for path in files {
        let code = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        programs.push((path, code));
    }

    let pool = ExecutionPool::builder()
        .config(config)
        .sink(Arc::new(StdioSink::new(divider)))
        .launch()
        .await?;

    let options = RunOptions::new().with_inputs(inputs);
    let runs = programs.iter().map(|(path, code)| {
        let options = options.clone();
        let pool = &pool;
        async move {
            let result = pool.run_and_report(code.as_str(), options).await;
            (path, result)
        }
    });

    let mut failures = 0usize;
    for (path, result) in join_all(runs).await {
        match result {
            Ok(value) if !value.is_null() => println!("{}: {value}", path.display()),
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                tracing::debug!(file = %path.display(), code = e.code(), "Program failed");
            }
        }
    }

    if let Ok(status) = pool.status().await {
        tracing::info!(
            succeeded = status.metrics.succeeded,
            failed = status.metrics.failed,
            timed_out = status.metrics.timed_out,
            "All programs finished"
        );
    }
    pool.shutdown().await?;

    if failures > 0 {
        anyhow::bail!("{failures} program(s) failed");
    }
    Ok(())
}
