//! Job-runner driver for the Nightlight processing engine.
//!
//! Reads a job description (a single `seq` operator, see the operator
//! graph's JSON contract) and an optional context-parameters file, builds
//! the operator graph and execution context, runs it to completion, and
//! exits non-zero with flushed logs on any aggregated error.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;

use nightlight_core::context::{ContextParams, ExecutionContext};
use nightlight_core::operator::Registry;
use nightlight_core::promise::materialize_all;

/// Runs a single Nightlight job: a `seq` operator graph over a set of
/// light frames, reading its parameters from JSON files.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the job JSON file (a single `seq` operator).
    job: PathBuf,

    /// Path to a context-parameters JSON file. Omit for defaults.
    #[arg(short, long)]
    context: Option<PathBuf>,
}

fn load_context_params(path: Option<&PathBuf>) -> Result<ContextParams> {
    match path {
        None => Ok(ContextParams::default()),
        Some(p) => {
            let text = fs::read_to_string(p).with_context(|| format!("reading context parameters from {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing context parameters from {}", p.display()))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let job_text = fs::read_to_string(&args.job).with_context(|| format!("reading job file {}", args.job.display()))?;
    let job_value: serde_json::Value = serde_json::from_str(&job_text).with_context(|| format!("parsing job file {}", args.job.display()))?;

    let params = load_context_params(args.context.as_ref())?;
    let ctx = Arc::new(ExecutionContext::new(params));

    let registry = Registry::with_builtins();
    let run_result = registry
        .create(&job_value)
        .and_then(|root| root.make_promises(Vec::new(), &ctx))
        .map(|promises| materialize_all(promises, ctx.max_threads, false));

    match run_result {
        Ok((frames, None)) => {
            let produced = frames.iter().filter(|f| f.is_some()).count();
            tracing::info!("job completed: {produced} frame(s) produced out of {} terminal promise(s)", frames.len());
            Ok(())
        }
        Ok((_, Some(err))) => {
            for line in ctx.log.lines() {
                eprintln!("{line}");
            }
            Err(anyhow::anyhow!(err).context("job failed"))
        }
        Err(err) => {
            for line in ctx.log.lines() {
                eprintln!("{line}");
            }
            Err(anyhow::anyhow!(err).context("job failed to build"))
        }
    }
}
