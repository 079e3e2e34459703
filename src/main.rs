//! `rustymo`: runs the default optimization pipeline over a JSON graph.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rustymo::analysis::registry::InferenceRegistry;
use rustymo::asg::Graph;
use rustymo::config::PipelineConfig;
use rustymo::passes::builtin::{default_registry, ConvertFp32ToFp16};
use rustymo::passes::scheduler::{PipelineStatus, Scheduler};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "rustymo: graph model optimizer", long_about = None)]
struct Args {
    /// Input graph (JSON)
    #[arg(short, long)]
    graph: PathBuf,

    /// Pipeline configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable FP32 -> FP16 conversion
    #[arg(long)]
    fp16: bool,

    /// Where to write the optimized graph (JSON)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_writer(std::io::stderr)
        .init();

    let file = File::open(&args.graph).with_context(|| format!("opening {}", args.graph.display()))?;
    let mut graph: Graph = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", args.graph.display()))?;
    info!(nodes = graph.len(), "graph loaded");

    let mut registry = default_registry(InferenceRegistry::with_standard_ops())?;
    if let Some(path) = &args.config {
        PipelineConfig::load(path)?.apply(&mut registry)?;
    }
    if args.fp16 {
        registry.set_enabled(ConvertFp32ToFp16::NAME, true)?;
    }

    let report = Scheduler::new().run(&registry, &mut graph);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for diagnostic in &report.diagnostics {
        serde_json::to_writer(&mut out, diagnostic)?;
        writeln!(out)?;
    }

    // Partial progress is still written out; callers decide what to do with it.
    if let Some(path) = &args.output {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &graph)?;
        info!(path = %path.display(), "graph written");
    }

    match report.status {
        PipelineStatus::Completed => {
            info!(passes = ?report.executed, "pipeline completed");
            Ok(())
        }
        PipelineStatus::Aborted(err) => bail!("pipeline aborted: {}", err),
    }
}
