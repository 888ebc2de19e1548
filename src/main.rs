use std::{
    fs::File,
    io::{self, BufWriter, Write},
    num::NonZeroUsize,
    path::PathBuf,
};

use anyhow::Context;
use clap::Parser;
use rustc_hash::FxHashSet;
use tracing_subscriber::EnvFilter;

use stubscan::{
    detector::MarkerMatcher,
    scheduler::{self, ArchiveFailure, ScanOptions},
    sink::LabelSink,
};

/// Scan MediaWiki history dumps for the lifecycle of a stub template.
///
/// Emits one JSON record per detected transition: {"rev_id": N, "label": "E"}
/// when the template first appears in a page's history, {"rev_id": N,
/// "label": "D"} when it is removed again.
#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct CommandLine {
    /// Dump files to process (plain XML or zstd-compressed)
    #[arg(required = true, value_name = "DUMP")]
    dumps: Vec<PathBuf>,

    /// Name of the stub template to track
    #[arg(long, default_value = "beginnetje", value_name = "NAME")]
    template: String,

    /// Only scan pages in this namespace (repeatable; default: all namespaces)
    #[arg(long = "namespace", value_name = "NUM")]
    namespaces: Vec<i32>,

    /// Number of parallel workers (default: available cores)
    #[arg(long, value_name = "NUM")]
    workers: Option<NonZeroUsize>,

    /// Write records to this file instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// What to do with a dump file that cannot be read
    #[arg(long, value_enum, default_value = "skip", value_name = "POLICY")]
    on_archive_error: OnArchiveError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OnArchiveError {
    /// Log a diagnostic and continue with the remaining dumps
    Skip,
    /// Stop the whole run on the first unreadable dump
    Abort,
}

fn main() -> anyhow::Result<()> {
    // stdout carries the records, all diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = CommandLine::parse();

    let matcher = MarkerMatcher::new(&args.template)
        .with_context(|| format!("invalid template name {:?}", args.template))?;

    let mut options = ScanOptions::new(matcher);
    if !args.namespaces.is_empty() {
        options.namespaces = Some(args.namespaces.iter().copied().collect::<FxHashSet<i32>>());
    }
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    options.on_archive_failure = match args.on_archive_error {
        OnArchiveError::Skip => ArchiveFailure::Skip,
        OnArchiveError::Abort => ArchiveFailure::Abort,
    };

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("failed to create output file {}", path.display())
        })?)),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = LabelSink::new(writer);

    let stats = scheduler::run(&args.dumps, &options, |event| sink.write_event(&event))?;

    sink.finish().context("failed to flush output")?;

    tracing::info!(pages = stats.pages, events = stats.events, "scan complete");

    Ok(())
}
