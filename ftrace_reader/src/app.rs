use std::{
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::dat::{
    CancellationFlag, EventLocation, FtraceTrace, ScanStatus, ScanSummary, SeekOutcome,
    TraceConfig, TraceEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per event
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ftrace-dump",
    author,
    version,
    about = "Decode events from a trace-cmd trace.dat file",
    long_about = None
)]
pub struct Args {
    /// Path to the trace.dat file
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Start at the first event at or after this timestamp (ns)
    #[arg(long, value_name = "NS", conflicts_with = "location")]
    pub from: Option<u64>,

    /// Resume at a location printed by an earlier run (TIMESTAMP:INDEX)
    #[arg(long, value_name = "TS:IDX")]
    pub location: Option<EventLocation>,

    /// Stop after this many events
    #[arg(long, short = 'n')]
    pub count: Option<u64>,

    /// Output format for events and metadata
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Print header metadata instead of events
    #[arg(long)]
    pub info: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    Timestamp(u64),
    Location(EventLocation),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub trace_path: PathBuf,
    pub start: StartPosition,
    pub limit: Option<u64>,
    pub format: OutputFormat,
    pub info_only: bool,
}

impl From<Args> for AppConfig {
    fn from(value: Args) -> Self {
        let start = match (value.location, value.from) {
            (Some(location), _) => StartPosition::Location(location),
            (None, Some(timestamp)) => StartPosition::Timestamp(timestamp),
            (None, None) => StartPosition::Beginning,
        };
        Self {
            trace_path: value.trace,
            start,
            limit: value.count,
            format: value.format,
            info_only: value.info,
        }
    }
}

/// Logs go to stderr; stdout carries only decoded output.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

pub fn run(config: AppConfig) -> Result<()> {
    let trace = FtraceTrace::open_with(&config.trace_path, TraceConfig::default())
        .with_context(|| format!("failed to open trace at {}", config.trace_path.display()))?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    if config.info_only {
        print_info(&trace, config.format, &mut out)?;
    } else {
        let cancel = CancellationFlag::new();
        let handler_flag = cancel.clone();
        ctrlc::set_handler(move || handler_flag.cancel())
            .context("failed to install Ctrl+C handler")?;
        dump(&trace, &config, &cancel, &mut out)?;
    }

    out.flush().context("failed to flush output")?;
    Ok(())
}

/// Print events from the configured start position. Stops at the end of the
/// trace, at the event limit, or when `cancel` is raised.
pub fn dump<W: Write>(
    trace: &FtraceTrace,
    config: &AppConfig,
    cancel: &CancellationFlag,
    out: &mut W,
) -> Result<ScanSummary> {
    let mut context = trace.context();
    let outcome = match config.start {
        StartPosition::Beginning => SeekOutcome::Positioned,
        StartPosition::Timestamp(timestamp) => context.seek_timestamp(timestamp),
        StartPosition::Location(location) => context.set_location(location),
    };
    match outcome {
        SeekOutcome::PastEnd => warn!(start = ?config.start, "start position is past the last event"),
        SeekOutcome::ClampedToStart => info!(start = ?config.start, "start position clamped to the first event"),
        SeekOutcome::Positioned => {}
    }

    let mut write_error = None;
    let summary = context.scan_events(cancel, config.limit, |event| {
        if write_error.is_some() {
            return;
        }
        if let Err(err) = write_event(out, event, config.format) {
            write_error = Some(err);
            cancel.cancel();
        }
    });
    if let Some(err) = write_error {
        return Err(err.context("failed to write event"));
    }

    match summary.status {
        ScanStatus::Completed => info!(events = summary.events, "dump complete"),
        ScanStatus::Cancelled | ScanStatus::LimitReached => info!(
            events = summary.events,
            status = ?summary.status,
            resume = %context.location(),
            "dump stopped early"
        ),
    }
    Ok(summary)
}

fn write_event<W: Write>(out: &mut W, event: &TraceEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => writeln!(out, "{event}")?,
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, event)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

pub fn print_info<W: Write>(trace: &FtraceTrace, format: OutputFormat, out: &mut W) -> Result<()> {
    let summary = trace.summary();
    if format == OutputFormat::Json {
        serde_json::to_writer_pretty(&mut *out, &summary)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(out, "version:     {}", summary.version)?;
    writeln!(out, "endianness:  {:?}", summary.endianness)?;
    writeln!(out, "long size:   {}", summary.long_size)?;
    writeln!(out, "page size:   {}", summary.page_size)?;
    writeln!(out, "file type:   {:?}", summary.file_type)?;
    writeln!(out, "cpus:        {}", summary.cpu_count)?;
    writeln!(out, "formats:     {}", summary.formats)?;
    writeln!(out, "symbols:     {}", summary.symbols)?;
    writeln!(out, "printk:      {}", summary.printk_formats)?;
    writeln!(out, "cmdlines:    {}", summary.cmdlines)?;
    match summary.time_range {
        Some((start, end)) => writeln!(out, "time range:  {start}..={end}")?,
        None => writeln!(out, "time range:  (no events)")?,
    }
    for (cpu, pages) in &summary.pages {
        writeln!(out, "cpu {cpu:>3}:     {pages} pages")?;
    }
    for (kind, text) in &summary.options {
        writeln!(out, "option {kind:?}: {text}")?;
    }
    Ok(())
}
