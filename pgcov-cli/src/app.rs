use std::{
    future::Future,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use pgcov::backend::CoverageBackend;
use pgcov::{
    render, session, ConnectionTarget, CoverageError, HideList, ListeningSession, RecordSet,
    RenderPolicy, SessionOptions,
};
use regex::Regex;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pgcov-html",
    author,
    version,
    about = "Collect PL/pgSQL line coverage while a test suite runs and write an annotated HTML report",
    long_about = None
)]
pub struct Args {
    /// Write the output to FILE
    #[arg(long, value_name = "FILE", default_value = "coverage.html")]
    pub outfile: PathBuf,

    /// Read a newline-separated list of functions from FILE for which the
    /// source code should be hidden
    #[arg(long, value_name = "FILE")]
    pub hide_source_list: Option<PathBuf>,

    /// Only show functions whose signature matches the regular expression FILTER
    #[arg(long, value_name = "FILTER")]
    pub filter: Option<String>,

    /// Connection string (key=value pairs or postgresql:// URL); unset fields
    /// fall back to PGHOST, PGPORT, PGUSER, PGPASSWORD and PGDATABASE.
    /// Connections are made without TLS, so sslmode=require is rejected
    #[arg(long, env = "PGCOV_CONNINFO", default_value = "", hide_default_value = true)]
    pub conninfo: String,

    /// Give up if the listen call has not acknowledged cancellation after SECS
    /// seconds (waits indefinitely by default)
    #[arg(long, value_name = "SECS")]
    pub cancel_timeout: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub outfile: PathBuf,
    pub hide_source_list: Option<PathBuf>,
    pub filter: Option<Regex>,
    pub target: ConnectionTarget,
    pub cancel_timeout: Option<Duration>,
}

impl AppConfig {
    fn from_args_with_env<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let filter = args
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("could not compile filter")?;
        let target = ConnectionTarget::parse(&args.conninfo)?.with_env_fallbacks(lookup);

        Ok(Self {
            outfile: args.outfile,
            hide_source_list: args.hide_source_list,
            filter,
            target,
            cancel_timeout: args.cancel_timeout.map(Duration::from_secs),
        })
    }
}

impl TryFrom<Args> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(value: Args) -> Result<Self> {
        Self::from_args_with_env(value, |key| std::env::var(key).ok())
    }
}

pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run(config: AppConfig) -> Result<()> {
    // Read the hide list up front so a bad path fails before connecting.
    let hide_list = match &config.hide_source_list {
        Some(path) => HideList::load(path).context("could not read hide-source list")?,
        None => HideList::default(),
    };

    let options = SessionOptions {
        cancel_timeout: config.cancel_timeout,
    };
    let coverage = session::start(&config.target, options)
        .await
        .context("could not start coverage session")?;

    collect_and_report(coverage, &config, hide_list, interrupted(), interrupted()).await
}

/// Keep the session listening until `stop` fires, then harvest and write the
/// report. If `abandon` fires before the report is in place the run fails and
/// the output file is left untouched.
pub async fn collect_and_report<B, Stop, Abandon>(
    mut coverage: ListeningSession<B>,
    config: &AppConfig,
    hide_list: HideList,
    stop: Stop,
    abandon: Abandon,
) -> Result<()>
where
    B: CoverageBackend,
    Stop: Future<Output = ()>,
    Abandon: Future<Output = ()>,
{
    info!(
        backend_pid = coverage.backend_pid(),
        outfile = %config.outfile.display(),
        "Collecting coverage; press Ctrl+C to write the report",
    );

    coverage
        .wait_for(stop)
        .await
        .context("coverage listener failed")?;
    info!("Stop requested, writing the output file");

    tokio::select! {
        result = finish(&mut coverage, config, hide_list) => result,
        () = abandon => {
            error!("Received a second interrupt, exiting without writing the output file");
            Err(anyhow!("interrupted again before the output file was written"))
        }
    }
}

async fn finish<B: CoverageBackend>(
    coverage: &mut ListeningSession<B>,
    config: &AppConfig,
    hide_list: HideList,
) -> Result<()> {
    let records = coverage
        .stop()
        .await
        .context("could not harvest coverage data")?;
    coverage.close().await;

    let hidden = hidden_functions(&hide_list, &records);
    let policy = RenderPolicy::new(hide_list, config.filter.clone());
    write_report(&config.outfile, &records, &policy)?;

    info!(
        functions = records.len(),
        hidden,
        outfile = %config.outfile.display(),
        "Coverage report written",
    );
    Ok(())
}

/// Number of hide-list entries that name a harvested function.
fn hidden_functions(hide_list: &HideList, records: &RecordSet) -> usize {
    hide_list
        .iter()
        .filter(|signature| {
            let called = records.get(signature).is_some();
            if !called {
                debug!(signature = %signature, "Hide-list entry was not called");
            }
            called
        })
        .count()
}

/// Render into a temporary file next to `path` and move it into place once
/// complete, so an interrupted or failed render never leaves a partial report.
pub fn write_report(path: &Path, records: &RecordSet, policy: &RenderPolicy) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut staged = staging_file(dir)
        .map_err(|err| CoverageError::io(dir, err))
        .with_context(|| format!("could not open output file {}", path.display()))?;
    render(&mut BufWriter::new(staged.as_file_mut()), records, policy)
        .map_err(|err| CoverageError::io(path, err))
        .with_context(|| format!("could not write report to {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|err| CoverageError::io(path, err.error))
        .with_context(|| format!("could not move report into {}", path.display()))?;
    Ok(())
}

fn staging_file(dir: &Path) -> io::Result<tempfile::NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".pgcov-html-").suffix(".tmp");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    builder.tempfile_in(dir)
}

/// Resolves on the first SIGINT or, on unix, SIGTERM.
pub async fn interrupted() {
    first_signal(tokio::signal::ctrl_c(), terminate()).await;
}

#[cfg(unix)]
async fn terminate() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> io::Result<()> {
    std::future::pending().await
}

async fn first_signal<CtrlC, Terminate>(ctrl_c: CtrlC, terminate: Terminate)
where
    CtrlC: Future<Output = io::Result<()>>,
    Terminate: Future<Output = io::Result<()>>,
{
    tokio::select! {
        () = signal_received("SIGINT", ctrl_c) => {},
        () = signal_received("SIGTERM", terminate) => {},
    }
}

/// Completes when `signal` fires. A listener that cannot be installed never
/// completes, so it cannot be mistaken for a stop request.
async fn signal_received<F>(name: &'static str, signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!(signal = name, "Received stop signal"),
        Err(err) => {
            error!(signal = name, error = %err, "Failed to listen for signal");
            std::future::pending::<()>().await;
        }
    }
}
