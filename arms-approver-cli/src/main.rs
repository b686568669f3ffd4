//! ARMS approver CLI
//!
//! Adds three approvers to every account listed in a spreadsheet through an
//! ARMS session open in a browser started with remote debugging.
//!
//! Usage:
//!   chrome.exe --remote-debugging-port=9222        # then log in to ARMS
//!   arms-approver accounts.xlsx --approvers "a,b,c"
//!   arms-approver accounts.xlsx --dry-run          # show what would run

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arms_approver::config::{parse_approvers, parse_duration};
use arms_approver::{
    read_records, AccountRecord, ApproverError, BrowserKind, CdpPortal, CdpSession, Config,
    FailurePolicy, MatchMode, Orchestrator, ProgressStore, RecordOutcome, RunObserver, RunReport,
    RunStatus,
};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

const EXIT_FATAL_SESSION: i32 = 2;
const EXIT_BAD_INPUT: i32 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "arms-approver",
    version,
    about = "Add approvers to ARMS accounts listed in a spreadsheet, resuming after crashes"
)]
struct Args {
    /// Spreadsheet with the account list (.xlsx, .xls, .ods or .csv)
    input: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long, env = "ARMS_CONFIG")]
    config: Option<PathBuf>,

    /// Checkpoint file
    #[arg(long, env = "ARMS_CHECKPOINT")]
    checkpoint: Option<PathBuf>,

    /// Remote debugging endpoint (host:port)
    #[arg(short, long, env = "ARMS_ENDPOINT")]
    endpoint: Option<String>,

    /// Browser that holds the ARMS session
    #[arg(short, long, value_enum)]
    browser: Option<BrowserArg>,

    /// Exactly three approvers, comma-separated
    #[arg(short, long, env = "ARMS_APPROVERS")]
    approvers: Option<String>,

    /// Worksheet name (defaults to the first sheet)
    #[arg(long)]
    sheet: Option<String>,

    /// Header of the OU ID column
    #[arg(long)]
    ou_column: Option<String>,

    /// Header of the account name column
    #[arg(long)]
    name_column: Option<String>,

    /// How the OU ID is matched in the packages table
    #[arg(long, value_enum)]
    match_mode: Option<MatchModeArg>,

    /// Attempts per record before it is marked failed
    #[arg(long)]
    attempts: Option<u32>,

    /// Element wait timeout, e.g. "30s"
    #[arg(long, value_parser = duration_arg)]
    timeout: Option<Duration>,

    /// Autocomplete suggestion timeout, e.g. "20s"
    #[arg(long, value_parser = duration_arg)]
    suggestion_timeout: Option<Duration>,

    /// DOM polling interval, e.g. "250ms"
    #[arg(long, value_parser = duration_arg)]
    poll_interval: Option<Duration>,

    /// What to do after a record fails
    #[arg(long, value_enum)]
    on_failure: Option<FailureArg>,

    /// Exit non-zero if any record failed
    #[arg(long)]
    fail_on_record_error: bool,

    /// Ignore the checkpoint and start from the first record
    #[arg(long)]
    no_resume: bool,

    /// List pending records without connecting to the browser
    #[arg(long)]
    dry_run: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[clap(rename_all = "lower")]
enum BrowserArg {
    Chrome,
    Edge,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[clap(rename_all = "lower")]
enum MatchModeArg {
    Equals,
    StartsWith,
    Plain,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
#[clap(rename_all = "lower")]
enum FailureArg {
    Continue,
    Halt,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn init_logging() -> Result<()> {
    let log_level = std::env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    Ok(())
}

/// Defaults, then the YAML file, then flags.
fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(input) = &args.input {
        config.input.path = Some(input.clone());
    }
    if let Some(sheet) = &args.sheet {
        config.input.columns.sheet = Some(sheet.clone());
    }
    if let Some(column) = &args.ou_column {
        config.input.columns.ou_id_column = column.clone();
    }
    if let Some(column) = &args.name_column {
        config.input.columns.account_name_column = column.clone();
    }
    if let Some(path) = &args.checkpoint {
        config.checkpoint.path = path.clone();
    }
    if args.no_resume {
        config.checkpoint.resume = false;
    }
    if let Some(endpoint) = &args.endpoint {
        config.browser.endpoint = endpoint.clone();
    }
    if let Some(browser) = args.browser {
        config.browser.kind = match browser {
            BrowserArg::Chrome => BrowserKind::Chrome,
            BrowserArg::Edge => BrowserKind::Edge,
        };
    }
    if let Some(mode) = args.match_mode {
        config.portal.match_mode = match mode {
            MatchModeArg::Equals => MatchMode::Equals,
            MatchModeArg::StartsWith => MatchMode::StartsWith,
            MatchModeArg::Plain => MatchMode::Plain,
        };
    }
    if let Some(attempts) = args.attempts {
        config.retry.max_attempts = attempts;
    }
    if let Some(timeout) = args.timeout {
        config.timeouts.element = timeout;
    }
    if let Some(timeout) = args.suggestion_timeout {
        config.timeouts.suggestion = timeout;
    }
    if let Some(interval) = args.poll_interval {
        config.timeouts.poll_interval = interval;
    }
    if let Some(policy) = args.on_failure {
        config.run.on_failure = match policy {
            FailureArg::Continue => FailurePolicy::Continue,
            FailureArg::Halt => FailurePolicy::Halt,
        };
    }
    if args.fail_on_record_error {
        config.run.fail_on_record_error = true;
    }
    if let Some(approvers) = &args.approvers {
        config.run.approvers = parse_approvers(approvers);
    }
    if config.run.approvers.is_empty() && !args.dry_run {
        config.run.approvers = prompt_approvers()?;
    }

    Ok(config)
}

fn prompt_approvers() -> Result<Vec<String>> {
    print!("Enter 3 approvers (comma-separated): ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(parse_approvers(&line))
}

fn endpoint_port(endpoint: &str) -> u16 {
    endpoint
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse().ok())
        .unwrap_or(9222)
}

/// Prints one line per record as the run progresses.
struct ConsoleObserver;

impl RunObserver for ConsoleObserver {
    fn skipped(&mut self, record: &AccountRecord) {
        println!("{} {}", "[SKIP]".dimmed(), record);
    }

    fn started(&mut self, record: &AccountRecord) {
        println!("{} {}", "[....]".cyan(), record);
    }

    fn finished(&mut self, record: &AccountRecord, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Confirmed { attempts, submissions } => println!(
                "{} {} ({} submission(s), attempt {})",
                "[DONE]".green().bold(),
                record,
                submissions,
                attempts
            ),
            RecordOutcome::Failed { attempts, state, error } => println!(
                "{} {} after {} attempt(s) at {}: {}",
                "[FAIL]".red().bold(),
                record,
                attempts,
                state,
                error
            ),
        }
    }
}

fn print_summary(report: &RunReport, checkpoint: &std::path::Path) {
    let s = &report.summary;
    println!();
    println!("{}", "Summary".bold());
    println!("  Confirmed: {}", s.confirmed.to_string().green());
    println!("  Failed:    {}", s.failed.to_string().red());
    println!("  Skipped:   {}", s.skipped);
    if s.not_attempted > 0 {
        println!("  Not attempted: {}", s.not_attempted.to_string().yellow());
    }
    println!(
        "  Checkpoint: {} (last completed index {})",
        checkpoint.display(),
        report.last_completed_index
    );
    match &report.status {
        RunStatus::Completed => println!("Done. Verify the ARMS UI for success alerts."),
        RunStatus::Halted => println!("{}", "Stopped after a failed record.".yellow()),
        RunStatus::Interrupted => println!("{}", "Interrupted. Re-run to resume.".yellow()),
        RunStatus::SessionLost(reason) => {
            println!("{} {}", "Browser session lost:".red().bold(), reason)
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "Invalid configuration:".red().bold(), e);
            return Ok(EXIT_BAD_INPUT);
        }
    };

    let input = match &config.input.path {
        Some(path) => path.clone(),
        None => {
            eprintln!("{}", "No input spreadsheet given (argument or input.path in config).".red());
            return Ok(EXIT_BAD_INPUT);
        }
    };

    let records = match read_records(&input, &config.input.columns) {
        Ok(records) => records,
        Err(e @ (ApproverError::InputFormat(_) | ApproverError::FileNotFound(_))) => {
            eprintln!("{} {}", "Cannot read input:".red().bold(), e);
            return Ok(EXIT_BAD_INPUT);
        }
        Err(e) => return Err(e.into()),
    };

    let store = ProgressStore::new(&config.checkpoint.path);

    if args.dry_run {
        let checkpoint = if config.checkpoint.resume {
            store.load()
        } else {
            Default::default()
        };
        let pending: Vec<_> = records.iter().filter(|r| !checkpoint.is_done(r)).collect();
        println!(
            "{} of {} record(s) pending (checkpoint {}):",
            pending.len(),
            records.len(),
            store.path().display()
        );
        for record in pending {
            println!("  {record}");
        }
        return Ok(0);
    }

    if let Err(e) = config.validate() {
        eprintln!("{} {}", "Invalid configuration:".red().bold(), e);
        return Ok(EXIT_BAD_INPUT);
    }

    let session = match CdpSession::connect(&config.browser.endpoint).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{} {}", "Cannot attach to the browser:".red().bold(), e);
            eprintln!(
                "{}",
                config
                    .browser
                    .kind
                    .launch_instructions(endpoint_port(&config.browser.endpoint))
            );
            return Ok(EXIT_FATAL_SESSION);
        }
    };
    let session = Arc::new(session.with_command_timeout(config.timeouts.element));

    let portal = match CdpPortal::attach(session, config.portal.clone(), config.timeouts.clone()).await {
        Ok(portal) => portal,
        Err(e) => {
            eprintln!("{} {}", "Cannot open the ARMS tab:".red().bold(), e);
            return Ok(EXIT_FATAL_SESSION);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing up and saving progress");
            ctrl_c.cancel();
        }
    });

    let fail_on_record_error = config.run.fail_on_record_error;
    let checkpoint_path = config.checkpoint.path.clone();
    let orchestrator = Orchestrator::new(portal, store, config, cancel);
    let report = orchestrator
        .run(records, &mut ConsoleObserver)
        .await
        .context("run aborted")?;

    print_summary(&report, &checkpoint_path);
    Ok(report.exit_code(fail_on_record_error))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }
    info!("Starting arms-approver");

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}
