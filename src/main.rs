mod config;
mod model;
mod orchestrator;
mod session;
mod signals;
mod tasks;
mod terminal;
mod vcs;
mod watcher;

use clap::Parser;
use config::{Config, ConfigError};
use orchestrator::{OrchestratorError, OutputFormat, SessionOptions};
use session::{SessionError, SessionRequest};
use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Environment toggle for verbose diagnostics on stderr.
const DEBUG_ENV: &str = "PROMPTRUN_DEBUG";

/// Run an interactive AI coding agent in a pseudo-terminal, type a task prompt
/// into it, and exit as soon as the task's output artifact appears.
#[derive(Parser, Debug)]
#[command(name = "promptrun", version, about)]
pub struct Cli {
    /// Task type; decides which files count as the finished artifact
    #[arg(value_name = "TASK")]
    task: String,

    /// Prompt text. `{head_sha}` and `{branch}` are substituted
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,

    /// Read the prompt from a file instead (default: stdin)
    #[arg(short = 'f', long)]
    prompt_file: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, default_value = "promptrun.toml")]
    config: PathBuf,

    /// Model for the agent (validated before anything is spawned)
    #[arg(short, long)]
    model: Option<String>,

    /// Run the agent headless in print mode and submit the prompt automatically
    #[arg(short, long)]
    print: bool,

    /// Agent output format in print mode
    #[arg(long, value_enum, requires = "print")]
    output_format: Option<OutputFormat>,

    /// Milliseconds to wait before typing the prompt (overrides config)
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Artifact poll interval in milliseconds (overrides config)
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Give up watching for the artifact after this many minutes (overrides config)
    #[arg(long)]
    max_minutes: Option<u64>,

    /// Keep the agent open after the artifact appears
    #[arg(long)]
    no_auto_exit: bool,

    /// Validate config and model, print the resolved command and watch targets, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watcher polls, spawn details)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug)]
enum AppError {
    Config(ConfigError),
    Prompt(String),
    Session(SessionError),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "{e}"),
            AppError::Prompt(msg) => write!(f, "{msg}"),
            AppError::Session(e) => write!(f, "{e}"),
        }
    }
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            AppError::Session(SessionError::Agent(OrchestratorError::InvalidModel(_))) => 2,
            AppError::Session(SessionError::Agent(
                OrchestratorError::NotFound { .. } | OrchestratorError::ShellNotFound { .. },
            )) => 127,
            _ => 1,
        }
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        AppError::Session(e)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Session(SessionError::Agent(e))
    }
}

fn debug_env_enabled(value: Option<&str>) -> bool {
    match value {
        Some(v) => {
            let v = v.trim();
            !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
        }
        None => false,
    }
}

fn init_logging(verbose: bool) {
    let debug = verbose || debug_env_enabled(std::env::var(DEBUG_ENV).ok().as_deref());
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Merge CLI overrides into the loaded config.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(ms) = cli.delay_ms {
        config.agent.prompt_delay_ms = ms;
    }
    if let Some(ms) = cli.poll_ms {
        config.watcher.poll_interval_ms = ms.max(1);
    }
    if let Some(minutes) = cli.max_minutes {
        config.watcher.max_duration_secs = minutes.saturating_mul(60);
    }
}

fn session_options(config: &Config, cli: &Cli) -> SessionOptions {
    SessionOptions {
        print: cli.print,
        interactive: !cli.print,
        output_format: cli.output_format,
        model: cli.model.clone(),
        prompt_delay: config.agent.prompt_delay(),
    }
}

fn read_prompt(cli: &Cli) -> Result<String, AppError> {
    if let Some(text) = &cli.prompt {
        return Ok(text.clone());
    }
    if let Some(path) = &cli.prompt_file {
        return std::fs::read_to_string(path)
            .map_err(|e| AppError::Prompt(format!("failed to read {}: {e}", path.display())));
    }
    if std::io::stdin().is_terminal() {
        return Err(AppError::Prompt(
            "no prompt given: use --prompt, --prompt-file, or pipe it on stdin".to_string(),
        ));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| AppError::Prompt(format!("failed to read stdin: {e}")))?;
    Ok(buf)
}

fn print_dry_run(
    config: &Config,
    cli: &Cli,
    options: &SessionOptions,
    head_sha: Option<&str>,
) -> Result<(), AppError> {
    let args = orchestrator::build_args(&config.agent, options)?;
    let wc = tasks::watcher_config(config, &cli.task, std::time::SystemTime::now(), head_sha);

    println!("promptrun v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", cli.config.display());
    println!("Shell:       {}", config.agent.resolved_shell());
    println!("Command:     {}", args.join(" "));
    println!("Delay:       {:?}", options.prompt_delay);
    println!("Task:        {} ({:?})", cli.task, wc.mode);
    for target in &wc.targets {
        println!("  watch {:?} {}", target.kind, target.path.display());
    }
    println!("Correlation: {}", wc.correlation_token.as_deref().unwrap_or("none"));
    println!("Polling:     every {:?}, give up after {:?}", wc.poll_interval, wc.max_duration);
    println!("Dry run: config validated, not running.");
    Ok(())
}

async fn run(cli: Cli) -> Result<i32, AppError> {
    let mut config = Config::load(&cli.config).map_err(AppError::Config)?;
    apply_overrides(&mut config, &cli);
    let options = session_options(&config, &cli);

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let head_sha = vcs::head_sha(&cwd);
    let branch = vcs::current_branch(&cwd);
    tracing::debug!(?head_sha, ?branch, "resolved revision");

    if cli.dry_run {
        print_dry_run(&config, &cli, &options, head_sha.as_deref())?;
        return Ok(0);
    }

    let template = read_prompt(&cli)?;
    let prompt = vcs::render_prompt(&template, head_sha.as_deref(), branch.as_deref());

    let request = SessionRequest {
        task_id: &cli.task,
        prompt: &prompt,
        head_sha: head_sha.as_deref(),
        options,
        auto_exit: !cli.no_auto_exit,
    };
    let outcome = session::run_session(&config, request).await?;
    tracing::info!(?outcome, "session finished");
    Ok(outcome.exit_code())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("promptrun: {e}");
            e.exit_code()
        }
    };
    // Give the stdout forwarding thread's last write a moment to land.
    tokio::time::sleep(Duration::from_millis(20)).await;
    std::process::exit(code);
}
