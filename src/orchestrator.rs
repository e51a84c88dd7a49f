//! Agent process control through a pseudo-terminal.
//!
//! The agent is launched via the platform shell under a pty so it behaves as if
//! a person were at the keyboard. The prompt is delivered by writing to the pty
//! after a short delay, never by placing it on the command line.

use crate::config::AgentConfig;
use crate::model::{self, ModelError};
use crate::terminal::RawModeGuard;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long the output reader may keep draining after the child exits.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
        }
    }
}

/// Per-session knobs for how the agent is launched and driven.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pass `-p` (print mode) to the agent.
    pub print: bool,
    /// Proxy the local terminal into the pty instead of submitting the prompt.
    pub interactive: bool,
    /// Only meaningful together with `print`.
    pub output_format: Option<OutputFormat>,
    pub model: Option<String>,
    /// Wait before typing the prompt, so the agent's own input is ready.
    pub prompt_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            print: false,
            interactive: true,
            output_format: None,
            model: None,
            prompt_delay: Duration::from_secs(1),
        }
    }
}

/// What the agent left behind: everything it wrote to the pty, and its exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResult {
    pub output: String,
    pub exit_code: i32,
}

#[derive(Debug)]
pub enum OrchestratorError {
    /// The model name failed validation; nothing was spawned.
    InvalidModel(ModelError),
    /// The agent program is not on PATH.
    NotFound { command: String },
    /// The shell the agent is launched through does not exist.
    ShellNotFound { shell: String },
    /// Opening or wiring up the pseudo-terminal failed.
    Pty { context: &'static str, message: String },
    /// The shell could not be started.
    Spawn { shell: String, message: String },
    /// Killing the agent failed.
    Kill { message: String },
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::InvalidModel(e) => write!(f, "{e}"),
            OrchestratorError::NotFound { command } => write!(
                f,
                "`{command}` was not found on PATH. \
                 Install the agent CLI or set [agent].command in promptrun.toml"
            ),
            OrchestratorError::ShellNotFound { shell } => write!(
                f,
                "shell `{shell}` does not exist. \
                 Set [agent].shell in promptrun.toml or fix $SHELL"
            ),
            OrchestratorError::Pty { context, message } => {
                write!(f, "failed to {context}: {message}")
            }
            OrchestratorError::Spawn { shell, message } => {
                write!(f, "failed to launch agent via {shell}: {message}")
            }
            OrchestratorError::Kill { message } => write!(f, "failed to kill agent: {message}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OrchestratorError::InvalidModel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModelError> for OrchestratorError {
    fn from(e: ModelError) -> Self {
        OrchestratorError::InvalidModel(e)
    }
}

/// Build the agent argv: `<command> [--model <name>] [-p [--output-format <fmt>]]`.
///
/// The model is the only user-influenced token and must resolve first.
pub fn build_args(
    agent: &AgentConfig,
    options: &SessionOptions,
) -> Result<Vec<String>, OrchestratorError> {
    let mut args = vec![agent.command.clone()];
    if let Some(requested) = &options.model {
        let canonical = model::resolve(requested)?;
        args.push("--model".to_string());
        args.push(canonical.to_string());
    }
    if options.print {
        args.push("-p".to_string());
        if let Some(format) = options.output_format {
            args.push("--output-format".to_string());
            args.push(format.as_str().to_string());
        }
    }
    Ok(args)
}

/// Wrap an argv in the platform shell: `$SHELL -c "..."` or `cmd.exe /C ...`.
fn shell_command(shell: &str, args: &[String]) -> CommandBuilder {
    let line = args.join(" ");
    let mut cmd = CommandBuilder::new(shell);
    if cfg!(windows) {
        cmd.args(["/C", line.as_str()]);
    } else {
        cmd.args(["-c", line.as_str()]);
    }
    cmd
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running agent. Lives from spawn until its exit has been observed.
pub struct AgentHandle {
    pid: Option<u32>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    terminal: Arc<Mutex<Option<RawModeGuard>>>,
    result: JoinHandle<AgentResult>,
    finished: Option<AgentResult>,
    // Held so the pty stays open for the life of the handle.
    _master: Box<dyn MasterPty + Send>,
}

impl AgentHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Type `text` into the agent's terminal.
    #[allow(dead_code)]
    pub fn write(&self, text: &str) -> std::io::Result<()> {
        write_pty(&self.writer, text)
    }

    /// Type the prompt after `delay`; press Enter for it when `submit` is set.
    fn schedule_prompt(&self, prompt: String, delay: Duration, submit: bool) {
        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut result = write_pty(&writer, &prompt);
            if result.is_ok() && submit {
                result = write_pty(&writer, "\r");
            }
            match result {
                Ok(()) => tracing::debug!(bytes = prompt.len(), submit, "prompt injected"),
                Err(e) => tracing::warn!(error = %e, "failed to inject prompt"),
            }
        });
    }

    /// Terminate the agent and restore the local terminal.
    ///
    /// On unix the whole process group gets SIGHUP first (the pty child is a
    /// session leader), then the pty's own killer runs.
    pub fn kill(&self) -> Result<(), OrchestratorError> {
        self.release_terminal();

        #[cfg(unix)]
        let group_signalled = match self.pid {
            Some(pid) => {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                match killpg(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(pid, error = %e, "killpg failed");
                        false
                    }
                }
            }
            None => false,
        };
        #[cfg(not(unix))]
        let group_signalled = false;

        match lock(&self.killer).kill() {
            Ok(()) => {
                tracing::info!(pid = ?self.pid, "agent killed");
                Ok(())
            }
            Err(_) if group_signalled => Ok(()),
            Err(e) => Err(OrchestratorError::Kill {
                message: e.to_string(),
            }),
        }
    }

    /// Leave raw mode if this handle put the terminal in it. Idempotent.
    pub fn release_terminal(&self) {
        if let Some(mut guard) = lock(&self.terminal).take() {
            guard.release();
        }
    }

    /// Wait for the agent to exit. Cancel-safe; returns the cached result on
    /// later calls.
    pub async fn wait(&mut self) -> AgentResult {
        if let Some(result) = &self.finished {
            return result.clone();
        }
        let result = match (&mut self.result).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "agent waiter task failed");
                AgentResult {
                    output: String::new(),
                    exit_code: -1,
                }
            }
        };
        self.finished = Some(result.clone());
        result
    }
}

fn write_pty(writer: &Mutex<Box<dyn Write + Send>>, text: &str) -> std::io::Result<()> {
    let mut w = lock(writer);
    w.write_all(text.as_bytes())?;
    w.flush()
}

/// Spawn the agent under a pty and schedule the prompt injection.
///
/// Returns as soon as the process is running. Must be called within a tokio
/// runtime.
pub fn spawn_agent(
    agent: &AgentConfig,
    prompt: &str,
    options: &SessionOptions,
) -> Result<AgentHandle, OrchestratorError> {
    // Validation happens before anything touches the system.
    let args = build_args(agent, options)?;

    if which::which(&agent.command).is_err() {
        return Err(OrchestratorError::NotFound {
            command: agent.command.clone(),
        });
    }
    let shell = agent.resolved_shell();
    if which::which(&shell).is_err() {
        return Err(OrchestratorError::ShellNotFound { shell });
    }

    let pty = native_pty_system()
        .openpty(PtySize {
            rows: agent.rows,
            cols: agent.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| OrchestratorError::Pty {
            context: "open pty",
            message: e.to_string(),
        })?;

    let mut cmd = shell_command(&shell, &args);
    for (key, value) in std::env::vars() {
        cmd.env(key, value);
    }
    if std::env::var_os("TERM").is_none() {
        cmd.env("TERM", "xterm-256color");
    }
    if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }

    tracing::info!(shell = %shell, args = ?args, "spawning agent session");

    let mut child = pty.slave.spawn_command(cmd).map_err(|e| {
        let not_found = e
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
        if not_found {
            OrchestratorError::ShellNotFound {
                shell: shell.clone(),
            }
        } else {
            OrchestratorError::Spawn {
                shell: shell.clone(),
                message: e.to_string(),
            }
        }
    })?;
    drop(pty.slave);

    let pid = child.process_id();
    tracing::info!(pid = ?pid, "agent subprocess started");

    let pipes = pty
        .master
        .try_clone_reader()
        .map_err(|e| ("clone pty reader", e))
        .and_then(|reader| {
            let writer = pty
                .master
                .take_writer()
                .map_err(|e| ("take pty writer", e))?;
            Ok((reader, writer))
        });
    let (reader, writer) = match pipes {
        Ok(pipes) => pipes,
        Err((context, e)) => return Err(abandon_child(child.as_mut(), context, e.to_string())),
    };
    let writer: Arc<Mutex<Box<dyn Write + Send>>> = Arc::new(Mutex::new(writer));
    let killer = child.clone_killer();

    let terminal = Arc::new(Mutex::new(None));
    if options.interactive {
        match RawModeGuard::acquire() {
            Ok(guard) => *lock(&terminal) = Some(guard),
            Err(e) => tracing::warn!(
                error = %e,
                "could not enter raw mode; local input is line-buffered"
            ),
        }
        proxy_stdin(Arc::clone(&writer));
    }

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let reader_done = read_output(reader, Arc::clone(&buffer), options.interactive);

    let terminal_for_exit = Arc::clone(&terminal);
    let result = tokio::spawn(async move {
        let exit_code = match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => status.exit_code() as i32,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for agent");
                -1
            }
            Err(e) => {
                tracing::warn!(error = %e, "agent wait task panicked");
                -1
            }
        };

        // Terminal comes back before anything else is printed.
        if let Some(mut guard) = lock(&terminal_for_exit).take() {
            guard.release();
        }

        if tokio::time::timeout(OUTPUT_DRAIN, reader_done).await.is_err() {
            tracing::debug!("pty output still open after exit, returning what was read");
        }
        let output = String::from_utf8_lossy(&lock(&buffer)).into_owned();

        tracing::info!(exit_code, output_bytes = output.len(), "agent session completed");
        AgentResult { output, exit_code }
    });

    let handle = AgentHandle {
        pid,
        writer,
        killer: Mutex::new(killer),
        terminal,
        result,
        finished: None,
        _master: pty.master,
    };
    handle.schedule_prompt(prompt.to_string(), options.prompt_delay, !options.interactive);
    Ok(handle)
}

/// Kill a child whose pty wiring failed after spawn; nothing else would reap it.
fn abandon_child(
    child: &mut (dyn Child + Send + Sync),
    context: &'static str,
    message: String,
) -> OrchestratorError {
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, context, "failed to kill agent after pty setup error");
    }
    OrchestratorError::Pty { context, message }
}

/// Drain the pty on a dedicated thread. A blocking pty read can outlive the
/// child (grandchildren may hold the slave open), so this stays off the
/// runtime's blocking pool. The returned receiver fires at EOF.
fn read_output(
    mut reader: Box<dyn Read + Send>,
    buffer: Arc<Mutex<Vec<u8>>>,
    forward: bool,
) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    lock(&buffer).extend_from_slice(&buf[..n]);
                    if forward {
                        let _ = stdout.write_all(&buf[..n]);
                        let _ = stdout.flush();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO is how Linux reports the slave side closing.
                Err(_) => break,
            }
        }
        let _ = done_tx.send(());
    });
    done_rx
}

/// Forward local keystrokes into the pty until either side goes away.
fn proxy_stdin(writer: Arc<Mutex<Box<dyn Write + Send>>>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let mut w = lock(&writer);
            if w.write_all(&buf[..n]).and_then(|_| w.flush()).is_err() {
                break;
            }
        }
    });
}
