//! Single session lifecycle: start the completion watcher and the agent
//! together, then race artifact detection, agent exit, and host signals.

use crate::config::Config;
use crate::orchestrator::{self, AgentHandle, AgentResult, OrchestratorError, SessionOptions};
use crate::signals::{self, Shutdown};
use crate::tasks;
use crate::terminal;
use crate::watcher::{CompletionEvent, CompletionWatcher};
use std::future::Future;
use std::path::PathBuf;
use std::time::SystemTime;

const GREEN: &str = "\x1b[0;32m";
const YELLOW: &str = "\x1b[0;33m";
const NC: &str = "\x1b[0m";

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The task's artifact appeared; the agent was told to exit.
    Completed { artifact: PathBuf },
    /// The agent exited on its own. `timed_out` is set when the watcher had
    /// already given up by then.
    Exited { exit_code: i32, timed_out: bool },
    /// The host was asked to stop; the agent was killed.
    Interrupted(Shutdown),
}

impl SessionOutcome {
    /// Exit status for the host process.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Completed { .. } => 0,
            SessionOutcome::Exited { exit_code, .. } => *exit_code,
            SessionOutcome::Interrupted(sig) => sig.exit_code(),
        }
    }
}

/// Errors that can occur during session execution.
#[derive(Debug)]
pub enum SessionError {
    /// Validating, locating, or launching the agent failed.
    Agent(OrchestratorError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Agent(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Agent(e) => Some(e),
        }
    }
}

impl From<OrchestratorError> for SessionError {
    fn from(e: OrchestratorError) -> Self {
        SessionError::Agent(e)
    }
}

/// The parts of a running agent the coordinator needs.
pub trait AgentControl {
    async fn wait(&mut self) -> AgentResult;
    fn kill(&self) -> Result<(), OrchestratorError>;
    fn release_terminal(&self);
}

impl AgentControl for AgentHandle {
    async fn wait(&mut self) -> AgentResult {
        AgentHandle::wait(self).await
    }

    fn kill(&self) -> Result<(), OrchestratorError> {
        AgentHandle::kill(self)
    }

    fn release_terminal(&self) {
        AgentHandle::release_terminal(self)
    }
}

/// What the caller knows about the task being run.
pub struct SessionRequest<'a> {
    pub task_id: &'a str,
    pub prompt: &'a str,
    pub head_sha: Option<&'a str>,
    pub options: SessionOptions,
    /// Race the watcher against the agent. Only honoured in interactive mode
    /// on a terminal that supports it.
    pub auto_exit: bool,
}

/// Run one agent session to its end.
pub async fn run_session(
    config: &Config,
    request: SessionRequest<'_>,
) -> Result<SessionOutcome, SessionError> {
    // Fixed before either side starts; artifacts are judged against it.
    let session_start = SystemTime::now();
    tracing::info!(
        task_id = request.task_id,
        started = %chrono::DateTime::<chrono::Local>::from(session_start).format("%H:%M:%S%.3f"),
        "session starting"
    );

    let wants_race = request.options.interactive && request.auto_exit;
    let armed = wants_race && terminal::supports_auto_exit();
    if wants_race && !armed {
        tracing::warn!("auto-exit needs an interactive unix terminal; running without it");
        eprintln!("{YELLOW}Auto-exit is unavailable here; exit the agent manually when done.{NC}");
    }

    if !armed {
        let mut handle =
            orchestrator::spawn_agent(&config.agent, request.prompt, &request.options)?;
        tracing::debug!(pid = ?handle.pid(), "agent running without completion watcher");
        let outcome = tokio::select! {
            result = handle.wait() => {
                if !request.options.interactive {
                    print!("{}", result.output);
                }
                SessionOutcome::Exited { exit_code: result.exit_code, timed_out: false }
            }
            sig = signals::shutdown_signal() => interrupt(&handle, sig),
        };
        return Ok(outcome);
    }

    let watcher_config =
        tasks::watcher_config(config, request.task_id, session_start, request.head_sha);
    let mut watcher = CompletionWatcher::start(watcher_config);
    let mut handle =
        match orchestrator::spawn_agent(&config.agent, request.prompt, &request.options) {
            Ok(h) => h,
            Err(e) => {
                watcher.stop();
                return Err(e.into());
            }
        };
    tracing::debug!(pid = ?handle.pid(), "agent running with completion watcher");

    Ok(race(&mut watcher, &mut handle, signals::shutdown_signal()).await)
}

fn interrupt<A: AgentControl>(agent: &A, sig: Shutdown) -> SessionOutcome {
    tracing::info!(?sig, "shutdown requested, killing agent");
    if let Err(e) = agent.kill() {
        tracing::warn!(error = %e, "failed to kill agent on shutdown");
    }
    agent.release_terminal();
    SessionOutcome::Interrupted(sig)
}

/// Race the watcher's terminal event against the agent's own exit.
///
/// On `Complete` the agent is killed and the session succeeds whether or not
/// the kill worked. On `Timeout` the agent is left running for the user to
/// finish by hand.
pub async fn race<A: AgentControl>(
    watcher: &mut CompletionWatcher,
    agent: &mut A,
    shutdown: impl Future<Output = Shutdown>,
) -> SessionOutcome {
    tokio::pin!(shutdown);

    tokio::select! {
        event = watcher.recv() => {
            watcher.stop();
            match event {
                Some(CompletionEvent::Complete { path }) => {
                    if let Err(e) = agent.kill() {
                        tracing::warn!(error = %e, "artifact found but agent did not die cleanly");
                    }
                    agent.release_terminal();
                    eprint!("\r\n{GREEN}Task complete: {}{NC}\r\n", path.display());
                    return SessionOutcome::Completed { artifact: path };
                }
                Some(CompletionEvent::Timeout) => {
                    eprint!(
                        "\r\n{YELLOW}No completion artifact detected yet; \
                         exit the agent manually when it is done.{NC}\r\n"
                    );
                }
                None => tracing::debug!("watcher ended without an event"),
            }
        }
        result = agent.wait() => {
            watcher.stop();
            return SessionOutcome::Exited { exit_code: result.exit_code, timed_out: false };
        }
        sig = &mut shutdown => {
            watcher.stop();
            return interrupt(agent, sig);
        }
    }

    tokio::select! {
        result = agent.wait() => SessionOutcome::Exited {
            exit_code: result.exit_code,
            timed_out: true,
        },
        sig = &mut shutdown => interrupt(agent, sig),
    }
}
