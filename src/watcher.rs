//! Filesystem-based completion detection.
//!
//! Runs alongside the agent process and polls the task's watch targets for a
//! Markdown artifact written after the session started. The watcher ends in
//! exactly one way: a matching artifact (`Complete`), the duration cap
//! (`Timeout`), or an external `stop()` (no event). A single `AtomicBool`
//! decides which of the three wins.

use regex::Regex;
use serde::Deserialize;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Which filesystem change counts as evidence of completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectionMode {
    /// Scan a directory for `.md` entries.
    NewFiles,
    /// Check one pre-existing file.
    ModifyExisting,
    /// Whichever of the above the target currently resolves to.
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub kind: TargetKind,
}

impl WatchTarget {
    #[cfg(test)]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TargetKind::File,
        }
    }

    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TargetKind::Directory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub targets: Vec<WatchTarget>,
    pub mode: DetectionMode,
    pub poll_interval: Duration,
    pub max_duration: Duration,
    /// Recorded once by the coordinator before anything is spawned.
    pub session_start: SystemTime,
    /// Absorbs clock and filesystem timestamp granularity skew.
    pub tolerance: Duration,
    /// When set, an artifact only counts if it carries `**Head SHA:** <token>`.
    pub correlation_token: Option<String>,
}

impl WatcherConfig {
    pub fn new(
        targets: Vec<WatchTarget>,
        mode: DetectionMode,
        session_start: SystemTime,
    ) -> Self {
        Self {
            targets,
            mode,
            poll_interval: Duration::from_millis(300),
            max_duration: Duration::from_secs(600),
            session_start,
            tolerance: Duration::from_millis(50),
            correlation_token: None,
        }
    }
}

/// Terminal event emitted by a watcher. At most one per watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Complete { path: PathBuf },
    Timeout,
}

/// A running watcher. Dropping it has the same effect as `stop()`.
pub struct CompletionWatcher {
    stopped: Arc<AtomicBool>,
    cancel: Option<oneshot::Sender<()>>,
    events: oneshot::Receiver<CompletionEvent>,
    received: bool,
    task: JoinHandle<()>,
}

impl CompletionWatcher {
    /// Start polling. The first poll happens immediately rather than after a
    /// full interval. Must be called within a tokio runtime.
    pub fn start(config: WatcherConfig) -> CompletionWatcher {
        let stopped = Arc::new(AtomicBool::new(false));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (event_tx, event_rx) = oneshot::channel();

        tracing::debug!(
            targets = ?config.targets,
            mode = ?config.mode,
            poll_ms = config.poll_interval.as_millis() as u64,
            max_secs = config.max_duration.as_secs(),
            correlated = config.correlation_token.is_some(),
            "completion watcher starting"
        );

        let task = tokio::spawn(watch_loop(
            config,
            Arc::clone(&stopped),
            event_tx,
            cancel_rx,
        ));

        CompletionWatcher {
            stopped,
            cancel: Some(cancel_tx),
            events: event_rx,
            received: false,
            task,
        }
    }

    /// Wait for the terminal event. Returns `None` if the watcher was stopped
    /// externally, or if the event was already taken. Cancel-safe.
    pub async fn recv(&mut self) -> Option<CompletionEvent> {
        if self.received {
            return None;
        }
        let event = (&mut self.events).await.ok();
        self.received = true;
        event
    }

    /// Stop watching. Clears both timers; idempotent and never emits.
    pub fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("completion watcher stopped");
        }
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.task.abort();
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for CompletionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_loop(
    config: WatcherConfig,
    stopped: Arc<AtomicBool>,
    events: oneshot::Sender<CompletionEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let matcher = ArtifactMatcher::new(&config);

    // Both timers live on this task's stack, so every return below clears them.
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(config.max_duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => return,
            _ = &mut deadline => {
                if claim(&stopped) {
                    tracing::info!(
                        max_secs = config.max_duration.as_secs(),
                        "completion watcher timed out"
                    );
                    let _ = events.send(CompletionEvent::Timeout);
                }
                return;
            }
            _ = ticker.tick() => {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(path) = matcher.poll(&config.targets, config.mode) {
                    if claim(&stopped) {
                        tracing::info!(path = %path.display(), "completion artifact detected");
                        let _ = events.send(CompletionEvent::Complete { path });
                    }
                    return;
                }
            }
        }
    }
}

/// Flip `running -> stopped`. Only the caller that wins may emit.
fn claim(stopped: &AtomicBool) -> bool {
    stopped
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Whether an artifact modified at `mtime` postdates the session start,
/// allowing `tolerance` of skew. The comparison is strict.
pub fn is_fresh(mtime: SystemTime, session_start: SystemTime, tolerance: Duration) -> bool {
    match session_start.checked_sub(tolerance) {
        Some(threshold) => mtime > threshold,
        None => true,
    }
}

/// Read-only matching of watch targets. Every filesystem failure here means
/// "no match this cycle", never an error.
pub struct ArtifactMatcher {
    session_start: SystemTime,
    tolerance: Duration,
    token: Option<Regex>,
}

impl ArtifactMatcher {
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            session_start: config.session_start,
            tolerance: config.tolerance,
            token: config.correlation_token.as_deref().map(correlation_pattern),
        }
    }

    /// One polling cycle: targets in order, first qualifying file wins.
    pub fn poll(&self, targets: &[WatchTarget], mode: DetectionMode) -> Option<PathBuf> {
        targets.iter().find_map(|t| self.check_target(t, mode))
    }

    fn check_target(&self, target: &WatchTarget, mode: DetectionMode) -> Option<PathBuf> {
        let meta = match std::fs::metadata(&target.path) {
            Ok(m) => m,
            Err(e) => {
                tracing::trace!(path = %target.path.display(), error = %e, "target not readable");
                return None;
            }
        };
        let actual = if meta.is_dir() {
            TargetKind::Directory
        } else if meta.is_file() {
            TargetKind::File
        } else {
            return None;
        };

        let allowed = match mode {
            DetectionMode::NewFiles => {
                actual == TargetKind::Directory && target.kind == TargetKind::Directory
            }
            DetectionMode::ModifyExisting => {
                actual == TargetKind::File && target.kind == TargetKind::File
            }
            DetectionMode::Both => true,
        };
        if !allowed {
            return None;
        }

        match actual {
            TargetKind::Directory => self.scan_dir(&target.path),
            TargetKind::File => self
                .qualifies(&target.path, &meta)
                .then(|| target.path.clone()),
        }
    }

    fn scan_dir(&self, dir: &Path) -> Option<PathBuf> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::trace!(path = %dir.display(), error = %e, "directory not readable");
                return None;
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "md")
            })
            .collect();
        // read_dir order is unspecified
        candidates.sort();

        candidates.into_iter().find(|path| match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && self.qualifies(path, &meta),
            Err(_) => false,
        })
    }

    fn qualifies(&self, path: &Path, meta: &Metadata) -> bool {
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        if !is_fresh(mtime, self.session_start, self.tolerance) {
            return false;
        }
        match &self.token {
            None => true,
            Some(pattern) => match std::fs::read_to_string(path) {
                Ok(contents) => pattern.is_match(&contents),
                Err(e) => {
                    tracing::trace!(path = %path.display(), error = %e, "artifact not readable");
                    false
                }
            },
        }
    }
}

/// `**Head SHA:** <token>`, label case-insensitive, value optionally in backticks.
fn correlation_pattern(token: &str) -> Regex {
    let pattern = format!(
        r"(?i)\*\*Head SHA:\*\*\s*`?{}(?:[^0-9A-Za-z]|$)",
        regex::escape(token)
    );
    Regex::new(&pattern).expect("escaped token always forms a valid pattern")
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::time::Instant;

    const TOL: Duration = Duration::from_millis(50);

    fn set_mtime(path: &Path, at: SystemTime) {
        filetime::set_file_mtime(path, FileTime::from_system_time(at)).unwrap();
    }

    fn fast_config(targets: Vec<WatchTarget>, mode: DetectionMode) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(50),
            max_duration: Duration::from_millis(1000),
            ..WatcherConfig::new(targets, mode, SystemTime::now())
        }
    }

    #[test]
    fn test_is_fresh_boundaries() {
        let t = SystemTime::now();
        assert!(is_fresh(t, t, TOL));
        assert!(!is_fresh(t - TOL, t, TOL));
        assert!(is_fresh(t - TOL + Duration::from_millis(1), t, TOL));
        assert!(!is_fresh(t - TOL * 2, t, TOL));
        assert!(is_fresh(t + Duration::from_secs(5), t, TOL));
    }

    #[test]
    fn test_new_files_matches_fresh_markdown_only() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now();
        let config = WatcherConfig::new(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
            start,
        );
        let matcher = ArtifactMatcher::new(&config);

        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        let stale = dir.path().join("old.md");
        std::fs::write(&stale, "old").unwrap();
        set_mtime(&stale, start - Duration::from_millis(100));
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        let fresh = dir.path().join("review.md");
        std::fs::write(&fresh, "new").unwrap();
        set_mtime(&fresh, start + Duration::from_millis(10));
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(fresh));
    }

    #[test]
    fn test_mtime_exactly_at_start_matches_but_at_tolerance_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now();
        let path = dir.path().join("PLAN.md");
        std::fs::write(&path, "plan").unwrap();
        let config = WatcherConfig::new(
            vec![WatchTarget::file(&path)],
            DetectionMode::ModifyExisting,
            start,
        );
        let matcher = ArtifactMatcher::new(&config);

        set_mtime(&path, start);
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(path.clone()));

        set_mtime(&path, start - TOL);
        assert_eq!(matcher.poll(&config.targets, config.mode), None);
    }

    #[test]
    fn test_mode_kind_mismatch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("CHANGELOG.md");
        std::fs::write(&file, "fresh").unwrap();
        let start = SystemTime::now() - Duration::from_secs(10);

        // A file target under new-files is never scanned.
        let config = WatcherConfig::new(
            vec![WatchTarget::file(&file)],
            DetectionMode::NewFiles,
            start,
        );
        assert_eq!(ArtifactMatcher::new(&config).poll(&config.targets, config.mode), None);

        // A directory under modify-existing is skipped even with fresh contents.
        let config = WatcherConfig::new(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::ModifyExisting,
            start,
        );
        assert_eq!(ArtifactMatcher::new(&config).poll(&config.targets, config.mode), None);
    }

    #[test]
    fn test_both_mode_follows_what_the_target_resolves_to() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(10);
        let plans = dir.path().join(".plans");
        let plan_file = dir.path().join("PLAN.md");
        let config = WatcherConfig::new(
            vec![WatchTarget::file(&plan_file), WatchTarget::directory(&plans)],
            DetectionMode::Both,
            start,
        );
        let matcher = ArtifactMatcher::new(&config);

        // Neither exists yet: tolerated, no match.
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        std::fs::create_dir(&plans).unwrap();
        let in_dir = plans.join("step-1.md");
        std::fs::write(&in_dir, "x").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(in_dir));

        // Earlier target wins once it qualifies.
        std::fs::write(&plan_file, "x").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(plan_file));
    }

    #[test]
    fn test_correlation_token() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(10);
        let path = dir.path().join("review.md");
        let mut config = WatcherConfig::new(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
            start,
        );
        config.correlation_token = Some("ABC123".to_string());
        let matcher = ArtifactMatcher::new(&config);

        std::fs::write(&path, "# Review\n**Head SHA:** def456\n").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        std::fs::write(&path, "# Review\n**Head SHA:** abc1234\n").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        std::fs::write(&path, "# Review\n**head sha:** `abc123`\n").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(path.clone()));

        std::fs::write(&path, "**Head SHA:** abc123").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(path));
    }

    #[test]
    fn test_unreadable_entries_are_not_a_match() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(10);
        let mut config = WatcherConfig::new(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
            start,
        );
        config.correlation_token = Some("abc123".to_string());
        let matcher = ArtifactMatcher::new(&config);

        // A directory that looks like an artifact, and a file that can't be read as text.
        std::fs::create_dir(dir.path().join("a.md")).unwrap();
        let mut garbled = b"**Head SHA:** abc123 ".to_vec();
        garbled.extend_from_slice(&[0xff, 0xfe, 0xfd]);
        std::fs::write(dir.path().join("b.md"), &garbled).unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        let good = dir.path().join("c.md");
        std::fs::write(&good, "**Head SHA:** abc123\n").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(good));
    }

    #[test]
    fn test_extension_match_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(10);
        let config = WatcherConfig::new(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
            start,
        );
        let matcher = ArtifactMatcher::new(&config);

        std::fs::write(dir.path().join("TODO.MD"), "x").unwrap();
        std::fs::write(dir.path().join("notes.markdown"), "x").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), None);

        let md = dir.path().join("notes.md");
        std::fs::write(&md, "x").unwrap();
        assert_eq!(matcher.poll(&config.targets, config.mode), Some(md));
    }

    #[test]
    fn test_correlation_token_is_escaped() {
        let re = correlation_pattern("a.c");
        assert!(re.is_match("**Head SHA:** a.c\n"));
        assert!(!re.is_match("**Head SHA:** abc\n"));
    }

    #[tokio::test]
    async fn test_new_file_after_start_completes() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
        );
        let began = Instant::now();
        let mut watcher = CompletionWatcher::start(config);

        let path = dir.path().join("review.md");
        let write_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&write_path, "done").unwrap();
        });

        let event = tokio::time::timeout(Duration::from_secs(2), watcher.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(CompletionEvent::Complete { path }));
        // Written at ~100ms, polled every 50ms.
        assert!(began.elapsed() < Duration::from_millis(300));
        assert!(watcher.is_stopped());

        // Only one terminal event per lifetime.
        assert_eq!(watcher.recv().await, None);
    }

    #[tokio::test]
    async fn test_first_poll_does_not_wait_for_the_interval() {
        let dir = tempfile::tempdir().unwrap();
        let start = SystemTime::now() - Duration::from_secs(1);
        let path = dir.path().join("review.md");
        std::fs::write(&path, "done").unwrap();

        let config = WatcherConfig {
            poll_interval: Duration::from_secs(5),
            max_duration: Duration::from_secs(10),
            ..WatcherConfig::new(
                vec![WatchTarget::directory(dir.path())],
                DetectionMode::NewFiles,
                start,
            )
        };
        let began = Instant::now();
        let mut watcher = CompletionWatcher::start(config);

        let event = tokio::time::timeout(Duration::from_secs(2), watcher.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(CompletionEvent::Complete { path }));
        assert!(began.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_file_from_before_start_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
        );
        let path = dir.path().join("review.md");
        std::fs::write(&path, "old").unwrap();
        set_mtime(&path, config.session_start - Duration::from_millis(100));

        let began = Instant::now();
        let mut watcher = CompletionWatcher::start(config);
        let event = watcher.recv().await;
        assert_eq!(event, Some(CompletionEvent::Timeout));
        assert!(began.elapsed() >= Duration::from_millis(950));
        assert!(watcher.is_stopped());
    }

    #[tokio::test]
    async fn test_mismatched_token_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config =
            fast_config(vec![WatchTarget::directory(dir.path())], DetectionMode::NewFiles);
        config.max_duration = Duration::from_millis(400);
        config.correlation_token = Some("abc123".to_string());
        let mut watcher = CompletionWatcher::start(config);

        std::fs::write(dir.path().join("review.md"), "**Head SHA:** fff999\n").unwrap();

        assert_eq!(watcher.recv().await, Some(CompletionEvent::Timeout));
    }

    #[tokio::test]
    async fn test_stop_immediately_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
        );
        let mut watcher = CompletionWatcher::start(config);
        watcher.stop();
        assert!(watcher.is_stopped());

        // A fresh artifact after stop must not be reported.
        std::fs::write(dir.path().join("review.md"), "done").unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), watcher.recv()).await;
        assert!(!matches!(result, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = fast_config(
            vec![WatchTarget::directory(dir.path())],
            DetectionMode::NewFiles,
        );
        let mut watcher = CompletionWatcher::start(config);
        watcher.stop();
        watcher.stop();
        watcher.stop();
        assert!(watcher.is_stopped());
        assert_eq!(watcher.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_after_complete_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "x").unwrap();
        let mut config =
            fast_config(vec![WatchTarget::directory(dir.path())], DetectionMode::NewFiles);
        config.session_start = SystemTime::now() - Duration::from_secs(1);
        let mut watcher = CompletionWatcher::start(config);

        assert!(matches!(
            watcher.recv().await,
            Some(CompletionEvent::Complete { .. })
        ));
        watcher.stop();
        assert_eq!(watcher.recv().await, None);
    }
}
