use crate::config::{Config, TargetConfig, TaskConfig};
use crate::watcher::{DetectionMode, TargetKind, WatchTarget, WatcherConfig};
use std::path::PathBuf;
use std::time::SystemTime;

/// Task types known without any config. A `[[tasks]]` entry with the same id
/// replaces the built-in one.
pub fn builtin_tasks() -> Vec<TaskConfig> {
    vec![
        TaskConfig {
            id: "review".to_string(),
            mode: DetectionMode::NewFiles,
            correlate: true,
            targets: vec![target(".reviews", TargetKind::Directory)],
        },
        TaskConfig {
            id: "plan".to_string(),
            mode: DetectionMode::Both,
            correlate: false,
            targets: vec![
                target("PLAN.md", TargetKind::File),
                target(".plans", TargetKind::Directory),
            ],
        },
        TaskConfig {
            id: "changelog".to_string(),
            mode: DetectionMode::ModifyExisting,
            correlate: false,
            targets: vec![target("CHANGELOG.md", TargetKind::File)],
        },
    ]
}

fn target(path: &str, kind: TargetKind) -> TargetConfig {
    TargetConfig {
        path: PathBuf::from(path),
        kind,
    }
}

/// Find the detection rules for `task_id`: config entries first, then built-ins.
pub fn lookup(config: &Config, task_id: &str) -> Option<TaskConfig> {
    config
        .tasks
        .iter()
        .find(|t| t.id == task_id)
        .cloned()
        .or_else(|| builtin_tasks().into_iter().find(|t| t.id == task_id))
}

/// Build the watcher configuration for one session.
///
/// Unknown task ids fall back to scanning the configured output directories in
/// `new-files` mode, so a watcher can always be started.
pub fn watcher_config(
    config: &Config,
    task_id: &str,
    session_start: SystemTime,
    head_sha: Option<&str>,
) -> WatcherConfig {
    let (targets, mode, correlate) = match lookup(config, task_id) {
        Some(task) => {
            let targets = task
                .targets
                .iter()
                .map(|t| WatchTarget {
                    path: t.path.clone(),
                    kind: t.kind,
                })
                .collect();
            (targets, task.mode, task.correlate)
        }
        None => {
            tracing::debug!(task_id, "unknown task, watching fallback directories");
            let targets = config
                .watcher
                .fallback_dirs
                .iter()
                .map(WatchTarget::directory)
                .collect();
            (targets, DetectionMode::NewFiles, false)
        }
    };

    let correlation_token = match (correlate, head_sha) {
        (true, Some(sha)) => Some(sha.to_string()),
        (true, None) => {
            tracing::warn!(task_id, "no head revision available, artifacts will not be correlated");
            None
        }
        (false, _) => None,
    };

    WatcherConfig {
        poll_interval: config.watcher.poll_interval(),
        max_duration: config.watcher.max_duration(),
        tolerance: config.watcher.tolerance(),
        correlation_token,
        ..WatcherConfig::new(targets, mode, session_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builtin_review_is_correlated() {
        let config = Config::default();
        let start = SystemTime::now();
        let wc = watcher_config(&config, "review", start, Some("abc123"));
        assert_eq!(wc.mode, DetectionMode::NewFiles);
        assert_eq!(wc.targets, vec![WatchTarget::directory(".reviews")]);
        assert_eq!(wc.correlation_token.as_deref(), Some("abc123"));
        assert_eq!(wc.session_start, start);
        assert_eq!(wc.poll_interval, Duration::from_millis(300));
        assert_eq!(wc.max_duration, Duration::from_secs(600));
    }

    #[test]
    fn test_correlated_task_without_revision_runs_uncorrelated() {
        let wc = watcher_config(&Config::default(), "review", SystemTime::now(), None);
        assert_eq!(wc.correlation_token, None);
    }

    #[test]
    fn test_uncorrelated_task_ignores_revision() {
        let wc = watcher_config(&Config::default(), "plan", SystemTime::now(), Some("abc"));
        assert_eq!(wc.mode, DetectionMode::Both);
        assert_eq!(wc.targets.len(), 2);
        assert_eq!(wc.correlation_token, None);
    }

    #[test]
    fn test_unknown_task_falls_back_to_known_dirs() {
        let config = Config::default();
        let wc = watcher_config(&config, "mystery", SystemTime::now(), Some("abc"));
        assert_eq!(wc.mode, DetectionMode::NewFiles);
        assert_eq!(
            wc.targets,
            vec![
                WatchTarget::directory(".reviews"),
                WatchTarget::directory(".plans"),
                WatchTarget::directory(".reports"),
            ]
        );
        assert_eq!(wc.correlation_token, None);
    }

    #[test]
    fn test_config_task_overrides_builtin() {
        let mut config = Config::default();
        config.watcher.poll_interval_ms = 50;
        config.tasks.push(TaskConfig {
            id: "review".to_string(),
            mode: DetectionMode::ModifyExisting,
            correlate: false,
            targets: vec![target("REVIEW.md", TargetKind::File)],
        });

        let wc = watcher_config(&config, "review", SystemTime::now(), Some("abc"));
        assert_eq!(wc.mode, DetectionMode::ModifyExisting);
        assert_eq!(wc.targets, vec![WatchTarget::file("REVIEW.md")]);
        assert_eq!(wc.correlation_token, None);
        assert_eq!(wc.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        assert!(lookup(&Config::default(), "nope").is_none());
        assert!(lookup(&Config::default(), "changelog").is_some());
    }
}
