//! Version-control lookups used for prompt placeholders and artifact correlation.

use std::path::Path;
use std::process::Command;

/// Run a git query in `dir` and return its trimmed stdout, or None on any failure.
fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = match Command::new("git").args(args).current_dir(dir).output() {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!(error = %e, "git not available");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(
            args = ?args,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "git query failed"
        );
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Full SHA of HEAD.
pub fn head_sha(dir: &Path) -> Option<String> {
    git_output(dir, &["rev-parse", "HEAD"])
}

/// Current branch name; None on a detached HEAD.
pub fn current_branch(dir: &Path) -> Option<String> {
    git_output(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).filter(|b| b != "HEAD")
}

/// Substitute `{head_sha}` and `{branch}` in a prompt template.
pub fn render_prompt(template: &str, head_sha: Option<&str>, branch: Option<&str>) -> String {
    template
        .replace("{head_sha}", head_sha.unwrap_or("unknown"))
        .replace("{branch}", branch.unwrap_or("unknown"))
}
