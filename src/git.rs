//! The external git tool, invoked as an argv vector. No shell is ever
//! involved, so paths need no quoting and exit codes arrive undamaged.

use std::process::{Command, Output, Stdio};
use std::time::Duration;

use camino::Utf8Path;

use crate::error::{CacheError, Result};
use crate::progress::Spinner;

const GIT: &str = "git";

/// Total attempts for network-sensitive invocations.
const NETWORK_ATTEMPTS: u32 = 3;
/// First retry delay; doubled per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(16);

/// Git exit codes that retrying cannot fix: usage errors and
/// authentication/irrecoverable failures.
const TERMINAL_EXIT_CODES: [i32; 2] = [1, 128];

#[derive(Debug, Clone)]
pub struct GitTool {
    verbose: bool,
}

impl GitTool {
    pub fn new(verbose: bool) -> Self {
        GitTool { verbose }
    }

    fn command(&self, dir: Option<&Utf8Path>, args: &[&str]) -> Command {
        let mut cmd = Command::new(GIT);
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn capture(&self, dir: Option<&Utf8Path>, args: &[&str]) -> Result<Output> {
        if self.verbose {
            println!("git-cache: running git {}", args.join(" "));
        }
        self.command(dir, args)
            .output()
            .map_err(|e| CacheError::Git(format!("failed to spawn git {}: {e}", args.join(" "))))
    }

    /// Run to completion, requiring exit code zero.
    pub fn run(&self, dir: Option<&Utf8Path>, args: &[&str]) -> Result<()> {
        let out = self.capture(dir, args)?;
        if out.status.success() {
            Ok(())
        } else {
            Err(failure(args, &out))
        }
    }

    /// Run and return trimmed stdout, requiring exit code zero.
    pub fn output(&self, dir: Option<&Utf8Path>, args: &[&str]) -> Result<String> {
        let out = self.capture(dir, args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            Err(failure(args, &out))
        }
    }

    /// Run and return the raw exit code (-1 when killed by a signal).
    pub fn exit_code(&self, dir: Option<&Utf8Path>, args: &[&str]) -> Result<i32> {
        let out = self.capture(dir, args)?;
        Ok(out.status.code().unwrap_or(-1))
    }

    /// Whether the command exits zero. Probe helper; never retries.
    pub fn succeeds(&self, dir: Option<&Utf8Path>, args: &[&str]) -> bool {
        self.capture(dir, args)
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Run a network-sensitive command with bounded retry.
    ///
    /// Exit code 0 succeeds; 1 and 128 surface immediately; anything else is
    /// retried with exponential backoff (1 s doubling, capped at 16 s), three
    /// attempts total. Exhausting the retries is still a git failure, not a
    /// network one. A spinner with `label` runs while the child does and is
    /// cleared before any diagnostic.
    pub fn run_network(&self, dir: Option<&Utf8Path>, args: &[&str], label: &str) -> Result<()> {
        let mut delay = INITIAL_BACKOFF;
        for attempt in 1..=NETWORK_ATTEMPTS {
            let spinner = Spinner::start(label);
            let out = self.capture(dir, args);
            spinner.finish();

            let out = out?;
            if out.status.success() {
                return Ok(());
            }
            let code = out.status.code().unwrap_or(-1);
            if TERMINAL_EXIT_CODES.contains(&code) {
                return Err(failure(args, &out));
            }
            if attempt == NETWORK_ATTEMPTS {
                return Err(CacheError::Git(format!(
                    "{label}: git exited with code {code} after {NETWORK_ATTEMPTS} attempts{}",
                    stderr_tail(&out)
                )));
            }
            tracing::warn!(
                "{label}: git exited with code {code}, retrying in {}s",
                delay.as_secs()
            );
            std::thread::sleep(delay);
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        unreachable!("retry loop always returns");
    }
}

fn failure(args: &[&str], out: &Output) -> CacheError {
    CacheError::Git(format!(
        "git {} exited with code {}{}",
        args.join(" "),
        out.status.code().unwrap_or(-1),
        stderr_tail(out)
    ))
}

/// The last few stderr lines, indented, for error messages.
fn stderr_tail(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr);
    let lines: Vec<&str> = stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    let tail = &lines[lines.len().saturating_sub(3)..];
    format!(": {}", tail.join(" / "))
}

#[cfg(test)]
pub(crate) fn git_available() -> bool {
    Command::new(GIT)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_returns_trimmed_stdout() {
        if !git_available() {
            return;
        }
        let git = GitTool::new(false);
        let version = git.output(None, &["--version"]).unwrap();
        assert!(version.starts_with("git version"));
    }

    #[test]
    fn usage_errors_surface_as_git_errors() {
        if !git_available() {
            return;
        }
        let git = GitTool::new(false);
        let err = git
            .run(None, &["definitely-not-a-subcommand"])
            .unwrap_err();
        assert!(matches!(err, CacheError::Git(_)));
    }

    #[test]
    fn probe_helper_does_not_error() {
        if !git_available() {
            return;
        }
        let git = GitTool::new(false);
        assert!(git.succeeds(None, &["--version"]));
        assert!(!git.succeeds(None, &["definitely-not-a-subcommand"]));
    }
}
