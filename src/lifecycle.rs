//! The repository lifecycle engine.
//!
//! `ensure_mirror` and `ensure_checkout` share one five-phase contract:
//! inspect the destination, prepare it (back up a corrupt repository, remove
//! a non-git directory), materialize into a temporary sibling, validate the
//! temporary clone, then commit it with an atomic rename. A process killed at
//! any point leaves at worst a `.tmp.<ts>` sibling that the next run removes
//! before retrying; the canonical path is never half-populated.
//!
//! Callers hold the destination's path lock for the whole operation.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{CacheError, IoResultExt, Result};
use crate::git::GitTool;
use crate::metadata;
use crate::strategy::Strategy;
use crate::validate;

/// Warn when the destination filesystem has less free space than this.
const MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;

/// What `ensure_*` did to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Fresh clone committed to the canonical path.
    Created,
    /// Existing repository refreshed in place.
    Updated,
    /// Existing repository left as it was.
    Unchanged,
}

/// Classification of a destination directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirState {
    Absent,
    GitRepoValid,
    GitRepoCorrupt,
    NonGitDir,
}

/// What kind of repository a destination is expected to hold.
#[derive(Debug, Clone, Copy)]
pub enum RepoKind<'a> {
    Mirror,
    Checkout { mirror: &'a Utf8Path },
}

/// Phase one: classify the destination.
pub fn classify(git: &GitTool, path: &Utf8Path, kind: RepoKind<'_>) -> DirState {
    if !validate::dir_like(path) {
        return DirState::Absent;
    }
    match kind {
        RepoKind::Mirror => {
            let shaped = path.join("HEAD").is_file()
                || validate::dir_like(&path.join("refs"))
                || validate::dir_like(&path.join("objects"));
            if !shaped {
                return DirState::NonGitDir;
            }
            match validate::validate_mirror(git, path) {
                Ok(()) => DirState::GitRepoValid,
                Err(_) => DirState::GitRepoCorrupt,
            }
        }
        RepoKind::Checkout { mirror } => {
            if !validate::dir_like(&path.join(".git")) {
                return DirState::NonGitDir;
            }
            match validate::validate_checkout(git, path, mirror) {
                Ok(()) => DirState::GitRepoValid,
                Err(_) => DirState::GitRepoCorrupt,
            }
        }
    }
}

/// Materialize or refresh the bare mirror for `url` at `mirror`.
///
/// A shallow strategy is rejected here: a shallow repository cannot serve as
/// the alternates source for later full checkouts. On the fast path an
/// existing valid mirror is fetched in place; fetch failures leave the cache
/// usable and only downgrade the outcome.
pub fn ensure_mirror(
    git: &GitTool,
    url: &str,
    mirror: &Utf8Path,
    strategy: Strategy,
) -> Result<EnsureOutcome> {
    if strategy == Strategy::Shallow {
        return Err(CacheError::Args(
            "a shallow mirror cannot back reference checkouts; \
             use shallow for the checkout instead"
                .into(),
        ));
    }

    remove_stale_transients(mirror)?;

    if classify(git, mirror, RepoKind::Mirror) == DirState::GitRepoValid {
        return match update_mirror(git, mirror) {
            Ok(()) => Ok(EnsureOutcome::Updated),
            Err(e) => {
                // The existing mirror still serves objects; sync will retry.
                tracing::warn!("fetch for existing mirror `{mirror}` failed: {e}");
                Ok(EnsureOutcome::Unchanged)
            }
        };
    }

    // Submodules are not cloned here; the walker gives each one its own
    // sub-mirror, which a bare clone could not do anyway.
    replace(git, mirror, RepoKind::Mirror, |tmp| {
        let mut args: Vec<&str> = vec!["clone", "--mirror"];
        let filter = match strategy {
            Strategy::Treeless => Some("--filter=tree:0"),
            Strategy::Blobless => Some("--filter=blob:none"),
            Strategy::Full => None,
            Strategy::Shallow => unreachable!("rejected above"),
        };
        args.extend(filter);
        args.extend(["--", url, tmp.as_str()]);
        git.run_network(None, &args, &format!("caching {url}"))
    })
    .map(|()| EnsureOutcome::Created)
}

/// Refresh an existing mirror from its origin. The mirror refspec
/// (`+refs/*:refs/*`) force-updates branch heads and prunes what vanished
/// upstream.
pub fn update_mirror(git: &GitTool, mirror: &Utf8Path) -> Result<()> {
    git.run_network(
        Some(mirror),
        &["remote", "update", "--prune"],
        &format!("updating {mirror}"),
    )
}

/// Materialize or leave alone a reference checkout of `mirror` at `checkout`.
///
/// `remote_url` becomes the checkout's origin and may be a fork rather than
/// the mirrored URL; objects still come from the mirror through `--reference`.
pub fn ensure_checkout(
    git: &GitTool,
    mirror: &Utf8Path,
    checkout: &Utf8Path,
    strategy: Strategy,
    depth: u32,
    remote_url: &str,
) -> Result<EnsureOutcome> {
    remove_stale_transients(checkout)?;

    if classify(git, checkout, RepoKind::Checkout { mirror }) == DirState::GitRepoValid {
        return Ok(EnsureOutcome::Unchanged);
    }

    replace(git, checkout, RepoKind::Checkout { mirror }, |tmp| {
        let reference = format!("--reference={mirror}");
        let flags = strategy.clone_flags(depth);
        let mut args: Vec<&str> = vec!["clone", &reference];
        args.extend(flags.iter().map(String::as_str));
        args.extend(["--", remote_url, tmp.as_str()]);
        git.run_network(None, &args, &format!("checking out {remote_url}"))
    })
    .map(|()| EnsureOutcome::Created)
}

/// Phases two through five for a destination that needs rebuilding: prepare
/// the canonical path, materialize into a `.tmp.<ts>` sibling, validate it,
/// and commit by rename. Any failure rolls the canonical path back to the
/// backup taken in the prepare phase.
fn replace<F>(git: &GitTool, path: &Utf8Path, kind: RepoKind<'_>, materialize: F) -> Result<()>
where
    F: FnOnce(&Utf8Path) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).fs_context(parent)?;
        warn_if_low_space(parent);
    }

    let ts = metadata::unix_now();
    let backup = match classify(git, path, kind) {
        DirState::Absent | DirState::GitRepoValid => None,
        DirState::GitRepoCorrupt => {
            let backup = Utf8PathBuf::from(format!("{path}.backup.{ts}"));
            fs::rename(path, &backup).fs_context(path)?;
            Some(backup)
        }
        DirState::NonGitDir => {
            fs::remove_dir_all(path).fs_context(path)?;
            None
        }
    };

    // The guard removes the temporary sibling on every exit path; it is
    // defused only once the rename has made the tree canonical.
    let tmp = scopeguard::guard(
        Utf8PathBuf::from(format!("{path}.tmp.{ts}")),
        |tmp| {
            let _ = fs::remove_dir_all(&tmp);
        },
    );

    let built = materialize(&tmp).and_then(|()| match kind {
        RepoKind::Mirror => validate::validate_mirror(git, &tmp),
        RepoKind::Checkout { mirror } => validate::validate_checkout(git, &tmp, mirror),
    });
    if let Err(e) = built {
        drop(tmp);
        restore_backup(path, backup);
        return Err(e);
    }

    if let Err(e) = fs::rename(&*tmp, path) {
        drop(tmp);
        restore_backup(path, backup);
        return Err(CacheError::fs(path.to_owned(), e));
    }
    scopeguard::ScopeGuard::into_inner(tmp);

    if let Some(backup) = backup {
        if let Err(e) = fs::remove_dir_all(&backup) {
            tracing::warn!("could not remove backup `{backup}`: {e}");
        }
    }
    Ok(())
}

fn restore_backup(path: &Utf8Path, backup: Option<Utf8PathBuf>) {
    if let Some(backup) = backup {
        let _ = fs::remove_dir_all(path);
        let _ = fs::rename(&backup, path);
    }
}

/// Remove `.tmp.<ts>` siblings left behind by an interrupted run.
fn remove_stale_transients(path: &Utf8Path) -> Result<()> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Ok(());
    };
    let Ok(entries) = parent.read_dir_utf8() else {
        return Ok(());
    };
    let prefix = format!("{name}.tmp.");
    for entry in entries.flatten() {
        if entry.file_name().starts_with(&prefix) {
            let stale = entry.path();
            tracing::debug!("removing stale transient `{stale}`");
            fs::remove_dir_all(stale).fs_context(stale)?;
        }
    }
    Ok(())
}

/// Advisory free-space probe. Low space logs a warning; the operation
/// proceeds regardless.
fn warn_if_low_space(dir: &Utf8Path) {
    if let Some(free) = free_bytes(dir) {
        if free < MIN_FREE_BYTES {
            tracing::warn!(
                "less than {} MB free under `{dir}`, clone may fail",
                MIN_FREE_BYTES / (1024 * 1024)
            );
        }
    }
}

#[cfg(unix)]
fn free_bytes(dir: &Utf8Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(dir.as_std_path().as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stats) } != 0 {
        return None;
    }
    Some(stats.f_bavail as u64 * stats.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_bytes(_dir: &Utf8Path) -> Option<u64> {
    None
}
