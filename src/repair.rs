//! Detecting and fixing checkouts that fell behind their mirror.
//!
//! A checkout needs repair when it fails validation, when the mirror's refs
//! moved after the checkout last did, or when it is strictly behind its
//! origin. Dirty working trees are never touched: they are reported and
//! skipped.

use std::fs;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::git::GitTool;
use crate::identity::{paths, RemoteIdentity};
use crate::lifecycle::{self, EnsureOutcome};
use crate::lock::PathLock;
use crate::metadata;
use crate::strategy::Strategy;
use crate::validate;

/// Outcome counts of a system-wide repair sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    pub checked: usize,
    pub repaired: usize,
    pub skipped_dirty: usize,
    pub failed: usize,
}

fn mtime_secs(path: &Utf8Path) -> Option<u64> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

/// When the mirror's refs last moved.
fn mirror_ref_mtime(mirror: &Utf8Path) -> Option<u64> {
    [mirror.join("refs"), mirror.join("HEAD")]
        .iter()
        .filter_map(|p| mtime_secs(p))
        .max()
}

fn checkout_head_mtime(checkout: &Utf8Path) -> Option<u64> {
    mtime_secs(&checkout.join(".git/HEAD")).or_else(|| mtime_secs(&checkout.join(".git")))
}

/// Whether the working tree has no uncommitted modifications.
pub fn working_tree_clean(git: &GitTool, checkout: &Utf8Path) -> bool {
    git.output(Some(checkout), &["status", "--porcelain"])
        .map(|out| out.is_empty())
        .unwrap_or(false)
}

/// Commits the checkout is behind its origin/HEAD; zero when unknowable.
fn commits_behind(git: &GitTool, checkout: &Utf8Path) -> u32 {
    git.output(
        Some(checkout),
        &["rev-list", "--count", "HEAD..origin/HEAD"],
    )
    .ok()
    .and_then(|s| s.parse().ok())
    .unwrap_or(0)
}

/// The staleness predicate. `last_sync` is the mirror's recorded last sync
/// time (zero when unknown).
pub fn needs_repair(
    git: &GitTool,
    checkout: &Utf8Path,
    mirror: &Utf8Path,
    last_sync: u64,
) -> bool {
    if validate::validate_checkout(git, checkout, mirror).is_err() {
        return true;
    }

    let checkout_time = checkout_head_mtime(checkout);
    if let (Some(mirror_time), Some(checkout_time)) = (mirror_ref_mtime(mirror), checkout_time) {
        if mirror_time > checkout_time {
            return true;
        }
    }
    if let Some(checkout_time) = checkout_time {
        if last_sync > checkout_time {
            return true;
        }
    }

    commits_behind(git, checkout) > 0 && working_tree_clean(git, checkout)
}

/// Bring a clean checkout up to date in place: fetch, hard-reset to
/// origin/HEAD, drop untracked files.
pub fn update_from_mirror(git: &GitTool, checkout: &Utf8Path) -> Result<()> {
    git.run_network(
        Some(checkout),
        &["fetch", "origin"],
        &format!("updating {checkout}"),
    )?;
    git.run(Some(checkout), &["reset", "--hard", "origin/HEAD"])?;
    if let Err(e) = git.run(Some(checkout), &["clean", "-fd"]) {
        tracing::warn!("could not clean untracked files in `{checkout}`: {e}");
    }
    Ok(())
}

/// Repair one stale checkout. Prefers the in-place update; falls back to a
/// full recreation through the lifecycle engine. Returns `false` when the
/// checkout was dirty and left untouched.
pub fn repair_checkout(
    git: &GitTool,
    checkout: &Utf8Path,
    mirror: &Utf8Path,
    strategy: Strategy,
    remote_url: &str,
) -> Result<bool> {
    if validate::dir_like(checkout) && !working_tree_clean(git, checkout) {
        println!("git-cache: {checkout} has uncommitted changes, not touching it");
        return Ok(false);
    }

    if validate::validate_checkout(git, checkout, mirror).is_ok() {
        if update_from_mirror(git, checkout).is_ok() {
            return Ok(true);
        }
        tracing::warn!("in-place update of `{checkout}` failed, recreating");
    }

    if validate::dir_like(checkout) {
        fs::remove_dir_all(checkout)
            .map_err(|e| crate::error::CacheError::fs(checkout.to_owned(), e))?;
    }
    let outcome = lifecycle::ensure_checkout(git, mirror, checkout, strategy, 1, remote_url)?;
    debug_assert_eq!(outcome, EnsureOutcome::Created);
    Ok(true)
}

/// Sweep every cached repository and repair its stale checkouts.
pub fn repair_all_outdated(cfg: &CacheConfig, git: &GitTool) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    let mut targets = Vec::new();
    metadata::for_each(&cfg.cache_root, |mirror, meta| {
        targets.push((mirror.to_owned(), meta));
    })?;

    for (mirror, meta) in targets {
        let id = RemoteIdentity {
            host: meta.host,
            owner: meta.owner.clone(),
            name: meta.name.clone(),
        };
        let triple = paths(cfg, &id);
        let _mirror_lock = match PathLock::acquire(&mirror) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!("skipping `{mirror}`: {e}");
                report.failed += 1;
                continue;
            }
        };

        for (checkout, strategy, remote) in [
            (
                triple.ro_checkout.clone(),
                meta.strategy,
                meta.original_url.clone(),
            ),
            (
                triple.mod_checkout.clone(),
                Strategy::Blobless,
                meta.fork_url
                    .clone()
                    .unwrap_or_else(|| meta.original_url.clone()),
            ),
        ] {
            if !validate::dir_like(&checkout) {
                continue;
            }
            report.checked += 1;
            let _checkout_lock = match PathLock::acquire(&checkout) {
                Ok(lock) => lock,
                Err(e) => {
                    tracing::warn!("skipping `{checkout}`: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            if !needs_repair(git, &checkout, &mirror, meta.last_sync_time) {
                continue;
            }
            match repair_checkout(git, &checkout, &mirror, strategy, &remote) {
                Ok(true) => report.repaired += 1,
                Ok(false) => report.skipped_dirty += 1,
                Err(e) => {
                    eprintln!("git-cache: failed to repair {checkout}: {e}");
                    report.failed += 1;
                }
            }
        }
    }
    Ok(report)
}

/// Walk `<checkout_root>/<owner>/<name>` and report checkouts whose mirror is
/// gone. The modifiable subtree is skipped here; those checkouts are
/// reconciled through the metadata sweep instead, since their directory names
/// do not map back to an owner/name pair unambiguously.
pub fn detect_orphans<F>(cfg: &CacheConfig, mut visitor: F) -> Result<usize>
where
    F: FnMut(&Utf8Path),
{
    let mut orphans = 0;
    let Ok(owners) = cfg.checkout_root.read_dir_utf8() else {
        return Ok(0);
    };
    for owner_entry in owners.flatten() {
        let owner = owner_entry.file_name().to_string();
        if owner.starts_with('.') || owner == cfg.modifiable_subdir {
            continue;
        }
        let Ok(repos) = owner_entry.path().read_dir_utf8() else {
            continue;
        };
        for repo_entry in repos.flatten() {
            let checkout: Utf8PathBuf = repo_entry.path().to_owned();
            if !validate::dir_like(&checkout.join(".git")) {
                continue;
            }
            let mirror = cfg
                .cache_root
                .join("github")
                .join(&owner)
                .join(repo_entry.file_name());
            if !validate::dir_like(&mirror) {
                orphans += 1;
                visitor(&checkout);
            }
        }
    }
    Ok(orphans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::git_available;

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8Path::from_path(p).unwrap().to_owned()
    }

    #[test]
    fn invalid_checkout_always_needs_repair() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let git = GitTool::new(false);
        // Not even a directory yet.
        assert!(needs_repair(&git, &root.join("co"), &root.join("mirror"), 0));
    }

    #[test]
    fn orphan_walk_flags_checkouts_without_mirrors() {
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let cfg = CacheConfig::for_roots(root.join("cache"), root.join("checkouts"));

        // Orphan: checkout exists, mirror does not.
        fs::create_dir_all(cfg.checkout_root.join("alice/gone/.git")).unwrap();
        // Healthy: both exist.
        fs::create_dir_all(cfg.checkout_root.join("bob/kept/.git")).unwrap();
        fs::create_dir_all(cfg.cache_root.join("github/bob/kept")).unwrap();
        // Modifiable subtree is not walked.
        fs::create_dir_all(cfg.checkout_root.join("mithro/alice-gone/.git")).unwrap();
        // Not a checkout at all.
        fs::create_dir_all(cfg.checkout_root.join("carol/notes")).unwrap();

        let mut seen = Vec::new();
        let count = detect_orphans(&cfg, |p| seen.push(p.to_owned())).unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![cfg.checkout_root.join("alice/gone")]);
    }

    #[test]
    fn dirty_checkout_is_reported_not_repaired() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = utf8(dir.path());
        let git = GitTool::new(false);

        let origin = root.join("origin");
        git.run(None, &["init", "-b", "main", origin.as_str()])
            .unwrap();
        git.run(Some(&origin), &["config", "user.email", "t@example.com"])
            .unwrap();
        git.run(Some(&origin), &["config", "user.name", "t"]).unwrap();
        fs::write(origin.join("README"), "seed\n").unwrap();
        git.run(Some(&origin), &["add", "README"]).unwrap();
        git.run(Some(&origin), &["commit", "-m", "seed"]).unwrap();

        let mirror = root.join("mirror");
        lifecycle::ensure_mirror(&git, origin.as_str(), &mirror, Strategy::Full).unwrap();
        let checkout = root.join("checkout");
        lifecycle::ensure_checkout(&git, &mirror, &checkout, Strategy::Full, 1, origin.as_str())
            .unwrap();

        fs::write(checkout.join("README"), "local edits\n").unwrap();
        assert!(!working_tree_clean(&git, &checkout));

        let repaired =
            repair_checkout(&git, &checkout, &mirror, Strategy::Full, origin.as_str()).unwrap();
        assert!(!repaired);
        assert_eq!(
            fs::read_to_string(checkout.join("README")).unwrap(),
            "local edits\n"
        );
    }
}
