//! Integrity checks for mirrors and checkouts, plus corruption repair.
//!
//! Validation is layered: structural sentinels first, then what the external
//! git tool reports, then reference- or HEAD-level probes, and for checkouts
//! the alternates link back to the mirror.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{CacheError, IoResultExt, Result};
use crate::git::GitTool;
use crate::metadata;

/// Whether `path` is usable as a directory. Follows symlinks, so a symlink to
/// a directory counts and a dangling symlink does not.
pub fn dir_like(path: &Utf8Path) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

fn corrupt(path: &Utf8Path, reason: impl Into<String>) -> CacheError {
    CacheError::Corruption {
        path: path.to_owned(),
        reason: reason.into(),
    }
}

/// Validate a bare mirror.
///
/// Layers: sentinel files (`HEAD` regular file, `refs/`, `objects/`
/// directories), git recognizing the directory, and `show-ref` exiting 0 or 1
/// (a fresh mirror with no refs yet is not corrupt).
pub fn validate_mirror(git: &GitTool, mirror: &Utf8Path) -> Result<()> {
    let head = mirror.join("HEAD");
    if !head.is_file() {
        return Err(corrupt(mirror, "missing HEAD file"));
    }
    if fs::metadata(&head).map(|m| m.len()).unwrap_or(0) == 0 {
        return Err(corrupt(mirror, "empty HEAD file"));
    }
    for sentinel in ["refs", "objects"] {
        if !dir_like(&mirror.join(sentinel)) {
            return Err(corrupt(mirror, format!("missing {sentinel}/ directory")));
        }
    }

    if !git.succeeds(Some(mirror), &["rev-parse", "--git-dir"]) {
        return Err(corrupt(mirror, "git does not recognize the repository"));
    }

    match git.exit_code(Some(mirror), &["show-ref"])? {
        0 | 1 => Ok(()),
        code => Err(corrupt(mirror, format!("show-ref exited with code {code}"))),
    }
}

/// Validate a working-tree checkout derived from `mirror`.
///
/// Layers: `.git` present, git recognizing the repository, HEAD resolving
/// (tolerated for repositories with no refs at all), and the alternates file
/// containing exactly one line that resolves to the mirror's object store.
pub fn validate_checkout(git: &GitTool, checkout: &Utf8Path, mirror: &Utf8Path) -> Result<()> {
    if !dir_like(&checkout.join(".git")) {
        return Err(corrupt(checkout, "missing .git directory"));
    }
    if !git.succeeds(Some(checkout), &["rev-parse", "--git-dir"]) {
        return Err(corrupt(checkout, "git does not recognize the repository"));
    }

    if !git.succeeds(Some(checkout), &["rev-parse", "--verify", "HEAD"]) {
        // An empty repository has no HEAD to resolve; only refs present with
        // an unresolvable HEAD means breakage.
        if git.exit_code(Some(checkout), &["show-ref"])? == 0 {
            return Err(corrupt(checkout, "HEAD does not resolve"));
        }
    }

    check_alternates(checkout, mirror)
}

/// The alternates file must contain exactly one significant line pointing at
/// the mirror's object store.
fn check_alternates(checkout: &Utf8Path, mirror: &Utf8Path) -> Result<()> {
    let alternates_path = checkout.join(".git/objects/info/alternates");
    let contents = fs::read_to_string(&alternates_path)
        .map_err(|_| corrupt(checkout, "missing alternates file"))?;

    let lines: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    let [line] = lines.as_slice() else {
        return Err(corrupt(
            checkout,
            format!("alternates file has {} entries, expected 1", lines.len()),
        ));
    };

    let expected = mirror.join("objects");
    if *line == expected.as_str() || paths_coincide(line, &expected) {
        Ok(())
    } else {
        Err(corrupt(
            checkout,
            format!("alternates point at `{line}`, expected `{expected}`"),
        ))
    }
}

/// Exact comparison first; fall back to canonicalized paths so symlinked
/// roots do not read as corruption.
fn paths_coincide(line: &str, expected: &Utf8Path) -> bool {
    match (
        fs::canonicalize(line),
        fs::canonicalize(expected.as_std_path()),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Replace a corrupted mirror with a fresh bare clone.
///
/// The corrupted tree moves to `<mirror>.backup.<ts>` and stays there for
/// inspection. If the re-clone or its validation fails, the backup is moved
/// back and the error surfaces.
pub fn repair_mirror(git: &GitTool, mirror: &Utf8Path, original_url: &str) -> Result<()> {
    let backup = Utf8PathBuf::from(format!("{mirror}.backup.{}", metadata::unix_now()));
    fs::rename(mirror, &backup).fs_context(mirror)?;

    let result = git
        .run_network(
            None,
            &[
                "clone",
                "--mirror",
                "--",
                original_url,
                mirror.as_str(),
            ],
            &format!("re-cloning {original_url}"),
        )
        .and_then(|()| validate_mirror(git, mirror));

    match result {
        Ok(()) => {
            println!("git-cache: corrupted mirror backed up to {backup}");
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_dir_all(mirror);
            let _ = fs::rename(&backup, mirror);
            Err(e)
        }
    }
}
