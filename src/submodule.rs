//! Recursive submodule caching.
//!
//! Submodules declared in a checkout's top-level `.gitmodules` get their own
//! full bare mirrors under `<parent mirror>/submodules/<path>` and are
//! initialized in the checkout with `--reference` pointing there. A visited
//! set keyed by identity (falling back to the raw URL) bounds recursion.

use std::collections::HashSet;

use camino::Utf8Path;
use rayon::prelude::*;

use crate::error::Result;
use crate::git::GitTool;
use crate::identity;
use crate::lifecycle;
use crate::lock::PathLock;
use crate::strategy::Strategy;

/// Hard ceiling on nesting depth; no sane repository gets close.
const MAX_DEPTH: u32 = 8;

#[derive(Debug, Clone)]
pub struct SubmoduleSpec {
    pub name: String,
    pub path: String,
    pub url: String,
    pub branch: Option<String>,
}

/// Counts for one walk, failures included.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubmoduleReport {
    pub processed: usize,
    pub failed: usize,
}

impl SubmoduleReport {
    fn absorb(&mut self, other: SubmoduleReport) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// Parse the checkout's top-level `.gitmodules`. Entries missing `path` or
/// `url` are malformed and skipped.
pub fn parse_gitmodules(checkout: &Utf8Path) -> Result<Vec<SubmoduleSpec>> {
    let path = checkout.join(".gitmodules");
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let gitconfig = gix_config::File::from_path_no_includes(
        path.as_std_path().to_owned(),
        gix_config::Source::Api,
    )
    .map_err(|e| crate::error::CacheError::Git(format!("cannot parse `{path}`: {e}")))?;

    let Some(sections) = gitconfig.sections_by_name("submodule") else {
        return Ok(Vec::new());
    };

    let mut submodules = Vec::new();
    for section in sections {
        let name = section
            .header()
            .subsection_name()
            .map(|n| n.to_string())
            .unwrap_or_default();
        let body = section.body();
        let (Some(path), Some(url)) = (body.value("path"), body.value("url")) else {
            eprintln!("git-cache: submodule `{name}` missing path or url, skipping");
            continue;
        };
        submodules.push(SubmoduleSpec {
            name,
            path: path.to_string(),
            url: url.to_string(),
            branch: body.value("branch").map(|b| b.to_string()),
        });
    }
    Ok(submodules)
}

/// Cache and initialize every submodule of `checkout`, recursing when asked.
/// Individual submodule failures are reported but never fail the parent.
pub fn process_submodules(
    git: &GitTool,
    checkout: &Utf8Path,
    parent_mirror: &Utf8Path,
    recursive: bool,
) -> Result<SubmoduleReport> {
    let mut visited = HashSet::new();
    walk(git, checkout, parent_mirror, recursive, &mut visited, 0)
}

fn walk(
    git: &GitTool,
    checkout: &Utf8Path,
    parent_mirror: &Utf8Path,
    recursive: bool,
    visited: &mut HashSet<String>,
    depth: u32,
) -> Result<SubmoduleReport> {
    let mut report = SubmoduleReport::default();
    if depth >= MAX_DEPTH {
        tracing::warn!("submodule nesting deeper than {MAX_DEPTH} under `{checkout}`, stopping");
        return Ok(report);
    }

    let submodules: Vec<SubmoduleSpec> = parse_gitmodules(checkout)?
        .into_iter()
        .filter(|sub| visited.insert(visit_key(&sub.url)))
        .collect();
    if submodules.is_empty() {
        return Ok(report);
    }

    println!(
        "git-cache: processing {} submodule(s) of {checkout}",
        submodules.len()
    );

    let results: Vec<(SubmoduleSpec, Result<()>)> = submodules
        .into_par_iter()
        .map(|sub| {
            let result = cache_one(git, checkout, parent_mirror, &sub);
            (sub, result)
        })
        .collect();

    for (sub, result) in results {
        match result {
            Ok(()) => {
                report.processed += 1;
                if recursive {
                    let sub_checkout = checkout.join(&sub.path);
                    let sub_mirror = parent_mirror.join("submodules").join(&sub.path);
                    report.absorb(walk(
                        git,
                        &sub_checkout,
                        &sub_mirror,
                        recursive,
                        visited,
                        depth + 1,
                    )?);
                }
            }
            Err(e) => {
                eprintln!("git-cache: submodule `{}` failed: {e}", sub.name);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Mirror one submodule and initialize it inside the parent checkout.
fn cache_one(
    git: &GitTool,
    checkout: &Utf8Path,
    parent_mirror: &Utf8Path,
    sub: &SubmoduleSpec,
) -> Result<()> {
    let sub_mirror = parent_mirror.join("submodules").join(&sub.path);
    {
        let _lock = PathLock::acquire(&sub_mirror)?;
        // Submodule mirrors are always full: they back arbitrary later
        // checkouts.
        lifecycle::ensure_mirror(git, &sub.url, &sub_mirror, Strategy::Full)?;
    }

    let reference = format!("--reference={sub_mirror}");
    git.run_network(
        Some(checkout),
        &["submodule", "update", "--init", &reference, "--", &sub.path],
        &format!("initializing submodule {}", sub.name),
    )
}

/// Visited-set key: the parsed identity when the URL is one we understand,
/// the raw URL otherwise.
fn visit_key(url: &str) -> String {
    identity::parse_url(url)
        .map(|id| id.key())
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::fs;

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8Path::from_path(p).unwrap().to_owned()
    }

    #[test]
    fn missing_gitmodules_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse_gitmodules(&utf8(dir.path())).unwrap().is_empty());
    }

    #[test]
    fn parses_complete_entries_and_skips_malformed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let checkout = utf8(dir.path());
        fs::write(
            checkout.join(".gitmodules"),
            concat!(
                "[submodule \"libfoo\"]\n",
                "\tpath = vendor/libfoo\n",
                "\turl = https://github.com/acme/libfoo\n",
                "\tbranch = stable\n",
                "[submodule \"broken\"]\n",
                "\tpath = vendor/broken\n",
                "[submodule \"libbar\"]\n",
                "\tpath = third_party/libbar\n",
                "\turl = git@github.com:acme/libbar.git\n",
            ),
        )
        .unwrap();

        let subs = parse_gitmodules(&checkout).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].name, "libfoo");
        assert_eq!(subs[0].path, "vendor/libfoo");
        assert_eq!(subs[0].branch.as_deref(), Some("stable"));
        assert_eq!(subs[1].name, "libbar");
        assert_eq!(subs[1].url, "git@github.com:acme/libbar.git");
        assert_eq!(subs[1].branch, None);
    }

    #[test]
    fn visit_keys_normalize_equivalent_urls() {
        assert_eq!(
            visit_key("https://github.com/acme/libfoo.git"),
            visit_key("git@github.com:acme/libfoo")
        );
        // Unparseable URLs fall back to themselves.
        assert_eq!(
            visit_key("https://example.org/x/y"),
            "https://example.org/x/y"
        );
    }
}
