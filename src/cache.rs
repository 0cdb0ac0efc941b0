//! The cache orchestrator: wires the resolver, locks, lifecycle engine,
//! metadata store, collaborators and the repair sweep into the operations the
//! CLI exposes.

use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{CacheConfig, SyncConfig};
use crate::error::{CacheError, IoResultExt, Result};
use crate::git::GitTool;
use crate::github::GithubClient;
use crate::identity::{parse_url, paths, RemoteIdentity};
use crate::lifecycle::{self, EnsureOutcome};
use crate::lock::PathLock;
use crate::metadata::{self, CacheMetadata};
use crate::mirrors::MirrorManager;
use crate::repair;
use crate::strategy::{self, Strategy, StrategyArg};
use crate::submodule;
use crate::validate;

/// Worker threads for the sync fan-out.
const SYNC_JOBS: usize = 4;

/// One `clone` invocation, CLI flags already digested.
#[derive(Builder, Debug)]
pub struct CloneRequest {
    pub url: String,
    #[builder(default)]
    pub strategy: StrategyArg,
    #[builder(default = "1")]
    pub depth: u32,
    #[builder(default)]
    pub organization: Option<String>,
    #[builder(default)]
    pub make_private: bool,
    /// None means "follow the configured default".
    #[builder(default)]
    pub recursive: Option<bool>,
}

pub struct GitCache {
    cfg: CacheConfig,
    git: GitTool,
}

impl GitCache {
    pub fn new(cfg: CacheConfig) -> Result<Self> {
        cfg.ensure_roots()?;
        let git = GitTool::new(cfg.verbose);
        Ok(GitCache { cfg, git })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    fn github_client(&self) -> Option<GithubClient> {
        self.cfg
            .github_token
            .clone()
            .map(|token| GithubClient::new(Some(token)))
    }

    /// The full clone flow: mirror, optional fork, both checkouts,
    /// submodules. The mirror lock is held across the whole triple so
    /// concurrent cloners of one URL serialize; checkout locks nest inside.
    pub fn clone_repository(&self, req: &CloneRequest) -> Result<()> {
        let id = parse_url(&req.url)?;
        let triple = paths(&self.cfg, &id);
        let client = self.github_client();

        let resolved = strategy::resolve(req.strategy, &id, client.as_ref(), &self.cfg);
        // Shallow never reaches the mirror; it cannot back later checkouts.
        let mirror_strategy = match resolved {
            Strategy::Shallow => Strategy::Full,
            s => s,
        };
        let recursive = req.recursive.unwrap_or(self.cfg.recursive_submodules);

        let _mirror_lock = PathLock::acquire(&triple.mirror)?;

        println!("git-cache: caching {id} into {}", triple.mirror);
        let outcome =
            lifecycle::ensure_mirror(&self.git, &req.url, &triple.mirror, mirror_strategy)?;
        let mut prior_sync = metadata::unix_now();
        let mut meta = match outcome {
            EnsureOutcome::Created => {
                let mut meta = CacheMetadata::create(&id, &req.url, resolved);
                meta.last_sync_time = metadata::unix_now();
                meta.cache_size = metadata::calculate_size(&triple.mirror);
                meta.default_branch = self.default_branch(&triple.mirror);
                metadata::save(&triple.mirror, &meta)?;
                meta
            }
            EnsureOutcome::Updated | EnsureOutcome::Unchanged => {
                // Mirrors written by hand or by older tools get a sidecar now.
                let mut meta = metadata::load(&triple.mirror)
                    .unwrap_or_else(|_| CacheMetadata::create(&id, &req.url, resolved));
                prior_sync = meta.last_sync_time;
                if outcome == EnsureOutcome::Updated {
                    meta.last_sync_time = metadata::unix_now();
                }
                metadata::save(&triple.mirror, &meta)?;
                meta
            }
        };

        // Opportunistically refresh any named mirrors when auto-sync is on
        // and the last sync is older than the configured interval.
        let sync_cfg = SyncConfig::from_env();
        if sync_cfg.auto_sync
            && metadata::unix_now().saturating_sub(prior_sync)
                >= sync_cfg.sync_interval_hours.saturating_mul(3600)
        {
            if let Err(e) = MirrorManager::new(&self.git, &triple.mirror).sync(&sync_cfg) {
                tracing::warn!("auto-sync of named mirrors failed: {e}");
            }
        }

        if meta.is_fork_needed {
            if let Some(client) = &client {
                self.fork_repository(client, &id, req, &mut meta, &triple.mirror);
            }
        }

        let modifiable_url = meta.fork_url.clone().unwrap_or_else(|| req.url.clone());
        self.derive_checkout(
            &triple.mirror,
            &triple.ro_checkout,
            resolved,
            req.depth,
            &req.url,
        )?;
        self.derive_checkout(
            &triple.mirror,
            &triple.mod_checkout,
            Strategy::Blobless,
            req.depth,
            &modifiable_url,
        )?;

        if recursive {
            let report = submodule::process_submodules(
                &self.git,
                &triple.ro_checkout,
                &triple.mirror,
                true,
            )?;
            if report.processed > 0 || report.failed > 0 {
                let mut meta = metadata::load(&triple.mirror)?;
                meta.has_submodules = true;
                metadata::save(&triple.mirror, &meta)?;
            }
            if report.failed > 0 {
                eprintln!(
                    "git-cache: {} submodule(s) failed; the main clone is usable",
                    report.failed
                );
            }
        }

        println!("git-cache: {id} ready");
        println!("  read-only:  {}", triple.ro_checkout);
        println!("  modifiable: {}", triple.mod_checkout);
        Ok(())
    }

    /// Ensure one checkout and keep the sidecar's `ref_count` in step. Caller
    /// holds the mirror lock; the checkout lock nests inside it.
    fn derive_checkout(
        &self,
        mirror: &Utf8Path,
        checkout: &Utf8Path,
        strategy: Strategy,
        depth: u32,
        remote_url: &str,
    ) -> Result<()> {
        let outcome = {
            let _lock = PathLock::acquire(checkout)?;
            // Under --force a healthy checkout is rebuilt too, but never over
            // uncommitted work.
            if self.cfg.force
                && lifecycle::classify(
                    &self.git,
                    checkout,
                    lifecycle::RepoKind::Checkout { mirror },
                ) == lifecycle::DirState::GitRepoValid
            {
                if repair::working_tree_clean(&self.git, checkout) {
                    std::fs::remove_dir_all(checkout).fs_context(checkout)?;
                } else {
                    println!("git-cache: {checkout} has uncommitted changes, keeping it");
                }
            }
            lifecycle::ensure_checkout(&self.git, mirror, checkout, strategy, depth, remote_url)?
        };
        // The checkout itself is in place; a sidecar hiccup is not worth
        // failing the clone over.
        let bookkeeping = match outcome {
            EnsureOutcome::Created => metadata::inc_ref(mirror),
            _ => metadata::update_access(mirror),
        };
        if let Err(e) = bookkeeping {
            tracing::warn!("metadata update for `{mirror}` failed: {e}");
        }
        Ok(())
    }

    /// Ask the hosting provider for a fork. Failures are warnings: the cache
    /// works fine against the upstream URL.
    fn fork_repository(
        &self,
        client: &GithubClient,
        id: &RemoteIdentity,
        req: &CloneRequest,
        meta: &mut CacheMetadata,
        mirror: &Utf8Path,
    ) {
        let organization = req
            .organization
            .clone()
            .unwrap_or_else(|| self.cfg.fork_organization.clone());

        match client.fork(&id.owner, &id.name, Some(&organization)) {
            Ok(fork) => {
                if fork.already_exists {
                    println!("git-cache: fork already exists: {}", fork.url);
                } else {
                    println!("git-cache: forked to {}", fork.url);
                }
                meta.fork_url = Some(fork.url.clone());
                meta.fork_organization = Some(organization.clone());
                meta.is_private_fork = fork.private;

                if req.make_private && !fork.private {
                    match parse_url(&fork.url) {
                        Ok(fork_id) => {
                            match client.set_private(&fork_id.owner, &fork_id.name, true) {
                                Ok(()) => meta.is_private_fork = true,
                                Err(e) => {
                                    eprintln!("git-cache: could not make fork private: {e}")
                                }
                            }
                        }
                        Err(e) => tracing::warn!("unparseable fork url `{}`: {e}", fork.url),
                    }
                }
                if let Err(e) = metadata::save(mirror, meta) {
                    tracing::warn!("could not record fork in metadata: {e}");
                }
            }
            Err(e) => {
                eprintln!("git-cache: fork failed ({e}), continuing with upstream");
            }
        }
    }

    fn default_branch(&self, mirror: &Utf8Path) -> Option<String> {
        self.git
            .output(Some(mirror), &["symbolic-ref", "HEAD"])
            .ok()
            .and_then(|full| full.strip_prefix("refs/heads/").map(str::to_string))
    }

    /// Print configuration and every cached repository.
    pub fn status(&self) -> Result<()> {
        println!("git-cache: configuration");
        println!("  cache root:       {}", self.cfg.cache_root);
        println!("  checkout root:    {}", self.cfg.checkout_root);
        println!("  default strategy: {}", self.cfg.default_strategy);
        println!(
            "  github token:     {}",
            if self.cfg.github_token.is_some() {
                "present"
            } else {
                "absent"
            }
        );

        let mut total_size = 0u64;
        let count = metadata::for_each(&self.cfg.cache_root, |_mirror, meta| {
            total_size += meta.cache_size;
            println!(
                "  {}/{}  strategy={} size={} checkouts={} synced {}",
                meta.owner,
                meta.name,
                meta.strategy,
                human_bytes(meta.cache_size),
                meta.ref_count,
                ago(meta.last_sync_time),
            );
        })?;
        println!(
            "git-cache: {count} repositories, {} total",
            human_bytes(total_size)
        );
        Ok(())
    }

    /// One line per cached repository.
    pub fn list(&self) -> Result<()> {
        metadata::for_each(&self.cfg.cache_root, |_mirror, meta| {
            println!(
                "{}/{}\t{}\t{}\t{}",
                meta.owner,
                meta.name,
                meta.strategy,
                human_bytes(meta.cache_size),
                meta.original_url
            );
        })?;
        Ok(())
    }

    /// Remove cached repositories and their checkouts. Destructive, so it
    /// only acts under `--force`; otherwise it reports what would go.
    pub fn clean(&self, force: bool) -> Result<()> {
        let mut targets: Vec<(Utf8PathBuf, CacheMetadata)> = Vec::new();
        metadata::for_each(&self.cfg.cache_root, |mirror, meta| {
            targets.push((mirror.to_owned(), meta));
        })?;

        if !force {
            for (mirror, meta) in &targets {
                println!("would remove {}/{} ({mirror})", meta.owner, meta.name);
            }
            println!(
                "git-cache: {} repositories; pass --force to actually remove them",
                targets.len()
            );
            return Ok(());
        }

        for (mirror, meta) in &targets {
            let id = RemoteIdentity {
                host: meta.host,
                owner: meta.owner.clone(),
                name: meta.name.clone(),
            };
            let triple = paths(&self.cfg, &id);
            let _lock = PathLock::acquire(mirror)?;

            for checkout in [&triple.ro_checkout, &triple.mod_checkout] {
                if validate::dir_like(checkout) {
                    std::fs::remove_dir_all(checkout).fs_context(checkout)?;
                    // Keep the counter honest while the sidecar still exists.
                    let _ = metadata::dec_ref(mirror);
                }
            }
            std::fs::remove_dir_all(mirror).fs_context(mirror)?;
            println!("git-cache: removed {}/{}", meta.owner, meta.name);
        }

        remove_empty_tree(&self.cfg.cache_root);
        Ok(())
    }

    /// Fetch every mirror (prune included), then run the repair sweep.
    pub fn sync_all(&self) -> Result<()> {
        let sync_cfg = SyncConfig::from_env();
        let mut targets: Vec<Utf8PathBuf> = Vec::new();
        metadata::for_each(&self.cfg.cache_root, |mirror, _meta| {
            targets.push(mirror.to_owned());
        })?;
        let total = targets.len();

        let failures = AtomicUsize::new(0);
        let (tx, rx) = crossbeam::channel::unbounded::<Utf8PathBuf>();
        crossbeam::thread::scope(|scope| {
            for _ in 0..SYNC_JOBS.min(total.max(1)) {
                let rx = rx.clone();
                let failures = &failures;
                let sync_cfg = &sync_cfg;
                scope.spawn(move |_| {
                    for mirror in rx.iter() {
                        if let Err(e) = self.sync_one(&mirror, sync_cfg) {
                            eprintln!("git-cache: sync failed for {mirror}: {e}");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
            for mirror in targets {
                let _ = tx.send(mirror);
            }
            drop(tx);
        })
        .expect("sync worker panicked");

        let failures = failures.into_inner();
        println!(
            "git-cache: synced {}/{total} mirrors",
            total - failures
        );

        let report = repair::repair_all_outdated(&self.cfg, &self.git)?;
        if report.repaired > 0 || report.failed > 0 {
            println!(
                "git-cache: repaired {} checkout(s), {} failed",
                report.repaired, report.failed
            );
        }

        if failures > 0 {
            return Err(CacheError::Network(format!(
                "{failures} of {total} mirrors failed to sync"
            )));
        }
        Ok(())
    }

    fn sync_one(&self, mirror: &Utf8Path, sync_cfg: &SyncConfig) -> Result<()> {
        let _lock = PathLock::acquire(mirror)?;
        scopeguard::defer! {
            tracing::debug!("finished sync pass for `{mirror}`");
        }
        lifecycle::update_mirror(&self.git, mirror)?;
        MirrorManager::new(&self.git, mirror).sync(sync_cfg)?;
        metadata::update_sync(mirror)?;

        let mut meta = metadata::load(mirror)?;
        meta.cache_size = metadata::calculate_size(mirror);
        metadata::save(mirror, &meta)
    }

    /// Validate one cached repository (by URL) or all of them, repairing
    /// what fails. Errors out if anything stays invalid.
    pub fn verify(&self, url: Option<&str>) -> Result<()> {
        let mut targets: Vec<(Utf8PathBuf, CacheMetadata)> = Vec::new();
        match url {
            Some(url) => {
                let id = parse_url(url)?;
                let triple = paths(&self.cfg, &id);
                let meta = metadata::load(&triple.mirror).map_err(|_| {
                    CacheError::NotFound(format!("no cached repository for {id}"))
                })?;
                targets.push((triple.mirror, meta));
            }
            None => {
                metadata::for_each(&self.cfg.cache_root, |mirror, meta| {
                    targets.push((mirror.to_owned(), meta));
                })?;
            }
        }

        let mut invalid = 0;
        for (mirror, meta) in targets {
            if let Err(e) = self.verify_one(&mirror, &meta) {
                eprintln!("git-cache: {}/{}: {e}", meta.owner, meta.name);
                invalid += 1;
            } else {
                println!("git-cache: {}/{} valid", meta.owner, meta.name);
            }
        }
        if invalid > 0 {
            return Err(CacheError::Validation {
                path: self.cfg.cache_root.clone(),
                reason: format!("{invalid} repositories failed verification"),
            });
        }
        Ok(())
    }

    fn verify_one(&self, mirror: &Utf8Path, meta: &CacheMetadata) -> Result<()> {
        let id = RemoteIdentity {
            host: meta.host,
            owner: meta.owner.clone(),
            name: meta.name.clone(),
        };
        let triple = paths(&self.cfg, &id);
        let _lock = PathLock::acquire(mirror)?;

        if let Err(e) = validate::validate_mirror(&self.git, mirror) {
            println!("git-cache: mirror for {id} is corrupted, re-cloning");
            tracing::debug!("mirror validation: {e}");
            if meta.original_url.is_empty() {
                return Err(e);
            }
            validate::repair_mirror(&self.git, mirror, &meta.original_url)?;
            // The sidecar went with the corrupted tree; rebuild it.
            let mut fresh = meta.clone();
            fresh.last_sync_time = metadata::unix_now();
            fresh.cache_size = metadata::calculate_size(mirror);
            fresh.ref_count = 0;
            metadata::save(mirror, &fresh)?;
        }

        let mut existing = 0;
        for (checkout, strategy, remote) in [
            (&triple.ro_checkout, meta.strategy, meta.original_url.clone()),
            (
                &triple.mod_checkout,
                Strategy::Blobless,
                meta.fork_url
                    .clone()
                    .unwrap_or_else(|| meta.original_url.clone()),
            ),
        ] {
            if !validate::dir_like(checkout) {
                continue;
            }
            let _checkout_lock = PathLock::acquire(checkout)?;
            if validate::validate_checkout(&self.git, checkout, mirror).is_err() {
                println!("git-cache: checkout {checkout} is corrupted, recreating");
                repair::repair_checkout(&self.git, checkout, mirror, strategy, &remote)?;
            }
            existing += 1;
        }

        // Reconcile the counter against what actually exists on disk.
        let mut meta = metadata::load(mirror)?;
        if meta.ref_count != existing {
            meta.ref_count = existing;
            metadata::save(mirror, &meta)?;
        }
        Ok(())
    }

    /// Repair stale checkouts everywhere and report orphans.
    pub fn repair_outdated(&self) -> Result<()> {
        let report = repair::repair_all_outdated(&self.cfg, &self.git)?;
        println!(
            "git-cache: checked {} checkout(s): {} repaired, {} dirty (left alone), {} failed",
            report.checked, report.repaired, report.skipped_dirty, report.failed
        );

        let orphans = repair::detect_orphans(&self.cfg, |checkout| {
            println!("git-cache: orphaned checkout (mirror is gone): {checkout}");
        })?;
        if orphans > 0 {
            println!(
                "git-cache: {orphans} orphaned checkout(s); re-clone their URLs or remove them"
            );
        }
        Ok(())
    }
}

/// Prune now-empty owner/host directories after removals.
fn remove_empty_tree(root: &Utf8Path) {
    let Ok(entries) = root.read_dir_utf8() else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            remove_empty_tree(entry.path());
            let _ = std::fs::remove_dir(entry.path());
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn ago(epoch: u64) -> String {
    if epoch == 0 {
        return "never".to_string();
    }
    let delta = metadata::unix_now().saturating_sub(epoch);
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{}m ago", delta / 60),
        3600..=86_399 => format!("{}h ago", delta / 3600),
        _ => format!("{}d ago", delta / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::git_available;

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8Path::from_path(p).unwrap().to_owned()
    }

    fn cache_in(dir: &tempfile::TempDir) -> GitCache {
        let root = utf8(dir.path());
        let cfg = CacheConfig::for_roots(root.join("cache"), root.join("checkouts"));
        GitCache::new(cfg).unwrap()
    }

    #[test]
    fn builder_fills_request_defaults() {
        let req = CloneRequestBuilder::default()
            .url("https://github.com/octocat/Hello-World".to_string())
            .build()
            .unwrap();
        assert_eq!(req.strategy, StrategyArg::Auto);
        assert_eq!(req.depth, 1);
        assert!(!req.make_private);
        assert!(req.recursive.is_none());
    }

    #[test]
    fn clone_rejects_unsupported_urls() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let req = CloneRequestBuilder::default()
            .url("file:///tmp/somewhere".to_string())
            .build()
            .unwrap();
        assert!(matches!(
            cache.clone_repository(&req),
            Err(CacheError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn verify_reports_missing_repository() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        assert!(matches!(
            cache.verify(Some("https://github.com/octocat/Hello-World")),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn verify_reconciles_ref_count_with_disk() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let git = GitTool::new(false);

        let id = parse_url("https://github.com/octocat/Hello-World").unwrap();
        let triple = paths(cache.config(), &id);
        git.run(None, &["init", "--bare", triple.mirror.as_str()])
            .unwrap();
        let mut meta = CacheMetadata::create(&id, &id.https_url(), Strategy::Full);
        meta.ref_count = 2; // claims two checkouts; none exist
        metadata::save(&triple.mirror, &meta).unwrap();

        cache
            .verify(Some("https://github.com/octocat/Hello-World"))
            .unwrap();
        assert_eq!(metadata::load(&triple.mirror).unwrap().ref_count, 0);
    }

    #[test]
    fn clean_without_force_is_a_dry_run() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir);
        let git = GitTool::new(false);

        let id = parse_url("https://github.com/octocat/Hello-World").unwrap();
        let triple = paths(cache.config(), &id);
        git.run(None, &["init", "--bare", triple.mirror.as_str()])
            .unwrap();
        metadata::save(
            &triple.mirror,
            &CacheMetadata::create(&id, &id.https_url(), Strategy::Full),
        )
        .unwrap();

        cache.clean(false).unwrap();
        assert!(triple.mirror.is_dir());

        cache.clean(true).unwrap();
        assert!(!triple.mirror.exists());
    }

    #[test]
    fn human_helpers_format_reasonably() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(ago(0), "never");
        assert_eq!(ago(metadata::unix_now()), "just now");
    }
}
