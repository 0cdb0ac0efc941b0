//! Configuration: built-in defaults, the user config file, then environment
//! overrides, in that order. Command-line flags are applied last by the CLI.

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{CacheError, Result};
use crate::strategy::Strategy;

/// Cache root relative to `$HOME` when nothing else is configured.
pub const DEFAULT_CACHE_SUBDIR: &str = ".cache/git";
/// Checkout root relative to `$HOME` when nothing else is configured.
pub const DEFAULT_CHECKOUT_SUBDIR: &str = "github";
/// Directory under the checkout root that holds modifiable checkouts.
///
/// Historical constant: existing on-disk caches have their modifiable
/// checkouts here, so changing it would orphan them.
pub const MODIFIABLE_SUBDIR: &str = "mithro";
/// Organization forks land in unless overridden.
pub const DEFAULT_FORK_ORGANIZATION: &str = "mithro-mirrors";

/// User config file, git-config syntax, relative to `$HOME`.
const USER_CONFIG_FILE: &str = ".config/git-cache/config";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_root: Utf8PathBuf,
    pub checkout_root: Utf8PathBuf,
    pub modifiable_subdir: String,
    pub github_token: Option<String>,
    pub default_strategy: Strategy,
    pub fork_organization: String,
    pub verbose: bool,
    pub force: bool,
    pub recursive_submodules: bool,
}

impl CacheConfig {
    /// Resolve configuration from defaults, the user config file and the
    /// environment. Needs `$HOME` for the default roots.
    pub fn load() -> Result<Self> {
        let home = home_dir()?;
        let mut cfg = Self::for_roots(
            home.join(DEFAULT_CACHE_SUBDIR),
            home.join(DEFAULT_CHECKOUT_SUBDIR),
        );

        cfg.apply_user_config(&home.join(USER_CONFIG_FILE))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Configuration with explicit roots and default behavior. Also the entry
    /// point used by tests.
    pub fn for_roots(cache_root: Utf8PathBuf, checkout_root: Utf8PathBuf) -> Self {
        CacheConfig {
            cache_root,
            checkout_root,
            modifiable_subdir: MODIFIABLE_SUBDIR.to_string(),
            github_token: None,
            default_strategy: Strategy::Treeless,
            fork_organization: DEFAULT_FORK_ORGANIZATION.to_string(),
            verbose: false,
            force: false,
            recursive_submodules: true,
        }
    }

    fn apply_user_config(&mut self, path: &Utf8Path) -> Result<()> {
        if !path.is_file() {
            return Ok(());
        }
        let file = gix_config::File::from_path_no_includes(
            path.as_std_path().to_owned(),
            gix_config::Source::User,
        )
        .map_err(|e| CacheError::Config(format!("cannot parse `{path}`: {e}")))?;

        if let Some(mut sections) = file.sections_by_name("cache") {
            if let Some(section) = sections.next() {
                let body = section.body();
                if let Some(v) = body.value("root") {
                    self.cache_root = expand_path(&v.to_string());
                }
                if let Some(v) = body.value("checkout-root") {
                    self.checkout_root = expand_path(&v.to_string());
                }
                if let Some(v) = body.value("strategy") {
                    self.default_strategy = v
                        .to_string()
                        .parse()
                        .map_err(|e: String| CacheError::Config(e))?;
                }
            }
        }
        if let Some(mut sections) = file.sections_by_name("fork") {
            if let Some(section) = sections.next() {
                if let Some(v) = section.body().value("organization") {
                    self.fork_organization = v.to_string();
                }
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        // GIT_CACHE wins over the legacy GIT_CACHE_ROOT alias.
        if let Ok(v) = std::env::var("GIT_CACHE_ROOT") {
            self.cache_root = expand_path(&v);
        }
        if let Ok(v) = std::env::var("GIT_CACHE") {
            self.cache_root = expand_path(&v);
        }
        if let Ok(v) = std::env::var("GIT_CHECKOUT_ROOT") {
            self.checkout_root = expand_path(&v);
        }
        if let Ok(v) = std::env::var("GITHUB_TOKEN") {
            if !v.is_empty() {
                self.github_token = Some(v);
            }
        }
    }

    /// Create both roots if missing.
    pub fn ensure_roots(&self) -> Result<()> {
        for root in [&self.cache_root, &self.checkout_root] {
            std::fs::create_dir_all(root)
                .map_err(|e| CacheError::fs(root.clone(), e))?;
        }
        Ok(())
    }
}

/// Mirror synchronization knobs, environment-driven.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub auto_sync: bool,
    pub sync_interval_hours: u64,
    pub preferred_mirror: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        SyncConfig {
            auto_sync: env_flag("GIT_CACHE_AUTO_SYNC"),
            sync_interval_hours: std::env::var("GIT_CACHE_SYNC_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(24),
            preferred_mirror: std::env::var("GIT_CACHE_PREFERRED_MIRROR")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

pub(crate) fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn expand_path(raw: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn home_dir() -> Result<Utf8PathBuf> {
    std::env::var("HOME")
        .ok()
        .filter(|h| !h.is_empty())
        .map(Utf8PathBuf::from)
        .ok_or_else(|| CacheError::Config("HOME is not set".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_in_roots_and_behavior() {
        let cfg = CacheConfig::for_roots("/c".into(), "/w".into());
        assert_eq!(cfg.modifiable_subdir, "mithro");
        assert_eq!(cfg.fork_organization, "mithro-mirrors");
        assert_eq!(cfg.default_strategy, Strategy::Treeless);
        assert!(cfg.recursive_submodules);
        assert!(cfg.github_token.is_none());
    }

    #[test]
    fn user_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[cache]").unwrap();
        writeln!(f, "\troot = /srv/git-cache").unwrap();
        writeln!(f, "\tstrategy = blobless").unwrap();
        writeln!(f, "[fork]").unwrap();
        writeln!(f, "\torganization = my-mirrors").unwrap();

        let mut cfg = CacheConfig::for_roots("/c".into(), "/w".into());
        cfg.apply_user_config(Utf8Path::from_path(&path).unwrap())
            .unwrap();
        assert_eq!(cfg.cache_root, "/srv/git-cache");
        assert_eq!(cfg.default_strategy, Strategy::Blobless);
        assert_eq!(cfg.fork_organization, "my-mirrors");
    }

    #[test]
    fn bad_strategy_in_config_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "[cache]\n\tstrategy = sideways\n").unwrap();

        let mut cfg = CacheConfig::for_roots("/c".into(), "/w".into());
        let err = cfg
            .apply_user_config(Utf8Path::from_path(&path).unwrap())
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }
}
