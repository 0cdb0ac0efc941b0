//! Clone strategy selection.
//!
//! `auto` is an input token only: it resolves to one of the four concrete
//! strategies before anything is persisted, either from hosting-provider
//! metadata or, failing that, conservative synthetic defaults.

use serde::{Deserialize, Serialize};

use camino::Utf8Path;

use crate::config::{env_flag, CacheConfig};
use crate::error::Result;
use crate::git::GitTool;
use crate::github::GithubClient;
use crate::identity::RemoteIdentity;
use crate::metadata;

/// Size thresholds, megabytes.
const SMALL_REPO_MB: u64 = 10;
const MEDIUM_REPO_MB: u64 = 100;
const LARGE_REPO_MB: u64 = 500;

/// Commit count thresholds.
const SHALLOW_COMMIT_THRESHOLD: u32 = 100;
const DEEP_HISTORY_THRESHOLD: u32 = 10_000;

/// Activity levels (0..100).
const LOW_ACTIVITY: u8 = 5;
const HIGH_ACTIVITY: u8 = 50;

/// Files larger than this flag a repository for blobless cloning.
const LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Recommendations below this confidence fall back to the configured default.
const APPLY_CONFIDENCE: u8 = 70;

/// A concrete, persistable clone strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Full,
    Shallow,
    Treeless,
    Blobless,
}

impl Strategy {
    /// Extra `git clone` arguments for this strategy.
    pub fn clone_flags(self, depth: u32) -> Vec<String> {
        match self {
            Strategy::Full => vec![],
            Strategy::Shallow => vec![format!("--depth={depth}")],
            Strategy::Treeless => vec!["--filter=tree:0".into()],
            Strategy::Blobless => vec!["--filter=blob:none".into()],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Full => "full",
            Strategy::Shallow => "shallow",
            Strategy::Treeless => "treeless",
            Strategy::Blobless => "blobless",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Strategy::Full),
            "shallow" => Ok(Strategy::Shallow),
            "treeless" => Ok(Strategy::Treeless),
            "blobless" => Ok(Strategy::Blobless),
            other => Err(format!(
                "unknown strategy `{other}` (expected full, shallow, treeless, blobless or auto)"
            )),
        }
    }
}

/// Strategy as given on the command line; `auto` is legal here and nowhere
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyArg {
    #[default]
    Auto,
    Fixed(Strategy),
}

impl std::str::FromStr for StrategyArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "auto" {
            Ok(StrategyArg::Auto)
        } else {
            s.parse().map(StrategyArg::Fixed)
        }
    }
}

/// Transient characteristics of a repository, gathered best-effort.
#[derive(Debug, Clone, Default)]
pub struct RepoAnalysis {
    /// Estimated on-disk size, bytes.
    pub estimated_size: u64,
    pub commit_count: u32,
    pub branch_count: u32,
    pub tag_count: u32,
    pub file_count: u32,
    pub has_large_files: bool,
    pub is_monorepo: bool,
    /// Unix time of the most recent commit.
    pub last_activity: u64,
    /// 0..100, derived from recency.
    pub activity_level: u8,
    pub primary_language: Option<String>,
}

impl RepoAnalysis {
    fn size_mb(&self) -> u64 {
        self.estimated_size / (1024 * 1024)
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub prefer_speed: bool,
    pub size_threshold_mb: u64,
    pub depth_threshold: u32,
    pub enable_filters: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            prefer_speed: true,
            size_threshold_mb: MEDIUM_REPO_MB,
            depth_threshold: SHALLOW_COMMIT_THRESHOLD,
            enable_filters: true,
        }
    }
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if env_flag("GIT_CACHE_PREFER_SPEED") {
            cfg.prefer_speed = true;
        }
        if env_flag("GIT_CACHE_PREFER_COMPLETE") {
            cfg.prefer_speed = false;
        }
        if let Some(v) = std::env::var("GIT_CACHE_SIZE_THRESHOLD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
        {
            cfg.size_threshold_mb = v;
        }
        if let Some(v) = std::env::var("GIT_CACHE_DEPTH_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
        {
            cfg.depth_threshold = v;
        }
        cfg
    }
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub strategy: Strategy,
    /// 0..100.
    pub confidence: u8,
    pub reasoning: &'static str,
    pub fallback: Strategy,
}

/// Pick a strategy from the analysis. First matching rule wins.
pub fn recommend(a: &RepoAnalysis, cfg: &DetectorConfig) -> Recommendation {
    let size_mb = a.size_mb();

    let rec = |strategy, confidence, reasoning, fallback| Recommendation {
        strategy,
        confidence,
        reasoning,
        fallback,
    };

    let mut out = if size_mb < SMALL_REPO_MB && a.commit_count < SHALLOW_COMMIT_THRESHOLD {
        rec(
            Strategy::Full,
            95,
            "small repository, full clone is optimal",
            Strategy::Shallow,
        )
    } else if a.is_monorepo {
        rec(
            Strategy::Blobless,
            90,
            "monorepo detected, blobless clone recommended",
            Strategy::Treeless,
        )
    } else if (size_mb > cfg.size_threshold_mb || a.commit_count > cfg.depth_threshold)
        && cfg.prefer_speed
        && (a.has_large_files || a.is_monorepo)
    {
        rec(
            Strategy::Blobless,
            85,
            "large repository with binary files, blobless clone recommended",
            Strategy::Treeless,
        )
    } else if size_mb > LARGE_REPO_MB && cfg.prefer_speed {
        rec(
            Strategy::Treeless,
            80,
            "large repository, treeless clone for faster download",
            Strategy::Blobless,
        )
    } else if size_mb > cfg.size_threshold_mb && cfg.prefer_speed {
        rec(
            Strategy::Shallow,
            75,
            "medium repository, shallow clone for speed",
            Strategy::Treeless,
        )
    } else if size_mb > cfg.size_threshold_mb {
        rec(
            Strategy::Full,
            70,
            "full history preferred despite size",
            Strategy::Treeless,
        )
    } else if a.activity_level > HIGH_ACTIVITY && cfg.prefer_speed {
        rec(
            Strategy::Shallow,
            70,
            "high activity repository, shallow clone for quick updates",
            Strategy::Full,
        )
    } else if a.activity_level < LOW_ACTIVITY {
        rec(
            Strategy::Full,
            80,
            "low activity repository, full clone appropriate",
            Strategy::Shallow,
        )
    } else if size_mb > cfg.size_threshold_mb / 2 {
        rec(
            Strategy::Treeless,
            60,
            "medium-sized repository, treeless clone balances speed and depth",
            Strategy::Shallow,
        )
    } else {
        rec(
            Strategy::Full,
            65,
            "standard repository, full clone recommended",
            Strategy::Shallow,
        )
    };

    if !cfg.enable_filters {
        if matches!(out.strategy, Strategy::Treeless | Strategy::Blobless) {
            out.strategy = Strategy::Shallow;
        }
        if matches!(out.fallback, Strategy::Treeless | Strategy::Blobless) {
            out.fallback = Strategy::Full;
        }
    }

    out
}

/// Resolve a CLI strategy argument to a concrete strategy.
pub fn resolve(
    arg: StrategyArg,
    id: &RemoteIdentity,
    client: Option<&GithubClient>,
    cfg: &CacheConfig,
) -> Strategy {
    match arg {
        StrategyArg::Fixed(s) => s,
        StrategyArg::Auto => {
            let detector = DetectorConfig::from_env();
            let analysis = analyze_identity(client, id);
            let rec = recommend(&analysis, &detector);
            if rec.confidence >= APPLY_CONFIDENCE {
                if cfg.verbose {
                    println!(
                        "git-cache: auto-detected strategy {} ({}% confidence): {}",
                        rec.strategy, rec.confidence, rec.reasoning
                    );
                }
                rec.strategy
            } else {
                if cfg.verbose {
                    println!(
                        "git-cache: low confidence ({}%), using default strategy {}",
                        rec.confidence, cfg.default_strategy
                    );
                }
                cfg.default_strategy
            }
        }
    }
}

/// Analyze a remote repository through the hosting provider. Falls back to
/// conservative synthetic defaults when the provider is unreachable.
pub fn analyze_identity(client: Option<&GithubClient>, id: &RemoteIdentity) -> RepoAnalysis {
    let mut analysis = RepoAnalysis {
        estimated_size: MEDIUM_REPO_MB * 1024 * 1024,
        commit_count: 1000,
        branch_count: 5,
        tag_count: 10,
        file_count: 500,
        last_activity: metadata::unix_now(),
        activity_level: 50,
        ..RepoAnalysis::default()
    };

    let Some(client) = client else {
        return analysis;
    };
    let facts = match client.get_repo(&id.owner, &id.name) {
        Ok(facts) => facts,
        Err(e) => {
            tracing::debug!("repository analysis via host API failed: {e}");
            return analysis;
        }
    };

    // The repos endpoint has no size breakdown, so these stay coarse.
    if facts.is_fork {
        analysis.estimated_size = SMALL_REPO_MB * 1024 * 1024;
        analysis.activity_level = 30;
    }
    if facts.fork_count > 100 {
        analysis.estimated_size = LARGE_REPO_MB * 1024 * 1024;
        analysis.activity_level = 70;
        analysis.is_monorepo = true;
    }
    analysis
}

/// Analyze an already-cloned repository by direct inspection.
pub fn analyze_local(git: &GitTool, path: &Utf8Path) -> Result<RepoAnalysis> {
    let mut analysis = RepoAnalysis {
        estimated_size: metadata::calculate_size(path),
        ..RepoAnalysis::default()
    };

    analysis.commit_count = git
        .output(Some(path), &["rev-list", "--count", "HEAD"])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    analysis.branch_count = git
        .output(Some(path), &["branch", "-r"])
        .map(|s| s.lines().count() as u32)
        .unwrap_or(1);
    analysis.tag_count = git
        .output(Some(path), &["tag"])
        .map(|s| s.lines().filter(|l| !l.is_empty()).count() as u32)
        .unwrap_or(0);
    analysis.last_activity = git
        .output(Some(path), &["log", "-1", "--format=%ct"])
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(metadata::unix_now);
    analysis.activity_level = activity_from_age(analysis.last_activity);

    let mut file_count = 0u32;
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        let Ok(md) = entry.metadata() else { continue };
        if md.is_file() {
            file_count += 1;
            if md.len() > LARGE_FILE_BYTES {
                analysis.has_large_files = true;
            }
        }
    }
    analysis.file_count = file_count;

    analysis.is_monorepo = analysis.estimated_size > LARGE_REPO_MB * 1024 * 1024
        || analysis.commit_count > DEEP_HISTORY_THRESHOLD;

    Ok(analysis)
}

fn activity_from_age(last_activity: u64) -> u8 {
    let days = metadata::unix_now().saturating_sub(last_activity) / (24 * 60 * 60);
    match days {
        0..=6 => 90,
        7..=29 => 70,
        30..=89 => 50,
        _ => 30,
    }
}

/// Rough download time in seconds for a strategy over the given bandwidth.
pub fn estimate_download_secs(a: &RepoAnalysis, strategy: Strategy, bandwidth_mbps: u64) -> u64 {
    if bandwidth_mbps == 0 {
        return 0;
    }
    let bytes = match strategy {
        Strategy::Full => a.estimated_size,
        Strategy::Shallow => a.estimated_size / 5,
        Strategy::Treeless => a.estimated_size * 2 / 5,
        Strategy::Blobless => a.estimated_size / 8,
    };
    let bytes_per_sec = bandwidth_mbps * 1024 * 1024 / 8;
    bytes.div_ceil(bytes_per_sec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(size_mb: u64, commits: u32) -> RepoAnalysis {
        RepoAnalysis {
            estimated_size: size_mb * 1024 * 1024,
            commit_count: commits,
            activity_level: 30,
            ..RepoAnalysis::default()
        }
    }

    #[test]
    fn tiny_repository_gets_full_clone() {
        let rec = recommend(&analysis(1, 50), &DetectorConfig::default());
        assert_eq!(rec.strategy, Strategy::Full);
        assert_eq!(rec.confidence, 95);
        assert_eq!(rec.fallback, Strategy::Shallow);
    }

    #[test]
    fn flagged_monorepo_gets_blobless() {
        let mut a = analysis(600, 20_000);
        a.is_monorepo = true;
        let rec = recommend(&a, &DetectorConfig::default());
        assert_eq!(rec.strategy, Strategy::Blobless);
        assert_eq!(rec.confidence, 90);
    }

    #[test]
    fn large_files_with_speed_preference_gets_blobless() {
        let mut a = analysis(200, 50);
        a.has_large_files = true;
        let rec = recommend(&a, &DetectorConfig::default());
        assert_eq!(rec.strategy, Strategy::Blobless);
        assert_eq!(rec.confidence, 85);
    }

    #[test]
    fn completeness_preference_overrides_size() {
        let cfg = DetectorConfig {
            prefer_speed: false,
            ..DetectorConfig::default()
        };
        let rec = recommend(&analysis(200, 50), &cfg);
        assert_eq!(rec.strategy, Strategy::Full);
        assert_eq!(rec.confidence, 70);
    }

    #[test]
    fn high_activity_gets_shallow() {
        let mut a = analysis(50, 500);
        a.activity_level = 80;
        let rec = recommend(&a, &DetectorConfig::default());
        assert_eq!(rec.strategy, Strategy::Shallow);
        assert_eq!(rec.confidence, 70);
    }

    #[test]
    fn quiet_archive_gets_full() {
        let mut a = analysis(50, 500);
        a.activity_level = 2;
        let rec = recommend(&a, &DetectorConfig::default());
        assert_eq!(rec.strategy, Strategy::Full);
        assert_eq!(rec.confidence, 80);
    }

    #[test]
    fn disabling_filters_downgrades_partial_clones() {
        let cfg = DetectorConfig {
            enable_filters: false,
            ..DetectorConfig::default()
        };
        let mut a = analysis(600, 20_000);
        a.is_monorepo = true;
        let rec = recommend(&a, &cfg);
        assert_eq!(rec.strategy, Strategy::Shallow);
    }

    #[test]
    fn strategy_keywords_round_trip() {
        for s in [
            Strategy::Full,
            Strategy::Shallow,
            Strategy::Treeless,
            Strategy::Blobless,
        ] {
            assert_eq!(s.as_str().parse::<Strategy>().unwrap(), s);
        }
        assert_eq!("auto".parse::<StrategyArg>().unwrap(), StrategyArg::Auto);
        assert!("sideways".parse::<StrategyArg>().is_err());
    }

    #[test]
    fn download_estimate_scales_by_strategy() {
        let a = analysis(100, 1000);
        let full = estimate_download_secs(&a, Strategy::Full, 100);
        let shallow = estimate_download_secs(&a, Strategy::Shallow, 100);
        let blobless = estimate_download_secs(&a, Strategy::Blobless, 100);
        assert!(full > shallow);
        assert!(shallow > blobless || shallow == 1);
        assert_eq!(estimate_download_secs(&a, Strategy::Full, 0), 0);
    }
}
