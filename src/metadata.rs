//! The per-mirror metadata sidecar: one `cache_metadata.json` document at the
//! mirror root, written whole on every change.
//!
//! Loading tolerates missing fields so that documents written by older
//! versions keep working; a document that does not parse at all reports as
//! corrupt and the caller may discard and rewrite it.

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::identity::{RemoteIdentity, RepoHost};
use crate::strategy::Strategy;

pub const METADATA_FILE: &str = "cache_metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub original_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_url: Option<String>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_organization: Option<String>,
    #[serde(rename = "type", default)]
    pub host: RepoHost,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub created_time: u64,
    #[serde(default)]
    pub last_sync_time: u64,
    #[serde(default)]
    pub last_access_time: u64,
    #[serde(default)]
    pub cache_size: u64,
    #[serde(default)]
    pub ref_count: u32,
    #[serde(default)]
    pub is_fork_needed: bool,
    #[serde(default)]
    pub is_private_fork: bool,
    #[serde(default)]
    pub has_submodules: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

impl CacheMetadata {
    /// Fresh metadata for a newly mirrored repository.
    pub fn create(id: &RemoteIdentity, original_url: &str, strategy: Strategy) -> Self {
        let now = unix_now();
        CacheMetadata {
            original_url: original_url.to_string(),
            fork_url: None,
            owner: id.owner.clone(),
            name: id.name.clone(),
            fork_organization: None,
            host: id.host,
            strategy,
            created_time: now,
            last_sync_time: 0,
            last_access_time: now,
            cache_size: 0,
            ref_count: 0,
            is_fork_needed: id.host == RepoHost::Github,
            is_private_fork: false,
            has_submodules: false,
            default_branch: None,
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_path(mirror: &Utf8Path) -> Utf8PathBuf {
    mirror.join(METADATA_FILE)
}

pub fn exists(mirror: &Utf8Path) -> bool {
    file_path(mirror).is_file()
}

/// Persist the sidecar, replacing the whole document.
pub fn save(mirror: &Utf8Path, meta: &CacheMetadata) -> Result<()> {
    let path = file_path(mirror);
    let body = serde_json::to_string_pretty(meta)
        .map_err(|e| CacheError::Config(format!("cannot serialize metadata: {e}")))?;
    fs::write(&path, body).map_err(|e| CacheError::fs(path, e))
}

/// Load the sidecar. Missing file reports [`CacheError::NotFound`],
/// unparseable content [`CacheError::Corruption`].
pub fn load(mirror: &Utf8Path) -> Result<CacheMetadata> {
    let path = file_path(mirror);
    let body = match fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::NotFound(format!("no metadata at `{path}`")))
        }
        Err(e) => return Err(CacheError::fs(path, e)),
    };
    serde_json::from_str(&body).map_err(|e| CacheError::Corruption {
        path,
        reason: format!("malformed metadata document: {e}"),
    })
}

fn update<F: FnOnce(&mut CacheMetadata)>(mirror: &Utf8Path, f: F) -> Result<()> {
    let mut meta = load(mirror)?;
    f(&mut meta);
    save(mirror, &meta)
}

/// Bump `last_access_time`. The caller must hold the mirror's path lock.
pub fn update_access(mirror: &Utf8Path) -> Result<()> {
    update(mirror, |m| m.last_access_time = unix_now())
}

/// Bump `last_sync_time`. The caller must hold the mirror's path lock.
pub fn update_sync(mirror: &Utf8Path) -> Result<()> {
    update(mirror, |m| m.last_sync_time = unix_now())
}

/// Record one more derived checkout. The caller must hold the mirror's path
/// lock.
pub fn inc_ref(mirror: &Utf8Path) -> Result<()> {
    update(mirror, |m| {
        m.ref_count += 1;
        m.last_access_time = unix_now();
    })
}

/// Record one less derived checkout, saturating at zero. The caller must
/// hold the mirror's path lock.
pub fn dec_ref(mirror: &Utf8Path) -> Result<()> {
    update(mirror, |m| m.ref_count = m.ref_count.saturating_sub(1))
}

/// Recursive byte count of a directory tree. Best-effort approximation used
/// for display and strategy heuristics.
pub fn calculate_size(path: &Utf8Path) -> u64 {
    walkdir::WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|md| md.is_file())
        .map(|md| md.len())
        .sum()
}

/// Visit every mirror under `cache_root` that carries a sidecar. Returns the
/// number of mirrors visited. Mirrors whose sidecar fails to load are skipped
/// with a warning.
pub fn for_each<F>(cache_root: &Utf8Path, mut f: F) -> Result<usize>
where
    F: FnMut(&Utf8Path, CacheMetadata),
{
    let mut count = 0;
    for host_dir in subdirs(cache_root) {
        for owner_dir in subdirs(&host_dir) {
            for repo_dir in subdirs(&owner_dir) {
                if !exists(&repo_dir) {
                    continue;
                }
                match load(&repo_dir) {
                    Ok(meta) => {
                        f(&repo_dir, meta);
                        count += 1;
                    }
                    Err(e) => tracing::warn!("skipping `{repo_dir}`: {e}"),
                }
            }
        }
    }
    Ok(count)
}

/// Immediate subdirectories, skipping lock files and crash transients.
fn subdirs(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let Ok(entries) = dir.read_dir_utf8() else {
        return Vec::new();
    };
    let mut out: Vec<Utf8PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path().to_owned())
        .filter(|p| {
            let name = p.file_name().unwrap_or("");
            !name.starts_with('.')
                && !name.contains(".tmp.")
                && !name.contains(".backup.")
                && !name.ends_with(".lock")
        })
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> RemoteIdentity {
        crate::identity::parse_url("https://github.com/octocat/Hello-World").unwrap()
    }

    fn mirror_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        let path = Utf8Path::from_path(dir.path()).unwrap().join("mirror");
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_dir(&dir);
        let meta = CacheMetadata::create(
            &sample_identity(),
            "https://github.com/octocat/Hello-World",
            Strategy::Blobless,
        );
        save(&mirror, &meta).unwrap();
        assert!(exists(&mirror));
        assert_eq!(load(&mirror).unwrap(), meta);
    }

    #[test]
    fn load_fills_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_dir(&dir);
        fs::write(
            mirror.join(METADATA_FILE),
            r#"{"original_url": "https://github.com/a/b"}"#,
        )
        .unwrap();
        let meta = load(&mirror).unwrap();
        assert_eq!(meta.strategy, Strategy::Full);
        assert_eq!(meta.host, RepoHost::Unknown);
        assert_eq!(meta.created_time, 0);
        assert_eq!(meta.ref_count, 0);
    }

    #[test]
    fn missing_and_malformed_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_dir(&dir);
        assert!(matches!(load(&mirror), Err(CacheError::NotFound(_))));

        fs::write(mirror.join(METADATA_FILE), "{ not json").unwrap();
        assert!(matches!(
            load(&mirror),
            Err(CacheError::Corruption { .. })
        ));
    }

    #[test]
    fn strategy_persists_as_lowercase_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_dir(&dir);
        let meta = CacheMetadata::create(&sample_identity(), "u", Strategy::Treeless);
        save(&mirror, &meta).unwrap();
        let body = fs::read_to_string(mirror.join(METADATA_FILE)).unwrap();
        assert!(body.contains(r#""strategy": "treeless""#));
        assert!(body.contains(r#""type": "github""#));
    }

    #[test]
    fn ref_count_inc_then_dec_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = mirror_dir(&dir);
        let meta = CacheMetadata::create(&sample_identity(), "u", Strategy::Full);
        save(&mirror, &meta).unwrap();

        inc_ref(&mirror).unwrap();
        assert_eq!(load(&mirror).unwrap().ref_count, 1);
        dec_ref(&mirror).unwrap();
        assert_eq!(load(&mirror).unwrap().ref_count, 0);
        // saturates at zero
        dec_ref(&mirror).unwrap();
        assert_eq!(load(&mirror).unwrap().ref_count, 0);
    }

    #[test]
    fn for_each_visits_only_mirrors_with_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let with_meta = root.join("github/octocat/Hello-World");
        let without_meta = root.join("github/octocat/Spoon-Knife");
        let transient = root.join("github/octocat/Hello-World.tmp.12345");
        for p in [&with_meta, &without_meta, &transient] {
            fs::create_dir_all(p).unwrap();
        }
        save(
            &with_meta,
            &CacheMetadata::create(&sample_identity(), "u", Strategy::Full),
        )
        .unwrap();

        let mut seen = Vec::new();
        let count = for_each(root, |path, meta| {
            seen.push((path.to_owned(), meta.name));
        })
        .unwrap();
        assert_eq!(count, 1);
        assert_eq!(seen, vec![(with_meta, "Hello-World".to_string())]);
    }

    #[test]
    fn calculate_size_sums_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a"), vec![0u8; 100]).unwrap();
        fs::write(root.join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(calculate_size(root), 150);
    }
}
