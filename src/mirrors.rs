//! Additional remotes ("mirrors") for a cached repository.
//!
//! The authoritative remote list lives in the mirror's git configuration;
//! `mirrors.txt` beside the sidecar carries the bookkeeping git config has no
//! place for (type, priority, when it was added). One tab-separated line per
//! mirror.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::SyncConfig;
use crate::error::{CacheError, IoResultExt, Result};
use crate::git::GitTool;
use crate::metadata;

const MIRRORS_FILE: &str = "mirrors.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMirror {
    pub name: String,
    pub url: String,
    pub kind: String,
    pub priority: u32,
    pub added_time: u64,
}

pub struct MirrorManager<'a> {
    git: &'a GitTool,
    mirror_path: &'a Utf8Path,
}

impl<'a> MirrorManager<'a> {
    pub fn new(git: &'a GitTool, mirror_path: &'a Utf8Path) -> Self {
        MirrorManager { git, mirror_path }
    }

    fn file_path(&self) -> Utf8PathBuf {
        self.mirror_path.join(MIRRORS_FILE)
    }

    /// Register a named mirror: a git remote plus a bookkeeping line.
    pub fn add(&self, name: &str, url: &str, kind: &str, priority: u32) -> Result<()> {
        if name == "origin" {
            return Err(CacheError::Args("`origin` is reserved".into()));
        }
        let mut mirrors = self.list()?;
        if mirrors.iter().any(|m| m.name == name) {
            return Err(CacheError::Args(format!("mirror `{name}` already exists")));
        }

        self.git
            .run(Some(self.mirror_path), &["remote", "add", name, url])?;
        mirrors.push(RemoteMirror {
            name: name.to_string(),
            url: url.to_string(),
            kind: kind.to_string(),
            priority,
            added_time: metadata::unix_now(),
        });
        self.save(&mirrors)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut mirrors = self.list()?;
        let before = mirrors.len();
        mirrors.retain(|m| m.name != name);
        if mirrors.len() == before {
            return Err(CacheError::NotFound(format!("mirror `{name}`")));
        }
        self.git
            .run(Some(self.mirror_path), &["remote", "remove", name])?;
        self.save(&mirrors)
    }

    /// Mirrors in priority order (lowest number first).
    pub fn list(&self) -> Result<Vec<RemoteMirror>> {
        let path = self.file_path();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::fs(path, e)),
        };
        let mut mirrors: Vec<RemoteMirror> =
            contents.lines().filter_map(parse_line).collect();
        mirrors.sort_by_key(|m| m.priority);
        Ok(mirrors)
    }

    /// Fetch from every registered mirror, preferred one first. Individual
    /// failures are reported and counted, not fatal.
    pub fn sync(&self, sync_cfg: &SyncConfig) -> Result<usize> {
        let mut mirrors = self.list()?;
        if let Some(preferred) = &sync_cfg.preferred_mirror {
            mirrors.sort_by_key(|m| (m.name != *preferred, m.priority));
        }

        let mut failed = 0;
        for mirror in &mirrors {
            let result = self.git.run_network(
                Some(self.mirror_path),
                &["fetch", &mirror.name, "--prune"],
                &format!("fetching mirror {}", mirror.name),
            );
            if let Err(e) = result {
                eprintln!("git-cache: mirror `{}` failed to sync: {e}", mirror.name);
                failed += 1;
            }
        }
        Ok(failed)
    }

    fn save(&self, mirrors: &[RemoteMirror]) -> Result<()> {
        let mut body = String::new();
        for m in mirrors {
            body.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                m.name, m.url, m.kind, m.priority, m.added_time
            ));
        }
        let path = self.file_path();
        fs::write(&path, body).fs_context(&path)
    }
}

fn parse_line(line: &str) -> Option<RemoteMirror> {
    let mut fields = line.split('\t');
    let name = fields.next()?.to_string();
    let url = fields.next()?.to_string();
    let kind = fields.next()?.to_string();
    let priority = fields.next()?.parse().ok()?;
    let added_time = fields.next()?.parse().ok()?;
    if name.is_empty() || url.is_empty() {
        return None;
    }
    Some(RemoteMirror {
        name,
        url,
        kind,
        priority,
        added_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::git_available;

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8Path::from_path(p).unwrap().to_owned()
    }

    #[test]
    fn list_parses_and_orders_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = utf8(dir.path());
        fs::write(
            mirror.join(MIRRORS_FILE),
            "backup\thttps://backup.example/r.git\tbackup\t5\t1700000000\n\
             fast\thttps://fast.example/r.git\tperformance\t0\t1700000001\n\
             garbage line without tabs\n",
        )
        .unwrap();

        let git = GitTool::new(false);
        let mgr = MirrorManager::new(&git, &mirror);
        let mirrors = mgr.list().unwrap();
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[0].name, "fast");
        assert_eq!(mirrors[1].name, "backup");
    }

    #[test]
    fn add_and_remove_round_trip() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mirror = utf8(dir.path()).join("repo");
        let git = GitTool::new(false);
        git.run(None, &["init", "--bare", mirror.as_str()]).unwrap();

        let mgr = MirrorManager::new(&git, &mirror);
        mgr.add("backup", "https://backup.example/r.git", "backup", 1)
            .unwrap();
        assert_eq!(mgr.list().unwrap().len(), 1);
        // duplicate names are rejected
        assert!(mgr
            .add("backup", "https://other.example/r.git", "backup", 2)
            .is_err());

        mgr.remove("backup").unwrap();
        assert!(mgr.list().unwrap().is_empty());
        assert!(matches!(
            mgr.remove("backup"),
            Err(CacheError::NotFound(_))
        ));
    }
}
