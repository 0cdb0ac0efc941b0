//! Mapping remote URLs onto stable identities and on-disk paths.
//!
//! Every URL shape a user might paste (`https://`, `git://`, `git+ssh://`,
//! scp-style `user@host:owner/name`, bare `host/owner/name`, ...) normalizes
//! to the same [`RemoteIdentity`], so all of them share one cache entry.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Hosting services the cache knows how to key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoHost {
    Github,
    #[default]
    Unknown,
}

impl RepoHost {
    /// Path segment used under the cache root.
    pub fn as_str(self) -> &'static str {
        match self {
            RepoHost::Github => "github",
            RepoHost::Unknown => "unknown",
        }
    }

    pub fn domain(self) -> &'static str {
        match self {
            RepoHost::Github => "github.com",
            RepoHost::Unknown => "unknown",
        }
    }

    fn from_domain(domain: &str) -> Option<Self> {
        match domain {
            "github.com" => Some(RepoHost::Github),
            _ => None,
        }
    }
}

/// A parsed repository identity. Owner and name keep their original case:
/// GitHub compares them case-insensitively, but case-sensitive filesystems
/// do not, so folding case here would invite collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteIdentity {
    pub host: RepoHost,
    pub owner: String,
    pub name: String,
}

impl RemoteIdentity {
    /// Canonical https clone URL for this identity.
    pub fn https_url(&self) -> String {
        format!("https://{}/{}/{}", self.host.domain(), self.owner, self.name)
    }

    /// Key used by the submodule walker's visited set.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.host.as_str(), self.owner, self.name)
    }
}

impl std::fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// The three on-disk locations derived from one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTriple {
    /// Bare mirror under the cache root.
    pub mirror: Utf8PathBuf,
    /// Read-only reference checkout.
    pub ro_checkout: Utf8PathBuf,
    /// Modifiable checkout (always blobless, may track a fork).
    pub mod_checkout: Utf8PathBuf,
}

/// Derive the path triple for an identity. Purely deterministic, touches no
/// filesystem state.
pub fn paths(cfg: &CacheConfig, id: &RemoteIdentity) -> PathTriple {
    PathTriple {
        mirror: cfg
            .cache_root
            .join(id.host.as_str())
            .join(&id.owner)
            .join(&id.name),
        ro_checkout: cfg.checkout_root.join(&id.owner).join(&id.name),
        mod_checkout: cfg
            .checkout_root
            .join(&cfg.modifiable_subdir)
            .join(format!("{}-{}", id.owner, id.name)),
    }
}

/// Parse a user-supplied repository URL into an identity.
///
/// Accepted shapes: `https://`, `http://`, `git://`, `ssh://[user@]host[:port]/`,
/// each optionally prefixed with `git+`, scp-style `[user@]host:owner/name`,
/// and bare `host/owner/name`. `file://` and unknown hosts are rejected, as
/// are inputs whose owner or name segment is empty once `.git` and trailing
/// slashes are stripped.
pub fn parse_url(input: &str) -> Result<RemoteIdentity> {
    let unsupported = || CacheError::UnsupportedUrl(input.to_string());

    let s = input.trim();
    if s.is_empty() {
        return Err(unsupported());
    }
    let s = s.strip_prefix("git+").unwrap_or(s);

    if let Some((scheme, _)) = s.split_once("://") {
        match scheme {
            "http" | "https" | "git" | "ssh" => {}
            // `file://` is local by definition; there is nothing to cache.
            _ => return Err(unsupported()),
        }
        let url = url::Url::parse(s).map_err(|_| unsupported())?;
        let domain = url.host_str().ok_or_else(unsupported)?;
        return identity_from_parts(input, domain, url.path());
    }

    // scp-style: [user@]host:path
    if let Some((user_host, path)) = s.split_once(':') {
        let domain = user_host
            .rsplit_once('@')
            .map(|(_, h)| h)
            .unwrap_or(user_host);
        return identity_from_parts(input, domain, path);
    }

    // bare host/owner/name
    if let Some((domain, path)) = s.split_once('/') {
        return identity_from_parts(input, domain, path);
    }

    Err(unsupported())
}

fn identity_from_parts(input: &str, domain: &str, path: &str) -> Result<RemoteIdentity> {
    let unsupported = || CacheError::UnsupportedUrl(input.to_string());

    let host = RepoHost::from_domain(domain).ok_or_else(unsupported)?;

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let &[owner, name] = segments.as_slice() else {
        return Err(unsupported());
    };
    let name = name.strip_suffix(".git").unwrap_or(name);

    if owner.is_empty() || name.is_empty() {
        return Err(unsupported());
    }
    // The segments become path components verbatim; refuse anything that
    // could escape the cache root.
    for part in [owner, name] {
        if part == "." || part == ".." || part.contains('\\') {
            return Err(unsupported());
        }
    }

    Ok(RemoteIdentity {
        host,
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn id(owner: &str, name: &str) -> RemoteIdentity {
        RemoteIdentity {
            host: RepoHost::Github,
            owner: owner.into(),
            name: name.into(),
        }
    }

    #[test]
    fn accepts_all_documented_shapes() {
        let cases = [
            ("https://github.com/owner/repo", "owner", "repo"),
            ("https://github.com/owner/repo.git", "owner", "repo"),
            ("https://github.com/owner/repo/", "owner", "repo"),
            ("https://github.com/user-name/repo-name.git", "user-name", "repo-name"),
            ("http://github.com/owner/repo", "owner", "repo"),
            ("git://github.com/owner/repo.git", "owner", "repo"),
            ("git+https://github.com/owner/repo.git", "owner", "repo"),
            ("git+http://github.com/owner/repo.git", "owner", "repo"),
            ("git@github.com:owner/repo.git", "owner", "repo"),
            ("git@github.com:owner/repo", "owner", "repo"),
            ("ssh://git@github.com/owner/repo.git", "owner", "repo"),
            ("ssh://github.com/owner/repo.git", "owner", "repo"),
            ("ssh://user@github.com/owner/repo.git", "owner", "repo"),
            ("ssh://git@github.com:22/owner/repo.git", "owner", "repo"),
            ("git+ssh://github.com/owner/repo.git", "owner", "repo"),
            ("git+ssh://git@github.com/owner/repo.git", "owner", "repo"),
            ("github.com/owner/repo", "owner", "repo"),
            ("github.com/owner/repo.git", "owner", "repo"),
            ("github.com:owner/repo.git", "owner", "repo"),
            ("https://github.com/owner/repo.git/", "owner", "repo"),
            ("https://github.com/OwNeR/RePo", "OwNeR", "RePo"),
            ("https://github.com/123/456", "123", "456"),
        ];
        for (url, owner, name) in cases {
            assert_eq!(parse_url(url).unwrap(), id(owner, name), "url: {url}");
        }
    }

    #[test]
    fn rejects_unsupported_shapes() {
        let cases = [
            "https://gitlab.com/owner/repo",
            "file:///path/to/repo.git",
            "ftp://github.com/owner/repo",
            "https://github.com/",
            "https://github.com/owner",
            "https://github.com/owner/",
            "https://github.com/owner/repo/extra",
            "https://github.com/../escape",
            "not-a-url",
            "",
        ];
        for url in cases {
            assert!(
                matches!(parse_url(url), Err(CacheError::UnsupportedUrl(_))),
                "should reject: {url}"
            );
        }
    }

    #[test]
    fn parse_is_idempotent_over_rebuild() {
        // Every accepted shape rebuilds to a canonical URL that parses back
        // to the same identity.
        for url in [
            "https://github.com/octocat/Hello-World",
            "git@github.com:octocat/Hello-World.git",
            "git+ssh://git@github.com/octocat/Hello-World",
            "github.com/octocat/Hello-World",
        ] {
            let parsed = parse_url(url).unwrap();
            assert_eq!(parse_url(&parsed.https_url()).unwrap(), parsed);
        }
    }

    #[test]
    fn path_triple_is_deterministic() {
        let cfg = CacheConfig::for_roots("/cache".into(), "/checkouts".into());
        let triple = paths(&cfg, &id("octocat", "Hello-World"));
        assert_eq!(triple.mirror, "/cache/github/octocat/Hello-World");
        assert_eq!(triple.ro_checkout, "/checkouts/octocat/Hello-World");
        assert_eq!(triple.mod_checkout, "/checkouts/mithro/octocat-Hello-World");
        // same inputs, same answer
        assert_eq!(paths(&cfg, &id("octocat", "Hello-World")), triple);
    }
}
