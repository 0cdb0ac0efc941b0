//! Minimal GitHub REST collaborator: just enough for the fork workflow and
//! repository analysis. All other network traffic goes through git itself.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, Result};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("git-cache/", env!("CARGO_PKG_VERSION"));
const TIMEOUT: Duration = Duration::from_secs(30);

/// Facts about a remote repository, as reported by the hosting provider.
#[derive(Debug, Clone)]
pub struct RepoFacts {
    pub private: bool,
    pub fork_count: u32,
    pub is_fork: bool,
    pub default_branch: Option<String>,
    pub clone_url: Option<String>,
}

/// Result of a fork request.
#[derive(Debug, Clone)]
pub struct ForkOutcome {
    pub url: String,
    pub private: bool,
    pub already_exists: bool,
}

#[derive(Debug, Deserialize)]
struct ApiRepo {
    name: String,
    clone_url: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default, rename = "fork")]
    is_fork: bool,
    #[serde(default)]
    forks_count: u32,
    default_branch: Option<String>,
    owner: Option<ApiOwner>,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    login: String,
}

pub struct GithubClient {
    agent: ureq::Agent,
    token: Option<String>,
}

impl GithubClient {
    /// A client, optionally authenticated. Unauthenticated clients can read
    /// public repositories but cannot fork or change visibility.
    pub fn new(token: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(TIMEOUT)
            .build();
        GithubClient { agent, token }
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut req = self
            .agent
            .request(method, url)
            .set("Accept", "application/vnd.github.v3+json")
            .set("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
        req
    }

    fn require_token(&self, action: &str) -> Result<()> {
        if self.token.is_none() {
            return Err(CacheError::HostApi(format!(
                "{action} requires a GITHUB_TOKEN"
            )));
        }
        Ok(())
    }

    /// Look up a repository.
    pub fn get_repo(&self, owner: &str, name: &str) -> Result<RepoFacts> {
        let url = format!("{API_BASE}/repos/{owner}/{name}");
        let repo: ApiRepo = self
            .request("GET", &url)
            .call()
            .map_err(|e| map_error(e, &format!("{owner}/{name}")))?
            .into_json()
            .map_err(|e| CacheError::HostApi(format!("malformed repository response: {e}")))?;
        Ok(RepoFacts {
            private: repo.private,
            fork_count: repo.forks_count,
            is_fork: repo.is_fork,
            default_branch: repo.default_branch,
            clone_url: repo.clone_url,
        })
    }

    /// Fork `owner/name`, into `organization` when given, otherwise the
    /// authenticated user's account. Forking an already-forked repository is
    /// not an error; the existing fork is reported.
    pub fn fork(&self, owner: &str, name: &str, organization: Option<&str>) -> Result<ForkOutcome> {
        self.require_token("forking")?;

        // GitHub returns the existing fork with the same 202 it uses for a
        // fresh one, so probe for it first to tell the cases apart.
        if let Some(org) = organization {
            if let Ok(existing) = self.get_repo(org, name) {
                return Ok(ForkOutcome {
                    url: existing
                        .clone_url
                        .unwrap_or_else(|| format!("https://github.com/{org}/{name}")),
                    private: existing.private,
                    already_exists: true,
                });
            }
        }

        let url = format!("{API_BASE}/repos/{owner}/{name}/forks");
        let request = self.request("POST", &url);
        let response = match organization {
            Some(org) => request.send_json(ureq::json!({ "organization": org })),
            None => request.call(),
        }
        .map_err(|e| map_error(e, &format!("{owner}/{name}")))?;

        let repo: ApiRepo = response
            .into_json()
            .map_err(|e| CacheError::HostApi(format!("malformed fork response: {e}")))?;
        let fork_owner = repo
            .owner
            .map(|o| o.login)
            .unwrap_or_else(|| organization.unwrap_or(owner).to_string());
        Ok(ForkOutcome {
            url: repo
                .clone_url
                .unwrap_or_else(|| format!("https://github.com/{fork_owner}/{}", repo.name)),
            private: repo.private,
            already_exists: false,
        })
    }

    /// Flip a repository's visibility.
    pub fn set_private(&self, owner: &str, name: &str, private: bool) -> Result<()> {
        self.require_token("changing visibility")?;
        let url = format!("{API_BASE}/repos/{owner}/{name}");
        self.request("PATCH", &url)
            .send_json(ureq::json!({ "private": private }))
            .map_err(|e| map_error(e, &format!("{owner}/{name}")))?;
        Ok(())
    }
}

fn map_error(err: ureq::Error, what: &str) -> CacheError {
    match err {
        ureq::Error::Status(401, _) => {
            CacheError::HostApi(format!("authentication failed for {what}"))
        }
        ureq::Error::Status(403, _) => CacheError::Forbidden(format!("{what} on github")),
        ureq::Error::Status(404, _) => CacheError::NotFound(format!("{what} on github")),
        ureq::Error::Status(code, _) => {
            CacheError::HostApi(format!("github returned {code} for {what}"))
        }
        ureq::Error::Transport(t) => CacheError::Network(format!("github request failed: {t}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_client_refuses_write_operations() {
        let client = GithubClient::new(None);
        assert!(matches!(
            client.fork("octocat", "Hello-World", None),
            Err(CacheError::HostApi(_))
        ));
        assert!(matches!(
            client.set_private("octocat", "Hello-World", true),
            Err(CacheError::HostApi(_))
        ));
    }

    #[test]
    fn repo_payload_deserializes() {
        let repo: ApiRepo = serde_json::from_str(
            r#"{
                "name": "Hello-World",
                "clone_url": "https://github.com/octocat/Hello-World.git",
                "private": false,
                "fork": true,
                "forks_count": 42,
                "default_branch": "main",
                "owner": {"login": "octocat"}
            }"#,
        )
        .unwrap();
        assert_eq!(repo.name, "Hello-World");
        assert!(repo.is_fork);
        assert_eq!(repo.forks_count, 42);
        assert_eq!(repo.owner.unwrap().login, "octocat");
    }
}
