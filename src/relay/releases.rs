//! GitHub 发布列表与加速克隆命令。

use std::sync::Arc;

use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::cache::ResultCache;
use super::error::{RelayError, RelayResult};
use super::prober::PROBE_USER_AGENT;

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

#[derive(Debug, Deserialize)]
struct GhRelease {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    tag_name: String,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GhAsset>,
}

#[derive(Debug, Deserialize)]
struct GhAsset {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    download_count: u64,
    browser_download_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub name: String,
    pub size: u64,
    pub download_count: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSummary {
    pub id: u64,
    pub name: String,
    pub tag: String,
    pub published_at: Option<String>,
    pub prerelease: bool,
    pub assets: Vec<AssetSummary>,
}

impl From<GhRelease> for ReleaseSummary {
    fn from(r: GhRelease) -> Self {
        Self {
            id: r.id,
            // 没有标题的发布用 tag 代替
            name: r
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| r.tag_name.clone()),
            tag: r.tag_name,
            published_at: r.published_at,
            prerelease: r.prerelease,
            assets: r
                .assets
                .into_iter()
                .map(|a| AssetSummary {
                    name: a.name,
                    size: a.size,
                    download_count: a.download_count,
                    url: a.browser_download_url,
                })
                .collect(),
        }
    }
}

/// 仓库标识：接受 `owner/name`，或完整的 GitHub 仓库地址（可带 `.git`）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let raw = raw.trim();
        let path = match raw.find("github.com/") {
            Some(idx) => &raw[idx + "github.com/".len()..],
            None => raw,
        };
        let mut parts = path.trim_matches('/').split('/');
        let owner = parts.next().unwrap_or_default().trim();
        let name = parts
            .next()
            .unwrap_or_default()
            .trim()
            .trim_end_matches(".git");

        let valid = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if !valid(owner) || !valid(name) {
            return Err(RelayError::InvalidInput(format!("invalid repository: {raw}")));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloneCommand {
    pub original_url: String,
    pub proxied_url: String,
    pub command: String,
}

/// 生成加速克隆命令：把仓库地址中的 `github.com` 替换为代理域名。
/// 传入完整 URL 时保留原地址，否则按 `https://github.com/{owner}/{name}.git` 补全。
pub fn clone_command(repo: &str, relay: &str) -> RelayResult<CloneCommand> {
    let repo = repo.trim();
    let original_url = if repo.starts_with("http") {
        repo.to_string()
    } else {
        let parsed = RepoRef::parse(repo)?;
        format!("https://github.com/{}.git", parsed.full_name())
    };
    if !original_url.contains("github.com") {
        return Err(RelayError::InvalidInput(format!(
            "not a github repository: {original_url}"
        )));
    }
    let proxied_url = original_url.replacen("github.com", relay, 1);
    Ok(CloneCommand {
        command: format!("git clone {proxied_url}"),
        original_url,
        proxied_url,
    })
}

pub struct ReleaseClient {
    client: Client,
    api_base: String,
    cache: Arc<ResultCache<Value>>,
}

impl ReleaseClient {
    pub fn new(client: Client, api_base: impl Into<String>, cache: Arc<ResultCache<Value>>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            cache,
        }
    }

    /// 拉取发布列表，结果按默认 TTL 缓存在 `releases:{owner}/{name}`。
    pub async fn list(&self, repo: &RepoRef) -> RelayResult<Vec<ReleaseSummary>> {
        let key = format!("releases:{}", repo.full_name());
        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_value(cached) {
                Ok(list) => return Ok(list),
                Err(e) => {
                    warn!(target: "relay", key, error = %e, "缓存的发布列表无法解析，重新获取");
                    self.cache.remove(&key);
                }
            }
        }

        let url = format!("{}/repos/{}/releases", self.api_base, repo.full_name());
        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(USER_AGENT, PROBE_USER_AGENT)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RelayError::NotFound(format!("repository {}", repo.full_name())));
        }
        if !status.is_success() {
            return Err(RelayError::Upstream {
                status: Some(status.as_u16()),
                message: format!("GitHub API returned {status}"),
            });
        }

        let raw: Vec<GhRelease> = resp
            .json()
            .await
            .map_err(|e| RelayError::upstream(format!("decode releases: {e}")))?;
        if raw.is_empty() {
            return Err(RelayError::NotFound(format!(
                "no releases in {}",
                repo.full_name()
            )));
        }

        let list: Vec<ReleaseSummary> = raw.into_iter().map(ReleaseSummary::from).collect();
        debug!(target: "relay", repo = %repo.full_name(), count = list.len(), "fetched releases");
        if let Ok(value) = serde_json::to_value(&list) {
            self.cache.set(key, value);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use serde_json::json;

    use super::*;

    fn sample() -> Value {
        json!([
            {
                "id": 7,
                "name": "",
                "tag_name": "v1.2.0",
                "published_at": "2024-05-01T10:00:00Z",
                "prerelease": false,
                "assets": [
                    {
                        "name": "app-linux.tar.gz",
                        "size": 2048,
                        "download_count": 31,
                        "browser_download_url": "https://github.com/o/r/releases/download/v1.2.0/app-linux.tar.gz",
                        "uploader": {"login": "someone"}
                    }
                ]
            },
            {
                "id": 6,
                "name": "Beta",
                "tag_name": "v1.2.0-beta",
                "published_at": null,
                "prerelease": true,
                "assets": []
            }
        ])
    }

    async fn releases(
        State(hits): State<Arc<AtomicUsize>>,
        Path((owner, name)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> Response {
        hits.fetch_add(1, Ordering::SeqCst);
        assert_eq!(headers["accept"], GITHUB_ACCEPT);
        match (owner.as_str(), name.as_str()) {
            ("o", "r") => axum::Json(sample()).into_response(),
            ("o", "empty") => axum::Json(json!([])).into_response(),
            _ => (axum::http::StatusCode::NOT_FOUND, "Not Found").into_response(),
        }
    }

    async fn spawn_api() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/repos/:owner/:name/releases", get(releases))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (base, hits)
    }

    #[test]
    fn maps_github_payload() {
        let raw: Vec<GhRelease> = serde_json::from_value(sample()).unwrap();
        let list: Vec<ReleaseSummary> = raw.into_iter().map(Into::into).collect();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "v1.2.0");
        assert_eq!(list[0].assets[0].download_count, 31);
        assert!(list[0].assets[0].url.ends_with("app-linux.tar.gz"));
        assert_eq!(list[1].name, "Beta");
        assert!(list[1].prerelease);
        assert_eq!(list[1].published_at, None);
    }

    #[test]
    fn parses_repo_forms() {
        let expected = RepoRef {
            owner: "rust-lang".to_string(),
            name: "cargo".to_string(),
        };
        assert_eq!(RepoRef::parse("rust-lang/cargo").unwrap(), expected);
        assert_eq!(
            RepoRef::parse("https://github.com/rust-lang/cargo.git").unwrap(),
            expected
        );
        assert!(RepoRef::parse("cargo").is_err());
        assert!(RepoRef::parse("a b/c").is_err());
    }

    #[test]
    fn clone_command_swaps_github_host() {
        let cmd = clone_command("o/r", "gh.relay.net").unwrap();
        assert_eq!(cmd.original_url, "https://github.com/o/r.git");
        assert_eq!(cmd.command, "git clone https://gh.relay.net/o/r.git");

        let cmd = clone_command("https://github.com/o/r", "gh.relay.net").unwrap();
        assert_eq!(cmd.proxied_url, "https://gh.relay.net/o/r");

        assert!(clone_command("https://gitlab.com/o/r", "gh.relay.net").is_err());
    }

    #[tokio::test]
    async fn lists_and_caches_releases() {
        let (base, hits) = spawn_api().await;
        let cache = Arc::new(ResultCache::new(Duration::from_secs(300)));
        let client = ReleaseClient::new(Client::new(), base, cache.clone());
        let repo = RepoRef::parse("o/r").unwrap();

        let first = client.list(&repo).await.unwrap();
        let second = client.list(&repo).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.get("releases:o/r").is_some());
    }

    #[tokio::test]
    async fn missing_repo_or_no_releases_is_not_found() {
        let (base, _) = spawn_api().await;
        let client = ReleaseClient::new(
            Client::new(),
            base,
            Arc::new(ResultCache::new(Duration::from_secs(300))),
        );

        for repo in ["o/empty", "o/gone"] {
            let repo = RepoRef::parse(repo).unwrap();
            assert!(matches!(client.list(&repo).await, Err(RelayError::NotFound(_))));
        }
    }
}
