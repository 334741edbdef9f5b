// GitHub REST API surface used by the launcher: registration and remove
// tokens, listing and deleting self-hosted runners, and the authenticated user.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use launcher_common::constants::api;
use launcher_common::{HttpClientFactory, LauncherError, RunnerConfig};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use url::Url;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What a runner is registered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerScope {
    Repository { owner: String, repo: String },
    Organization { org: String },
}

impl RunnerScope {
    /// Derive owner and repository from the last two path segments of a
    /// repository URL. A trailing `.git` is ignored.
    pub fn from_repo_url(repo_url: &str) -> Result<Self, LauncherError> {
        let invalid = || LauncherError::InvalidRepoUrl {
            url: repo_url.to_string(),
        };
        let segments = path_segments(repo_url).ok_or_else(invalid)?;
        let [.., owner, repo] = segments.as_slice() else {
            return Err(invalid());
        };
        let repo = repo.trim_end_matches(".git");
        if owner.is_empty() || repo.is_empty() {
            return Err(invalid());
        }
        Ok(RunnerScope::Repository {
            owner: owner.clone(),
            repo: repo.to_string(),
        })
    }

    /// Scope of a configured runner: the organization for org runners
    /// (`ORG_NAME`, else the first path segment of `REPO_URL`), the
    /// repository otherwise.
    pub fn for_runner(runner: &RunnerConfig) -> Result<Self, LauncherError> {
        let repo_url = &runner.environment.repo_url;
        if !runner.is_org_runner() {
            return Self::from_repo_url(repo_url);
        }
        let org = match runner.org_name() {
            Some(org) => org.to_string(),
            None => path_segments(repo_url)
                .and_then(|s| s.into_iter().next())
                .ok_or_else(|| LauncherError::InvalidRepoUrl {
                    url: repo_url.to_string(),
                })?,
        };
        Ok(RunnerScope::Organization { org })
    }

    /// The URL handed to `config.sh --url`.
    pub fn registration_url(&self, repo_url: &str) -> Result<String, LauncherError> {
        match self {
            RunnerScope::Repository { .. } => Ok(repo_url.trim_end_matches('/').to_string()),
            RunnerScope::Organization { org } => {
                let url = parse_repo_url(repo_url).ok_or_else(|| LauncherError::InvalidRepoUrl {
                    url: repo_url.to_string(),
                })?;
                let host = url.host_str().ok_or_else(|| LauncherError::InvalidRepoUrl {
                    url: repo_url.to_string(),
                })?;
                let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
                Ok(format!("{}://{host}{port}/{org}", url.scheme()))
            }
        }
    }

    /// Path prefix of the scope's runner endpoints.
    fn api_path(&self) -> String {
        match self {
            RunnerScope::Repository { owner, repo } => format!("repos/{owner}/{repo}"),
            RunnerScope::Organization { org } => format!("orgs/{org}"),
        }
    }
}

impl std::fmt::Display for RunnerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerScope::Repository { owner, repo } => write!(f, "{owner}/{repo}"),
            RunnerScope::Organization { org } => write!(f, "org {org}"),
        }
    }
}

/// Parse a repository URL; `github.com/acme/widgets` is read as https.
fn parse_repo_url(repo_url: &str) -> Option<Url> {
    let repo_url = repo_url.trim();
    if repo_url.is_empty() {
        return None;
    }
    if repo_url.contains("://") {
        Url::parse(repo_url).ok()
    } else {
        Url::parse(&format!("https://{repo_url}")).ok()
    }
}

fn path_segments(repo_url: &str) -> Option<Vec<String>> {
    let url = parse_repo_url(repo_url)?;
    Some(
        url.path_segments()?
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Rate-limit metadata from the `x-ratelimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    pub reset: Option<DateTime<Utc>>,
}

impl RateLimit {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let number = |name: &str| -> Option<u64> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };
        Some(Self {
            limit: number(api::RATE_LIMIT_LIMIT)?,
            remaining: number(api::RATE_LIMIT_REMAINING)?,
            reset: number(api::RATE_LIMIT_RESET)
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        })
    }

    pub fn is_low(&self) -> bool {
        self.remaining < api::LOW_QUOTA_WATERMARK
    }
}

impl std::fmt::Display for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {} GitHub API requests left", self.remaining, self.limit)?;
        if let Some(reset) = self.reset {
            write!(f, ", resets at {}", reset.to_rfc3339())?;
        }
        Ok(())
    }
}

/// A response body together with the rate limit reported alongside it.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub body: T,
    pub rate: Option<RateLimit>,
}

/// A registration or remove token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedToken {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// A self-hosted runner known to the API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredRunner {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct RunnerPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    runners: Vec<RegisteredRunner>,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

/// Error body of a failed API call.
#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The remote operations the launcher needs. The access credential is
/// passed per call so one client serves every runner.
#[async_trait]
pub trait ActionsApi: Send + Sync {
    async fn create_registration_token(
        &self,
        access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<IssuedToken>>;

    async fn create_remove_token(
        &self,
        access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<IssuedToken>>;

    async fn list_runners(
        &self,
        access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<Vec<RegisteredRunner>>>;

    async fn delete_runner(&self, access_token: &str, scope: &RunnerScope, runner_id: u64) -> Result<()>;

    /// Login of the user the credential belongs to.
    async fn authenticated_user(&self, access_token: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    client: Client,
    api_base: String,
}

impl GitHubClient {
    const PER_PAGE: usize = 100;

    /// Create a client for the REST API rooted at `api_url`.
    pub fn new(api_url: &str) -> Result<Self> {
        Self::with_client(HttpClientFactory::create_client()?, api_url)
    }

    pub fn with_client(client: Client, api_url: &str) -> Result<Self> {
        Url::parse(api_url).with_context(|| format!("Invalid GitHub API URL '{api_url}'"))?;
        Ok(Self {
            client,
            api_base: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str, access_token: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{path}", self.api_base))
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, api::ACCEPT)
            .header(api::API_VERSION_HEADER, api::API_VERSION)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {what} request"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&body_text)
                .map(|e| e.message)
                .unwrap_or_else(|_| body_text.trim().to_string());
            return Err(anyhow::anyhow!(
                "{what} failed with HTTP {}: {message}",
                status.as_u16()
            ));
        }
        Ok(response)
    }

    async fn issue_token(
        &self,
        access_token: &str,
        scope: &RunnerScope,
        kind: &str,
    ) -> Result<ApiResponse<IssuedToken>> {
        let path = format!("{}/actions/runners/{kind}", scope.api_path());
        let request = self
            .request(Method::POST, &path, access_token)
            .header(reqwest::header::CONTENT_LENGTH, "0");
        let response = self.send(request, kind).await?;
        let rate = RateLimit::from_headers(response.headers());
        let body = response
            .json::<IssuedToken>()
            .await
            .with_context(|| format!("Failed to deserialize {kind} response"))?;
        Ok(ApiResponse { body, rate })
    }
}

#[async_trait]
impl ActionsApi for GitHubClient {
    async fn create_registration_token(
        &self,
        access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<IssuedToken>> {
        self.issue_token(access_token, scope, "registration-token").await
    }

    async fn create_remove_token(
        &self,
        access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<IssuedToken>> {
        self.issue_token(access_token, scope, "remove-token").await
    }

    async fn list_runners(
        &self,
        access_token: &str,
        scope: &RunnerScope,
    ) -> Result<ApiResponse<Vec<RegisteredRunner>>> {
        let mut runners = Vec::new();
        let mut rate = None;
        let mut page = 1;
        loop {
            let path = format!(
                "{}/actions/runners?per_page={}&page={page}",
                scope.api_path(),
                Self::PER_PAGE
            );
            let response = self
                .send(self.request(Method::GET, &path, access_token), "list runners")
                .await?;
            rate = RateLimit::from_headers(response.headers()).or(rate);
            let body: RunnerPage = response
                .json()
                .await
                .context("Failed to deserialize runner list")?;

            let received = body.runners.len();
            runners.extend(body.runners);
            if received < Self::PER_PAGE || runners.len() >= body.total_count {
                break;
            }
            page += 1;
        }
        Ok(ApiResponse { body: runners, rate })
    }

    async fn delete_runner(&self, access_token: &str, scope: &RunnerScope, runner_id: u64) -> Result<()> {
        let path = format!("{}/actions/runners/{runner_id}", scope.api_path());
        self.send(self.request(Method::DELETE, &path, access_token), "delete runner")
            .await?;
        Ok(())
    }

    async fn authenticated_user(&self, access_token: &str) -> Result<String> {
        let response = self
            .send(self.request(Method::GET, "user", access_token), "get user")
            .await?;
        let user: User = response.json().await.context("Failed to deserialize user")?;
        Ok(user.login)
    }
}
