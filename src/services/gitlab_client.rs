//! GitLab API client.
//!
//! Provides an HTTP client for GitLab API v4 with authentication, exhaustive
//! pagination, and incremental project-scoped fetching. Requests are always
//! scoped to explicit project ids, never a global fetch.
//!
//! Raw items are returned as `serde_json::Value` so the transformer can skip
//! individual malformed items instead of failing a whole user's sync.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{header, Client, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;

/// Parents whose notes are fetched concurrently per project.
const NOTE_FETCH_CONCURRENCY: usize = 4;

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.com`).
    pub base_url: String,

    /// OAuth access token for authentication.
    pub token: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitLabClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
}

/// Raw upstream payloads for one fetch pass, grouped by shape.
///
/// Notes are enriched by the client with two fields the upstream note object
/// lacks: `project_id` and `parent_web_url` (the parent issue/MR web URL,
/// used to build the note's anchor link).
#[derive(Debug, Default)]
pub struct FetchedEvents {
    pub issues: Vec<Value>,
    pub merge_requests: Vec<Value>,
    pub notes: Vec<Value>,
}

impl FetchedEvents {
    pub fn total(&self) -> usize {
        self.issues.len() + self.merge_requests.len() + self.notes.len()
    }
}

/// Parameters for one user's incremental fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub base_url: String,
    pub token: String,
    pub timeout_secs: u64,
    pub project_ids: Vec<i64>,
    pub updated_after: Option<i64>,
}

/// Upstream fetch seam between the sync engine and the GitLab API.
pub trait EventSource: Send + Sync {
    fn fetch_events(
        &self,
        request: FetchRequest,
    ) -> BoxFuture<'static, Result<FetchedEvents, AppError>>;
}

/// The production `EventSource`: builds one `GitLabClient` per request so
/// every fetch picks up the caller's current timeout.
#[derive(Debug, Default)]
pub struct GitLabSource;

impl EventSource for GitLabSource {
    fn fetch_events(
        &self,
        request: FetchRequest,
    ) -> BoxFuture<'static, Result<FetchedEvents, AppError>> {
        async move {
            let client = GitLabClient::new(GitLabClientConfig {
                base_url: request.base_url,
                token: request.token,
                timeout_secs: request.timeout_secs,
            })?;
            client
                .fetch_events(&request.project_ids, request.updated_after)
                .await
        }
        .boxed()
    }
}

/// Query parameters for incremental list endpoints.
#[derive(Debug, Clone, Default, Serialize)]
struct ListQuery {
    /// Return items updated after this timestamp (ISO 8601). This is what
    /// makes sync incremental.
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_after: Option<String>,
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, AppError> {
        let mut headers = header::HeaderMap::new();

        let token_value = header::HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| AppError::authentication("Invalid token format"))?;
        headers.insert(header::AUTHORIZATION, token_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Get the base URL for API requests.
    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    /// Extract the next page number from response headers, if any.
    fn next_page(response: &Response) -> Option<u32> {
        response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Extract the `retry-after` hint (seconds) from a 429 response.
    fn retry_after(response: &Response) -> Option<u64> {
        response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Classify API response errors into the pipeline's failure taxonomy.
    ///
    /// - 429 is surfaced as `RateLimited`; this client never retries it.
    /// - 401 means the token was rejected despite being believed fresh
    ///   (revoked out-of-band) and is treated like an expired token.
    /// - 403 and 5xx bubble as `GitLabApi` and count as a failed sync.
    async fn handle_response(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<Vec<Value>, AppError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<Vec<Value>>()
                .await
                .map_err(|e| AppError::internal(format!("Failed to parse response: {}", e)));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::rate_limited(Self::retry_after(&response)));
        }

        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::authentication_expired(
                "GitLab token expired or revoked. Please re-authenticate.",
            ));
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let body_message = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
            // GitLab returns errors as {"message": "..."} or {"error": "..."}
            v.get("message")
                .or_else(|| v.get("error"))
                .map(|m| m.as_str().map(String::from).unwrap_or_else(|| m.to_string()))
        });

        let message = match (status, &body_message) {
            (StatusCode::FORBIDDEN, _) => "Access denied".to_string(),
            (StatusCode::NOT_FOUND, _) => "Resource not found".to_string(),
            (_, Some(msg)) => msg.clone(),
            _ => format!("Request failed ({}): {}", status_code, body),
        };

        Err(AppError::gitlab_api_full(&message, status_code, endpoint))
    }

    /// Fetch all pages of a paginated endpoint, following `x-next-page`
    /// until upstream signals no more results.
    async fn get_all_pages(
        &self,
        endpoint: &str,
        query: Option<&impl Serialize>,
    ) -> Result<Vec<Value>, AppError> {
        let mut all_data = Vec::new();
        let mut page = 1u32;

        loop {
            let url = self.api_url(endpoint);
            let mut request = self.client.get(&url);

            if let Some(q) = query {
                request = request.query(q);
            }

            request =
                request.query(&[("page", page.to_string()), ("per_page", "100".to_string())]);

            let response = request.send().await?;
            let next = Self::next_page(&response);
            let data = self.handle_response(response, endpoint).await?;

            all_data.extend(data);

            match next {
                Some(n) => page = n,
                None => break,
            }
        }

        Ok(all_data)
    }

    /// Fetch issues, merge requests, and their notes for a set of projects.
    ///
    /// When `updated_after` is present, the issue and MR lists are filtered
    /// server-side to items modified after that watermark; notes are fetched
    /// only for the parents that came back, so they inherit the filter.
    pub async fn fetch_events(
        &self,
        project_ids: &[i64],
        updated_after: Option<i64>,
    ) -> Result<FetchedEvents, AppError> {
        let query = ListQuery {
            updated_after: updated_after.map(|ts| {
                DateTime::<Utc>::from_timestamp(ts, 0)
                    .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH)
                    .to_rfc3339()
            }),
        };

        let mut fetched = FetchedEvents::default();

        for &project_id in project_ids {
            let issues = self
                .get_all_pages(&format!("/projects/{}/issues", project_id), Some(&query))
                .await?;
            let merge_requests = self
                .get_all_pages(
                    &format!("/projects/{}/merge_requests", project_id),
                    Some(&query),
                )
                .await?;

            let note_fetches: Vec<_> = issues
                .iter()
                .map(|p| ("issues", p))
                .chain(merge_requests.iter().map(|p| ("merge_requests", p)))
                .map(|(kind, parent)| self.fetch_notes_for_parent(project_id, kind, parent))
                .collect();

            let note_batches: Vec<Vec<Value>> = stream::iter(note_fetches)
                .buffer_unordered(NOTE_FETCH_CONCURRENCY)
                .try_collect()
                .await?;
            for batch in note_batches {
                fetched.notes.extend(batch);
            }

            fetched.issues.extend(issues);
            fetched.merge_requests.extend(merge_requests);
        }

        Ok(fetched)
    }

    /// Fetch the notes of one issue or merge request and enrich them with
    /// the parent's project id and web URL.
    async fn fetch_notes_for_parent(
        &self,
        project_id: i64,
        kind: &str,
        parent: &Value,
    ) -> Result<Vec<Value>, AppError> {
        let Some(iid) = parent.get("iid").and_then(Value::as_i64) else {
            log::warn!("Skipping notes fetch: parent without iid in project {}", project_id);
            return Ok(Vec::new());
        };
        let parent_web_url = parent.get("web_url").and_then(Value::as_str).unwrap_or("");

        let endpoint = format!("/projects/{}/{}/{}/notes", project_id, kind, iid);
        let mut notes = self.get_all_pages(&endpoint, None::<&()>).await?;

        for note in &mut notes {
            if let Some(obj) = note.as_object_mut() {
                obj.insert("project_id".to_string(), Value::from(project_id));
                obj.insert("parent_web_url".to_string(), Value::from(parent_web_url));
            }
        }

        Ok(notes)
    }
}
