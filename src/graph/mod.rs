use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config;
use crate::error::CycleError;
use crate::model::{Comment, Reel, TenantKey};
use crate::source::{ContentSource, ReplyOutcome, SourceError, SourceFactory};
use crate::store::{Credentials, TenantSettings};

pub mod model;

use model::{ErrorEnvelope, Paged, WireComment, WireReel, WireReplyRef};

/// Graph error code for "activity already replied to".
const CODE_ALREADY_REPLIED: i64 = 10900;
/// Graph throttling codes (app, user, page and API-level limits).
const RATE_LIMIT_CODES: [i64; 4] = [4, 17, 32, 613];

/// Page used by the existence check. Only the first page is inspected.
const REPLY_CHECK_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub reels: u32,
    pub comments: u32,
    pub replies: u32,
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
    version: String,
    token: String,
    page_id: String,
    limits: Limits,
}

impl fmt::Debug for GraphClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .field("page_id", &self.page_id)
            .finish_non_exhaustive()
    }
}

impl GraphClient {
    pub fn new(
        http: Client,
        base_url: Url,
        version: String,
        credentials: Credentials,
        limits: Limits,
    ) -> Self {
        Self {
            http,
            base_url,
            version,
            token: credentials.access_token,
            page_id: credentials.page_id,
            limits,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(&format!("{}/{}", self.version, path))
            .map_err(|e| SourceError::Decode(format!("invalid endpoint {path}: {e}")))
    }

    fn comment_fields(&self) -> String {
        format!(
            "id,message,from,created_time,updated_time,comments.limit({}).summary(true){{id,message,from,created_time}}",
            self.limits.replies
        )
    }

    /// Sends the request and returns the body of a successful response.
    async fn send(&self, request: RequestBuilder) -> Result<String, SourceError> {
        let request = request.bearer_auth(&self.token).build()?;
        debug!(method = %request.method(), url = %request.url(), "graph request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            let err = error_from_response(status, &body);
            warn!(status = status.as_u16(), %err, "graph request failed");
            return Err(err);
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let body = self.send(self.http.get(url).query(query)).await?;
        serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

/// Map a non-success Graph response into a typed error.
pub fn error_from_response(status: StatusCode, body: &str) -> SourceError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let code = parsed.as_ref().and_then(|e| e.error.code);
    let message = parsed
        .map(|e| e.error.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.chars().take(200).collect());

    if status == StatusCode::TOO_MANY_REQUESTS || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c))
    {
        return SourceError::RateLimited(message);
    }
    SourceError::Api {
        status: status.as_u16(),
        code,
        message,
    }
}

fn is_already_replied(err: &SourceError) -> bool {
    matches!(err, SourceError::Api { code: Some(CODE_ALREADY_REPLIED), .. })
}

/// Duplicate-reply rejections become a successful `AlreadyReplied`.
fn reply_outcome(result: Result<String, SourceError>) -> Result<ReplyOutcome, SourceError> {
    match result {
        Ok(_) => Ok(ReplyOutcome::Sent),
        Err(err) if is_already_replied(&err) => Ok(ReplyOutcome::AlreadyReplied),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl ContentSource for GraphClient {
    fn page_id(&self) -> &str {
        &self.page_id
    }

    async fn list_reels(&self) -> Result<Vec<Reel>, SourceError> {
        let url = self.endpoint(&format!("{}/video_reels", self.page_id))?;
        let page: Paged<WireReel> = self
            .get_json(
                url,
                &[
                    ("fields", "id,description,updated_time".to_string()),
                    ("limit", self.limits.reels.to_string()),
                ],
            )
            .await?;
        Ok(page.data.into_iter().map(Reel::from).collect())
    }

    async fn list_comments(&self, reel_id: &str) -> Result<Vec<Comment>, SourceError> {
        let url = self.endpoint(&format!("{reel_id}/comments"))?;
        let page: Paged<WireComment> = self
            .get_json(
                url,
                &[
                    ("fields", self.comment_fields()),
                    ("limit", self.limits.comments.to_string()),
                ],
            )
            .await?;
        Ok(page.data.into_iter().map(Comment::from).collect())
    }

    async fn post_public_reply(
        &self,
        comment_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, SourceError> {
        let url = self.endpoint(&format!("{comment_id}/comments"))?;
        let request = self.http.post(url).query(&[("message", text)]);
        reply_outcome(self.send(request).await)
    }

    async fn post_private_reply(
        &self,
        comment_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, SourceError> {
        let url = self.endpoint(&format!("{}/messages", self.page_id))?;
        let body = json!({
            "recipient": { "comment_id": comment_id },
            "message": { "text": text },
        });
        reply_outcome(self.send(self.http.post(url).json(&body)).await)
    }

    async fn has_already_replied(&self, comment_id: &str) -> Result<bool, SourceError> {
        let url = self.endpoint(&format!("{comment_id}/comments"))?;
        let page: Paged<WireReplyRef> = self
            .get_json(
                url,
                &[
                    ("fields", "id,from".to_string()),
                    ("limit", REPLY_CHECK_LIMIT.to_string()),
                ],
            )
            .await?;
        Ok(page
            .data
            .iter()
            .any(|r| r.from.as_ref().is_some_and(|f| f.id == self.page_id)))
    }
}

/// Builds a [`GraphClient`] per tenant, sharing one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct GraphSourceFactory {
    http: Client,
    base_url: Url,
    default_version: String,
}

impl GraphSourceFactory {
    pub fn from_config(cfg: &config::Graph) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()
            .context("failed to build HTTP client")?;
        let mut base = cfg.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid graph.base_url")?;
        Ok(Self {
            http,
            base_url,
            default_version: cfg.default_version.clone(),
        })
    }
}

impl SourceFactory for GraphSourceFactory {
    fn build(
        &self,
        tenant: &TenantKey,
        settings: &TenantSettings,
    ) -> Result<Arc<dyn ContentSource>, CycleError> {
        let credentials = settings.credentials(tenant)?;
        let version = settings
            .api_version
            .clone()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.default_version.clone());
        let limits = Limits {
            reels: settings.reels_limit(),
            comments: settings.comments_limit(),
            replies: settings.replies_limit(),
        };
        Ok(Arc::new(GraphClient::new(
            self.http.clone(),
            self.base_url.clone(),
            version,
            credentials,
            limits,
        )))
    }
}
