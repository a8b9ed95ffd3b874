//! Capability interface for the remote content source.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::CycleError;
use crate::model::{Comment, Reel, TenantKey};
use crate::store::TenantSettings;

/// Result of posting a reply that the remote accepted or benignly refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Sent,
    /// The remote reports the target was already replied to.
    AlreadyReplied,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited by remote: {0}")]
    RateLimited(String),
    #[error("remote error {status} (code {code:?}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    #[error("invalid response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether retrying on a later cycle may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Transport(_) | SourceError::Timeout(_) | SourceError::RateLimited(_) => {
                true
            }
            SourceError::Api { status, .. } => *status >= 500,
            SourceError::Decode(_) => false,
        }
    }
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// The page this source acts as. Comments authored by it are never
    /// answered.
    fn page_id(&self) -> &str;

    async fn list_reels(&self) -> Result<Vec<Reel>, SourceError>;

    async fn list_comments(&self, reel_id: &str) -> Result<Vec<Comment>, SourceError>;

    async fn post_public_reply(
        &self,
        comment_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, SourceError>;

    async fn post_private_reply(
        &self,
        comment_id: &str,
        text: &str,
    ) -> Result<ReplyOutcome, SourceError>;

    async fn has_already_replied(&self, comment_id: &str) -> Result<bool, SourceError>;
}

/// Builds a tenant's content source from its stored settings.
pub trait SourceFactory: Send + Sync {
    fn build(
        &self,
        tenant: &TenantKey,
        settings: &TenantSettings,
    ) -> Result<Arc<dyn ContentSource>, CycleError>;
}
