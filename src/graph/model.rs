//! Wire shapes of the Graph API responses used by the content source.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::{Comment, CommentAuthor, Reel};

#[derive(Debug, Deserialize)]
pub struct Paged<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct WireReel {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "graph_time::deserialize")]
    pub updated_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct WireAuthor {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct WireComment {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub from: Option<WireAuthor>,
    #[serde(deserialize_with = "graph_time::deserialize")]
    pub created_time: DateTime<Utc>,
    #[serde(default, deserialize_with = "graph_time::deserialize_option")]
    pub updated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Option<WireReplies>,
}

#[derive(Debug, Deserialize)]
pub struct WireReplies {
    #[serde(default)]
    pub data: Vec<WireComment>,
    #[serde(default)]
    pub summary: Option<WireSummary>,
}

#[derive(Debug, Deserialize)]
pub struct WireSummary {
    #[serde(default)]
    pub total_count: Option<u64>,
}

/// Reply reference returned by the existence check (`fields=id,from`).
#[derive(Debug, Deserialize)]
pub struct WireReplyRef {
    #[allow(dead_code)]
    pub id: String,
    #[serde(default)]
    pub from: Option<WireAuthor>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
}

impl From<WireAuthor> for CommentAuthor {
    fn from(a: WireAuthor) -> Self {
        CommentAuthor {
            id: a.id,
            name: a.name,
        }
    }
}

impl From<WireReel> for Reel {
    fn from(r: WireReel) -> Self {
        Reel {
            id: r.id,
            description: r.description,
            updated_time: r.updated_time,
        }
    }
}

impl From<WireComment> for Comment {
    fn from(c: WireComment) -> Self {
        let (replies, reply_count) = match c.comments {
            Some(nested) => (
                nested.data.into_iter().map(Comment::from).collect(),
                nested.summary.and_then(|s| s.total_count),
            ),
            None => (Vec::new(), None),
        };
        Comment {
            id: c.id,
            message: c.message,
            author: c.from.map(CommentAuthor::from),
            created_time: c.created_time,
            updated_time: c.updated_time,
            replies,
            reply_count,
        }
    }
}

/// Graph timestamps look like `2024-01-01T12:00:00+0000`, which is not
/// RFC 3339; both forms are accepted.
pub mod graph_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z"))
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
