use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SourceConfig;

/// Posts shown per source on the news page
pub const MAX_POSTS: usize = 30;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Post {
    pub title: String,
    pub link: String,
    pub summary: Option<String>,
    pub published: Option<String>,
}

impl Post {
    pub fn display_published(&self) -> String {
        self.published
            .as_deref()
            .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
            .map(|d| d.format("%a %H:%M").to_string())
            .unwrap_or_default()
    }
}

/// Only http(s) links are rendered as clickable.
fn web_link(href: &str) -> Option<String> {
    let url = reqwest::Url::parse(href.trim()).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

#[async_trait]
pub trait NewsAggregator: Send + Sync {
    async fn posts(&self, source: &SourceConfig) -> anyhow::Result<Vec<Post>>;
}

/// Fetches RSS/Atom feeds on demand.
pub struct FeedAggregator {
    client: Client,
}

impl FeedAggregator {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Newsletter/1.0 (News Digest)")
            .build()?;

        Ok(Self { client })
    }

    pub fn parse_posts(bytes: &[u8]) -> anyhow::Result<Vec<Post>> {
        let parsed = parser::parse(bytes)?;

        let mut posts = Vec::new();
        for entry in parsed.entries {
            let title = entry
                .title
                .as_ref()
                .map(|t| t.content.clone())
                .unwrap_or_else(|| "Untitled".to_string());

            let Some(link) = entry.links.first().and_then(|l| web_link(&l.href)) else {
                warn!("Skipping entry with no http(s) link: {}", title);
                continue;
            };

            let summary = entry
                .summary
                .as_ref()
                .map(|s| s.content.trim().to_string())
                .filter(|s| !s.is_empty());

            let published: Option<DateTime<Utc>> = entry.published.or(entry.updated);

            posts.push(Post {
                title,
                link,
                summary,
                published: published.map(|p| p.to_rfc3339()),
            });

            if posts.len() == MAX_POSTS {
                break;
            }
        }

        Ok(posts)
    }
}

#[async_trait]
impl NewsAggregator for FeedAggregator {
    async fn posts(&self, source: &SourceConfig) -> anyhow::Result<Vec<Post>> {
        info!("Fetching news source: {} ({})", source.name, source.url);

        let response = self
            .client
            .get(&source.url)
            .send()
            .await?
            .error_for_status()?;
        let bytes = response.bytes().await?;

        let posts = Self::parse_posts(&bytes)?;
        info!("Fetched {} posts from '{}'", posts.len(), source.name);
        Ok(posts)
    }
}
