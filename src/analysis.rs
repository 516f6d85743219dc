//! Analysis-service client. The pipeline only needs the trait: how the
//! result is produced is the service's business.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::config;
use crate::model::ActivityKind;

/// Payload handed to the analysis service for one work item.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub tenant: String,
    pub course_id: i64,
    pub activity_id: i64,
    pub kind: ActivityKind,
    pub title: Option<String>,
}

#[async_trait]
pub trait AnalysisExecutor: Send + Sync {
    /// Analyze one item. The returned value is stored verbatim on the queue
    /// entry; an error message ends up in `last_error`.
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value>;
}

#[derive(Clone)]
pub struct HttpAnalysisExecutor {
    http: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for HttpAnalysisExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAnalysisExecutor")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpAnalysisExecutor {
    pub fn from_config(cfg: &config::Analysis) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint).context("invalid analysis endpoint")?;
        let http = Client::builder()
            .user_agent("coursepulse/0.1")
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .context("reqwest client")?;
        Ok(Self {
            http,
            endpoint,
            token: cfg.token.clone(),
        })
    }
}

#[async_trait]
impl AnalysisExecutor for HttpAnalysisExecutor {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value> {
        let resp = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .context("analysis request failed")?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("analysis service throttled the request"));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "analysis service returned {}: {}",
                status,
                truncate(&body, 200)
            ));
        }
        resp.json().await.context("malformed analysis response")
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_snake_case_kind() {
        let req = AnalysisRequest {
            tenant: "campus-a".into(),
            course_id: 3,
            activity_id: 17,
            kind: ActivityKind::Discussion,
            title: Some("Week 2 forum".into()),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "discussion");
        assert_eq!(json["activity_id"], 17);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 2), "he");
    }
}
