// InfluxDB v2 HTTP API via reqwest.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use super::StoreClient;
use super::csv::parse_query_csv;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{Job, JobSpec, Organization, Point, QueryRow};

/// Page size for task listings; longer listings are followed with the `after` cursor.
const TASK_PAGE_SIZE: usize = 500;

/// Cursor for the page after `page`, or None when `page` was the last one.
fn next_page_after(page: &[Job], page_size: usize) -> Option<&str> {
    if page.len() < page_size {
        return None;
    }
    page.last().map(|job| job.id.as_str())
}

pub struct InfluxStore {
    client: Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(default)]
    tasks: Vec<Job>,
}

#[derive(Deserialize)]
struct OrgList {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Deserialize)]
struct BucketList {
    #[serde(default)]
    buckets: Vec<serde_json::Value>,
}

impl InfluxStore {
    pub fn connect(config: &StoreConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(crate::version::user_agent())
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.url, path))
            .header("Authorization", format!("Token {}", self.token))
    }

    /// Maps non-success statuses: 400/422 mean the content was refused, the rest are transport.
    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&message)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(message);
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Err(StoreError::Rejected {
                status: status.as_u16(),
                message,
            }),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(message)),
            _ => Err(StoreError::Transport(format!("HTTP {}: {}", status, message))),
        }
    }
}

#[async_trait]
impl StoreClient for InfluxStore {
    #[instrument(skip(self, points), fields(store = "influx", operation = "write", points_count = points.len()))]
    async fn write(&self, points: &[Point]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Result<Vec<_>, _>>()?
            .join("\n");
        let response = self
            .request(reqwest::Method::POST, "/api/v2/write")
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, query), fields(store = "influx", operation = "query"))]
    async fn query(&self, query: &str) -> Result<Vec<QueryRow>, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/api/v2/query")
            .query(&[("org", self.org.as_str())])
            .header("Accept", "application/csv")
            .json(&json!({
                "query": query,
                "type": "flux",
                "dialect": { "header": true, "annotations": [], "delimiter": "," },
            }))
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;
        parse_query_csv(&body)
    }

    #[instrument(skip(self), fields(store = "influx", operation = "find_jobs"))]
    async fn find_jobs(&self, name: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let limit = TASK_PAGE_SIZE.to_string();
        let mut jobs = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut params = vec![("org", self.org.as_str()), ("limit", limit.as_str())];
            if let Some(name) = name {
                params.push(("name", name));
            }
            if let Some(after) = &after {
                params.push(("after", after.as_str()));
            }
            let response = self
                .request(reqwest::Method::GET, "/api/v2/tasks")
                .query(&params)
                .send()
                .await?;
            let page: TaskList = Self::check(response).await?.json().await?;
            after = next_page_after(&page.tasks, TASK_PAGE_SIZE).map(str::to_string);
            jobs.extend(page.tasks);
            if after.is_none() {
                break;
            }
        }
        // The name filter is a server-side prefix match on some versions; keep exact matches only.
        Ok(match name {
            Some(name) => jobs.into_iter().filter(|t| t.name == name).collect(),
            None => jobs,
        })
    }

    #[instrument(skip(self, org, spec), fields(store = "influx", operation = "create_job", job = %spec.name))]
    async fn create_job(&self, org: &Organization, spec: &JobSpec) -> Result<Job, StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/api/v2/tasks")
            .json(&json!({
                "orgID": org.id,
                "flux": spec.render(),
                "status": "active",
                "description": format!("{} {}", spec.key.family.tag(), spec.key.period),
            }))
            .send()
            .await?;
        let job: Job = Self::check(response).await?.json().await?;
        Ok(job)
    }

    #[instrument(skip(self), fields(store = "influx", operation = "delete_job"))]
    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/v2/tasks/{id}"))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn find_organizations(&self, name: &str) -> Result<Vec<Organization>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, "/api/v2/orgs")
            .query(&[("org", name)])
            .send()
            .await?;
        let list: OrgList = Self::check(response).await?.json().await?;
        Ok(list.orgs)
    }

    #[instrument(skip(self), fields(store = "influx", operation = "delete_range"))]
    async fn delete_range(
        &self,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        predicate: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::POST, "/api/v2/delete")
            .query(&[("org", self.org.as_str()), ("bucket", self.bucket.as_str())])
            .json(&json!({
                "start": start.to_rfc3339_opts(SecondsFormat::Secs, true),
                "stop": stop.to_rfc3339_opts(SecondsFormat::Secs, true),
                "predicate": predicate,
            }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn bucket_exists(&self) -> Result<bool, StoreError> {
        let response = self
            .request(reqwest::Method::GET, "/api/v2/buckets")
            .query(&[("name", self.bucket.as_str()), ("org", self.org.as_str())])
            .send()
            .await?;
        let list: BucketList = match Self::check(response).await {
            Ok(r) => r.json().await?,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(!list.buckets.is_empty())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}
