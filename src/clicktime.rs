use std::sync::Arc;

use chrono::NaiveDate;
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::metrics::Metrics;

pub const DEFAULT_BASE_URL: &str = "https://api.clicktime.com/v2/";

#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: String,
    pub number: u64,
    pub name: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub code: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// Display name with spaces replaced by `.`.
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeEntry {
    pub id: String,
    pub date: NaiveDate,
    pub hours: f64,
    pub comment: Option<String>,
    pub task_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct TimeEntryPage {
    pub entries: Vec<TimeEntry>,
    pub offset: u64,
    pub limit: u64,
    pub count: u64,
}

impl TimeEntryPage {
    pub fn next_offset(&self) -> u64 {
        self.offset.saturating_add(self.limit)
    }

    /// A page is last once the next offset reaches the reported count, or
    /// when the server reports a zero limit and the cursor cannot advance.
    pub fn is_last(&self) -> bool {
        self.limit == 0 || self.next_offset() >= self.count
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClickTimeError {
    #[error("clicktime request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("clicktime returned HTTP {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode clicktime response: {source}; body: {body}")]
    Decode {
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid clicktime base url '{0}'")]
    InvalidBaseUrl(String),
    #[error("no clicktime job found with number {0}")]
    JobNotFound(u64),
}

#[derive(Debug, Clone)]
pub struct ClickTimeClient {
    pub base_url: String,
    api_token: String,
    http: Client,
    metrics: Arc<Metrics>,
}

impl ClickTimeClient {
    pub fn new(base_url: &str, api_token: String) -> Result<Self, ClickTimeError> {
        Self::new_with_metrics(base_url, api_token, Arc::new(Metrics::new()))
    }

    pub fn new_with_metrics(
        base_url: &str,
        api_token: String,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClickTimeError> {
        let http = Client::builder().build()?;
        let base_url = normalize_base_url(base_url)
            .ok_or_else(|| ClickTimeError::InvalidBaseUrl(base_url.to_string()))?;
        Ok(Self {
            base_url,
            api_token,
            http,
            metrics,
        })
    }

    fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClickTimeError> {
        let url = format!("{}/{}", self.base_url, path);
        self.metrics.inc_api_request();
        tracing::debug!(%url, ?query, "clicktime request");
        let response = self
            .http
            .get(&url)
            .header("Authorization", format!("Token {}", self.api_token))
            .query(query)
            .send()?;
        decode(response)
    }

    pub fn list_time_entries(
        &self,
        job_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<TimeEntryPage, ClickTimeError> {
        let payload: Envelope<Vec<RawTimeEntry>> = self.get(
            "TimeEntries",
            &[
                ("JobID", job_id.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )?;
        let page = payload.page.unwrap_or(RawPage {
            offset,
            limit,
            count: 0,
        });
        tracing::debug!(
            job_id,
            offset = page.offset,
            limit = page.limit,
            count = page.count,
            returned = payload.data.len(),
            "clicktime time entry page"
        );

        Ok(TimeEntryPage {
            entries: payload.data.into_iter().map(TimeEntry::from).collect(),
            offset: page.offset,
            limit: page.limit,
            count: page.count,
        })
    }

    pub fn find_job_by_number(&self, number: u64) -> Result<JobInfo, ClickTimeError> {
        let payload: Envelope<Vec<RawJob>> = self.get(
            "Jobs",
            &[("JobNumber", number.to_string()), ("limit", "1".to_string())],
        )?;
        let job = payload
            .data
            .into_iter()
            .next()
            .ok_or(ClickTimeError::JobNotFound(number))?;
        Ok(JobInfo {
            id: job.id,
            number,
            name: job.name,
            client_id: job.client_id,
        })
    }

    pub fn get_client(&self, id: &str) -> Result<ClientInfo, ClickTimeError> {
        let payload: Envelope<RawClient> = self.get(&format!("Clients/{id}"), &[])?;
        Ok(ClientInfo {
            name: payload.data.name,
        })
    }

    pub fn get_task(&self, id: &str) -> Result<TaskInfo, ClickTimeError> {
        let payload: Envelope<RawTask> = self.get(&format!("Tasks/{id}"), &[])?;
        Ok(TaskInfo {
            code: payload.data.task_code,
            name: payload.data.name,
        })
    }

    pub fn get_user(&self, id: &str) -> Result<UserInfo, ClickTimeError> {
        let payload: Envelope<RawUser> = self.get(&format!("Users/{id}"), &[])?;
        Ok(UserInfo {
            name: normalize_employee_name(&payload.data.name),
            email: payload.data.email.unwrap_or_default(),
        })
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClickTimeError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        tracing::warn!(%status, "clicktime request failed");
        return Err(ClickTimeError::Http { status, body });
    }

    let body = response.text()?;
    serde_json::from_str(&body).map_err(|source| {
        let body = truncate_body(&body);
        tracing::warn!(%body, "failed decoding clicktime response");
        ClickTimeError::Decode { source, body }
    })
}

pub(crate) fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(1000) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Trims a configured base url, defaults the scheme to https and drops any
/// trailing slash so paths can be appended with `/`.
pub(crate) fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidate = if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = reqwest::Url::parse(&candidate).ok()?;
    Some(parsed.as_str().trim_end_matches('/').to_string())
}

pub fn normalize_employee_name(name: &str) -> String {
    name.replace(' ', ".")
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    page: Option<RawPage>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(deserialize_with = "lenient_u64")]
    offset: u64,
    #[serde(deserialize_with = "lenient_u64")]
    limit: u64,
    #[serde(deserialize_with = "lenient_u64")]
    count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTimeEntry {
    #[serde(rename = "ID")]
    id: String,
    date: NaiveDate,
    #[serde(deserialize_with = "lenient_f64")]
    hours: f64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(rename = "TaskID")]
    task_id: String,
    #[serde(rename = "UserID")]
    user_id: String,
}

impl From<RawTimeEntry> for TimeEntry {
    fn from(raw: RawTimeEntry) -> Self {
        Self {
            id: raw.id,
            date: raw.date,
            hours: raw.hours,
            comment: raw.comment,
            task_id: raw.task_id,
            user_id: raw.user_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawJob {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(rename = "ClientID")]
    client_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawClient {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawTask {
    name: String,
    #[serde(default)]
    task_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawUser {
    name: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(serde_json::Number),
    String(String),
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid number {n}"))),
        NumberOrString::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid number '{s}'"))),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid count {n}"))),
        NumberOrString::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid count '{s}'"))),
    }
}
