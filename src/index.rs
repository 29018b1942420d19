use std::sync::Arc;

use chrono::NaiveDateTime;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::clicktime::{normalize_base_url, truncate_body};
use crate::document::{timestamp_format, IndexedRecord, TIMESTAMP_FORMAT};
use crate::metrics::Metrics;

pub const DEFAULT_ALIAS: &str = "tf-dwh-clicktime";

const PIT_KEEP_ALIVE: &str = "1m";

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("search index request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("search index returned HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("failed to decode search index response: {source}; body: {body}")]
    Decode {
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid search index base url '{0}'")]
    InvalidBaseUrl(String),
}

#[derive(Debug, Clone, Default)]
pub enum IndexAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    ApiKey(String),
}

#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub cluster_name: Option<String>,
    pub version: Option<String>,
}

/// Elasticsearch client scoped to one write alias.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    pub base_url: String,
    pub alias: String,
    auth: IndexAuth,
    http: Client,
    metrics: Arc<Metrics>,
}

impl SearchIndex {
    pub fn new(base_url: &str, alias: &str, auth: IndexAuth) -> Result<Self, IndexError> {
        Self::new_with_metrics(base_url, alias, auth, Arc::new(Metrics::new()))
    }

    pub fn new_with_metrics(
        base_url: &str,
        alias: &str,
        auth: IndexAuth,
        metrics: Arc<Metrics>,
    ) -> Result<Self, IndexError> {
        let http = Client::builder().build()?;
        let base_url = normalize_base_url(base_url)
            .ok_or_else(|| IndexError::InvalidBaseUrl(base_url.to_string()))?;
        Ok(Self {
            base_url,
            alias: alias.to_string(),
            auth,
            http,
            metrics,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            IndexAuth::None => request,
            IndexAuth::Basic { username, password } => {
                request.basic_auth(username, password.as_ref())
            }
            IndexAuth::ApiKey(key) => request.header("Authorization", format!("ApiKey {key}")),
        }
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, IndexError> {
        self.metrics.inc_api_request();
        let response = self.authorize(request).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(IndexError::Http { status, body });
        }
        Ok(response)
    }

    pub fn cluster_info(&self) -> Result<ClusterInfo, IndexError> {
        let url = format!("{}/", self.base_url);
        let payload: InfoResponse = decode(self.send(self.http.get(&url))?)?;
        Ok(ClusterInfo {
            cluster_name: payload.cluster_name,
            version: payload.version.and_then(|v| v.number),
        })
    }

    /// Creates `{alias}-000001` behind the alias when the alias is missing.
    /// Returns whether an index was created.
    pub fn ensure_alias(&self) -> Result<bool, IndexError> {
        let url = format!("{}/_alias/{}", self.base_url, self.alias);
        self.metrics.inc_api_request();
        let response = self.authorize(self.http.head(&url)).send()?;
        match response.status() {
            status if status.is_success() => {
                tracing::debug!(alias = %self.alias, "index alias exists");
                return Ok(false);
            }
            status if status == StatusCode::NOT_FOUND => {}
            status => {
                return Err(IndexError::Http {
                    status,
                    body: String::new(),
                })
            }
        }

        let index_name = format!("{}-000001", self.alias);
        let url = format!("{}/{}", self.base_url, index_name);
        let mut aliases = serde_json::Map::new();
        aliases.insert(self.alias.clone(), json!({}));
        let body = json!({ "aliases": aliases });
        self.send(self.http.put(&url).json(&body))?;
        tracing::info!(alias = %self.alias, index = %index_name, "created index behind alias");
        Ok(true)
    }

    /// Writes `doc` under `id`, replacing any existing document with that id.
    pub fn upsert<T: Serialize>(&self, id: &str, doc: &T) -> Result<(), IndexError> {
        let url = format!("{}/{}/_doc/{}", self.base_url, self.alias, id);
        self.send(self.http.put(&url).json(doc))?;
        self.metrics.inc_upserted();
        Ok(())
    }

    /// Most recent `timestamp` among documents of `job_number`, if any.
    pub fn latest_timestamp(&self, job_number: u64) -> Result<Option<NaiveDateTime>, IndexError> {
        let body = json!({
            "size": 1,
            "sort": [{ "timestamp": { "order": "desc" } }],
            "query": {
                "bool": {
                    "must": [{ "match_phrase": { "job_number": job_number } }]
                }
            }
        });
        let payload: SearchResponse<TimestampSource> = self.search(&body)?;
        Ok(payload
            .hits
            .hits
            .into_iter()
            .next()
            .and_then(|hit| hit.source)
            .map(|source| source.timestamp))
    }

    /// Every document of `job_number` indexed at or after `cutoff`.
    ///
    /// Pages with `search_after` inside a point in time, so the result is a
    /// consistent snapshot and is not capped by `max_result_window`. The
    /// point in time adds a `_shard_doc` tiebreaker to the sort, which keeps
    /// the order total even though a whole run shares one `timestamp`.
    pub fn records_since(
        &self,
        job_number: u64,
        cutoff: NaiveDateTime,
        page_size: u64,
    ) -> Result<Vec<IndexedRecord>, IndexError> {
        let mut pit_id = self.open_point_in_time()?;
        let records = self.page_records(&mut pit_id, job_number, cutoff, page_size.max(1));
        self.close_point_in_time(&pit_id);
        records
    }

    fn page_records(
        &self,
        pit_id: &mut String,
        job_number: u64,
        cutoff: NaiveDateTime,
        page_size: u64,
    ) -> Result<Vec<IndexedRecord>, IndexError> {
        let cutoff = cutoff.format(TIMESTAMP_FORMAT).to_string();
        let mut records = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;

        loop {
            let mut body = json!({
                "size": page_size,
                "pit": { "id": pit_id.as_str(), "keep_alive": PIT_KEEP_ALIVE },
                "_source": ["date", "task_code", "employee_name"],
                "sort": [{ "timestamp": { "order": "desc" } }],
                "query": {
                    "bool": {
                        "must": [{ "match_phrase": { "job_number": job_number } }],
                        "filter": [{ "range": { "timestamp": { "gte": cutoff } } }]
                    }
                }
            });
            if let Some(cursor) = &search_after {
                body["search_after"] = json!(cursor);
            }

            let url = format!("{}/_search", self.base_url);
            let payload: SearchResponse<IndexedRecord> =
                decode(self.send(self.http.post(&url).json(&body))?)?;
            if let Some(id) = payload.pit_id {
                *pit_id = id;
            }

            let returned = payload.hits.hits.len() as u64;
            let cursor = payload.hits.hits.last().and_then(|hit| hit.sort.clone());
            records.extend(payload.hits.hits.into_iter().filter_map(|hit| {
                hit.source.map(|mut record| {
                    record.doc_id = hit.id;
                    record
                })
            }));

            if returned < page_size {
                break;
            }
            match cursor {
                Some(cursor) => search_after = Some(cursor),
                None => {
                    tracing::warn!(
                        project = job_number,
                        records = records.len(),
                        "search hits carry no sort values; stopping prior record paging"
                    );
                    break;
                }
            }
        }

        Ok(records)
    }

    fn open_point_in_time(&self) -> Result<String, IndexError> {
        let url = format!("{}/{}/_pit", self.base_url, self.alias);
        let request = self.http.post(&url).query(&[("keep_alive", PIT_KEEP_ALIVE)]);
        let payload: PointInTime = decode(self.send(request)?)?;
        Ok(payload.id)
    }

    /// Points in time expire on their own; failing to close one early is
    /// only logged.
    fn close_point_in_time(&self, pit_id: &str) {
        let url = format!("{}/_pit", self.base_url);
        let body = json!({ "id": pit_id });
        if let Err(err) = self.send(self.http.delete(&url).json(&body)) {
            tracing::warn!(alias = %self.alias, error = %err, "failed to close point in time");
        }
    }

    /// Removes the documents with the given ids. Sends nothing for an empty
    /// set and returns the number of documents the index reports deleted.
    pub fn delete_documents(&self, ids: &[String]) -> Result<u64, IndexError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let url = format!("{}/{}/_delete_by_query", self.base_url, self.alias);
        let body = json!({ "query": { "ids": { "values": ids } } });
        let payload: DeleteByQueryResponse = decode(self.send(self.http.post(&url).json(&body))?)?;
        let deleted = payload.deleted.unwrap_or(0);
        self.metrics.add_deleted(deleted);
        Ok(deleted)
    }

    fn search<T: DeserializeOwned>(&self, body: &Value) -> Result<SearchResponse<T>, IndexError> {
        let url = format!("{}/{}/_search", self.base_url, self.alias);
        decode(self.send(self.http.post(&url).json(body))?)
    }
}

fn decode<T: DeserializeOwned>(response: Response) -> Result<T, IndexError> {
    let body = response.text()?;
    serde_json::from_str(&body).map_err(|source| IndexError::Decode {
        source,
        body: truncate_body(&body),
    })
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    #[serde(default)]
    cluster_name: Option<String>,
    #[serde(default)]
    version: Option<VersionInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(default)]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    #[serde(default)]
    pit_id: Option<String>,
    hits: Hits<T>,
}

#[derive(Debug, Deserialize)]
struct Hits<T> {
    #[serde(default = "Vec::new")]
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default = "Option::default")]
    // `_source` is absent when the mapping disables it
    source: Option<T>,
    #[serde(default)]
    sort: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct PointInTime {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TimestampSource {
    #[serde(with = "timestamp_format")]
    timestamp: NaiveDateTime,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: Option<u64>,
}
