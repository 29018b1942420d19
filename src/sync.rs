use chrono::{NaiveDateTime, TimeDelta, Utc};

use crate::cache::LookupCache;
use crate::clicktime::{ClickTimeClient, ClickTimeError};
use crate::config::SyncConfig;
use crate::document::{document_id, retain_unconfirmed, IndexedRecord, TimeEntryDocument};
use crate::index::{IndexError, SearchIndex};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    ClickTime(#[from] ClickTimeError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone)]
pub struct ProjectReport {
    pub job_number: u64,
    pub job_name: String,
    pub cutoff: NaiveDateTime,
    pub prior_records: usize,
    pub pages: usize,
    pub entries_indexed: usize,
    pub stale_found: usize,
    pub stale_deleted: u64,
}

#[derive(Debug, Default)]
pub struct SyncResult {
    pub projects: Vec<ProjectReport>,
}

impl SyncResult {
    pub fn entries_indexed(&self) -> usize {
        self.projects.iter().map(|p| p.entries_indexed).sum()
    }

    pub fn stale_deleted(&self) -> u64 {
        self.projects.iter().map(|p| p.stale_deleted).sum()
    }
}

/// Documents of a job indexed since `cutoff`, the working set that the
/// current fetch has to re-confirm.
#[derive(Debug, Clone)]
pub struct PriorRecords {
    pub cutoff: NaiveDateTime,
    pub records: Vec<IndexedRecord>,
}

pub fn sync_projects(
    clicktime: &ClickTimeClient,
    index: &SearchIndex,
    cache: &mut LookupCache,
    settings: &SyncConfig,
    projects: &[u64],
) -> Result<SyncResult, SyncError> {
    let mut result = SyncResult::default();
    for &number in projects {
        let indexed_at = Utc::now().naive_utc();
        let report = sync_project(clicktime, index, cache, settings, number, indexed_at)?;
        result.projects.push(report);
    }
    Ok(result)
}

/// Mirrors every current time entry of one job into the index and removes
/// the documents the upstream no longer returns.
pub fn sync_project(
    clicktime: &ClickTimeClient,
    index: &SearchIndex,
    cache: &mut LookupCache,
    settings: &SyncConfig,
    number: u64,
    indexed_at: NaiveDateTime,
) -> Result<ProjectReport, SyncError> {
    tracing::info!(project = number, "handling project");

    let job = cache.job(number, || clicktime.find_job_by_number(number))?;
    let client = cache.client(&job.client_id, || clicktime.get_client(&job.client_id))?;

    let prior = load_prior_records(index, number, settings, indexed_at);
    let prior_count = prior.records.len();
    let mut pending = prior.records;
    tracing::info!(
        project = number,
        cutoff = %prior.cutoff,
        prior_records = prior_count,
        "loaded previously indexed records"
    );

    let mut offset: u64 = 0;
    let mut pages = 0;
    let mut indexed = 0;
    loop {
        let page = clicktime.list_time_entries(&job.id, offset, settings.page_size)?;
        pages += 1;

        for entry in &page.entries {
            let task = cache.task(&entry.task_id, || clicktime.get_task(&entry.task_id))?;
            let user = cache.user(&entry.user_id, || clicktime.get_user(&entry.user_id))?;
            let doc = TimeEntryDocument::build(entry, &job, &client, &task, &user, indexed_at);

            let id = document_id(entry);
            index.upsert(&id, &doc)?;
            indexed += 1;
            retain_unconfirmed(&mut pending, &id, &doc);
        }

        if page.is_last() {
            break;
        }
        let next = page.next_offset();
        if next <= offset {
            tracing::warn!(
                project = number,
                offset,
                next,
                count = page.count,
                "time entry paging made no progress; stopping"
            );
            break;
        }
        offset = next;
    }

    let stale_ids: Vec<String> = pending.into_iter().map(|record| record.doc_id).collect();
    tracing::info!(
        project = number,
        stale = stale_ids.len(),
        "removing documents no longer returned upstream"
    );
    let stale_deleted = index.delete_documents(&stale_ids)?;

    tracing::info!(
        project = number,
        pages,
        indexed,
        stale_deleted,
        "project synced"
    );

    Ok(ProjectReport {
        job_number: number,
        job_name: job.name,
        cutoff: prior.cutoff,
        prior_records: prior_count,
        pages,
        entries_indexed: indexed,
        stale_found: stale_ids.len(),
        stale_deleted,
    })
}

/// Any failure while reading prior records yields an empty working set and
/// the far-past cutoff, so the run re-indexes rather than deletes.
pub fn load_prior_records(
    index: &SearchIndex,
    job_number: u64,
    settings: &SyncConfig,
    now: NaiveDateTime,
) -> PriorRecords {
    match try_load_prior_records(index, job_number, settings, now) {
        Ok(prior) => prior,
        Err(err) => {
            tracing::warn!(
                project = job_number,
                error = %err,
                "failed to read previously indexed records; treating job as unindexed"
            );
            PriorRecords {
                cutoff: far_past_cutoff(now, settings),
                records: Vec::new(),
            }
        }
    }
}

fn try_load_prior_records(
    index: &SearchIndex,
    job_number: u64,
    settings: &SyncConfig,
    now: NaiveDateTime,
) -> Result<PriorRecords, IndexError> {
    let cutoff = cutoff_from_latest(index.latest_timestamp(job_number)?, now, settings);
    let records = index.records_since(job_number, cutoff, settings.page_size)?;
    Ok(PriorRecords { cutoff, records })
}

pub fn cutoff_from_latest(
    latest: Option<NaiveDateTime>,
    now: NaiveDateTime,
    settings: &SyncConfig,
) -> NaiveDateTime {
    match latest {
        Some(latest) => days_before(latest, settings.lookback_days),
        None => far_past_cutoff(now, settings),
    }
}

fn far_past_cutoff(now: NaiveDateTime, settings: &SyncConfig) -> NaiveDateTime {
    days_before(now, settings.history_days)
}

/// Saturates at `NaiveDateTime::MIN` when `days` is out of range.
fn days_before(at: NaiveDateTime, days: i64) -> NaiveDateTime {
    TimeDelta::try_days(days)
        .and_then(|span| at.checked_sub_signed(span))
        .unwrap_or(NaiveDateTime::MIN)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use httpmock::Method::{DELETE, GET, POST, PUT};
    use httpmock::{Mock, MockServer};
    use serde_json::{json, Value};

    use super::*;
    use crate::index::{IndexAuth, DEFAULT_ALIAS};
    use crate::metrics::Metrics;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(h, min, 0))
            .expect("valid timestamp")
    }

    fn indexed_at() -> NaiveDateTime {
        at(2020, 7, 10, 12, 0)
    }

    struct ReferenceMocks<'a> {
        jobs: Mock<'a>,
        users: Mock<'a>,
    }

    struct Harness {
        clicktime_server: MockServer,
        index_server: MockServer,
        metrics: Arc<Metrics>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                clicktime_server: MockServer::start(),
                index_server: MockServer::start(),
                metrics: Arc::new(Metrics::new()),
            }
        }

        fn clients(&self) -> (ClickTimeClient, SearchIndex, LookupCache) {
            let clicktime = ClickTimeClient::new_with_metrics(
                &self.clicktime_server.base_url(),
                "secret".into(),
                Arc::clone(&self.metrics),
            )
            .expect("clicktime client");
            let index = SearchIndex::new_with_metrics(
                &self.index_server.base_url(),
                DEFAULT_ALIAS,
                IndexAuth::None,
                Arc::clone(&self.metrics),
            )
            .expect("search index");
            (clicktime, index, LookupCache::new(Arc::clone(&self.metrics)))
        }

        fn reference_data(&self) -> ReferenceMocks<'_> {
            let server = &self.clicktime_server;
            let jobs = server.mock(|when, then| {
                when.method(GET)
                    .path("/Jobs")
                    .query_param("JobNumber", "20184");
                then.status(200).json_body(json!({
                    "data": [{"ID": "job-1", "Name": "TaskFlow H2-2020", "ClientID": "c1"}]
                }));
            });
            server.mock(|when, then| {
                when.method(GET).path("/Clients/c1");
                then.status(200).json_body(json!({"data": {"Name": "Acme"}}));
            });
            server.mock(|when, then| {
                when.method(GET).path("/Tasks/t1");
                then.status(200)
                    .json_body(json!({"data": {"Name": "Development", "TaskCode": "DEV"}}));
            });
            let users = server.mock(|when, then| {
                when.method(GET).path("/Users/u1");
                then.status(200).json_body(json!({
                    "data": {"Name": "Ada Lovelace", "Email": "ada@example.com"}
                }));
            });
            ReferenceMocks { jobs, users }
        }

        fn entries_page(&self, offset: u64, limit: u64, count: u64, data: Value) -> Mock<'_> {
            self.clicktime_server.mock(|when, then| {
                when.method(GET)
                    .path("/TimeEntries")
                    .query_param("JobID", "job-1")
                    .query_param("offset", offset.to_string());
                then.status(200).json_body(json!({
                    "data": data,
                    "page": {"offset": offset, "limit": limit, "count": count}
                }));
            })
        }

        fn latest_timestamp(&self, timestamp: Option<&str>) -> Mock<'_> {
            let hits = match timestamp {
                Some(ts) => json!([{"_id": "x", "_source": {"timestamp": ts}}]),
                None => json!([]),
            };
            self.index_server.mock(|when, then| {
                when.method(POST)
                    .path("/tf-dwh-clicktime/_search")
                    .json_body_partial(r#"{"size": 1}"#);
                then.status(200).json_body(json!({"hits": {"hits": hits}}));
            })
        }

        fn point_in_time(&self) {
            self.index_server.mock(|when, then| {
                when.method(POST).path("/tf-dwh-clicktime/_pit");
                then.status(200).json_body(json!({"id": "pit-1"}));
            });
            self.index_server.mock(|when, then| {
                when.method(DELETE).path("/_pit");
                then.status(200).json_body(json!({"succeeded": true}));
            });
        }

        fn prior_records(&self, hits: Value) -> Mock<'_> {
            self.point_in_time();
            self.index_server.mock(|when, then| {
                when.method(POST).path("/_search");
                then.status(200).json_body(json!({"hits": {"hits": hits}}));
            })
        }

        fn upserts(&self) -> Mock<'_> {
            self.index_server.mock(|when, then| {
                when.method(PUT).path_contains("/tf-dwh-clicktime/_doc/");
                then.status(200).json_body(json!({"result": "updated"}));
            })
        }

        fn delete(&self) -> Mock<'_> {
            self.index_server.mock(|when, then| {
                when.method(POST).path("/tf-dwh-clicktime/_delete_by_query");
                then.status(200).json_body(json!({"deleted": 1}));
            })
        }
    }

    fn entry(id: &str, date: &str) -> Value {
        json!({
            "ID": id,
            "Date": date,
            "Hours": 1.5,
            "Comment": "work",
            "TaskID": "t1",
            "UserID": "u1"
        })
    }

    fn prior_hit(doc_id: &str, date: &str) -> Value {
        json!({
            "_id": doc_id,
            "_source": {"date": date, "task_code": "DEV", "employee_name": "Ada.Lovelace"}
        })
    }

    #[test]
    fn matching_fetch_deletes_nothing() {
        let h = Harness::new();
        h.reference_data();
        h.entries_page(0, 500, 1, json!([entry("e1", "2020-07-01")]));
        h.latest_timestamp(Some("2020-07-09T12:00:00"));
        h.prior_records(json!([prior_hit("e1-u1-t1", "2020-07-01")]));
        let upserts = h.upserts();
        let delete = h.delete();

        let (clicktime, index, mut cache) = h.clients();
        let report = sync_project(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            20184,
            indexed_at(),
        )
        .expect("sync");

        upserts.assert_hits(1);
        delete.assert_hits(0);
        assert_eq!(report.prior_records, 1);
        assert_eq!(report.stale_found, 0);
        assert_eq!(report.stale_deleted, 0);
    }

    #[test]
    fn record_missing_upstream_is_deleted_once() {
        let h = Harness::new();
        h.reference_data();
        h.entries_page(0, 500, 1, json!([entry("e1", "2020-07-01")]));
        h.latest_timestamp(Some("2020-07-09T12:00:00"));
        h.point_in_time();
        let prior = h.index_server.mock(|when, then| {
            when.method(POST).path("/_search").json_body_partial(
                r#"{"query": {"bool": {"filter": [
                    {"range": {"timestamp": {"gte": "2020-07-08T12:00:00"}}}
                ]}}}"#,
            );
            then.status(200).json_body(json!({"hits": {"hits": [
                prior_hit("e1-u1-t1", "2020-07-01"),
                prior_hit("e0-u1-t1", "2020-06-15")
            ]}}));
        });
        h.upserts();
        let delete = h.index_server.mock(|when, then| {
            when.method(POST)
                .path("/tf-dwh-clicktime/_delete_by_query")
                .json_body(json!({"query": {"ids": {"values": ["e0-u1-t1"]}}}));
            then.status(200).json_body(json!({"deleted": 1}));
        });

        let (clicktime, index, mut cache) = h.clients();
        let report = sync_project(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            20184,
            indexed_at(),
        )
        .expect("sync");

        prior.assert();
        delete.assert_hits(1);
        assert_eq!(report.cutoff, at(2020, 7, 8, 12, 0));
        assert_eq!(report.stale_found, 1);
        assert_eq!(report.stale_deleted, 1);
    }

    #[test]
    fn entry_edited_upstream_is_not_deleted_after_upsert() {
        let h = Harness::new();
        h.reference_data();
        h.entries_page(0, 500, 1, json!([entry("e1", "2020-07-02")]));
        h.latest_timestamp(Some("2020-07-09T12:00:00"));
        h.prior_records(json!([prior_hit("e1-u1-t1", "2020-07-01")]));
        let upsert = h.index_server.mock(|when, then| {
            when.method(PUT).path("/tf-dwh-clicktime/_doc/e1-u1-t1");
            then.status(200).json_body(json!({"result": "updated"}));
        });
        let delete = h.delete();

        let (clicktime, index, mut cache) = h.clients();
        let report = sync_project(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            20184,
            indexed_at(),
        )
        .expect("sync");

        upsert.assert_hits(1);
        delete.assert_hits(0);
        assert_eq!(report.prior_records, 1);
        assert_eq!(report.stale_found, 0);
    }

    #[test]
    fn paging_follows_server_reported_limit() {
        let h = Harness::new();
        h.reference_data();
        let first = h.entries_page(0, 1, 2, json!([entry("e1", "2020-07-01")]));
        let second = h.entries_page(1, 1, 2, json!([entry("e2", "2020-07-02")]));
        h.latest_timestamp(None);
        h.prior_records(json!([]));
        let upserts = h.upserts();

        let (clicktime, index, mut cache) = h.clients();
        let report = sync_project(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            20184,
            indexed_at(),
        )
        .expect("sync");

        first.assert_hits(1);
        second.assert_hits(1);
        upserts.assert_hits(2);
        assert_eq!(report.pages, 2);
        assert_eq!(report.entries_indexed, 2);
    }

    #[test]
    fn paging_stops_when_server_does_not_advance() {
        let h = Harness::new();
        h.reference_data();
        // The server keeps answering with offset 0 whatever was requested.
        let stuck = h.clicktime_server.mock(|when, then| {
            when.method(GET).path("/TimeEntries");
            then.status(200).json_body(json!({
                "data": [],
                "page": {"offset": 0, "limit": 1, "count": 10}
            }));
        });
        h.latest_timestamp(None);
        h.prior_records(json!([]));

        let (clicktime, index, mut cache) = h.clients();
        let report = sync_project(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            20184,
            indexed_at(),
        )
        .expect("sync");

        stuck.assert_hits(2);
        assert_eq!(report.pages, 2);
    }

    #[test]
    fn prior_lookup_failure_indexes_without_deleting() {
        let h = Harness::new();
        h.reference_data();
        h.entries_page(0, 500, 1, json!([entry("e1", "2020-07-01")]));
        h.index_server.mock(|when, then| {
            when.method(POST).path("/tf-dwh-clicktime/_search");
            then.status(500).body("search unavailable");
        });
        let upserts = h.upserts();
        let delete = h.delete();

        let (clicktime, index, mut cache) = h.clients();
        let report = sync_project(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            20184,
            indexed_at(),
        )
        .expect("sync survives prior lookup failure");

        upserts.assert_hits(1);
        delete.assert_hits(0);
        assert_eq!(report.prior_records, 0);
        assert_eq!(report.cutoff, indexed_at() - TimeDelta::days(2000));
    }

    #[test]
    fn repeated_project_reuses_lookups_and_document_ids() {
        let h = Harness::new();
        let reference = h.reference_data();
        h.entries_page(0, 500, 1, json!([entry("e1", "2020-07-01")]));
        h.latest_timestamp(None);
        h.prior_records(json!([]));
        let upsert = h.index_server.mock(|when, then| {
            when.method(PUT).path("/tf-dwh-clicktime/_doc/e1-u1-t1");
            then.status(200).json_body(json!({"result": "updated"}));
        });

        let (clicktime, index, mut cache) = h.clients();
        let result = sync_projects(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            &[20184, 20184],
        )
        .expect("sync");

        reference.jobs.assert_hits(1);
        reference.users.assert_hits(1);
        upsert.assert_hits(2);
        assert_eq!(result.projects.len(), 2);
        assert_eq!(result.entries_indexed(), 2);
        assert!(h.metrics.snapshot().cache_hits >= 4);
    }

    #[test]
    fn upstream_failure_ends_the_run() {
        let h = Harness::new();
        h.reference_data();
        h.clicktime_server.mock(|when, then| {
            when.method(GET).path("/TimeEntries");
            then.status(502).body("bad gateway");
        });
        h.latest_timestamp(None);
        h.prior_records(json!([]));
        let delete = h.delete();

        let (clicktime, index, mut cache) = h.clients();
        let err = sync_projects(
            &clicktime,
            &index,
            &mut cache,
            &SyncConfig::default(),
            &[20184],
        )
        .expect_err("clicktime failure propagates");

        assert!(matches!(
            err,
            SyncError::ClickTime(ClickTimeError::Http { status, .. }) if status.as_u16() == 502
        ));
        delete.assert_hits(0);
    }

    #[test]
    fn cutoff_subtracts_lookback_from_latest() {
        let settings = SyncConfig::default();
        let now = indexed_at();

        assert_eq!(
            cutoff_from_latest(Some(at(2020, 7, 9, 6, 15)), now, &settings),
            at(2020, 7, 8, 6, 15)
        );
        assert_eq!(
            cutoff_from_latest(None, now, &settings),
            now - TimeDelta::days(2000)
        );
    }

    #[test]
    fn out_of_range_windows_saturate_instead_of_panicking() {
        let settings = SyncConfig {
            page_size: 500,
            lookback_days: 1_000_000_000_000_000,
            history_days: i64::MAX,
        };
        let now = indexed_at();

        assert_eq!(
            cutoff_from_latest(Some(at(2020, 7, 9, 6, 15)), now, &settings),
            NaiveDateTime::MIN
        );
        assert_eq!(cutoff_from_latest(None, now, &settings), NaiveDateTime::MIN);
    }
}
