use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::clicktime::{ClientInfo, JobInfo, TaskInfo, TimeEntry, UserInfo};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One time entry as stored in the search index, with job, client, task and
/// user attributes denormalized onto it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeEntryDocument {
    pub id: String,
    pub comment: String,
    pub date: NaiveDate,
    pub reported_hours: f64,
    pub job_number: u64,
    pub job_name: String,
    pub client_name: String,
    pub task_code: Option<String>,
    pub task_name: String,
    pub employee_name: String,
    pub employee_email: String,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
}

impl TimeEntryDocument {
    pub fn build(
        entry: &TimeEntry,
        job: &JobInfo,
        client: &ClientInfo,
        task: &TaskInfo,
        user: &UserInfo,
        indexed_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: entry.id.clone(),
            comment: sanitize_comment(entry.comment.as_deref()),
            date: entry.date,
            reported_hours: entry.hours,
            job_number: job.number,
            job_name: job.name.clone(),
            client_name: client.name.clone(),
            task_code: task.code.clone(),
            task_name: task.name.clone(),
            employee_name: user.name.clone(),
            employee_email: user.email.clone(),
            timestamp: indexed_at,
        }
    }
}

/// Index document id for an entry. Stable across runs, so re-indexing the
/// same entry replaces rather than duplicates.
pub fn document_id(entry: &TimeEntry) -> String {
    format!("{}-{}-{}", entry.id, entry.user_id, entry.task_id)
}

fn sanitize_comment(comment: Option<&str>) -> String {
    comment
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii)
        .collect()
}

/// The fields of a previously indexed document that reconciliation matches on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedRecord {
    #[serde(skip)]
    pub doc_id: String,
    pub date: String,
    #[serde(default)]
    pub task_code: Option<String>,
    pub employee_name: String,
}

impl IndexedRecord {
    pub fn matches(&self, doc: &TimeEntryDocument) -> bool {
        self.date == doc.date.to_string()
            && self.task_code == doc.task_code
            && self.employee_name == doc.employee_name
    }
}

/// Drops every record confirmed by `doc` written under `doc_id` and returns
/// how many were dropped. The record stored under `doc_id` itself is always
/// confirmed, since the upsert just replaced it.
pub fn retain_unconfirmed(
    records: &mut Vec<IndexedRecord>,
    doc_id: &str,
    doc: &TimeEntryDocument,
) -> usize {
    let before = records.len();
    records.retain(|record| record.doc_id != doc_id && !record.matches(doc));
    before - records.len()
}

pub(crate) mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(
        value: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    /// Accepts the plain format plus fractional seconds or a trailing `Z`.
    pub fn parse(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        let trimmed = raw.trim().trim_end_matches('Z');
        NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
    }
}
