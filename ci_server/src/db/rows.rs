//! Row types for the diesel tables and their conversions to the core models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use ci_signal::models::credential::Credential;
use ci_signal::models::poll::{split_branches, PollRequest};
use ci_signal::models::summary::{BuildSummary, StageResult};
use ci_signal::{Error, Result};

use crate::schema::{build_stage_details, build_summary, credentials, polling_repos};

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = build_summary)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SummaryRow {
    pub id: i64,
    pub hash: String,
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub status: String,
    pub signaled_by: String,
    pub credentials_id: i64,
    pub failed: bool,
    pub queuetime: Option<DateTime<Utc>>,
    pub starttime: Option<DateTime<Utc>>,
    pub buildtime: f64,
}

impl TryFrom<SummaryRow> for BuildSummary {
    type Error = Error;

    fn try_from(row: SummaryRow) -> Result<Self> {
        Ok(BuildSummary {
            id: row.id,
            hash: row.hash,
            account: row.account,
            repo: row.repo,
            branch: row.branch,
            status: row.status.parse()?,
            signaled_by: row.signaled_by.parse()?,
            credentials_id: row.credentials_id,
            queue_time: row.queuetime,
            start_time: row.starttime,
            build_duration: row.buildtime,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = build_summary)]
pub struct NewSummary<'a> {
    pub hash: &'a str,
    pub account: &'a str,
    pub repo: &'a str,
    pub branch: &'a str,
    pub status: &'a str,
    pub signaled_by: &'a str,
    pub credentials_id: i64,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = build_stage_details)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StageRow {
    pub id: i64,
    pub build_id: i64,
    pub stage: String,
    pub error: String,
    pub starttime: DateTime<Utc>,
    pub runtime: f64,
    pub status: i32,
    pub messages: serde_json::Value,
}

impl TryFrom<StageRow> for StageResult {
    type Error = Error;

    fn try_from(row: StageRow) -> Result<Self> {
        let messages = serde_json::from_value(row.messages)
            .map_err(|e| Error::Storage(format!("stage {} messages: {e}", row.id)))?;
        Ok(StageResult {
            build_id: row.build_id,
            stage: row.stage,
            error: row.error,
            start_time: row.starttime,
            stage_duration: row.runtime,
            status: row.status,
            messages,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = build_stage_details)]
pub struct NewStage<'a> {
    pub build_id: i64,
    pub stage: &'a str,
    pub error: &'a str,
    pub starttime: DateTime<Utc>,
    pub runtime: f64,
    pub status: i32,
    pub messages: serde_json::Value,
}

impl<'a> From<&'a StageResult> for NewStage<'a> {
    fn from(stage: &'a StageResult) -> Self {
        Self {
            build_id: stage.build_id,
            stage: &stage.stage,
            error: &stage.error,
            starttime: stage.start_time,
            runtime: stage.stage_duration,
            status: stage.status,
            messages: serde_json::Value::from(stage.messages.clone()),
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = credentials)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CredRow {
    pub id: i64,
    pub account: String,
    pub identifier: String,
    pub cred_type: String,
    pub cred_sub_type: String,
    pub additional_fields: serde_json::Value,
}

/// The secret half is never stored here; it comes back empty.
impl TryFrom<CredRow> for Credential {
    type Error = Error;

    fn try_from(row: CredRow) -> Result<Self> {
        let fields = match row.additional_fields {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(Error::Storage(format!(
                    "credential {} has non-object fields: {other}",
                    row.id
                )))
            }
        };
        Ok(Credential {
            id: Some(row.id),
            account: row.account,
            identifier: row.identifier,
            sub_type: row.cred_sub_type.parse()?,
            fields,
            secret: String::new(),
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = credentials)]
pub struct NewCred<'a> {
    pub account: &'a str,
    pub identifier: &'a str,
    pub cred_type: &'a str,
    pub cred_sub_type: &'a str,
    pub additional_fields: serde_json::Value,
}

impl<'a> From<&'a Credential> for NewCred<'a> {
    fn from(cred: &'a Credential) -> Self {
        Self {
            account: &cred.account,
            identifier: &cred.identifier,
            cred_type: cred.cred_type().as_str(),
            cred_sub_type: cred.sub_type.as_str(),
            additional_fields: serde_json::Value::Object(cred.fields.clone()),
        }
    }
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = polling_repos)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PollRow {
    pub id: i64,
    pub account: String,
    pub repo: String,
    pub cron_string: String,
    pub branches: String,
    pub last_cron_time: Option<DateTime<Utc>>,
    pub last_hashes: serde_json::Value,
    pub credentials_id: i64,
}

impl From<PollRow> for PollRequest {
    fn from(row: PollRow) -> Self {
        PollRequest {
            account: row.account,
            repo: row.repo,
            cron: row.cron_string,
            branches: split_branches(&row.branches),
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = polling_repos)]
pub struct NewPoll<'a> {
    pub account: &'a str,
    pub repo: &'a str,
    pub cron_string: &'a str,
    pub branches: String,
    pub credentials_id: i64,
}

pub fn hashes_from_json(value: serde_json::Value) -> Result<HashMap<String, String>> {
    if value.is_null() {
        return Ok(HashMap::new());
    }
    serde_json::from_value(value).map_err(|e| Error::Storage(format!("last_hashes: {e}")))
}
