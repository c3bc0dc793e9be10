//! Durable build records and per-stage audit rows.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stage name of the dispatch-time validation row.
pub const HOOKHANDLER_VALIDATION: &str = "HOOKHANDLER_VALIDATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Nil,
    Queued,
    Running,
    Passed,
    Failed,
    FailedPrestart,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Nil => "nil",
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Passed => "passed",
            BuildStatus::Failed => "failed",
            BuildStatus::FailedPrestart => "failed_prestart",
        }
    }

    /// Statuses only move forward: NIL, QUEUED, RUNNING, then one terminal.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Nil, Queued)
                | (Nil, FailedPrestart)
                | (Queued, Running)
                | (Queued, Passed)
                | (Queued, Failed)
                | (Running, Passed)
                | (Running, Failed)
        )
    }

    /// Status an `UpdateSum` call lands on from this status.
    pub fn completion(self, failed: bool) -> BuildStatus {
        match (self, failed) {
            (BuildStatus::Nil, true) => BuildStatus::FailedPrestart,
            (_, true) => BuildStatus::Failed,
            (_, false) => BuildStatus::Passed,
        }
    }

    /// Check a transition, naming the build on failure.
    pub fn ensure_transition(self, next: BuildStatus, id: i64) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                id,
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nil" => Ok(BuildStatus::Nil),
            "queued" => Ok(BuildStatus::Queued),
            "running" => Ok(BuildStatus::Running),
            "passed" => Ok(BuildStatus::Passed),
            "failed" => Ok(BuildStatus::Failed),
            "failed_prestart" => Ok(BuildStatus::FailedPrestart),
            other => Err(Error::Storage(format!("unknown build status {other}"))),
        }
    }
}

/// Why a build was signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignaledBy {
    Push,
    PullRequest,
    Poll,
    Requested,
}

impl SignaledBy {
    pub fn as_str(self) -> &'static str {
        match self {
            SignaledBy::Push => "push",
            SignaledBy::PullRequest => "pull_request",
            SignaledBy::Poll => "poll",
            SignaledBy::Requested => "requested",
        }
    }
}

impl fmt::Display for SignaledBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignaledBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(SignaledBy::Push),
            "pull_request" => Ok(SignaledBy::PullRequest),
            "poll" => Ok(SignaledBy::Poll),
            "requested" => Ok(SignaledBy::Requested),
            other => Err(Error::Storage(format!("unknown signaled_by {other}"))),
        }
    }
}

/// Values written by `AddSumStart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryStart {
    pub hash: String,
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub signaled_by: SignaledBy,
    pub credentials_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub id: i64,
    pub hash: String,
    pub account: String,
    pub repo: String,
    pub branch: String,
    pub status: BuildStatus,
    pub signaled_by: SignaledBy,
    pub credentials_id: i64,
    pub queue_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    /// Seconds; zero until the build finishes.
    pub build_duration: f64,
}

/// One row of `build_stage_details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub build_id: i64,
    pub stage: String,
    pub error: String,
    pub start_time: DateTime<Utc>,
    /// Seconds.
    pub stage_duration: f64,
    /// 0 for pass, 1 for fail.
    pub status: i32,
    pub messages: Vec<String>,
}

impl StageResult {
    pub fn begin(build_id: i64, stage: &str) -> Self {
        Self {
            build_id,
            stage: stage.to_string(),
            error: String::new(),
            start_time: Utc::now(),
            stage_duration: -99.99,
            status: 0,
            messages: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: i32, message: &str, error: &str) {
        self.messages.push(message.to_string());
        self.status = status;
        self.error = error.to_string();
        let elapsed = Utc::now() - self.start_time;
        self.stage_duration = elapsed.num_milliseconds() as f64 / 1000.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_only_move_forward() {
        use BuildStatus::*;
        assert!(Nil.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Passed));
        assert!(!Queued.can_transition_to(Nil));
        assert!(!Passed.can_transition_to(Failed));
        assert!(!FailedPrestart.can_transition_to(Queued));
        assert!(!Running.can_transition_to(FailedPrestart));
        assert!(!Queued.can_transition_to(FailedPrestart));
    }

    #[test]
    fn failing_an_unqueued_build_is_prestart() {
        assert_eq!(BuildStatus::Nil.completion(true), BuildStatus::FailedPrestart);
        assert_eq!(BuildStatus::Running.completion(true), BuildStatus::Failed);
        assert_eq!(BuildStatus::Running.completion(false), BuildStatus::Passed);
    }

    #[test]
    fn status_strings_round_trip_through_storage_form() {
        for status in [
            BuildStatus::Nil,
            BuildStatus::Queued,
            BuildStatus::Running,
            BuildStatus::Passed,
            BuildStatus::Failed,
            BuildStatus::FailedPrestart,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
    }

    #[test]
    fn finishing_a_stage_records_duration_and_message() {
        let mut stage = StageResult::begin(7, HOOKHANDLER_VALIDATION);
        stage.finish(1, "Failed initial validation", "queue down");
        assert_eq!(stage.status, 1);
        assert_eq!(stage.messages, ["Failed initial validation"]);
        assert_eq!(stage.error, "queue down");
        assert!(stage.stage_duration >= 0.0);
    }
}
