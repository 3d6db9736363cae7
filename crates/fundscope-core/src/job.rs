//! Persisted job model: keys, triggers, options and the versioned job payload codec.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Current payload envelope version written by [`JobSpec::encode`].
pub const JOB_PAYLOAD_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.group, self.name)
    }
}

impl FromStr for JobKey {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("::") {
            Some((group, name)) if !group.is_empty() && !name.is_empty() => {
                Ok(JobKey::new(name, group))
            }
            _ => Err(TriggerError::Malformed(format!("invalid job key `{s}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Scheduled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Scheduled)
    }
}

impl FromStr for JobStatus {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(TriggerError::Malformed(format!("unknown job status `{other}`"))),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("{0}")]
    Malformed(String),
    #[error("invalid cron expression `{expression}`: {message}")]
    Cron { expression: String, message: String },
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    RunOnce { delay: Duration },
    Interval { every: Duration },
    Cron { expression: String },
}

impl Trigger {
    pub fn run_once(delay: Duration) -> Self {
        Trigger::RunOnce { delay }
    }

    pub fn every(every: Duration) -> Self {
        Trigger::Interval { every }
    }

    pub fn cron(expression: impl Into<String>) -> Result<Self, TriggerError> {
        let expression = expression.into();
        parse_cron(&expression)?;
        Ok(Trigger::Cron { expression })
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self, Trigger::RunOnce { .. })
    }

    /// Serialized form persisted next to the job: `once:<ms>ms`, `every:<ms>ms`, `cron:<expr>`.
    pub fn description(&self) -> String {
        match self {
            Trigger::RunOnce { delay } => format!("once:{}ms", delay.as_millis()),
            Trigger::Interval { every } => format!("every:{}ms", every.as_millis()),
            Trigger::Cron { expression } => format!("cron:{expression}"),
        }
    }

    pub fn from_description(description: &str) -> Result<Self, TriggerError> {
        let (kind, rest) = description
            .split_once(':')
            .ok_or_else(|| TriggerError::Malformed(format!("invalid trigger `{description}`")))?;
        match kind {
            "once" => Ok(Trigger::RunOnce {
                delay: parse_millis(rest)?,
            }),
            "every" => {
                let every = parse_millis(rest)?;
                if every.is_zero() {
                    return Err(TriggerError::Malformed("interval must be positive".into()));
                }
                Ok(Trigger::Interval { every })
            }
            "cron" => Trigger::cron(rest),
            other => Err(TriggerError::Malformed(format!("unknown trigger kind `{other}`"))),
        }
    }

    pub fn first_fire_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TriggerError> {
        match self {
            Trigger::RunOnce { delay } => Ok(now + to_chrono(*delay)),
            Trigger::Interval { every } => Ok(now + to_chrono(*every)),
            Trigger::Cron { expression } => next_cron_fire(expression, now),
        }
    }

    /// Next occurrence after a fire at `previous`; `None` for one-shot triggers. Occurrences
    /// that would already be in the past are skipped forward to `now`.
    pub fn next_fire_time(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, TriggerError> {
        match self {
            Trigger::RunOnce { .. } => Ok(None),
            Trigger::Interval { every } => {
                let step = to_chrono(*every);
                let next = previous + step;
                Ok(Some(if next < now { now + step } else { next }))
            }
            Trigger::Cron { expression } => {
                next_cron_fire(expression, previous.max(now)).map(Some)
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

fn parse_millis(raw: &str) -> Result<Duration, TriggerError> {
    raw.trim_end_matches("ms")
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| TriggerError::Malformed(format!("invalid trigger duration `{raw}`: {e}")))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Accepts 5-field cron by prepending a seconds column.
fn parse_cron(expression: &str) -> Result<Schedule, TriggerError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| TriggerError::Cron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

fn next_cron_fire(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, TriggerError> {
    parse_cron(expression)?
        .after(&after)
        .next()
        .ok_or_else(|| TriggerError::Cron {
            expression: expression.to_string(),
            message: "schedule has no future occurrences".into(),
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    pub replace: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_interval: Duration::from_secs(300),
            replace: false,
        }
    }
}

impl JobOptions {
    /// Options used for every crawl job.
    pub fn crawl() -> Self {
        Self {
            max_retries: 10,
            retry_interval: Duration::from_secs(300),
            replace: false,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Row owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub key: JobKey,
    pub job_type: String,
    pub description: String,
    pub next_run_time: DateTime<Utc>,
    pub status: JobStatus,
    pub trigger: String,
    pub options: JobOptions,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    pub fn trigger(&self) -> Result<Trigger, TriggerError> {
        Trigger::from_description(&self.trigger)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlPmfFunds {
    pub uid: String,
    pub for_date: NaiveDate,
    #[serde(default)]
    pub skip_next: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileFundHouse {
    pub fund_manager_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfNavSync {
    pub scheme_id: i64,
}

/// Every job kind the scheduler knows how to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobSpec {
    CrawlPmfFunds(CrawlPmfFunds),
    PmsDataConsistency(ReconcileFundHouse),
    PmfInit,
    MfSync,
    MfNavSync(MfNavSync),
}

impl JobSpec {
    pub const CRAWL_PMF_FUNDS: &'static str = "CrawlPmfFunds";
    pub const PMS_DATA_CONSISTENCY: &'static str = "PmsDataConsistency";
    pub const PMF_INIT: &'static str = "PmfInit";
    pub const MF_SYNC: &'static str = "MfSync";
    pub const MF_NAV_SYNC: &'static str = "MfNavSync";

    pub const ALL_KINDS: [&'static str; 5] = [
        Self::CRAWL_PMF_FUNDS,
        Self::PMS_DATA_CONSISTENCY,
        Self::PMF_INIT,
        Self::MF_SYNC,
        Self::MF_NAV_SYNC,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::CrawlPmfFunds(_) => Self::CRAWL_PMF_FUNDS,
            JobSpec::PmsDataConsistency(_) => Self::PMS_DATA_CONSISTENCY,
            JobSpec::PmfInit => Self::PMF_INIT,
            JobSpec::MfSync => Self::MF_SYNC,
            JobSpec::MfNavSync(_) => Self::MF_NAV_SYNC,
        }
    }

    /// Serializes to `{"v":1,"kind":...,<fields>}`.
    pub fn encode(&self) -> Result<String, JobCodecError> {
        let mut value = serde_json::to_value(self)?;
        let JsonValue::Object(map) = &mut value else {
            return Err(JobCodecError::Malformed("job payload is not an object".into()));
        };
        map.insert("v".to_string(), JsonValue::from(JOB_PAYLOAD_VERSION));
        Ok(serde_json::to_string(&value)?)
    }

    pub fn decode(description: &str) -> Result<Self, JobCodecError> {
        let mut value: JsonValue = serde_json::from_str(description)?;
        let JsonValue::Object(map) = &mut value else {
            return Err(JobCodecError::Malformed("job payload is not an object".into()));
        };
        let version = map
            .remove("v")
            .and_then(|v| v.as_u64())
            .ok_or(JobCodecError::MissingVersion)?;
        if version != JOB_PAYLOAD_VERSION {
            return Err(JobCodecError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Decodes and checks that the payload belongs to the registered `job_type`.
    pub fn decode_as(job_type: &str, description: &str) -> Result<Self, JobCodecError> {
        let spec = Self::decode(description)?;
        if spec.kind() != job_type {
            return Err(JobCodecError::KindMismatch {
                expected: job_type.to_string(),
                found: spec.kind().to_string(),
            });
        }
        Ok(spec)
    }
}

#[derive(Debug, Error)]
pub enum JobCodecError {
    #[error("job payload json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job payload is missing its version")]
    MissingVersion,
    #[error("unsupported job payload version {0}")]
    UnsupportedVersion(u64),
    #[error("job payload kind `{found}` does not match registered type `{expected}`")]
    KindMismatch { expected: String, found: String },
    #[error("{0}")]
    Malformed(String),
}
