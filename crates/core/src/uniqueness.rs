//! Deduplication digests.
//!
//! A digest is a SHA-256 over a stable string key built from the job class and,
//! optionally, its arguments. The store enforces "at most one alive job per
//! digest"; the strategies here only decide *which* key a job maps to and when
//! it maps to none at all.
//!
//! - `Alive`: one alive (`waiting`/`claimed`/`running`) job per key. Terminal
//!   jobs carry no digest, so the key frees up as soon as the job finishes.
//! - `FixedWindow`: one job per key per calendar window (UTC). The digest is
//!   always present; the window start is part of the key.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::job::JobRecord;

/// Granularity of a fixed dedup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePeriod {
    Second,
    Minute,
    Hour,
    Day,
    /// ISO weeks (starting Monday 00:00 UTC)
    Week,
    Month,
}

impl TimePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::Second => "second",
            TimePeriod::Minute => "minute",
            TimePeriod::Hour => "hour",
            TimePeriod::Day => "day",
            TimePeriod::Week => "week",
            TimePeriod::Month => "month",
        }
    }

    /// Start of the window containing `at`.
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let fixed = |d: ChronoDuration| at.duration_trunc(d).unwrap_or(at);
        match self {
            TimePeriod::Second => fixed(ChronoDuration::seconds(1)),
            TimePeriod::Minute => fixed(ChronoDuration::minutes(1)),
            TimePeriod::Hour => fixed(ChronoDuration::hours(1)),
            TimePeriod::Day => fixed(ChronoDuration::days(1)),
            TimePeriod::Week => {
                let day = fixed(ChronoDuration::days(1));
                day - ChronoDuration::days(i64::from(day.weekday().num_days_from_monday()))
            }
            TimePeriod::Month => Utc
                .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(at),
        }
    }
}

/// Deduplication strategy attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UniquenessConfig {
    Alive {
        #[serde(default)]
        with_args: bool,
    },
    FixedWindow {
        period: TimePeriod,
        #[serde(default)]
        with_args: bool,
    },
}

impl UniquenessConfig {
    pub fn alive(with_args: bool) -> Self {
        Self::Alive { with_args }
    }

    pub fn fixed_window(period: TimePeriod, with_args: bool) -> Self {
        Self::FixedWindow { period, with_args }
    }

    /// Digest for `job`, or `None` when the job must not hold a uniqueness slot.
    ///
    /// `now` stands in for `available_at` when the record has none.
    pub fn digest(&self, job: &JobRecord, now: DateTime<Utc>) -> Option<String> {
        match *self {
            UniquenessConfig::Alive { with_args } => {
                if !job.state.is_alive() {
                    return None;
                }
                let mut key = format!("alive|{}", job.class);
                if with_args {
                    append_args(&mut key, job);
                }
                Some(hash_key(&key))
            }
            UniquenessConfig::FixedWindow { period, with_args } => {
                let window = period.truncate(job.available_at.unwrap_or(now));
                let mut key = format!(
                    "window|{}|{}|{}",
                    job.class,
                    period.as_str(),
                    window.timestamp()
                );
                if with_args {
                    append_args(&mut key, job);
                }
                Some(hash_key(&key))
            }
        }
    }
}

fn append_args(key: &mut String, job: &JobRecord) {
    key.push_str("|args:");
    write_canonical_list(key, &job.args);
    key.push_str("|ctor:");
    write_canonical_list(key, &job.constructor_args);
}

fn write_canonical_list(out: &mut String, values: &[JsonValue]) {
    out.push('[');
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        write_canonical(out, value);
    }
    out.push(']');
}

/// JSON with object keys sorted at every depth.
///
/// Does not rely on `serde_json::Map` ordering, which flips to insertion order
/// when any crate in the build enables `preserve_order`.
fn write_canonical(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (k, v)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(k.clone()).to_string());
                out.push(':');
                write_canonical(out, v);
            }
            out.push('}');
        }
        JsonValue::Array(items) => write_canonical_list(out, items),
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, NewJob};
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn job_at(class: &str, available_at: &str) -> JobRecord {
        NewJob::new(class)
            .available_at(at(available_at))
            .into_record(at(available_at))
            .unwrap()
    }

    #[test]
    fn fixed_window_hour_groups_timestamps_in_the_same_hour() {
        let config = UniquenessConfig::fixed_window(TimePeriod::Hour, false);
        let now = Utc::now();

        let a = config.digest(&job_at("report", "2024-05-01T14:15:30Z"), now);
        let b = config.digest(&job_at("report", "2024-05-01T14:45:10Z"), now);
        assert_eq!(a, b);

        let c = config.digest(&job_at("report", "2024-05-01T14:30:00Z"), now);
        let d = config.digest(&job_at("report", "2024-05-01T15:30:00Z"), now);
        assert_ne!(c, d);
    }

    #[test]
    fn fixed_window_digest_ignores_state() {
        let config = UniquenessConfig::fixed_window(TimePeriod::Day, false);
        let mut job = job_at("report", "2024-05-01T10:00:00Z");
        let alive = config.digest(&job, Utc::now());

        job.state = JobState::Completed;
        assert_eq!(config.digest(&job, Utc::now()), alive);
        assert!(alive.is_some());
    }

    #[test]
    fn alive_digest_is_none_for_terminal_jobs() {
        let config = UniquenessConfig::alive(false);
        let mut job = job_at("sync", "2024-05-01T10:00:00Z");

        for state in [JobState::Waiting, JobState::Claimed, JobState::Running] {
            job.state = state;
            assert!(config.digest(&job, Utc::now()).is_some());
        }
        for state in [JobState::Completed, JobState::Failed, JobState::Canceled] {
            job.state = state;
            assert!(config.digest(&job, Utc::now()).is_none());
        }
    }

    #[test]
    fn alive_digest_without_args_ignores_args() {
        let config = UniquenessConfig::alive(false);
        let now = Utc::now();
        let a = NewJob::new("sync").arg(json!(1)).into_record(now).unwrap();
        let b = NewJob::new("sync").arg(json!(2)).into_record(now).unwrap();

        assert_eq!(config.digest(&a, now), config.digest(&b, now));
    }

    #[test]
    fn alive_digest_with_args_distinguishes_args() {
        let config = UniquenessConfig::alive(true);
        let now = Utc::now();
        let a = NewJob::new("sync").arg(json!(1)).into_record(now).unwrap();
        let b = NewJob::new("sync").arg(json!(2)).into_record(now).unwrap();
        let c = NewJob::new("other").arg(json!(1)).into_record(now).unwrap();

        assert_ne!(config.digest(&a, now), config.digest(&b, now));
        assert_ne!(config.digest(&a, now), config.digest(&c, now));
    }

    #[test]
    fn object_key_order_does_not_affect_digest() {
        let config = UniquenessConfig::alive(true);
        let now = Utc::now();
        let a: JsonValue = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: JsonValue = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();

        let ja = NewJob::new("sync").arg(a).into_record(now).unwrap();
        let jb = NewJob::new("sync").arg(b).into_record(now).unwrap();
        assert_eq!(config.digest(&ja, now), config.digest(&jb, now));
    }

    #[test]
    fn week_and_month_windows_are_calendar_aligned() {
        // 2024-05-01 is a Wednesday.
        let wed = at("2024-05-01T13:00:00Z");
        assert_eq!(TimePeriod::Week.truncate(wed), at("2024-04-29T00:00:00Z"));
        assert_eq!(TimePeriod::Month.truncate(wed), at("2024-05-01T00:00:00Z"));
        assert_eq!(
            TimePeriod::Month.truncate(at("2024-02-29T23:59:59Z")),
            at("2024-02-01T00:00:00Z")
        );
        assert_eq!(
            TimePeriod::Minute.truncate(at("2024-05-01T13:07:59.900Z")),
            at("2024-05-01T13:07:00Z")
        );
    }

    #[test]
    fn uniqueness_config_serializes_with_type_tag() {
        let value = serde_json::to_value(UniquenessConfig::fixed_window(TimePeriod::Hour, true)).unwrap();
        assert_eq!(
            value,
            json!({"type": "fixed-window", "period": "hour", "with_args": true})
        );

        let alive: UniquenessConfig = serde_json::from_value(json!({"type": "alive"})).unwrap();
        assert_eq!(alive, UniquenessConfig::alive(false));
    }
}
