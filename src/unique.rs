//! Deterministic uniqueness fingerprints for job deduplication.
//!
//! A [`Unique`] spec selects which parts of a job participate in its
//! fingerprint. The resulting key is stamped into `meta.uniq_key`, and
//! `insert_job` collapses an insert whose key matches an existing
//! non-terminal job.

use crate::job::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Job fields that can participate in the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueField {
    Worker,
    Queue,
    Args,
}

/// Named group of states a unique job is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueGroup {
    /// Any job that has not reached a terminal state.
    #[default]
    Incomplete,
    /// Only jobs still waiting in the scheduled state.
    Scheduled,
    /// Every state, terminal or not.
    All,
}

impl UniqueGroup {
    fn states(self) -> &'static [JobState] {
        match self {
            UniqueGroup::Incomplete => &[
                JobState::Available,
                JobState::Scheduled,
                JobState::Executing,
                JobState::Retryable,
            ],
            UniqueGroup::Scheduled => &[JobState::Scheduled],
            UniqueGroup::All => &[
                JobState::Available,
                JobState::Scheduled,
                JobState::Executing,
                JobState::Retryable,
                JobState::Completed,
                JobState::Discarded,
                JobState::Cancelled,
            ],
        }
    }

    /// Bitmap of state indices, stored in `meta.uniq_bmp`.
    fn bitmap(self) -> Vec<u8> {
        self.states().iter().map(|state| *state as u8).collect()
    }
}

/// Uniqueness specification for an enqueued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Unique {
    /// Fields included in the fingerprint. Defaults to all three.
    pub fields: Vec<UniqueField>,
    /// When non-empty, restricts `args` to these top-level keys.
    pub keys: Vec<String>,
    /// Match-group recorded alongside the key.
    pub group: UniqueGroup,
    /// Bucket `scheduled_at` into windows of this many seconds.
    pub period: Option<u64>,
}

impl Default for Unique {
    fn default() -> Self {
        Self {
            fields: vec![UniqueField::Worker, UniqueField::Queue, UniqueField::Args],
            keys: Vec::new(),
            group: UniqueGroup::default(),
            period: None,
        }
    }
}

impl Unique {
    /// Uniqueness over a time window, the common case for periodic jobs.
    pub fn within_period(seconds: u64) -> Self {
        Self {
            period: Some(seconds),
            ..Self::default()
        }
    }
}

/// Stamp `uniq`, `uniq_key`, and `uniq_bmp` into the job's meta.
pub(crate) fn apply(
    meta: &mut Map<String, Value>,
    worker: &str,
    queue: &str,
    args: &Value,
    scheduled_at: DateTime<Utc>,
    spec: &Unique,
) {
    let mut hasher = Sha256::new();

    for field in [UniqueField::Worker, UniqueField::Queue, UniqueField::Args] {
        if !spec.fields.contains(&field) {
            continue;
        }

        match field {
            UniqueField::Worker => hasher.update(format!("worker:{worker}\n")),
            UniqueField::Queue => hasher.update(format!("queue:{queue}\n")),
            UniqueField::Args => {
                hasher.update("args:");
                hasher.update(canonical(&selected_args(args, &spec.keys)));
                hasher.update("\n");
            }
        }
    }

    if let Some(period) = spec.period.filter(|period| *period > 0) {
        let bucket = scheduled_at.timestamp().div_euclid(period as i64) * period as i64;
        hasher.update(format!("period:{bucket}\n"));
    }

    meta.insert("uniq".into(), json!(true));
    meta.insert("uniq_key".into(), json!(format!("{:x}", hasher.finalize())));
    meta.insert("uniq_bmp".into(), json!(spec.group.bitmap()));
}

fn selected_args(args: &Value, keys: &[String]) -> Value {
    if keys.is_empty() {
        return args.clone();
    }

    match args {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| keys.contains(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render JSON with object keys sorted at every level, so logically equal
/// payloads always hash identically.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", json!(key), canonical(&map[key])))
                .collect();

            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
