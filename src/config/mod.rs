//! Configuration for a queue node.
//!
//! Loaded with figment from the environment (merged over an optional
//! `stoker.toml`). Duration fields accept both numeric values (interpreted
//! as seconds) and strings with units ("500ms", "30s", "2m"). All options
//! are validated up front; a node never starts with a bad config.

use crate::cron::Expression;
use crate::error::{Error, Result};
use crate::runtime::scheduler::CronEntry;
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration for a node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log level for this crate's target ("trace" through "error").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Database connection URL.
    pub database_url: String,

    /// Instance name, shared by every node in the cluster.
    #[serde(default = "default_name")]
    pub name: String,

    /// This node's identity, used in producer idents and `attempted_by`.
    #[serde(default = "default_node")]
    pub node: String,

    /// Graceful shutdown timeout.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Queues to run and their per-node concurrency limits.
    ///
    /// Accepts a table in TOML or a compact `"default=10,mailers=5"` string
    /// from the environment.
    #[serde(default, deserialize_with = "deserialize_queues")]
    pub queues: BTreeMap<String, usize>,

    #[serde(default)]
    pub stager: StagerConfig,

    #[serde(default)]
    pub refresher: RefresherConfig,

    #[serde(default)]
    pub pruner: PrunerConfig,

    #[serde(default)]
    pub leadership: LeadershipConfig,

    /// Cron entries, evaluated by the leader each minute.
    #[serde(default)]
    pub cron: Vec<CronEntryConfig>,

    /// Include error debug representations in recorded job errors.
    #[serde(default = "default_true")]
    pub errors_with_traceback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagerConfig {
    #[serde(
        default = "default_stage_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(default = "default_stage_limit")]
    pub limit: i64,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            interval: default_stage_interval(),
            limit: default_stage_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefresherConfig {
    #[serde(
        default = "default_refresh_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_producer_max_age",
        deserialize_with = "deserialize_duration"
    )]
    pub max_age: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            interval: default_refresh_interval(),
            max_age: default_producer_max_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrunerConfig {
    #[serde(
        default = "default_prune_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        default = "default_prune_max_age",
        deserialize_with = "deserialize_duration"
    )]
    pub max_age: Duration,
    #[serde(default = "default_prune_limit")]
    pub limit: i64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: default_prune_interval(),
            max_age: default_prune_max_age(),
            limit: default_prune_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeadershipConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_leader_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_leader_interval(),
        }
    }
}

/// One cron entry as configured; parsed into a
/// [`CronEntry`] during validation.
#[derive(Debug, Clone, Deserialize)]
pub struct CronEntryConfig {
    pub expression: String,
    pub worker: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_args")]
    pub args: Value,
    #[serde(default)]
    pub priority: i32,
}

impl CronEntryConfig {
    fn to_entry(&self) -> Result<CronEntry> {
        if self.worker.trim().is_empty() {
            return Err(Error::InvalidConfig("cron entry worker must be non-empty".into()));
        }

        if !(0..=9).contains(&self.priority) {
            return Err(Error::InvalidConfig(format!(
                "cron entry priority must be between 0 and 9, got {}",
                self.priority
            )));
        }

        Ok(CronEntry {
            expression: Expression::parse(&self.expression)?,
            worker: self.worker.clone(),
            queue: self.queue.clone(),
            args: self.args.clone(),
            priority: self.priority,
        })
    }
}

impl Config {
    /// Validate every option, failing fast on the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("name must be non-empty".into()));
        }

        if self.node.trim().is_empty() {
            return Err(Error::InvalidConfig("node must be non-empty".into()));
        }

        for (queue, limit) in &self.queues {
            if queue.trim().is_empty() {
                return Err(Error::InvalidConfig("queue names must be non-empty".into()));
            }

            if *limit < 1 {
                return Err(Error::InvalidConfig(format!(
                    "queue '{queue}' limit must be positive"
                )));
            }
        }

        if self.stager.interval.is_zero() {
            return Err(Error::InvalidConfig("stager interval must be positive".into()));
        }

        if self.stager.limit < 1 {
            return Err(Error::InvalidConfig("stager limit must be positive".into()));
        }

        if self.refresher.interval.is_zero() {
            return Err(Error::InvalidConfig("refresher interval must be positive".into()));
        }

        if self.refresher.max_age.is_zero() {
            return Err(Error::InvalidConfig("refresher max_age must be positive".into()));
        }

        if self.pruner.interval.is_zero() {
            return Err(Error::InvalidConfig("pruner interval must be positive".into()));
        }

        if self.pruner.max_age.is_zero() {
            return Err(Error::InvalidConfig("pruner max_age must be positive".into()));
        }

        if self.pruner.limit < 1 {
            return Err(Error::InvalidConfig("pruner limit must be positive".into()));
        }

        if self.leadership.interval.is_zero() {
            return Err(Error::InvalidConfig("leadership interval must be positive".into()));
        }

        self.cron_entries()?;

        Ok(())
    }

    /// Parse the configured cron entries.
    pub fn cron_entries(&self) -> Result<Vec<CronEntry>> {
        self.cron.iter().map(CronEntryConfig::to_entry).collect()
    }

    /// Producer ident for this node (`"{name}.{node}"`).
    pub fn ident(&self) -> String {
        format!("{}.{}", self.name, self.node)
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_name() -> String {
    "stoker".to_owned()
}

/// Default node identity: the HOSTNAME env var when present.
fn default_node() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_owned())
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_stage_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_stage_limit() -> i64 {
    20_000
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_producer_max_age() -> Duration {
    Duration::from_secs(60)
}

fn default_prune_interval() -> Duration {
    Duration::from_secs(60)
}

/// Terminal jobs are retained for a week by default.
fn default_prune_max_age() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_prune_limit() -> i64 {
    10_000
}

fn default_leader_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_queue() -> String {
    "default".to_owned()
}

fn default_args() -> Value {
    Value::Object(Map::new())
}

fn default_true() -> bool {
    true
}

/// Duration parser accepting seconds by default plus ms/s/m/h units, with
/// optional whitespace between the number and the unit.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Accepts `30`, `"30s"`, `"1500ms"`, `"2m"` and the like.
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration '{value}': {e}. Examples: '5' (seconds), '1500ms', '30s', '2m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration conversion error: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }

            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

/// Accepts a `{queue: limit}` map or a `"default=10,mailers=5"` string.
fn deserialize_queues<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, usize>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{MapAccess, Visitor};

    struct QueuesVisitor;

    impl<'de> Visitor<'de> for QueuesVisitor {
        type Value = BTreeMap<String, usize>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a map of queue limits or a 'queue=limit,...' string")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let mut queues = BTreeMap::new();

            for pair in value.split(',').filter(|pair| !pair.trim().is_empty()) {
                let (queue, limit) = pair.split_once('=').ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "expected 'queue=limit' in queue list, got '{pair}'"
                    ))
                })?;

                let limit = limit.trim().parse::<usize>().map_err(|_| {
                    serde::de::Error::custom(format!(
                        "invalid limit for queue '{}': '{}'",
                        queue.trim(),
                        limit.trim()
                    ))
                })?;

                queues.insert(queue.trim().to_owned(), limit);
            }

            Ok(queues)
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut queues = BTreeMap::new();

            while let Some((queue, limit)) = map.next_entry::<String, usize>()? {
                queues.insert(queue, limit);
            }

            Ok(queues)
        }
    }

    deserializer.deserialize_any(QueuesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Figment;
    use figment::providers::Serialized;
    use serde_json::json;

    fn minimal() -> Figment {
        Figment::new().merge(Serialized::defaults(json!({
            "database_url": "postgres://localhost/stoker_test"
        })))
    }

    fn extract(figment: Figment) -> Config {
        figment.extract().expect("config should deserialize")
    }

    #[test]
    fn defaults_are_applied() {
        let config = extract(minimal());

        assert_eq!(config.log_level, "info");
        assert_eq!(config.name, "stoker");
        assert_eq!(config.shutdown_timeout, Duration::from_secs(8));
        assert_eq!(config.stager.interval, Duration::from_secs(1));
        assert_eq!(config.stager.limit, 20_000);
        assert_eq!(config.refresher.interval, Duration::from_secs(15));
        assert_eq!(config.refresher.max_age, Duration::from_secs(60));
        assert_eq!(config.pruner.max_age, Duration::from_secs(7 * 24 * 60 * 60));
        assert!(config.leadership.enabled);
        assert!(config.queues.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn durations_parse_from_numbers_and_strings() {
        let config = extract(minimal().merge(Serialized::defaults(json!({
            "shutdown_timeout": "1500ms",
            "stager": {"interval": 2},
            "refresher": {"interval": "30s", "max_age": "2m"}
        }))));

        assert_eq!(config.shutdown_timeout, Duration::from_millis(1500));
        assert_eq!(config.stager.interval, Duration::from_secs(2));
        assert_eq!(config.refresher.interval, Duration::from_secs(30));
        assert_eq!(config.refresher.max_age, Duration::from_secs(120));
    }

    #[test]
    fn queues_parse_from_map_and_string() {
        let from_map = extract(minimal().merge(Serialized::defaults(json!({
            "queues": {"default": 10, "mailers": 5}
        }))));
        assert_eq!(from_map.queues["default"], 10);
        assert_eq!(from_map.queues["mailers"], 5);

        let from_string = extract(minimal().merge(Serialized::defaults(json!({
            "queues": "default=10, mailers=5"
        }))));
        assert_eq!(from_string.queues, from_map.queues);
    }

    #[test]
    fn zero_queue_limit_is_rejected() {
        let config = extract(minimal().merge(Serialized::defaults(json!({
            "queues": {"default": 0}
        }))));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limit must be positive"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = extract(minimal().merge(Serialized::defaults(json!({
            "stager": {"interval": 0}
        }))));
        assert!(config.validate().is_err());

        let config = extract(minimal().merge(Serialized::defaults(json!({
            "refresher": {"max_age": 0}
        }))));
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_cron_expression_is_rejected() {
        let config = extract(minimal().merge(Serialized::defaults(json!({
            "cron": [{"expression": "* * *", "worker": "Tick"}]
        }))));

        assert!(config.validate().is_err());
    }

    #[test]
    fn cron_entries_parse() {
        let config = extract(minimal().merge(Serialized::defaults(json!({
            "cron": [
                {"expression": "@hourly", "worker": "Tick"},
                {"expression": "*/5 * * * *", "worker": "Sweep", "queue": "maintenance"}
            ]
        }))));

        let entries = config.cron_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].worker, "Tick");
        assert_eq!(entries[1].queue, "maintenance");
    }

    #[test]
    fn ident_joins_name_and_node() {
        let config = extract(minimal().merge(Serialized::defaults(json!({
            "name": "stoker",
            "node": "node-a"
        }))));

        assert_eq!(config.ident(), "stoker.node-a");
    }
}
