//! Counter definitions: the static configuration of a sharded counter.
//!
//! A [`CounterDefinition`] names the shard sub-collection, fixes the number
//! of shards per parent, holds the default shard template and sets the
//! rollup interval. It is validated once, when built, so a definition that
//! exists is always usable.
//!
//! # Ticks
//!
//! Time is bucketed into *ticks* of one rollup interval:
//!
//! ```text
//! tick = floor(unix_seconds / rollup_interval_seconds)
//! ```
//!
//! A write stamps its shard with `tick + 1`, and a rollup pass at tick `t`
//! sweeps shards stamped `t, t-1, ..., t-9`:
//!
//! ```text
//!        write at tick t ──► ct = t+1
//!                              │
//!   tick:  t    t+1   t+2  ...  t+10   t+11
//!          ·     ▲━━━━━━━━━━━━━━━━▲      ·
//!                └─ eligible for rollup ─┘
//! ```
//!
//! A shard is therefore never swept during the interval it was written in,
//! and stays eligible for ten consecutive ticks.
//!
//! # Examples
//!
//! ```rust
//! use contatori_distribuiti::definition::CounterDefinition;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let likes = CounterDefinition::builder("likes")
//!     .shard_count(4)
//!     .rollup_interval(Duration::from_secs(60))
//!     .template(&json!({"count": 0}))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(likes.shard_count(), 4);
//! assert!(CounterDefinition::builder("likes").shard_count(0).build().is_err());
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::store::{CollectionRef, DocumentRef};
use crate::value::{check_fields, value_kind, Fields};

/// Number of trailing ticks swept by one rollup pass.
pub const STALENESS_WINDOW_TICKS: i64 = 10;

/// Shards per parent when not configured.
pub const DEFAULT_SHARD_COUNT: usize = 10;

/// Rollup interval when not configured.
pub const DEFAULT_ROLLUP_INTERVAL: Duration = Duration::from_secs(60);

/// Validated configuration of one logical sharded counter.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDefinition {
    name: String,
    shard_count: usize,
    template: Fields,
    rollup_interval: Duration,
}

impl CounterDefinition {
    /// Starts building a definition whose shards live in sub-collections
    /// named `name`.
    pub fn builder(name: impl Into<String>) -> CounterDefinitionBuilder {
        CounterDefinitionBuilder {
            name: name.into(),
            shard_count: DEFAULT_SHARD_COUNT,
            rollup_interval: DEFAULT_ROLLUP_INTERVAL,
            template: None,
        }
    }

    /// Collection id of the shard sub-collections.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of shards per parent.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Default fields of a lazily created shard.
    pub fn template(&self) -> &Fields {
        &self.template
    }

    /// Length of one tick.
    pub fn rollup_interval(&self) -> Duration {
        self.rollup_interval
    }

    /// The tick containing `time`.
    pub fn tick_at(&self, time: SystemTime) -> i64 {
        let secs = match time.duration_since(UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_secs()).unwrap_or(i64::MAX),
            Err(before) => -(before.duration().as_secs_f64().ceil() as i64),
        };
        secs.div_euclid(self.interval_secs())
    }

    /// The creation tick stamped on a shard written at `time`.
    pub fn creation_tick_at(&self, time: SystemTime) -> i64 {
        self.tick_at(time).saturating_add(1)
    }

    /// The creation ticks swept by a rollup pass at `time`, newest first.
    pub fn staleness_window(&self, time: SystemTime) -> Vec<i64> {
        let current = self.tick_at(time);
        (0..STALENESS_WINDOW_TICKS).map(|i| current - i).collect()
    }

    /// Time left until the tick after the one containing `time` begins.
    pub fn until_next_tick(&self, time: SystemTime) -> Duration {
        let next = self
            .tick_at(time)
            .saturating_add(1)
            .saturating_mul(self.interval_secs());
        let next = u64::try_from(next).unwrap_or_default();
        match UNIX_EPOCH.checked_add(Duration::from_secs(next)) {
            Some(next) => next.duration_since(time).unwrap_or_default(),
            None => Duration::MAX,
        }
    }

    /// The shard sub-collection of `parent`.
    pub fn shards_of(&self, parent: &DocumentRef) -> CollectionRef {
        parent.collection(&self.name)
    }

    /// The shard of `parent` with the given index.
    pub fn shard_ref(&self, parent: &DocumentRef, index: usize) -> DocumentRef {
        self.shards_of(parent).doc(&index.to_string())
    }

    // In range: `build` rejects intervals beyond `i64::MAX` seconds.
    fn interval_secs(&self) -> i64 {
        i64::try_from(self.rollup_interval.as_secs()).unwrap_or(i64::MAX)
    }
}

/// Builder for [`CounterDefinition`].
#[derive(Debug)]
pub struct CounterDefinitionBuilder {
    name: String,
    shard_count: usize,
    rollup_interval: Duration,
    template: Option<Result<Value, serde_json::Error>>,
}

impl CounterDefinitionBuilder {
    /// Sets the number of shards per parent.
    pub fn shard_count(self, shard_count: usize) -> Self {
        Self {
            shard_count,
            ..self
        }
    }

    /// Sets the tick length. Must be a whole number of seconds.
    pub fn rollup_interval(self, rollup_interval: Duration) -> Self {
        Self {
            rollup_interval,
            ..self
        }
    }

    /// Sets the default shard template.
    ///
    /// Any value serializing to an object is accepted, typically a struct
    /// with numeric fields or a `serde_json` object.
    pub fn template<T: Serialize + ?Sized>(self, template: &T) -> Self {
        Self {
            template: Some(serde_json::to_value(template)),
            ..self
        }
    }

    /// Validates the configuration and builds the definition.
    pub fn build(self) -> Result<CounterDefinition, ConfigError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(ConfigError::InvalidName(self.name));
        }
        if self.shard_count == 0 {
            return Err(ConfigError::ZeroShardCount);
        }
        if self.rollup_interval.as_secs() == 0
            || self.rollup_interval.subsec_nanos() != 0
            || i64::try_from(self.rollup_interval.as_secs()).is_err()
        {
            return Err(ConfigError::InvalidRollupInterval(self.rollup_interval));
        }

        let template = match self.template.transpose()? {
            None => Fields::new(),
            Some(Value::Object(fields)) => fields,
            Some(other) => return Err(ConfigError::TemplateNotAnObject(value_kind(&other))),
        };
        check_fields(&template)?;

        Ok(CounterDefinition {
            name: self.name,
            shard_count: self.shard_count,
            template,
            rollup_interval: self.rollup_interval,
        })
    }
}

/// Serialized form of a [`CounterDefinition`], e.g. from a JSON config file.
///
/// ```rust
/// use contatori_distribuiti::definition::{CounterConfig, CounterDefinition};
///
/// let config: CounterConfig = serde_json::from_str(
///     r#"{"name": "likes", "shard_count": 4, "rollup_interval_secs": 60,
///         "template": {"count": 0}}"#,
/// )
/// .unwrap();
///
/// let likes = CounterDefinition::try_from(config).unwrap();
/// assert_eq!(likes.name(), "likes");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Collection id of the shard sub-collections.
    pub name: String,
    /// Number of shards per parent.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
    /// Tick length in seconds.
    #[serde(default = "default_rollup_interval_secs")]
    pub rollup_interval_secs: u64,
    /// Default shard fields.
    #[serde(default)]
    pub template: Fields,
}

fn default_shard_count() -> usize {
    DEFAULT_SHARD_COUNT
}

fn default_rollup_interval_secs() -> u64 {
    DEFAULT_ROLLUP_INTERVAL.as_secs()
}

impl TryFrom<CounterConfig> for CounterDefinition {
    type Error = ConfigError;

    fn try_from(config: CounterConfig) -> Result<Self, Self::Error> {
        CounterDefinition::builder(config.name)
            .shard_count(config.shard_count)
            .rollup_interval(Duration::from_secs(config.rollup_interval_secs))
            .template(&config.template)
            .build()
    }
}

impl From<&CounterDefinition> for CounterConfig {
    fn from(definition: &CounterDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            shard_count: definition.shard_count,
            rollup_interval_secs: definition.rollup_interval.as_secs(),
            template: definition.template.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn likes() -> CounterDefinition {
        CounterDefinition::builder("likes")
            .shard_count(4)
            .rollup_interval(Duration::from_secs(60))
            .template(&json!({"count": 0}))
            .build()
            .unwrap()
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_defaults() {
        let def = CounterDefinition::builder("views").build().unwrap();
        assert_eq!(def.shard_count(), DEFAULT_SHARD_COUNT);
        assert_eq!(def.rollup_interval(), DEFAULT_ROLLUP_INTERVAL);
        assert!(def.template().is_empty());
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            CounterDefinition::builder("").build(),
            Err(ConfigError::InvalidName(_))
        ));
        assert!(matches!(
            CounterDefinition::builder("a/b").build(),
            Err(ConfigError::InvalidName(_))
        ));
        assert!(matches!(
            CounterDefinition::builder("likes").shard_count(0).build(),
            Err(ConfigError::ZeroShardCount)
        ));
        assert!(matches!(
            CounterDefinition::builder("likes")
                .rollup_interval(Duration::from_millis(1500))
                .build(),
            Err(ConfigError::InvalidRollupInterval(_))
        ));
        assert!(matches!(
            CounterDefinition::builder("likes")
                .rollup_interval(Duration::ZERO)
                .build(),
            Err(ConfigError::InvalidRollupInterval(_))
        ));
    }

    #[test]
    fn test_huge_rollup_interval() {
        assert!(matches!(
            CounterDefinition::builder("likes")
                .rollup_interval(Duration::from_secs(u64::MAX))
                .build(),
            Err(ConfigError::InvalidRollupInterval(_))
        ));

        let config = CounterConfig {
            name: "likes".to_string(),
            shard_count: 4,
            rollup_interval_secs: u64::MAX,
            template: Fields::new(),
        };
        assert!(CounterDefinition::try_from(config).is_err());

        let def = CounterDefinition::builder("likes")
            .rollup_interval(Duration::from_secs(i64::MAX as u64))
            .build()
            .unwrap();
        assert_eq!(def.tick_at(at(6_000)), 0);
        assert_eq!(def.creation_tick_at(at(6_000)), 1);
        assert_eq!(def.staleness_window(at(6_000))[0], 0);
        assert!(def.until_next_tick(at(6_000)) > Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn test_template_validation() {
        assert!(matches!(
            CounterDefinition::builder("likes")
                .template(&json!({"count": 0, "ct": 3}))
                .build(),
            Err(ConfigError::ReservedField(f)) if f == "ct"
        ));
        assert!(matches!(
            CounterDefinition::builder("likes").template(&json!([1, 2])).build(),
            Err(ConfigError::TemplateNotAnObject("an array"))
        ));
    }

    #[test]
    fn test_template_from_struct() {
        #[derive(Serialize)]
        struct VideoStats {
            likes: u32,
            watch_time: f64,
        }

        let def = CounterDefinition::builder("stats")
            .template(&VideoStats {
                likes: 0,
                watch_time: 0.0,
            })
            .build()
            .unwrap();
        assert_eq!(def.template().get("likes"), Some(&json!(0)));
        assert_eq!(def.template().get("watch_time"), Some(&json!(0.0)));
    }

    #[test]
    fn test_ticks() {
        let def = likes();
        assert_eq!(def.tick_at(at(0)), 0);
        assert_eq!(def.tick_at(at(59)), 0);
        assert_eq!(def.tick_at(at(60)), 1);
        assert_eq!(def.tick_at(at(6_000)), 100);
        assert_eq!(def.creation_tick_at(at(6_000)), 101);
        assert_eq!(def.tick_at(UNIX_EPOCH - Duration::from_secs(1)), -1);
    }

    #[test]
    fn test_staleness_window() {
        let window = likes().staleness_window(at(6_000));
        assert_eq!(window.len(), STALENESS_WINDOW_TICKS as usize);
        assert_eq!(window.first(), Some(&100));
        assert_eq!(window.last(), Some(&91));
        assert!(!window.contains(&90));
        assert!(!window.contains(&101));
    }

    #[test]
    fn test_until_next_tick() {
        let def = likes();
        assert_eq!(def.until_next_tick(at(6_000)), Duration::from_secs(60));
        assert_eq!(def.until_next_tick(at(6_045)), Duration::from_secs(15));
    }

    #[test]
    fn test_shard_refs() {
        let def = likes();
        let parent = DocumentRef::new("posts", "p1");
        assert_eq!(def.shards_of(&parent).path(), "posts/p1/likes");
        assert_eq!(def.shard_ref(&parent, 3).path(), "posts/p1/likes/3");
    }

    #[test]
    fn test_config_round_trip() {
        let def = likes();
        let config = CounterConfig::from(&def);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CounterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(CounterDefinition::try_from(parsed).unwrap(), def);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config: CounterConfig = serde_json::from_str(r#"{"name": "views"}"#).unwrap();
        assert_eq!(config.shard_count, DEFAULT_SHARD_COUNT);
        assert_eq!(config.rollup_interval_secs, 60);

        let bad: CounterConfig =
            serde_json::from_str(r#"{"name": "views", "template": {"did": "x"}}"#).unwrap();
        assert!(CounterDefinition::try_from(bad).is_err());
    }
}
