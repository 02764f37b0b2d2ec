//! Runtime configuration for the matcher.
//!
//! Values come from the process environment (a `.env` file is loaded by the
//! binary via `dotenvy`). The route subdivision table is a separate JSON file.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_TRIP_ID_SUFFIX_SEPARATOR: &str = "_";
pub const DEFAULT_MAX_AGE_SECONDS: u64 = 3 * 60 * 60;
pub const DEFAULT_CLEAN_INTERVAL_SECONDS: u64 = 60 * 60;
pub const DEFAULT_PG_POOL_SIZE: u32 = 30;
pub const DEFAULT_SCHEMA: &str = "public";

/// Maps route IDs to the schedule subdivision letter used when constructing
/// full trip IDs (e.g. `"1" -> "A"` for the IRT lines).
///
/// Stored as a plain JSON object on disk:
/// ```json
/// {
///   "1": "A",
///   "7": "B"
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSubdivisions {
    entries: HashMap<String, String>,
}

impl RouteSubdivisions {
    /// Loads the table from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading route subdivisions from {path}"))?;
        let entries: HashMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("parsing route subdivisions in {path}"))?;
        Ok(Self { entries })
    }

    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the subdivision for `route_id`, if the route is allow-listed.
    pub fn get(&self, route_id: &str) -> Option<&str> {
        self.entries.get(route_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RouteSubdivisions {
    fn default() -> Self {
        Self::from_entries([("1", "A")])
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub schedule_digest: String,
    pub match_concurrency: usize,
    pub trip_id_suffix_separator: String,
    pub stop_time_updates_max_age: Duration,
    pub stop_time_updates_clean_interval: Duration,
    pub pg_pool_size: u32,
    pub schedule_db_schema: String,
    pub route_subdivisions: RouteSubdivisions,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl MatcherConfig {
    /// Configuration with every default applied.
    pub fn new(schedule_digest: impl Into<String>) -> Self {
        Self {
            schedule_digest: schedule_digest.into(),
            match_concurrency: default_concurrency(),
            trip_id_suffix_separator: DEFAULT_TRIP_ID_SUFFIX_SEPARATOR.to_string(),
            stop_time_updates_max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECONDS),
            stop_time_updates_clean_interval: Duration::from_secs(DEFAULT_CLEAN_INTERVAL_SECONDS),
            pg_pool_size: DEFAULT_PG_POOL_SIZE,
            schedule_db_schema: DEFAULT_SCHEMA.to_string(),
            route_subdivisions: RouteSubdivisions::default(),
        }
    }

    /// Reads the configuration from the process environment.
    ///
    /// `schedule_digest` takes precedence over `SCHEDULE_FEED_DIGEST`.
    pub fn from_env(schedule_digest: Option<String>) -> Result<Self> {
        Self::from_lookup(schedule_digest, |key| std::env::var(key).ok())
    }

    /// Same as [`MatcherConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(schedule_digest: Option<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let digest = match schedule_digest.or_else(|| lookup("SCHEDULE_FEED_DIGEST")) {
            Some(d) if !d.trim().is_empty() => d.trim().to_string(),
            _ => bail!("SCHEDULE_FEED_DIGEST must be set"),
        };
        let mut cfg = Self::new(digest);

        if let Some(n) = parse_var::<usize, _>(&lookup, "MATCH_CONCURRENCY")? {
            if n == 0 {
                bail!("MATCH_CONCURRENCY must be greater than 0");
            }
            cfg.match_concurrency = n;
        }
        if let Some(sep) = lookup("TRIP_ID_SUFFIX_SEPARATOR") {
            if sep.is_empty() {
                bail!("TRIP_ID_SUFFIX_SEPARATOR must not be empty");
            }
            cfg.trip_id_suffix_separator = sep;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "STOP_TIME_UPDATES_MAX_AGE_SECONDS")? {
            cfg.stop_time_updates_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) =
            parse_var::<u64, _>(&lookup, "STOP_TIME_UPDATES_CLEAN_INTERVAL_SECONDS")?
        {
            if secs == 0 {
                bail!("STOP_TIME_UPDATES_CLEAN_INTERVAL_SECONDS must be greater than 0");
            }
            cfg.stop_time_updates_clean_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "PG_POOL_SIZE")? {
            if n == 0 {
                bail!("PG_POOL_SIZE must be greater than 0");
            }
            cfg.pg_pool_size = n;
        }
        if let Some(schema) = lookup("SCHEDULE_DB_SCHEMA") {
            cfg.schedule_db_schema = schema;
        }
        if let Some(path) = lookup("ROUTE_SUBDIVISIONS_PATH") {
            cfg.route_subdivisions = RouteSubdivisions::load(&path)?;
        }

        Ok(cfg)
    }

    /// Shortened digest used as the `schedule_feed_digest` metrics label.
    pub fn digest_label(&self) -> String {
        self.schedule_digest.chars().take(8).collect()
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = MatcherConfig::from_lookup(Some("abcdef0123456789".to_string()), |_| None)
            .unwrap();
        assert_eq!(cfg.trip_id_suffix_separator, "_");
        assert_eq!(cfg.stop_time_updates_max_age, Duration::from_secs(10800));
        assert_eq!(cfg.stop_time_updates_clean_interval, Duration::from_secs(3600));
        assert_eq!(cfg.pg_pool_size, 30);
        assert_eq!(cfg.schedule_db_schema, "public");
        assert!(cfg.match_concurrency >= 2);
        assert_eq!(cfg.route_subdivisions.get("1"), Some("A"));
        assert_eq!(cfg.digest_label(), "abcdef01");
    }

    #[test]
    fn test_digest_is_required() {
        let result = MatcherConfig::from_lookup(None, |_| None);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides() {
        let cfg = MatcherConfig::from_lookup(
            None,
            lookup_from(&[
                ("SCHEDULE_FEED_DIGEST", "deadbeef"),
                ("MATCH_CONCURRENCY", "3"),
                ("TRIP_ID_SUFFIX_SEPARATOR", "-"),
                ("STOP_TIME_UPDATES_MAX_AGE_SECONDS", "60"),
                ("PG_POOL_SIZE", "4"),
                ("SCHEDULE_DB_SCHEMA", "gtfs_abc"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.schedule_digest, "deadbeef");
        assert_eq!(cfg.match_concurrency, 3);
        assert_eq!(cfg.trip_id_suffix_separator, "-");
        assert_eq!(cfg.stop_time_updates_max_age, Duration::from_secs(60));
        assert_eq!(cfg.pg_pool_size, 4);
        assert_eq!(cfg.schedule_db_schema, "gtfs_abc");
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let result = MatcherConfig::from_lookup(
            Some("d".to_string()),
            lookup_from(&[("MATCH_CONCURRENCY", "many")]),
        );
        assert!(result.is_err());

        let result = MatcherConfig::from_lookup(
            Some("d".to_string()),
            lookup_from(&[("MATCH_CONCURRENCY", "0")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_route_subdivisions() {
        let path = format!(
            "{}/gtfs_rt_matcher_test_subdivisions.json",
            env::temp_dir().display()
        );
        fs::write(&path, r#"{"1": "A", "7": "B"}"#).unwrap();

        let table = RouteSubdivisions::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("7"), Some("B"));
        assert_eq!(table.get("L"), None);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_route_subdivisions_missing_file() {
        assert!(RouteSubdivisions::load("/nonexistent/subdivisions.json").is_err());
    }
}
