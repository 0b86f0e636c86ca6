// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of the query engine, loaded from TOML.

// Copyright 2024 Oxide Computer Company

use crate::Error;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Default timeout for a single request to ClickHouse.
pub const fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Default interval between two polls of a tailed query.
pub const fn default_tail_interval() -> Duration {
    Duration::from_secs(1)
}

/// Default capacity of the channel between two residual stages.
pub const fn default_channel_capacity() -> usize {
    16
}

fn default_url() -> String {
    String::from("http://127.0.0.1:8123")
}

fn default_database() -> String {
    String::from("qryn")
}

/// Logical tables the planners read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(test, derive(strum::EnumIter))]
pub enum Table {
    Samples,
    TimeSeries,
    TimeSeriesGin,
    Metrics15s,
    Traces,
    TracesAttrs,
    TracesKv,
    Patterns,
    MetricsMeta,
}

impl Table {
    /// The name of the table in the stock schema.
    pub fn default_name(&self) -> &'static str {
        match self {
            Table::Samples => "samples_v3",
            Table::TimeSeries => "time_series",
            Table::TimeSeriesGin => "time_series_gin",
            Table::Metrics15s => "metrics_15s",
            Table::Traces => "tempo_traces",
            Table::TracesAttrs => "tempo_traces_attrs_gin",
            Table::TracesKv => "tempo_traces_kv",
            Table::Patterns => "patterns",
            Table::MetricsMeta => "metrics_meta",
        }
    }
}

/// Physical table names, resolved once per process from the configuration.
///
/// Each logical table has a local name and a distributed name. Outside of
/// cluster mode the two are the same.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableNames {
    local: BTreeMap<Table, String>,
    dist: BTreeMap<Table, String>,
}

impl TableNames {
    /// Resolve table names, applying `overrides` (keyed by the default
    /// name) and, when `cluster` is set, the `_dist` suffix.
    pub fn resolve(
        database: &str,
        cluster: bool,
        overrides: &BTreeMap<String, String>,
    ) -> Self {
        let mut local = BTreeMap::new();
        let mut dist = BTreeMap::new();
        for table in ALL_TABLES {
            let default = table.default_name();
            let name = overrides
                .get(default)
                .cloned()
                .unwrap_or_else(|| default.to_string());
            let dist_name = if cluster {
                format!("`{}`.{}_dist", database, name)
            } else {
                name.clone()
            };
            local.insert(table, name);
            dist.insert(table, dist_name);
        }
        Self { local, dist }
    }

    pub fn local(&self, table: Table) -> &str {
        self.local
            .get(&table)
            .map(String::as_str)
            .unwrap_or_else(|| table.default_name())
    }

    pub fn dist(&self, table: Table) -> &str {
        self.dist
            .get(&table)
            .map(String::as_str)
            .unwrap_or_else(|| table.default_name())
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::resolve("", false, &BTreeMap::new())
    }
}

const ALL_TABLES: [Table; 9] = [
    Table::Samples,
    Table::TimeSeries,
    Table::TimeSeriesGin,
    Table::Metrics15s,
    Table::Traces,
    Table::TracesAttrs,
    Table::TracesKv,
    Table::Patterns,
    Table::MetricsMeta,
];

/// Connection details for ClickHouse.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DbConfig {
    /// Base URL of the ClickHouse HTTP interface.
    #[serde(default = "default_url")]
    pub url: String,

    /// Database holding the tables.
    #[serde(default = "default_database")]
    pub database: String,

    /// Name of the ClickHouse cluster. Empty for a single node.
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default = "default_request_timeout", with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            database: default_database(),
            cluster_name: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Configuration of the query engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,

    /// Capacity of the bounded channels between residual stages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Interval between two polls of a tailed query, in seconds.
    #[serde(default = "default_tail_interval", with = "duration_secs")]
    pub tail_interval: Duration,

    /// Physical table names, keyed by the stock table name they replace.
    #[serde(default)]
    pub tables: BTreeMap<String, String>,

    /// Schema features and the time, in nanoseconds since the epoch, from
    /// which data written with each feature is available.
    #[serde(default)]
    pub features: BTreeMap<String, i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            channel_capacity: default_channel_capacity(),
            tail_interval: default_tail_interval(),
            tables: BTreeMap::new(),
            features: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| Error::Config(e.to_string()))?;
        if config.channel_capacity == 0 {
            return Err(Error::Config(String::from(
                "channel_capacity must be greater than zero",
            )));
        }
        Ok(config)
    }

    pub fn is_cluster(&self) -> bool {
        !self.db.cluster_name.is_empty()
    }

    pub fn table_names(&self) -> TableNames {
        TableNames::resolve(&self.db.database, self.is_cluster(), &self.tables)
    }
}

// Durations are written as a number of seconds, which may be fractional.
mod duration_secs {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use strum::IntoEnumIterator;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.db.database, "qryn");
        assert_eq!(config.channel_capacity, default_channel_capacity());
        assert_eq!(config.tail_interval, Duration::from_secs(1));
        assert!(!config.is_cluster());
        let tables = config.table_names();
        assert_eq!(tables.local(Table::Samples), "samples_v3");
        assert_eq!(tables.dist(Table::Samples), "samples_v3");
    }

    #[test]
    fn test_cluster_and_overrides() {
        let config = Config::from_toml(
            r#"
            tail_interval = 0.5
            [db]
            database = "logs"
            cluster_name = "main"
            [tables]
            samples_v3 = "samples_v4"
            "#,
        )
        .unwrap();
        assert!(config.is_cluster());
        assert_eq!(config.tail_interval, Duration::from_millis(500));
        let tables = config.table_names();
        assert_eq!(tables.local(Table::Samples), "samples_v4");
        assert_eq!(tables.dist(Table::Samples), "`logs`.samples_v4_dist");
        assert_eq!(tables.dist(Table::TimeSeries), "`logs`.time_series_dist");
    }

    #[test]
    fn test_every_table_resolves() {
        let tables = TableNames::default();
        for table in Table::iter() {
            assert_eq!(tables.local(table), table.default_name());
        }
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            Config::from_toml("channel_capacity = 0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[features]\nv3_2 = 1000").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.features.get("v3_2"), Some(&1000));
        assert!(matches!(
            Config::from_file("/nonexistent/config.toml"),
            Err(Error::Config(_))
        ));
    }
}
