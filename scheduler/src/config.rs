//! `figment`-based config loading: TOML file + env overrides, mirroring
//! the teacher's `ConfigLoader`/`make_config_loader` shape (OpenAPI-dump
//! escape hatch dropped, no HTTP admin surface per spec Non-goals).

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "scheduler".to_string(),
            username: "scheduler".to_string(),
            password: "scheduler".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: "scheduler.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DbConfig {
    Postgres(DbPostgresConfig),
    Sqlite(DbSqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

/// Registry client: a prefix-based etcd-like KV store with TTL leases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub endpoints: Vec<String>,
    pub key_prefix: String,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            key_prefix: "/scheduler/services".to_string(),
            lease_ttl: Duration::from_secs(10),
        }
    }
}

/// Schedule-loop + renew-loop cadence (spec.md §4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleLoopConfig {
    pub batch_size: i64,
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub preempted_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub schedule_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub renew_interval: Duration,
}

impl Default for ScheduleLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            preempted_timeout: Duration::from_secs(30),
            schedule_interval: Duration::from_millis(500),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Shared shape for the three compensator loops (spec.md §4.9).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompensatorLoopConfig {
    pub batch_size: i64,
    #[serde(with = "humantime_serde")]
    pub min_duration: Duration,
}

impl Default for CompensatorLoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            min_duration: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompensatorConfig {
    pub retry: CompensatorLoopConfig,
    pub reschedule: CompensatorLoopConfig,
    pub interrupt: CompensatorLoopConfig,
}

impl Default for CompensatorConfig {
    fn default() -> Self {
        Self {
            retry: CompensatorLoopConfig::default(),
            reschedule: CompensatorLoopConfig::default(),
            interrupt: CompensatorLoopConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub environment: String,
    pub grpc_port: u16,
    pub metrics_port: u16,
    pub db: DbConfig,
    pub registry: RegistryConfig,
    pub schedule: ScheduleLoopConfig,
    pub compensator: CompensatorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            grpc_port: 9199,
            metrics_port: 9899,
            db: DbConfig::default(),
            registry: RegistryConfig::default(),
            schedule: ScheduleLoopConfig::default(),
            compensator: CompensatorConfig::default(),
        }
    }
}

/// Loads `config/scheduler.toml` merged over built-in defaults, then
/// `SCHEDULER__`-prefixed env vars on top, matching the teacher's
/// file-then-env precedence.
pub fn make_config_loader() -> Figment {
    Figment::from(Serialized::defaults(SchedulerConfig::default()))
        .merge(Toml::file(PathBuf::from("config/scheduler.toml")))
        .merge(Env::prefixed("SCHEDULER__").split("__"))
}

pub fn load_config() -> Result<SchedulerConfig, figment::Error> {
    make_config_loader().extract()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_loadable() {
        let config: SchedulerConfig = load_config().expect("failed to load config");
        assert_eq!(config.grpc_port, 9199);
    }
}
