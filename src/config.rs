use crate::error::CrackError;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WORKER_PREFETCH: u16 = 1;

fn required<F>(lookup: &F, key: &str) -> Result<String, CrackError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(CrackError::Config(format!("missing environment variable {}", key))),
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: Option<T>) -> Result<T, CrackError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = match (lookup(key), default) {
        (Some(value), _) if !value.trim().is_empty() => value,
        (_, Some(default)) => return Ok(default),
        _ => return Err(CrackError::Config(format!("missing environment variable {}", key))),
    };
    raw.trim()
        .parse()
        .map_err(|_| CrackError::Config(format!("{} has an invalid value: {}", key, raw)))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Exchange, queue and routing-key names plus connection settings shared by
/// the manager and the workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
    pub direct_exchange: String,
    pub fanout_exchange: String,
    pub task_queue: String,
    pub result_queue: String,
    pub task_routing_key: String,
    pub result_routing_key: String,
    pub stop_routing_key: String,
    pub heartbeat_interval: Duration,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, CrackError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CrackError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let heartbeat_secs: u64 = parsed(&lookup, "CRACK_HEARTBEAT_SECS", None)?;
        if heartbeat_secs == 0 {
            return Err(CrackError::Config("CRACK_HEARTBEAT_SECS must be positive".to_string()));
        }
        Ok(Self {
            url: required(&lookup, "CRACK_AMQP_URL")?,
            direct_exchange: required(&lookup, "CRACK_DIRECT_EXCHANGE")?,
            fanout_exchange: required(&lookup, "CRACK_FANOUT_EXCHANGE")?,
            task_queue: required(&lookup, "CRACK_TASK_QUEUE")?,
            result_queue: required(&lookup, "CRACK_RESULT_QUEUE")?,
            task_routing_key: required(&lookup, "CRACK_TASK_ROUTING_KEY")?,
            result_routing_key: required(&lookup, "CRACK_RESULT_ROUTING_KEY")?,
            stop_routing_key: required(&lookup, "CRACK_STOP_ROUTING_KEY")?,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub broker: BrokerConfig,
    pub database_url: String,
    pub task_timeout: Duration,
    pub confirm_timeout: Duration,
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, CrackError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CrackError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let task_timeout_secs: u64 = parsed(&lookup, "CRACK_TASK_TIMEOUT_SECS", None)?;
        if task_timeout_secs == 0 {
            return Err(CrackError::Config("CRACK_TASK_TIMEOUT_SECS must be positive".to_string()));
        }
        let confirm_timeout_secs: u64 = parsed(
            &lookup,
            "CRACK_CONFIRM_TIMEOUT_SECS",
            Some(DEFAULT_CONFIRM_TIMEOUT_SECS),
        )?;
        Ok(Self {
            broker: BrokerConfig::from_lookup(&lookup)?,
            database_url: required(&lookup, "CRACK_DATABASE_URL")?,
            task_timeout: Duration::from_secs(task_timeout_secs),
            confirm_timeout: Duration::from_secs(confirm_timeout_secs),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub progress_log_interval: u64,
    pub prefetch: u16,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, CrackError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CrackError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefetch: u16 = parsed(&lookup, "CRACK_WORKER_PREFETCH", Some(DEFAULT_WORKER_PREFETCH))?;
        Ok(Self {
            broker: BrokerConfig::from_lookup(&lookup)?,
            progress_log_interval: parsed(&lookup, "CRACK_PROGRESS_LOG_INTERVAL", None)?,
            prefetch: prefetch.max(1),
        })
    }
}
