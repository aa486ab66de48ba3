//! Process configuration read from the environment.

use crate::application::worker::{MAX_BATCH_SIZE, WorkerSettings};
use crate::domain::context::Operator;
use crate::domain::job::RetryPolicy;
use crate::error::{PaymentError, Result};
use chrono::Duration;
use std::fmt;
use std::net::SocketAddr;

pub const ENV_INTERNAL_API_SECRET: &str = "INTERNAL_API_SECRET";
pub const ENV_BIND_ADDR: &str = "PAYRAIL_BIND_ADDR";
pub const ENV_WORKER_BATCH_SIZE: &str = "PAYRAIL_WORKER_BATCH_SIZE";
pub const ENV_WORKER_PARALLEL_ORGS: &str = "PAYRAIL_WORKER_PARALLEL_ORGS";
pub const ENV_MAX_ATTEMPTS: &str = "PAYRAIL_MAX_ATTEMPTS";
pub const ENV_VISIBILITY_TIMEOUT_SECS: &str = "PAYRAIL_VISIBILITY_TIMEOUT_SECS";
pub const ENV_BACKOFF_BASE_SECS: &str = "PAYRAIL_BACKOFF_BASE_SECS";
pub const ENV_BACKOFF_MAX_SECS: &str = "PAYRAIL_BACKOFF_MAX_SECS";
pub const ENV_DETECTOR_BATCH_LIMIT: &str = "PAYRAIL_DETECTOR_BATCH_LIMIT";
pub const ENV_DETECTOR_GRACE_SECS: &str = "PAYRAIL_DETECTOR_GRACE_SECS";
pub const ENV_MAX_PAYLOAD_BYTES: &str = "PAYRAIL_MAX_PAYLOAD_BYTES";
pub const ENV_OPERATOR_TOKENS: &str = "PAYRAIL_OPERATOR_TOKENS";
pub const ENV_REQUIRE_AUDIT: &str = "PAYRAIL_REQUIRE_AUDIT";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_BATCH_SIZE: u64 = 25;
const DEFAULT_PARALLEL_ORGS: u64 = 4;
const DEFAULT_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 300;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 30;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 3600;
const DEFAULT_DETECTOR_BATCH_LIMIT: u64 = 500;
const DEFAULT_DETECTOR_GRACE_SECS: u64 = 900;
const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct Config {
    pub internal_api_secret: String,
    pub bind_addr: SocketAddr,
    pub worker: WorkerSettings,
    pub detector_batch_limit: usize,
    pub detector_grace: Duration,
    pub max_payload_bytes: usize,
    /// Bearer token and operator pairs for `/ops/*`.
    pub operators: Vec<(String, Operator)>,
    pub require_audit: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("internal_api_secret", &"<redacted>")
            .field("bind_addr", &self.bind_addr)
            .field("worker", &self.worker)
            .field("detector_batch_limit", &self.detector_batch_limit)
            .field("detector_grace", &self.detector_grace)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("operators", &self.operators.len())
            .field("require_audit", &self.require_audit)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// `Configuration` when the internal secret is missing or blank, or when
    /// a value does not parse.
    pub fn from_lookup<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let internal_api_secret = get_env(ENV_INTERNAL_API_SECRET)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PaymentError::Configuration(format!("{ENV_INTERNAL_API_SECRET} must be set"))
            })?;

        let bind_raw = get_env(ENV_BIND_ADDR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.trim().parse().map_err(|_| {
            PaymentError::Configuration(format!("{ENV_BIND_ADDR} is not a socket address: '{bind_raw}'"))
        })?;

        let batch_size = positive(&get_env, ENV_WORKER_BATCH_SIZE, DEFAULT_BATCH_SIZE)?;
        let policy = RetryPolicy {
            max_attempts: u32::try_from(positive(&get_env, ENV_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS)?)
                .map_err(|_| out_of_range(ENV_MAX_ATTEMPTS))?,
            visibility_timeout: seconds(
                &get_env,
                ENV_VISIBILITY_TIMEOUT_SECS,
                DEFAULT_VISIBILITY_TIMEOUT_SECS,
            )?,
            backoff_base: seconds(&get_env, ENV_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_BASE_SECS)?,
            backoff_max: seconds(&get_env, ENV_BACKOFF_MAX_SECS, DEFAULT_BACKOFF_MAX_SECS)?,
        };
        let worker = WorkerSettings {
            batch_size: to_usize(batch_size, ENV_WORKER_BATCH_SIZE)?.min(MAX_BATCH_SIZE),
            parallel_orgs: to_usize(
                positive(&get_env, ENV_WORKER_PARALLEL_ORGS, DEFAULT_PARALLEL_ORGS)?,
                ENV_WORKER_PARALLEL_ORGS,
            )?,
            policy,
        };

        let operators = match get_env(ENV_OPERATOR_TOKENS) {
            Some(raw) => parse_operator_tokens(&raw)?,
            None => Vec::new(),
        };
        let require_audit = match get_env(ENV_REQUIRE_AUDIT) {
            Some(raw) => parse_bool(ENV_REQUIRE_AUDIT, &raw)?,
            None => false,
        };

        Ok(Self {
            internal_api_secret,
            bind_addr,
            worker,
            detector_batch_limit: to_usize(
                positive(&get_env, ENV_DETECTOR_BATCH_LIMIT, DEFAULT_DETECTOR_BATCH_LIMIT)?,
                ENV_DETECTOR_BATCH_LIMIT,
            )?,
            detector_grace: seconds(&get_env, ENV_DETECTOR_GRACE_SECS, DEFAULT_DETECTOR_GRACE_SECS)?,
            max_payload_bytes: to_usize(
                positive(&get_env, ENV_MAX_PAYLOAD_BYTES, DEFAULT_MAX_PAYLOAD_BYTES)?,
                ENV_MAX_PAYLOAD_BYTES,
            )?,
            operators,
            require_audit,
        })
    }
}

fn positive<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(PaymentError::Configuration(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
        Ok(value) => Ok(value),
    }
}

fn seconds<F>(get_env: &F, key: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = positive(get_env, key, default)?;
    let secs = i64::try_from(secs).map_err(|_| out_of_range(key))?;
    Duration::try_seconds(secs).ok_or_else(|| out_of_range(key))
}

fn to_usize(value: u64, key: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| out_of_range(key))
}

fn out_of_range(key: &str) -> PaymentError {
    PaymentError::Configuration(format!("{key} exceeds the supported range"))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(PaymentError::Configuration(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}

/// Parses `user:token:org1,org2;user2:token2:org3`.
pub fn parse_operator_tokens(raw: &str) -> Result<Vec<(String, Operator)>> {
    let mut operators = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':').map(str::trim);
        let (Some(user), Some(token), Some(orgs)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(PaymentError::Configuration(format!(
                "{ENV_OPERATOR_TOKENS} entries must look like user:token:org1,org2"
            )));
        };
        if user.is_empty() || token.is_empty() {
            return Err(PaymentError::Configuration(format!(
                "{ENV_OPERATOR_TOKENS} entry for '{user}' has an empty user or token"
            )));
        }
        let orgs = orgs.split(',').map(str::trim).filter(|o| !o.is_empty());
        operators.push((token.to_string(), Operator::new(user, orgs)));
    }
    Ok(operators)
}
