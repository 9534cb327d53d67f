// package-restore/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::store::DescendantTraversal;

// Structs for deserializing config.json. Every field is optional; environment
// variables fill in or override what the file leaves out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonPostgresConfig {
    pub database_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub sslmode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonAwsConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRetryOptions {
    pub base_delay_ms: Option<u64>,
    pub max_jitter_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWorkerOptions {
    pub max_messages: Option<i32>,
    pub wait_time_seconds: Option<i32>,
    pub visibility_timeout_seconds: Option<i32>,
    pub concurrency: Option<usize>,
    pub exit_when_idle: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub postgres: Option<JsonPostgresConfig>,
    pub aws: Option<JsonAwsConfig>,
    pub delete_record_table: Option<String>,
    pub restore_queue: Option<String>,
    pub changelog_queue_url: Option<String>,
    pub descendant_traversal: Option<String>,
    pub retry: Option<JsonRetryOptions>,
    pub worker: Option<JsonWorkerOptions>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    url: Url,
}

impl PostgresConfig {
    pub fn connection_url(&self) -> &str {
        self.url.as_str()
    }

    /// The connection URL with the password masked, for logs.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        if url.password().is_some() {
            let _ = url.set_password(Some("****"));
        }
        url.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AwsSettings {
    pub region: Option<String>,
    /// Overrides the service endpoints, e.g. for a local stack.
    pub endpoint_url: Option<String>,
}

impl AwsSettings {
    /// Shared SDK configuration every AWS client is built from.
    pub async fn load_sdk_config(&self) -> aws_config::SdkConfig {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &self.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint_url) = &self.endpoint_url {
            tracing::info!(endpoint_url = %endpoint_url, "overriding AWS endpoints");
            loader = loader.endpoint_url(endpoint_url);
        }
        loader.load().await
    }
}

/// Backoff for provider batch calls that report unprocessed items.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(1000),
            max_attempts: 10,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_count` (1-based): linear in the count plus jitter.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random::<u64>() % jitter_ms
        };
        self.base_delay * retry_count + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub delete_record_table: String,
    pub restore_queue: String,
    pub changelog_queue_url: Option<String>,
    pub max_messages: i32,
    pub wait_time_seconds: i32,
    pub visibility_timeout_seconds: Option<i32>,
    pub concurrency: usize,
    pub exit_when_idle: bool,
}

#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub restore_queue: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub operation: Option<OperationConfig>,
    pub postgres: PostgresConfig,
    pub aws: AwsSettings,
    pub retry: RetryConfig,
    pub traversal: DescendantTraversal,
    pub raw_json_config: RawJsonConfig,
}

#[derive(Debug, Clone)]
pub enum OperationConfig {
    Worker(WorkerConfig),
    Request(RequestConfig),
}

/// Lookup used for environment overrides; injected so tests do not touch the process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Reads `config_path` when it exists, otherwise configures from the environment alone.
    pub fn load_from_json(config_path: &Path, env: EnvLookup<'_>) -> Result<Self> {
        let raw_json_config: RawJsonConfig = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            serde_json::from_str(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            tracing::info!(
                "no config file at {}, using environment only",
                config_path.display()
            );
            RawJsonConfig::default()
        };
        Self::from_raw(raw_json_config, env)
    }

    pub fn from_raw(raw_json_config: RawJsonConfig, env: EnvLookup<'_>) -> Result<Self> {
        let postgres = postgres_config(
            raw_json_config.postgres.clone().unwrap_or_default(),
            env,
        )?;

        let aws_raw = raw_json_config.aws.clone().unwrap_or_default();
        let aws = AwsSettings {
            region: env("REGION").or(aws_raw.region),
            endpoint_url: env("AWS_ENDPOINT_URL").or(aws_raw.endpoint_url),
        };

        let retry_raw = raw_json_config.retry.clone().unwrap_or_default();
        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            base_delay: retry_raw
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_jitter: retry_raw
                .max_jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_jitter),
            max_attempts: retry_raw.max_attempts.unwrap_or(defaults.max_attempts),
        };

        let traversal = match env("RESTORE_DESCENDANT_TRAVERSAL")
            .or_else(|| raw_json_config.descendant_traversal.clone())
        {
            Some(value) => value
                .parse::<DescendantTraversal>()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid descendant_traversal")?,
            None => DescendantTraversal::default(),
        };

        Ok(AppConfig {
            operation: None, // To be filled by main after parsing CLI args
            postgres,
            aws,
            retry,
            traversal,
            raw_json_config,
        })
    }
}

fn postgres_config(raw: JsonPostgresConfig, env: EnvLookup<'_>) -> Result<PostgresConfig> {
    if let Some(database_url) = env("DATABASE_URL").or(raw.database_url) {
        let url = Url::parse(&database_url).context("Invalid database_url")?;
        return Ok(PostgresConfig { url });
    }

    let host = env("POSTGRES_HOST").or(raw.host).unwrap_or_else(|| "localhost".into());
    let port = match env("POSTGRES_PORT") {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("parsing POSTGRES_PORT value `{}`", value))?,
        None => raw.port.unwrap_or(5432),
    };
    let user = env("POSTGRES_USER").or(raw.user).unwrap_or_else(|| "postgres".into());
    let password = env("POSTGRES_PASSWORD").or(raw.password);
    let dbname = env("PENNSIEVE_DB").or(raw.dbname).unwrap_or_else(|| "postgres".into());
    let sslmode = env("POSTGRES_SSL_MODE").or(raw.sslmode).unwrap_or_else(|| "disable".into());

    let mut url = Url::parse(&format!("postgres://{}:{}", host, port))
        .with_context(|| format!("Invalid postgres host `{}`", host))?;
    url.set_username(&user)
        .map_err(|_| anyhow::anyhow!("Invalid postgres user `{}`", user))?;
    url.set_password(password.as_deref())
        .map_err(|_| anyhow::anyhow!("Invalid postgres password"))?;
    url.set_path(&dbname);
    url.query_pairs_mut().append_pair("sslmode", &sslmode);
    Ok(PostgresConfig { url })
}

pub fn load_worker_config_from_json(
    raw_config: &RawJsonConfig,
    env: EnvLookup<'_>,
) -> Result<WorkerConfig> {
    let delete_record_table = env("DELETE_RECORD_DYNAMODB_TABLE_NAME")
        .or_else(|| raw_config.delete_record_table.clone())
        .context("delete_record_table (or DELETE_RECORD_DYNAMODB_TABLE_NAME) must be set for the restore worker")?;
    let restore_queue = restore_queue(raw_config, env)?;
    let changelog_queue_url = env("JOBS_QUEUE_ID").or_else(|| raw_config.changelog_queue_url.clone());
    if changelog_queue_url.is_none() {
        tracing::warn!("no changelog queue configured; restore changelog events will not be sent");
    }

    let worker = raw_config.worker.clone().unwrap_or_default();
    let concurrency = match env("RESTORE_WORKER_CONCURRENCY") {
        Some(value) => value
            .parse::<usize>()
            .with_context(|| format!("parsing RESTORE_WORKER_CONCURRENCY value `{}`", value))?,
        None => worker.concurrency.unwrap_or(4),
    };
    if concurrency == 0 {
        return Err(anyhow::anyhow!("worker concurrency must be at least 1"));
    }

    Ok(WorkerConfig {
        delete_record_table,
        restore_queue,
        changelog_queue_url,
        // SQS accepts 1..=10 messages and at most 20 seconds of long polling
        max_messages: worker.max_messages.unwrap_or(10).clamp(1, 10),
        wait_time_seconds: worker.wait_time_seconds.unwrap_or(20).clamp(0, 20),
        visibility_timeout_seconds: worker.visibility_timeout_seconds,
        concurrency,
        exit_when_idle: worker.exit_when_idle.unwrap_or(false),
    })
}

pub fn load_request_config_from_json(
    raw_config: &RawJsonConfig,
    env: EnvLookup<'_>,
) -> Result<RequestConfig> {
    Ok(RequestConfig {
        restore_queue: restore_queue(raw_config, env)?,
    })
}

fn restore_queue(raw_config: &RawJsonConfig, env: EnvLookup<'_>) -> Result<String> {
    let queue = env("RESTORE_PACKAGE_QUEUE")
        .or_else(|| raw_config.restore_queue.clone())
        .context("restore_queue (or RESTORE_PACKAGE_QUEUE) must be set")?;
    if queue.trim().is_empty() {
        return Err(anyhow::anyhow!("restore_queue cannot be empty."));
    }
    Ok(queue)
}
