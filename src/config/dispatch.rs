//! Root configuration for the dispatch engine.

use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use super::pool::PoolConfig;
use crate::core::error::AppResult;

/// Remote agent client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Port agents listen on.
    pub port: u16,
    /// Maximum cached connections.
    pub cache_size: usize,
    /// Seconds an unused connection stays cached.
    pub cache_expire_secs: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-call timeout in milliseconds.
    pub call_timeout_ms: u64,
    /// Turn every mutating agent call into a no-op.
    pub test_mode: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 8444,
            cache_size: 2000,
            cache_expire_secs: 300,
            connect_timeout_ms: 5_000,
            call_timeout_ms: 10_000,
            test_mode: false,
        }
    }
}

impl AgentConfig {
    /// Validate agent settings.
    ///
    /// # Errors
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be greater than 0".into());
        }
        if self.cache_size == 0 {
            return Err("cache_size must be greater than 0".into());
        }
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Booking limits for one dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Candidate jobs fetched per host.
    pub job_query_max: usize,
    /// Candidate frames fetched per job.
    pub frame_query_max: usize,
    /// Frames booked from one job per pass.
    pub job_frame_dispatch_max: usize,
    /// Frames booked onto one host per pass.
    pub host_frame_dispatch_max: usize,
    /// Frames booked onto one local assignment per pass.
    pub local_frame_dispatch_max: usize,
    /// Seconds a job stays locked against concurrent booking.
    pub job_lock_expire_secs: u64,
    /// Skip remote launches; bookings are recorded only.
    pub test_mode: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            job_query_max: 20,
            frame_query_max: 10,
            job_frame_dispatch_max: 2,
            host_frame_dispatch_max: 12,
            local_frame_dispatch_max: 10,
            job_lock_expire_secs: 5,
            test_mode: false,
        }
    }
}

impl DispatcherConfig {
    /// Validate booking limits.
    ///
    /// # Errors
    /// Returns a message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("job_query_max", self.job_query_max),
            ("frame_query_max", self.frame_query_max),
            ("job_frame_dispatch_max", self.job_frame_dispatch_max),
            ("host_frame_dispatch_max", self.host_frame_dispatch_max),
            ("local_frame_dispatch_max", self.local_frame_dispatch_max),
        ] {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// Persistence backend selection, passed explicitly at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEngine {
    /// In-process store for development and tests.
    #[default]
    InMemory,
    /// External Postgres database.
    Postgres {
        /// Connection URL.
        url: String,
    },
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Booking pool.
    pub booking: PoolConfig,
    /// Kill pool.
    pub kill: PoolConfig,
    /// Management pool (dependency satisfaction, eat, launch, reparent, host admin).
    pub manage: PoolConfig,
    /// Remote agent client.
    pub agent: AgentConfig,
    /// Booking limits.
    pub dispatcher: DispatcherConfig,
    /// Persistence backend.
    pub store: StoreEngine,
    /// Interval between booking ticks in milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            booking: PoolConfig::new()
                .with_worker_count(num_cpus::get().max(2))
                .with_queue_capacity(1000),
            kill: PoolConfig::new().with_worker_count(2).with_queue_capacity(500),
            manage: PoolConfig::new().with_worker_count(4).with_queue_capacity(2000),
            agent: AgentConfig::default(),
            dispatcher: DispatcherConfig::default(),
            store: StoreEngine::default(),
            tick_interval_ms: 1_000,
        }
    }
}

impl DispatchConfig {
    /// Validate every section.
    ///
    /// # Errors
    /// Returns a message naming the section and field that is invalid.
    pub fn validate(&self) -> Result<(), String> {
        for (name, pool) in [("booking", &self.booking), ("kill", &self.kill), ("manage", &self.manage)] {
            pool.validate().map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        self.agent.validate().map_err(|e| format!("agent invalid: {e}"))?;
        self.dispatcher
            .validate()
            .map_err(|e| format!("dispatcher invalid: {e}"))?;
        if let StoreEngine::Postgres { url } = &self.store {
            if url.is_empty() {
                return Err("store invalid: postgres url must not be empty".into());
            }
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `DISPATCH_*` environment variables, loading
    /// a `.env` file first when present. Unset variables keep defaults.
    ///
    /// # Errors
    /// Fails when a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();

        cfg.booking.worker_count = env_or("DISPATCH_BOOKING_THREADS", cfg.booking.worker_count)?;
        cfg.booking.queue_capacity = env_or("DISPATCH_BOOKING_QUEUE", cfg.booking.queue_capacity)?;
        cfg.kill.worker_count = env_or("DISPATCH_KILL_THREADS", cfg.kill.worker_count)?;
        cfg.kill.queue_capacity = env_or("DISPATCH_KILL_QUEUE", cfg.kill.queue_capacity)?;
        cfg.manage.worker_count = env_or("DISPATCH_MANAGE_THREADS", cfg.manage.worker_count)?;
        cfg.manage.queue_capacity = env_or("DISPATCH_MANAGE_QUEUE", cfg.manage.queue_capacity)?;

        cfg.agent.port = env_or("DISPATCH_AGENT_PORT", cfg.agent.port)?;
        cfg.agent.cache_size = env_or("DISPATCH_AGENT_CACHE_SIZE", cfg.agent.cache_size)?;
        cfg.agent.cache_expire_secs = env_or("DISPATCH_AGENT_CACHE_EXPIRE_SECS", cfg.agent.cache_expire_secs)?;
        cfg.agent.call_timeout_ms = env_or("DISPATCH_AGENT_CALL_TIMEOUT_MS", cfg.agent.call_timeout_ms)?;

        let test_mode = env_or("DISPATCH_TEST_MODE", false)?;
        cfg.agent.test_mode = test_mode;
        cfg.dispatcher.test_mode = test_mode;

        cfg.tick_interval_ms = env_or("DISPATCH_TICK_INTERVAL_MS", cfg.tick_interval_ms)?;
        if let Ok(url) = env::var("DISPATCH_STORE_URL") {
            cfg.store = StoreEngine::Postgres { url };
        }

        cfg.validate().map_err(|e| anyhow!(e))?;
        Ok(cfg)
    }
}

fn env_or<T>(key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value `{raw}` for {key}")),
        Err(_) => Ok(default),
    }
}
