//! Configuration types.

use crate::batcher::BatchConfig;
use crate::error::PoolError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default number of workers.
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Default execution time limit in milliseconds.
pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 5000;

/// Default minimum spacing between output flushes in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 4;

/// Default maximum characters per output batch.
pub const DEFAULT_MAX_BATCH_UNITS: usize = 50;

/// Default delay before retrying a failed handle spawn, in milliseconds.
pub const DEFAULT_RESPAWN_DELAY_MS: u64 = 250;

/// Default consecutive boot failures after which a worker counts as broken.
pub const DEFAULT_MAX_BOOT_ATTEMPTS: u32 = 3;

/// Default interpreter command.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Modules guest code may not import by default.
pub const DEFAULT_BLOCKED_MODULES: &[&str] = &[
    "subprocess",
    "ctypes",
    "multiprocessing",
    "socket",
    "pty",
    "_posixsubprocess",
];

/// Root configuration structure, as read from `pyexec.toml`:
///
/// ```toml
/// [pool]
/// pool_size = 4
/// max_execution_time_ms = 2000
///
/// [process]
/// interpreter = "python3.12"
/// memory_limit_mb = 512
///
/// [logging]
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyExecConfig {
    /// Pool sizing, timing and batching
    #[serde(default)]
    pub pool: PoolConfig,
    /// Interpreter process settings
    #[serde(default)]
    pub process: ProcessConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PyExecConfig {
    /// Creates a configuration with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the pool section.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replaces the process section.
    #[must_use]
    pub fn with_process(mut self, process: ProcessConfig) -> Self {
        self.process = process;
        self
    }

    /// Replaces the logging section.
    #[must_use]
    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), PoolError> {
        self.pool.validate()?;
        self.process.validate()
    }
}

/// Pool sizing, timing and output batching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrently running workers (at least 1)
    pub pool_size: usize,
    /// Execution time limit per task; 0 disables it
    pub max_execution_time_ms: u64,
    /// Minimum spacing between output flushes
    pub flush_interval_ms: u64,
    /// Maximum characters per output batch (at least 1)
    pub max_batch_units: usize,
    /// Delay before retrying after a handle failed to start or boot
    pub respawn_delay_ms: u64,
    /// Consecutive boot failures after which a worker counts as broken
    pub max_boot_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            max_execution_time_ms: DEFAULT_MAX_EXECUTION_TIME_MS,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_batch_units: DEFAULT_MAX_BATCH_UNITS,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            max_boot_attempts: DEFAULT_MAX_BOOT_ATTEMPTS,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the execution time limit; 0 disables it.
    #[must_use]
    pub fn with_max_execution_time_ms(mut self, ms: u64) -> Self {
        self.max_execution_time_ms = ms;
        self
    }

    /// Sets the minimum spacing between output flushes.
    #[must_use]
    pub fn with_flush_interval_ms(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    /// Sets the maximum characters per output batch.
    #[must_use]
    pub fn with_max_batch_units(mut self, units: usize) -> Self {
        self.max_batch_units = units;
        self
    }

    /// Sets the respawn delay.
    #[must_use]
    pub fn with_respawn_delay_ms(mut self, ms: u64) -> Self {
        self.respawn_delay_ms = ms;
        self
    }

    /// Sets how many consecutive boot failures make a worker count as broken.
    #[must_use]
    pub fn with_max_boot_attempts(mut self, attempts: u32) -> Self {
        self.max_boot_attempts = attempts;
        self
    }

    /// Returns the execution time limit, or `None` when disabled.
    #[must_use]
    pub fn execution_limit(&self) -> Option<Duration> {
        (self.max_execution_time_ms > 0).then(|| Duration::from_millis(self.max_execution_time_ms))
    }

    /// Returns the respawn delay.
    #[must_use]
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    /// Returns the batching parameters handles are spawned with.
    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_batch_units: self.max_batch_units,
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `pool_size`, `max_batch_units` or
    /// `max_boot_attempts` is zero.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::invalid_config(
                "pool_size",
                "must be at least 1",
            ));
        }

        if self.max_batch_units == 0 {
            return Err(PoolError::invalid_config(
                "max_batch_units",
                "must be at least 1",
            ));
        }

        if self.max_boot_attempts == 0 {
            return Err(PoolError::invalid_config(
                "max_boot_attempts",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

/// Settings for interpreter child processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Interpreter command, looked up on `PATH` unless it contains a `/`
    pub interpreter: String,
    /// Top-level modules guest code may not import
    pub blocked_modules: Vec<String>,
    /// Address-space limit for each interpreter, in MiB
    pub memory_limit_mb: Option<u64>,
    /// CPU-seconds limit for each interpreter (`RLIMIT_CPU`).
    ///
    /// The budget is cumulative over the interpreter's whole lifetime, not per
    /// task: an interpreter that has served many programs can be killed in the
    /// middle of a short one. That program settles with `ENVIRONMENT_ERROR`
    /// and the pool replaces the interpreter with a fresh budget. Use
    /// `max_execution_time_ms` to bound a single program.
    pub cpu_time_secs: Option<u64>,
    /// Extra environment variables for the interpreter
    pub env: BTreeMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            blocked_modules: DEFAULT_BLOCKED_MODULES
                .iter()
                .map(|m| (*m).to_string())
                .collect(),
            memory_limit_mb: None,
            cpu_time_secs: None,
            env: BTreeMap::new(),
        }
    }
}

impl ProcessConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interpreter command.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Adds a module to the blocked list.
    #[must_use]
    pub fn with_blocked_module(mut self, module: impl Into<String>) -> Self {
        self.blocked_modules.push(module.into());
        self
    }

    /// Sets the address-space limit in MiB.
    #[must_use]
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    /// Sets the lifetime CPU-seconds limit of each interpreter.
    ///
    /// See [`ProcessConfig::cpu_time_secs`] for how the budget is spent.
    #[must_use]
    pub fn with_cpu_time_secs(mut self, secs: u64) -> Self {
        self.cpu_time_secs = Some(secs);
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty interpreter or a zero limit.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.interpreter.trim().is_empty() {
            return Err(PoolError::invalid_config(
                "interpreter",
                "must name an interpreter command",
            ));
        }

        if let Some(0) = self.memory_limit_mb {
            return Err(PoolError::invalid_config(
                "memory_limit_mb",
                "must be greater than zero or unset",
            ));
        }

        if let Some(0) = self.cpu_time_secs {
            return Err(PoolError::invalid_config(
                "cpu_time_secs",
                "must be greater than zero or unset",
            ));
        }

        Ok(())
    }
}
