//! Configuration management for pyexec.
//!
//! # Configuration File Format
//!
//! Configuration is stored in TOML format. The search order is:
//! 1. `./pyexec.toml` (project-local)
//! 2. `~/.config/pyexec/config.toml` (XDG config)
//!
//! Every section and field is optional:
//!
//! ```toml
//! [pool]
//! pool_size = 2
//! max_execution_time_ms = 5000   # 0 disables the limit
//! flush_interval_ms = 4
//! max_batch_units = 50
//! respawn_delay_ms = 250
//! max_boot_attempts = 3
//!
//! [process]
//! interpreter = "python3"
//! blocked_modules = ["subprocess", "ctypes", "multiprocessing", "socket", "pty", "_posixsubprocess"]
//! memory_limit_mb = 512
//! cpu_time_secs = 600
//!
//! [process.env]
//! PYTHONHASHSEED = "0"
//!
//! [logging]
//! enabled = false    # file logging
//! stderr = true
//! level = "warn"
//! ```

mod file;
mod types;

pub use file::{from_path, from_str, load, search_paths, xdg_config_dir};

pub use types::{
    PoolConfig, ProcessConfig, PyExecConfig, DEFAULT_BLOCKED_MODULES, DEFAULT_FLUSH_INTERVAL_MS,
    DEFAULT_INTERPRETER, DEFAULT_MAX_BATCH_UNITS, DEFAULT_MAX_BOOT_ATTEMPTS,
    DEFAULT_MAX_EXECUTION_TIME_MS, DEFAULT_POOL_SIZE, DEFAULT_RESPAWN_DELAY_MS,
};
