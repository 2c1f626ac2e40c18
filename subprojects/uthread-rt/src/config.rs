//! Runtime configuration.
//!
//! Limits that used to be compiled-in constants (thread capacity, stack size,
//! preemption period) are plain values here, with defaults matching the
//! classic setup: 128 threads and a 50 ms tick.

use std::{num::ParseIntError, time::Duration};

use crate::preempt::PreemptionMode;

/// Default thread capacity, including the thread that builds the runtime.
pub const DEFAULT_MAX_THREADS: usize = 128;

/// Default usable stack size of a spawned thread.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest accepted stack size.
///
/// Enough for the entry trampoline, a signal frame and a modest body.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default preemption period.
pub const DEFAULT_PREEMPT_INTERVAL: Duration = Duration::from_millis(50);

/// Environment variable: thread capacity.
pub const ENV_MAX_THREADS: &str = "UTHREAD_MAX_THREADS";
/// Environment variable: stack size in bytes.
pub const ENV_STACK_SIZE: &str = "UTHREAD_STACK_SIZE";
/// Environment variable: preemption period in milliseconds.
pub const ENV_PREEMPT_INTERVAL_MS: &str = "UTHREAD_PREEMPT_INTERVAL_MS";
/// Environment variable: `disabled`, `checkpoint` or `async`.
pub const ENV_PREEMPTION: &str = "UTHREAD_PREEMPTION";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of live logical threads, thread 0 included.
    pub max_threads: usize,

    /// Usable stack size of each spawned thread, in bytes.
    ///
    /// Rounded up to the page size when the stack is mapped.
    pub stack_size: usize,

    /// Period of the preemption timer.
    pub preempt_interval: Duration,

    /// How timer ticks turn into context switches.
    pub preemption: PreemptionMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            stack_size: DEFAULT_STACK_SIZE,
            preempt_interval: DEFAULT_PREEMPT_INTERVAL,
            preemption: PreemptionMode::default(),
        }
    }
}

impl Config {
    /// Sets the thread capacity.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the stack size.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Sets the preemption period.
    pub fn with_preempt_interval(mut self, interval: Duration) -> Self {
        self.preempt_interval = interval;
        self
    }

    /// Sets the preemption mode.
    pub fn with_preemption(mut self, mode: PreemptionMode) -> Self {
        self.preemption = mode;
        self
    }

    /// Builds a configuration from the process environment.
    ///
    /// Unset variables keep their default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// Keys are the `UTHREAD_*` names; a `None` keeps the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_THREADS) {
            config.max_threads = parse_number(ENV_MAX_THREADS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STACK_SIZE) {
            config.stack_size = parse_number(ENV_STACK_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PREEMPT_INTERVAL_MS) {
            let ms: u64 = parse_number(ENV_PREEMPT_INTERVAL_MS, &raw)?;
            config.preempt_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(ENV_PREEMPTION) {
            config.preemption = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the values can be used to build a runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads < 2 {
            return Err(ConfigError::MaxThreadsTooSmall(self.max_threads));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall(self.stack_size));
        }
        if self.preemption != PreemptionMode::Disabled && self.preempt_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    raw.trim()
        .parse()
        .map_err(|source| ConfigError::InvalidNumber { key, source })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric setting could not be parsed.
    #[error("Invalid number for {key}: {source}")]
    InvalidNumber {
        /// The offending key.
        key: &'static str,
        /// The parse failure.
        #[source]
        source: ParseIntError,
    },

    /// The capacity must leave room for at least one spawned thread.
    #[error("max_threads must be at least 2, got {0}")]
    MaxThreadsTooSmall(usize),

    /// The stack size is below [`MIN_STACK_SIZE`].
    #[error("stack_size must be at least {MIN_STACK_SIZE} bytes, got {0}")]
    StackTooSmall(usize),

    /// A timer with a zero period never fires.
    #[error("preempt_interval must be non-zero when preemption is enabled")]
    ZeroInterval,

    /// The preemption mode name is not recognized.
    #[error("Unknown preemption mode '{0}' (expected disabled, checkpoint or async)")]
    UnknownMode(String),
}
