//! Scheduler configuration
//!
//! Settings resolve in this order (highest priority first):
//!
//! 1. **Programmatic** - fields set on [`SchedulerConfig`] directly
//! 2. **Environment variables** - `STRAND_*` values applied by [`SchedulerConfig::from_env`]
//! 3. **Defaults** - [`SchedulerConfig::default()`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `STRAND_INITIAL_CAPACITY` | `usize` | `initial_capacity` |
//! | `STRAND_YIELD_BETWEEN_BATCHES` | `bool` | `yield_between_batches` |

/// Environment variable name for the running-set pre-reservation.
pub const ENV_INITIAL_CAPACITY: &str = "STRAND_INITIAL_CAPACITY";
/// Environment variable name for the between-batch yield toggle.
pub const ENV_YIELD_BETWEEN_BATCHES: &str = "STRAND_YIELD_BETWEEN_BATCHES";

/// Default number of running-set slots reserved up front
pub const DEFAULT_INITIAL_CAPACITY: usize = 1024;

/// Errors raised while reading configuration from the environment
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value found in the environment
        value: String,
        /// Human-readable description of the accepted values
        expected: &'static str,
    },
}

/// Per-scheduler tuning knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Slots reserved in the running set and the batch scratch buffer
    pub initial_capacity: usize,

    /// Whether `run_until_notask` yields the thread between batches
    pub yield_between_batches: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            yield_between_batches: true,
        }
    }
}

impl SchedulerConfig {
    /// Defaults with `STRAND_*` environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply any `STRAND_*` variables present in the environment
    ///
    /// Unset variables leave the field untouched.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_INITIAL_CAPACITY) {
            self.initial_capacity = parse_usize(ENV_INITIAL_CAPACITY, &val)?;
        }
        if let Some(val) = read_env(ENV_YIELD_BETWEEN_BATCHES) {
            self.yield_between_batches = parse_bool(ENV_YIELD_BETWEEN_BATCHES, &val)?;
        }
        Ok(())
    }

    /// Set `initial_capacity`
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set `yield_between_batches`
    pub fn with_yield_between_batches(mut self, enabled: bool) -> Self {
        self.yield_between_batches = enabled;
        self
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        var,
        value: val.to_string(),
        expected: "unsigned integer",
    })
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: val.to_string(),
            expected: "bool (true/false/1/0/yes/no/on/off)",
        }),
    }
}
