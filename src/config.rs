//! Runtime Configuration
//!
//! Configuration for the stack allocator. Values can be set
//! programmatically through the builder or loaded from environment
//! variables; either way the configuration is frozen for the lifetime of
//! the process the first time any stack is created. Stacks are pooled and
//! shared across fibers, so resizing them mid-flight is not supported.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FILAMENT_STACK_SIZE` | User fiber stack size in bytes | 131072 (128KB) |
//! | `FILAMENT_STACK_GUARD_PAGE` | Allocate a guard page below each stack ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use filament_runtime::config::StackConfig;
//!
//! let config = StackConfig::builder()
//!     .stack_size(1024 * 1024)
//!     .guard_page(true)
//!     .build()?;
//! filament_runtime::config::install(config)?;
//! ```

use std::env;
use std::sync::OnceLock;

/// Default user stack size: 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Size of system fiber stacks. Not configurable; system fibers run only
/// runtime-internal code with known stack depth.
pub const SYSTEM_STACK_SIZE: usize = 16 * 1024;

/// Stack allocation configuration.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// User fiber stack size in bytes. Must be a multiple of the system
    /// page size.
    /// Default: 128 KiB.
    pub stack_size: usize,

    /// Whether to place an inaccessible guard page immediately below each
    /// user stack. Costs one extra VMA per pooled stack; overflow then
    /// faults instead of corrupting adjacent memory.
    /// Default: true.
    pub guard_page: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            guard_page: true,
        }
    }
}

impl StackConfig {
    /// Create a new builder for StackConfig.
    pub fn builder() -> StackConfigBuilder {
        StackConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or unparsable fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(val) = parse_env_usize("FILAMENT_STACK_SIZE") {
            config.stack_size = val;
        }
        if let Some(val) = parse_env_bool("FILAMENT_STACK_GUARD_PAGE") {
            config.guard_page = val;
        }
        if config.validate().is_err() {
            crate::warn_once!(
                "Ignoring invalid FILAMENT_STACK_SIZE ({}); using default of {} bytes.",
                config.stack_size,
                DEFAULT_STACK_SIZE
            );
            config.stack_size = DEFAULT_STACK_SIZE;
        }
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = page_size();
        if self.stack_size == 0 || self.stack_size % page != 0 {
            return Err(ConfigError::InvalidValue {
                field: "stack_size",
                message: format!("must be a positive multiple of the page size ({})", page),
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Error message.
        message: String,
    },
    /// The configuration was already frozen by first use.
    AlreadyInstalled,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
            ConfigError::AlreadyInstalled => {
                write!(f, "stack configuration is already in use and cannot be changed")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for StackConfig.
#[derive(Debug, Clone, Default)]
pub struct StackConfigBuilder {
    config: StackConfig,
}

impl StackConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user stack size in bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = size;
        self
    }

    /// Enable or disable the guard page.
    pub fn guard_page(mut self, enabled: bool) -> Self {
        self.config.guard_page = enabled;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<StackConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

static INSTALLED: OnceLock<StackConfig> = OnceLock::new();

/// Install an explicit configuration. Fails if any stack has already been
/// created (which freezes the environment-derived configuration).
pub fn install(config: StackConfig) -> Result<(), ConfigError> {
    config.validate()?;
    INSTALLED.set(config).map_err(|_| ConfigError::AlreadyInstalled)
}

/// The process-wide stack configuration, loading from the environment on
/// first use.
pub fn stack_config() -> &'static StackConfig {
    INSTALLED.get_or_init(StackConfig::from_env)
}

/// The system page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // Safety: sysconf is always safe to call.
        let v = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if v > 0 {
            v as usize
        } else {
            4096
        }
    })
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.stack_size, 128 * 1024);
        assert!(config.guard_page);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = StackConfig::builder()
            .stack_size(page_size() * 64)
            .guard_page(false)
            .build()
            .unwrap();
        assert_eq!(config.stack_size, page_size() * 64);
        assert!(!config.guard_page);
    }

    #[test]
    fn test_builder_validation_rejects_unaligned() {
        let result = StackConfig::builder().stack_size(page_size() + 1).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_validation_rejects_zero() {
        let result = StackConfig::builder().stack_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "stack_size",
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("stack_size"));
        assert!(err.to_string().contains("must be positive"));
    }
}
