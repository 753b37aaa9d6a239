//! Configuration Module
//!
//! Handles loading and validating cache and worker configuration from environment variables.

use std::env;

use crate::error::{CacheError, Result};

/// Upper bound on the number of store lock shards.
pub const MAX_LOCK_SHARDS: u32 = 64;

const MIB: u64 = 1024 * 1024;

/// Cache and worker configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// POSIX shared memory name the workers attach to
    pub shm_name: String,
    /// Arena data size in bytes
    pub shm_size: u64,
    /// Number of independently locked arena segments
    pub shm_segments: u32,
    /// Sizing hint for the bucket array
    pub entries_hint: usize,
    /// TTL in seconds applied when a store passes ttl 0 (0 = never expire)
    pub default_ttl: u32,
    /// Seconds a deleted entry may stay referenced before it is force-freed
    pub gc_ttl: u32,
    /// Finds take the exclusive lock instead of the shared one
    pub write_lock: bool,
    /// Suppress concurrent rebuilds of a recently missing key
    pub slam_defense: bool,
    /// Slam defense guard window in milliseconds
    pub slam_window_ms: u64,
    /// Number of store lock shards (1 = single global lock)
    pub lock_shards: u32,
    /// Longest wait for a shared lock before its holder is presumed dead
    pub lock_timeout_ms: u64,
    /// Use the request start time for TTL accounting
    pub use_request_time: bool,
    /// Name of the serializer used for composite values
    pub serializer: String,
    /// Keep arena data pages read-only outside mutations
    pub protect_memory: bool,
    /// HTTP server port
    pub server_port: u16,
    /// Scheduled GC interval in seconds
    pub gc_interval: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SHM_NAME` - shared memory name (default: /shmcache)
    /// - `SHM_SIZE` - arena size, K/M/G suffixes accepted (default: 32M)
    /// - `SHM_SEGMENTS` - segment count (default: 1)
    /// - `ENTRIES_HINT` - bucket sizing hint (default: 4096)
    /// - `DEFAULT_TTL` - default TTL in seconds (default: 0)
    /// - `GC_TTL` - deferred free grace period in seconds (default: 3600)
    /// - `WRITE_LOCK` - exclusive lock for reads (default: true)
    /// - `SLAM_DEFENSE` - slam defense toggle (default: true)
    /// - `SLAM_WINDOW_MS` - slam guard window (default: 1000)
    /// - `LOCK_SHARDS` - store lock shards (default: 1)
    /// - `LOCK_TIMEOUT_MS` - shared lock wait limit (default: 10000)
    /// - `USE_REQUEST_TIME` - per-request clock (default: true)
    /// - `SERIALIZER` - serializer name (default: default)
    /// - `PROTECT_MEMORY` - mprotect arena pages (default: false)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `GC_INTERVAL` - GC frequency in seconds (default: 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shm_name: env::var("SHM_NAME").unwrap_or(defaults.shm_name),
            shm_size: env::var("SHM_SIZE")
                .ok()
                .and_then(|v| parse_size(&v))
                .unwrap_or(defaults.shm_size),
            shm_segments: env_parse("SHM_SEGMENTS").unwrap_or(defaults.shm_segments),
            entries_hint: env_parse("ENTRIES_HINT").unwrap_or(defaults.entries_hint),
            default_ttl: env_parse("DEFAULT_TTL").unwrap_or(defaults.default_ttl),
            gc_ttl: env_parse("GC_TTL").unwrap_or(defaults.gc_ttl),
            write_lock: env_flag("WRITE_LOCK").unwrap_or(defaults.write_lock),
            slam_defense: env_flag("SLAM_DEFENSE").unwrap_or(defaults.slam_defense),
            slam_window_ms: env_parse("SLAM_WINDOW_MS").unwrap_or(defaults.slam_window_ms),
            lock_shards: env_parse("LOCK_SHARDS").unwrap_or(defaults.lock_shards),
            lock_timeout_ms: env_parse("LOCK_TIMEOUT_MS").unwrap_or(defaults.lock_timeout_ms),
            use_request_time: env_flag("USE_REQUEST_TIME").unwrap_or(defaults.use_request_time),
            serializer: env::var("SERIALIZER").unwrap_or(defaults.serializer),
            protect_memory: env_flag("PROTECT_MEMORY").unwrap_or(defaults.protect_memory),
            server_port: env_parse("SERVER_PORT").unwrap_or(defaults.server_port),
            gc_interval: env_parse("GC_INTERVAL").unwrap_or(defaults.gc_interval),
        }
    }

    /// Checks the values that would otherwise fail deep inside arena setup.
    pub fn validate(&self) -> Result<()> {
        if self.shm_size == 0 {
            return Err(CacheError::Config("shm_size must be greater than 0".into()));
        }
        if self.shm_segments == 0 {
            return Err(CacheError::Config("shm_segments must be at least 1".into()));
        }
        if self.lock_shards == 0 || self.lock_shards > MAX_LOCK_SHARDS {
            return Err(CacheError::Config(format!(
                "lock_shards must be between 1 and {}",
                MAX_LOCK_SHARDS
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(CacheError::Config("lock_timeout_ms must be greater than 0".into()));
        }
        if self.entries_hint == 0 {
            return Err(CacheError::Config("entries_hint must be at least 1".into()));
        }
        if self.serializer.is_empty() {
            return Err(CacheError::Config("serializer name cannot be empty".into()));
        }
        if !self.shm_name.starts_with('/') || self.shm_name.len() < 2 {
            return Err(CacheError::Config(format!(
                "shm_name '{}' must start with '/'",
                self.shm_name
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_name: "/shmcache".to_string(),
            shm_size: 32 * MIB,
            shm_segments: 1,
            entries_hint: 4096,
            default_ttl: 0,
            gc_ttl: 3600,
            write_lock: true,
            slam_defense: true,
            slam_window_ms: 1000,
            lock_shards: 1,
            lock_timeout_ms: 10_000,
            use_request_time: true,
            serializer: "default".to_string(),
            protect_memory: false,
            server_port: 3000,
            gc_interval: 1,
        }
    }
}

/// Parses a memory size with an optional K/M/G suffix.
///
/// Bare numbers below one MiB are read as a count of MiB, so `"32"` and
/// `"32M"` mean the same thing.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last()? {
        'k' | 'K' => (&raw[..raw.len() - 1], 1024),
        'm' | 'M' => (&raw[..raw.len() - 1], MIB),
        'g' | 'G' => (&raw[..raw.len() - 1], 1024 * MIB),
        _ => (raw, 1),
    };
    let value: u64 = digits.trim().parse().ok()?;
    if value == 0 {
        return None;
    }
    let bytes = value.checked_mul(multiplier)?;
    if multiplier == 1 && bytes < MIB {
        return bytes.checked_mul(MIB);
    }
    Some(bytes)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.shm_size, 32 * MIB);
        assert_eq!(config.shm_segments, 1);
        assert_eq!(config.default_ttl, 0);
        assert_eq!(config.gc_ttl, 3600);
        assert!(config.write_lock);
        assert!(config.slam_defense);
        assert_eq!(config.server_port, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        env::remove_var("SHM_SIZE");
        env::remove_var("SHM_SEGMENTS");
        env::remove_var("GC_TTL");
        env::remove_var("SERVER_PORT");

        let config = Config::from_env();
        assert_eq!(config.shm_size, 32 * MIB);
        assert_eq!(config.shm_segments, 1);
        assert_eq!(config.gc_ttl, 3600);
        assert_eq!(config.server_port, 3000);
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("64K"), Some(64 * 1024));
        assert_eq!(parse_size("32M"), Some(32 * MIB));
        assert_eq!(parse_size("1g"), Some(1024 * MIB));
        assert_eq!(parse_size("2097152"), Some(2 * MIB));
    }

    #[test]
    fn test_parse_size_legacy_megabytes() {
        // old style: a bare small number is a MiB count
        assert_eq!(parse_size("32"), Some(32 * MIB));
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("0"), None);
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("-5M"), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            lock_shards: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = Config {
            lock_shards: MAX_LOCK_SHARDS + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            shm_name: "noslash".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            lock_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
