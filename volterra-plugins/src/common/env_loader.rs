//! Environment variable loading
//!
//! Overrides are read through an [`EnvLoader`] bound to a prefix, so
//! `EnvLoader::new("VOLTERRA").load_optional::<usize>("MAX_CONCURRENT_JOBS")`
//! reads `VOLTERRA_MAX_CONCURRENT_JOBS`. Values that are set but fail to parse
//! are logged and ignored rather than silently replaced by a default.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix used for every override this crate reads
pub const ENV_PREFIX: &str = "VOLTERRA";

/// Load and parse an environment variable, `None` when unset or unparsable
pub fn load_env_optional<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

/// Reads prefixed environment variables
#[derive(Debug, Clone)]
pub struct EnvLoader {
    prefix: String,
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(ENV_PREFIX)
    }
}

impl EnvLoader {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Full variable name for a suffix
    pub fn key(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }

    pub fn load_optional<T>(&self, suffix: &str) -> Option<T>
    where
        T: FromStr,
    {
        load_env_optional(&self.key(suffix))
    }

    /// A non-empty path value
    pub fn load_path(&self, suffix: &str) -> Option<PathBuf> {
        env::var_os(self.key(suffix))
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// A duration given in whole seconds
    pub fn load_duration_secs(&self, suffix: &str) -> Option<Duration> {
        self.load_optional::<u64>(suffix).map(Duration::from_secs)
    }

    /// A duration given in milliseconds
    pub fn load_duration_millis(&self, suffix: &str) -> Option<Duration> {
        self.load_optional::<u64>(suffix).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_env_optional() {
        let key = "VOLTERRA_TEST_OPTIONAL";

        env::remove_var(key);
        assert_eq!(load_env_optional::<u32>(key), None);

        env::set_var(key, " 456 ");
        assert_eq!(load_env_optional::<u32>(key), Some(456));

        env::set_var(key, "invalid");
        assert_eq!(load_env_optional::<u32>(key), None);

        env::remove_var(key);
    }

    #[test]
    #[serial]
    fn test_env_loader_prefixes_keys() {
        let loader = EnvLoader::new("VOLTERRA_TEST");
        assert_eq!(loader.key("NUMBER"), "VOLTERRA_TEST_NUMBER");

        env::set_var("VOLTERRA_TEST_NUMBER", "12");
        assert_eq!(loader.load_optional::<usize>("NUMBER"), Some(12));
        env::remove_var("VOLTERRA_TEST_NUMBER");
        assert_eq!(loader.load_optional::<usize>("NUMBER"), None);
    }

    #[test]
    #[serial]
    fn test_env_loader_durations_and_paths() {
        let loader = EnvLoader::new("VOLTERRA_TEST");

        env::set_var("VOLTERRA_TEST_SECS", "30");
        env::set_var("VOLTERRA_TEST_MS", "250");
        env::set_var("VOLTERRA_TEST_DIR", "/opt/plugins");
        env::set_var("VOLTERRA_TEST_EMPTY", "");

        assert_eq!(loader.load_duration_secs("SECS"), Some(Duration::from_secs(30)));
        assert_eq!(loader.load_duration_millis("MS"), Some(Duration::from_millis(250)));
        assert_eq!(loader.load_path("DIR"), Some(PathBuf::from("/opt/plugins")));
        assert_eq!(loader.load_path("EMPTY"), None);

        for suffix in ["SECS", "MS", "DIR", "EMPTY"] {
            env::remove_var(loader.key(suffix));
        }
    }
}
