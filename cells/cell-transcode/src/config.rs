//! Worker configuration, read from `PIXELCELL_*` environment variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const ENV_FETCH_TIMEOUT_SECS: &str = "PIXELCELL_FETCH_TIMEOUT_SECS";
pub const ENV_MAX_FETCH_BYTES: &str = "PIXELCELL_MAX_FETCH_BYTES";
pub const ENV_MAX_SURFACE_PIXELS: &str = "PIXELCELL_MAX_SURFACE_PIXELS";
pub const ENV_USER_AGENT: &str = "PIXELCELL_USER_AGENT";

/// Settings shared by every request a worker serves
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Upper bound on a single locator fetch
    pub fetch_timeout: Duration,
    /// Largest body accepted from a locator
    pub max_fetch_bytes: u64,
    /// Largest drawing surface (width * height) the encoder will allocate
    pub max_surface_pixels: u64,
    pub user_agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_fetch_bytes: 32 * 1024 * 1024,
            max_surface_pixels: 100_000_000,
            user_agent: concat!("pixelcell/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl WorkerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`, falling back to defaults
    /// for unset or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            fetch_timeout: Duration::from_secs(parse_setting(
                &lookup,
                ENV_FETCH_TIMEOUT_SECS,
                defaults.fetch_timeout.as_secs(),
            )),
            max_fetch_bytes: parse_setting(&lookup, ENV_MAX_FETCH_BYTES, defaults.max_fetch_bytes),
            max_surface_pixels: parse_setting(
                &lookup,
                ENV_MAX_SURFACE_PIXELS,
                defaults.max_surface_pixels,
            ),
            user_agent: lookup(ENV_USER_AGENT)
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or(defaults.user_agent),
        }
    }

    /// The environment that reproduces this configuration in a child process.
    pub fn to_env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_FETCH_TIMEOUT_SECS, self.fetch_timeout.as_secs().to_string()),
            (ENV_MAX_FETCH_BYTES, self.max_fetch_bytes.to_string()),
            (ENV_MAX_SURFACE_PIXELS, self.max_surface_pixels.to_string()),
            (ENV_USER_AGENT, self.user_agent.clone()),
        ]
    }
}

/// Parse one setting, keeping `default` when it is unset or invalid.
pub fn parse_setting<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            warn!(setting = name, value = %raw, error = %e, "ignoring invalid setting");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        assert_eq!(WorkerConfig::from_lookup(|_| None), WorkerConfig::default());
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            (ENV_FETCH_TIMEOUT_SECS, "5"),
            (ENV_MAX_FETCH_BYTES, "not-a-number"),
            (ENV_MAX_SURFACE_PIXELS, " 4096 "),
        ]));
        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.max_fetch_bytes, WorkerConfig::default().max_fetch_bytes);
        assert_eq!(config.max_surface_pixels, 4096);
    }

    #[test]
    fn test_env_vars_reproduce_config() {
        let config = WorkerConfig {
            fetch_timeout: Duration::from_secs(7),
            max_fetch_bytes: 1234,
            max_surface_pixels: 99,
            user_agent: "test-agent".into(),
        };
        let vars = config.to_env_vars();
        let pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        assert_eq!(WorkerConfig::from_lookup(lookup_from(&pairs)), config);
    }
}
