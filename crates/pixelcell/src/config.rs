//! Host configuration, read from `PIXELCELL_*` environment variables.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use cell_transcode::WorkerConfig;
use cell_transcode::config::parse_setting;
use tracing::warn;

pub const ENV_WORKERS: &str = "PIXELCELL_WORKERS";
pub const ENV_CELL_PATH: &str = "PIXELCELL_CELL_PATH";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "PIXELCELL_REQUEST_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Number of independent workers
    pub workers: usize,
    /// Directory holding the `pxc-cell-transcode` binary
    pub cell_path: Option<PathBuf>,
    /// Caller-side limit on a single request; `None` waits forever
    pub request_timeout: Option<Duration>,
    /// Passed on to every worker
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            cell_path: None,
            request_timeout: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut workers = parse_setting(&lookup, ENV_WORKERS, defaults.workers);
        if workers == 0 {
            warn!(setting = ENV_WORKERS, "worker count must be positive, using default");
            workers = defaults.workers;
        }

        let timeout_secs: u64 = parse_setting(&lookup, ENV_REQUEST_TIMEOUT_SECS, 0);

        Self {
            workers,
            cell_path: lookup(ENV_CELL_PATH)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            request_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            worker: WorkerConfig::from_lookup(&lookup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup() {
        let config = PoolConfig::from_lookup(|name| match name {
            ENV_WORKERS => Some("3".into()),
            ENV_CELL_PATH => Some("/opt/pixelcell/cells".into()),
            ENV_REQUEST_TIMEOUT_SECS => Some("12".into()),
            "PIXELCELL_MAX_FETCH_BYTES" => Some("1024".into()),
            _ => None,
        });
        assert_eq!(config.workers, 3);
        assert_eq!(config.cell_path, Some(PathBuf::from("/opt/pixelcell/cells")));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(12)));
        assert_eq!(config.worker.max_fetch_bytes, 1024);
    }

    #[test]
    fn test_zero_workers_and_timeout_fall_back() {
        let config = PoolConfig::from_lookup(|name| match name {
            ENV_WORKERS => Some("0".into()),
            ENV_REQUEST_TIMEOUT_SECS => Some("0".into()),
            _ => None,
        });
        assert_eq!(config.workers, PoolConfig::default().workers);
        assert_eq!(config.request_timeout, None);
        assert!(config.workers >= 1);
    }
}
