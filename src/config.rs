//! Runtime configuration read from `CREO_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value {value:?} for environment variable `{key}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

pub const MOUNTS_PATH: &str = "CREO_MOUNTS_PATH";
pub const QUOTA_MIN_ID: &str = "CREO_QUOTA_MIN_ID";
pub const SNAPSHOT_SYNC_PERIOD_SECS: &str = "CREO_SNAPSHOT_SYNC_PERIOD_SECS";
pub const DISK_PROBE_TIMEOUT_SECS: &str = "CREO_DISK_PROBE_TIMEOUT_SECS";
pub const NSENTER_PATH: &str = "CREO_NSENTER_PATH";
pub const DF_PATH: &str = "CREO_DF_PATH";
pub const DEFAULT_SHM_SIZE: &str = "CREO_DEFAULT_SHM_SIZE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Mount table in `/proc/mounts` format.
    pub mounts_path: PathBuf,
    /// Project ids are allocated above this value.
    pub quota_min_id: u32,
    pub snapshot_sync_period: Duration,
    /// Upper bound for a single in-container `df` run.
    pub disk_probe_timeout: Duration,
    pub nsenter_path: PathBuf,
    /// `df` as seen from inside the container.
    pub df_path: PathBuf,
    /// Size in bytes of a private `/dev/shm` without an explicit size.
    pub default_shm_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from("/proc/mounts"),
            quota_min_id: crate::quota::QUOTA_MIN_ID,
            snapshot_sync_period: Duration::from_secs(10),
            disk_probe_timeout: Duration::from_secs(10),
            nsenter_path: PathBuf::from("nsenter"),
            df_path: PathBuf::from("/bin/df"),
            default_shm_size: crate::spec::DEFAULT_SHM_SIZE,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if a set variable can't be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, using defaults for unset or empty keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            mounts_path: get(MOUNTS_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.mounts_path),
            quota_min_id: parse(&get, QUOTA_MIN_ID)?.unwrap_or(defaults.quota_min_id),
            snapshot_sync_period: parse_secs(&get, SNAPSHOT_SYNC_PERIOD_SECS)?
                .unwrap_or(defaults.snapshot_sync_period),
            disk_probe_timeout: parse_secs(&get, DISK_PROBE_TIMEOUT_SECS)?
                .unwrap_or(defaults.disk_probe_timeout),
            nsenter_path: get(NSENTER_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.nsenter_path),
            df_path: get(DF_PATH).map(PathBuf::from).unwrap_or(defaults.df_path),
            default_shm_size: parse(&get, DEFAULT_SHM_SIZE)?.unwrap_or(defaults.default_shm_size),
        };
        log::debug!("config: {:?}", config);
        Ok(config)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|value| {
            value.trim().parse().map_err(|err: T::Err| Error::InvalidValue {
                key,
                reason: err.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>> {
    match parse::<u64>(get, key)? {
        Some(0) => Err(Error::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be positive".to_owned(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[(DF_PATH, "  ")])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.quota_min_id, 16_777_216);
        assert_eq!(config.default_shm_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (MOUNTS_PATH, "/rootfs/proc/1/mounts"),
            (QUOTA_MIN_ID, "100"),
            (SNAPSHOT_SYNC_PERIOD_SECS, "30"),
            (DF_PATH, "/usr/bin/df"),
        ]))
        .unwrap();

        assert_eq!(config.mounts_path, PathBuf::from("/rootfs/proc/1/mounts"));
        assert_eq!(config.quota_min_id, 100);
        assert_eq!(config.snapshot_sync_period, Duration::from_secs(30));
        assert_eq!(config.disk_probe_timeout, Duration::from_secs(10));
        assert_eq!(config.df_path, PathBuf::from("/usr/bin/df"));
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            (QUOTA_MIN_ID, "-1"),
            (SNAPSHOT_SYNC_PERIOD_SECS, "0"),
            (DISK_PROBE_TIMEOUT_SECS, "10s"),
            (DEFAULT_SHM_SIZE, "64m"),
        ] {
            let err = Config::from_lookup(lookup(&[(key, value)])).unwrap_err();
            let Error::InvalidValue { key: got, .. } = err;
            assert_eq!(got, key);
        }
    }
}
