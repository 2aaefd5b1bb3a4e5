//! Daemon configuration. Everything has a default; the TOML file is
//! optional and usually absent.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the shared region file consumers map.
    pub region_path: PathBuf,
    /// Packet transfers kept in flight per endpoint.
    pub urb_count: u32,
    /// Declare the device gone after this long without a PCM-in
    /// completion. 0 disables the watchdog.
    pub watchdog_ms: u64,
    /// Rate the device is locked to at stream start.
    pub sample_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_path: PathBuf::from(ploytec_shm::DEFAULT_REGION_PATH),
            urb_count: crate::engine::DEFAULT_URB_COUNT,
            watchdog_ms: 500,
            sample_rate: 96_000,
        }
    }
}

/// Load the config, defaulting wholesale when no path is given or the file
/// is missing. A file that exists but does not parse is a startup error.
pub fn load(path: Option<&Path>) -> Result<Config, toml::de::Error> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text),
        Err(err) => {
            log::warn!("config {} not readable ({}), using defaults", path.display(), err);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = load(None).unwrap();
        assert_eq!(config.urb_count, 2);
        assert_eq!(config.sample_rate, 96_000);
        assert_eq!(config.region_path, PathBuf::from("/dev/shm/ozzy_shared_mem"));
    }

    #[test]
    fn partial_file_overrides_partially() {
        let config: Config = toml::from_str("watchdog_ms = 2000\nurb_count = 4\n").unwrap();
        assert_eq!(config.watchdog_ms, 2000);
        assert_eq!(config.urb_count, 4);
        assert_eq!(config.sample_rate, 96_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("frames = 12\n").is_err());
    }
}
