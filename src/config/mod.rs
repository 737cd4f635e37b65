pub mod structs;

use crate::error::{Result, SupervisorError};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use structs::SupervisorConfig;

/// Default base directory for config, durable store, and logs, analogous to
/// the teacher's `~/.opm`.
pub static DEFAULT_BASE_DIR: Lazy<PathBuf> = Lazy::new(|| match home::home_dir() {
    Some(home) => home.join(".opm-supervisor"),
    None => PathBuf::from(".opm-supervisor"),
});

/// Load the config from `<base_dir>/config.toml`, creating a default one on
/// first run (matching `opm`'s `config::read()` create-on-first-run shape).
pub fn read(base_dir: &Path) -> Result<SupervisorConfig> {
    let config_path = base_dir.join("config.toml");

    if !config_path.is_file() {
        std::fs::create_dir_all(base_dir)?;
        let config = SupervisorConfig::default_at(base_dir);
        write(&config_path, &config)?;
        log::info!("created default config at {}", config_path.display());
        return Ok(config);
    }

    let contents = std::fs::read_to_string(&config_path)?;
    toml::from_str(&contents).map_err(|err| SupervisorError::InvalidConfig(err.to_string()))
}

pub fn write(path: &Path, config: &SupervisorConfig) -> Result<()> {
    let contents =
        toml::to_string(config).map_err(|err| SupervisorError::InvalidConfig(err.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(())
}

impl SupervisorConfig {
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        write(&base_dir.join("config.toml"), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_creates_default_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = read(dir.path()).unwrap();
        assert!(dir.path().join("config.toml").is_file());
        assert_eq!(config.monitor.check_interval_secs, 10);
    }

    #[test]
    fn read_round_trips_an_edited_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = read(dir.path()).unwrap();
        config.monitor.check_interval_secs = 42;
        config.save(dir.path()).unwrap();

        let reloaded = read(dir.path()).unwrap();
        assert_eq!(reloaded.monitor.check_interval_secs, 42);
    }
}
