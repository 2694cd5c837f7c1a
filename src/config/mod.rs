//! Link and radio configuration, persisted as a TOML file alongside the
//! binary key file.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::link::ladder::FecThresholds;
use crate::radio::{Bandwidth, PhyConfig};

/// `channel_id = (link_id << 8) | radio_port` for each logical stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioPorts {
    pub video: u8,
    pub mavlink: u8,
    pub tunnel: u8,
    pub tx: u8,
}

impl Default for RadioPorts {
    fn default() -> Self {
        RadioPorts {
            video: 0,
            mavlink: 0x10,
            tunnel: 32,
            tx: 160,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub update_ms: u64,
    pub target_host: String,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            update_ms: 100,
            target_host: "10.5.0.10".to_string(),
        }
    }
}

/// Application configuration: everything needed to repeat a `run` without
/// re-specifying flags, short of the key file's contents themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper 24 bits of the channel id for every radio port on this link.
    pub link_id: u32,
    pub radio_ports: RadioPorts,
    /// Path to the binary file holding `tx_secret ‖ rx_public`.
    pub key_file: PathBuf,
    /// Monotonic session seed.
    pub epoch: u64,
    pub k: u8,
    pub n: u8,
    pub phy: PhyConfig,
    pub adaptive: AdaptiveConfig,
    pub fec_thresholds: FecThresholds,
    pub tx_power: u8,
    pub rcv_buf: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            link_id: 1,
            radio_ports: RadioPorts::default(),
            key_file: PathBuf::from("wfb.key"),
            epoch: 0,
            k: 1,
            n: 5,
            phy: PhyConfig::default(),
            adaptive: AdaptiveConfig::default(),
            fec_thresholds: FecThresholds::default(),
            tx_power: 30,
            rcv_buf: 1 << 20,
        }
    }
}

impl Config {
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("rs", "wfb-groundstation", "wfb-groundstation")
            .context("could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).context("failed to read config file")?;
        toml::from_str(&content).context("failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("failed to create config directory")?;
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(&path, content).context("failed to write config file")?;
        Ok(())
    }

    /// `k <= n` and both within `1..=255`, per the FEC data model invariant.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.k >= 1, "k must be at least 1");
        anyhow::ensure!(self.k <= self.n, "k ({}) must not exceed n ({})", self.k, self.n);
        Ok(())
    }

    pub fn channel_id(&self, radio_port: u8) -> u32 {
        crate::dispatch::channel_id(self.link_id, radio_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn invalid_k_greater_than_n_is_rejected() {
        let mut c = Config::default();
        c.k = 10;
        c.n = 5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let c = Config::default();
        let toml_str = toml::to_string_pretty(&c).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.link_id, c.link_id);
        assert_eq!(parsed.k, c.k);
        assert_eq!(parsed.n, c.n);
    }

    #[test]
    fn bandwidth_serializes_by_variant_name() {
        let mut c = Config::default();
        c.phy.bandwidth = Bandwidth::Bw80;
        let toml_str = toml::to_string_pretty(&c).unwrap();
        assert!(toml_str.contains("Bw80"));
    }
}
