//! Daemon configuration, loaded from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the state store.
    pub data_dir: PathBuf,
    /// Directory of pool definition TOML files.
    pub pool_dir: PathBuf,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Grace period handed to instance teardown on lease expiry.
    #[serde(default = "default_sweep_grace")]
    pub sweep_grace_secs: u64,
    #[serde(default = "default_pool_reload")]
    pub pool_reload_secs: u64,
    pub market: MarketConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "default_true")]
    pub spot_enabled: bool,
    #[serde(default = "default_true")]
    pub backfill_enabled: bool,
    pub min_price: f64,
    /// Target guaranteed-tier utilization in (0, 1].
    pub max_utilization: f64,
    pub min_reserved_mb: u64,
    pub instance_mem_mb: u64,
    #[serde(default = "default_backfill_cap")]
    pub backfill_cap: usize,
    #[serde(default = "default_one")]
    pub backfill_instance_count: u32,
    #[serde(default = "default_backfill_interval")]
    pub backfill_interval_secs: u64,
    #[serde(default = "default_backfill_max_interval")]
    pub backfill_max_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}
fn default_sweep_grace() -> u64 {
    30
}
fn default_pool_reload() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_backfill_cap() -> usize {
    4
}
fn default_one() -> u32 {
    1
}
fn default_backfill_interval() -> u64 {
    120
}
fn default_backfill_max_interval() -> u64 {
    3600
}

pub fn load_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: DaemonConfig = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    if !(0.0..=1.0).contains(&config.market.max_utilization) || config.market.max_utilization == 0.0
    {
        anyhow::bail!("market.max_utilization must be in (0, 1]");
    }
    if config.market.instance_mem_mb == 0 {
        anyhow::bail!("market.instance_mem_mb must be positive");
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config(
            r#"
data_dir = "/var/lib/leasegrid"
pool_dir = "/etc/leasegrid/pools"

[market]
min_price = 0.05
max_utilization = 0.8
min_reserved_mb = 1024
instance_mem_mb = 512
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.pool_reload_secs, 300);
        assert!(config.market.spot_enabled);
        assert_eq!(config.market.backfill_cap, 4);
        assert_eq!(config.market.backfill_max_interval_secs, 3600);
    }

    #[test]
    fn bad_utilization_is_rejected() {
        let file = write_config(
            r#"
data_dir = "/tmp/a"
pool_dir = "/tmp/b"

[market]
min_price = 0.05
max_utilization = 1.5
min_reserved_mb = 0
instance_mem_mb = 512
"#,
        );
        assert!(load_config(file.path()).is_err());
    }
}
