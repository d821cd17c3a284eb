//! Configuration for hubd

use clap::Parser;
use spn_net::NetConfig;
use std::net::SocketAddr;

/// hubd - SPN hub daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "hubd")]
#[command(about = "SPN hub daemon")]
pub struct Config {
    /// Listen address for incoming cranes
    #[arg(short, long, default_value = "0.0.0.0:7017")]
    pub listen: SocketAddr,

    /// Bootstrap hubs (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Name announced for this hub
    #[arg(long, env = "SPN_HUB_NAME")]
    pub name: String,

    /// Relay terminals for other hubs
    #[arg(long)]
    pub public: bool,

    /// Exchange key rotation interval in seconds
    #[arg(long, default_value = "86400")]
    pub key_rotation_secs: u64,

    /// Lane measurement interval in seconds
    #[arg(long, default_value = "600")]
    pub measure_interval_secs: u64,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Hub name cannot be empty");
        }
        if self.key_rotation_secs == 0 || self.measure_interval_secs == 0 {
            anyhow::bail!("Intervals must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {}", self.log_format);
        }
        Ok(())
    }

    /// Network settings derived from the flags.
    pub fn net_config(&self) -> NetConfig {
        if self.public {
            NetConfig::public()
        } else {
            NetConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_list() {
        let config = Config::try_parse_from([
            "hubd",
            "--name",
            "alpha",
            "--bootstrap",
            "127.0.0.1:1700,127.0.0.1:1701",
            "--public",
        ])
        .unwrap();
        assert_eq!(config.bootstrap.len(), 2);
        assert!(config.net_config().public_hub);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let config = Config::try_parse_from(["hubd", "--name", " "]).unwrap();
        assert!(config.validate().is_err());
    }
}
