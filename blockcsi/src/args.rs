//! Command-line flags, each also readable from a `BLOCKCSI_*` variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use libcsi::config::{DEFAULT_ENDPOINT, DriverConfig, Mode};
use libcsi::cloud::http::DEFAULT_API_URL;
use libcsi::types::DEFAULT_DRIVER_NAME;

#[derive(Parser, Debug, Clone)]
#[command(name = "blockcsi", version, about = "CSI plugin for cloud block storage volumes")]
pub struct Args {
    /// Services to run: controller, node or all.
    #[arg(long, env = "BLOCKCSI_MODE", default_value = "all")]
    pub mode: Mode,

    /// UNIX socket the orchestrator dials.
    #[arg(long, env = "BLOCKCSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    #[arg(long, env = "BLOCKCSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    #[arg(long, env = "BLOCKCSI_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(long, env = "BLOCKCSI_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Region for volumes created without a topology requirement.
    #[arg(long, env = "BLOCKCSI_REGION", default_value = "")]
    pub region: String,

    /// Cluster node name, matched against instance labels.
    #[arg(long, env = "BLOCKCSI_NODE_NAME", default_value = "")]
    pub node_name: String,

    /// Prepended to every remote volume label (at most 12 characters).
    #[arg(long, env = "BLOCKCSI_VOLUME_LABEL_PREFIX")]
    pub volume_label_prefix: Option<String>,

    /// File holding this node's instance ID, written by the metadata agent.
    #[arg(long, env = "BLOCKCSI_INSTANCE_ID_FILE")]
    pub instance_id_file: Option<PathBuf>,

    #[arg(long, env = "BLOCKCSI_POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "BLOCKCSI_POLL_TIMEOUT_SECS", default_value_t = 300)]
    pub poll_timeout_secs: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "BLOCKCSI_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            driver_name: self.driver_name.clone(),
            endpoint: self.endpoint.clone(),
            api_url: self.api_url.clone(),
            api_token: self.api_token.clone(),
            region: self.region.clone(),
            node_name: self.node_name.clone(),
            volume_label_prefix: self.volume_label_prefix.clone(),
            instance_id_file: self.instance_id_file.clone(),
            mode: self.mode,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            ..DriverConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_driver_config() {
        let args = Args::try_parse_from([
            "blockcsi",
            "--mode",
            "node",
            "--api-token",
            "secret",
            "--node-name",
            "worker-1",
            "--volume-label-prefix",
            "k8s.",
            "--poll-interval-secs",
            "2",
        ])
        .unwrap();
        let config = args.driver_config();
        assert_eq!(config.mode, Mode::Node);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.label_prefix(), Some("k8s."));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        config.validate().unwrap();
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["blockcsi", "--mode", "both", "--api-token", "t"]).is_err());
    }
}
