//! Driver configuration.
//!
//! The binary fills [`DriverConfig`] from flags and `BLOCKCSI_*` environment
//! variables; the library only consumes the validated result.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CsiError;
use crate::key::MAX_VOLUME_LABEL_PREFIX_LENGTH;
use crate::poll::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};
use crate::types::DEFAULT_DRIVER_NAME;

/// Default UNIX socket the orchestrator dials.
pub const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/blockcsi.rk8s.io/csi.sock";

/// Which services this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Identity + Controller.
    Controller,
    /// Identity + Node.
    Node,
    /// Everything, for single-process test clusters.
    #[default]
    All,
}

impl Mode {
    pub fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::All)
    }

    pub fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::All)
    }
}

impl FromStr for Mode {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            "all" => Ok(Self::All),
            other => Err(CsiError::InvalidArgument(format!(
                "unknown mode {other:?}, expected controller, node or all"
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Node => "node",
            Self::All => "all",
        })
    }
}

/// Runtime settings shared by all services.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub vendor_version: String,
    /// `unix://` endpoint to serve on.
    pub endpoint: String,
    pub api_url: String,
    pub api_token: String,
    /// Region used when a create request carries no topology.
    pub region: String,
    /// Cluster node name, matched against instance labels.
    pub node_name: String,
    /// Prepended to every remote volume label.
    pub volume_label_prefix: Option<String>,
    pub instance_id_file: Option<PathBuf>,
    pub mode: Mode,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            api_url: crate::cloud::http::DEFAULT_API_URL.to_owned(),
            api_token: String::new(),
            region: String::new(),
            node_name: String::new(),
            volume_label_prefix: None,
            instance_id_file: None,
            mode: Mode::All,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl DriverConfig {
    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<(), CsiError> {
        if self.driver_name.is_empty() {
            return Err(CsiError::invalid("driver name must not be empty"));
        }
        if !self.endpoint.starts_with("unix://") {
            return Err(CsiError::InvalidArgument(format!(
                "endpoint {:?} must use the unix:// scheme",
                self.endpoint
            )));
        }
        if self.api_token.is_empty() {
            return Err(CsiError::invalid("api token must not be empty"));
        }
        if self.mode.runs_node() && self.node_name.is_empty() && self.instance_id_file.is_none() {
            return Err(CsiError::invalid(
                "node mode needs a node name or an instance id file",
            ));
        }
        if let Some(prefix) = &self.volume_label_prefix {
            validate_label_prefix(prefix)?;
        }
        if self.poll_interval.is_zero() || self.poll_timeout < self.poll_interval {
            return Err(CsiError::invalid(
                "poll timeout must be at least one non-zero poll interval",
            ));
        }
        Ok(())
    }

    /// Label prefix, with an empty string treated as unset.
    pub fn label_prefix(&self) -> Option<&str> {
        self.volume_label_prefix.as_deref().filter(|p| !p.is_empty())
    }
}

/// Prefixes are short and use the characters the provider allows in labels.
pub fn validate_label_prefix(prefix: &str) -> Result<(), CsiError> {
    if prefix.chars().count() > MAX_VOLUME_LABEL_PREFIX_LENGTH {
        return Err(CsiError::InvalidArgument(format!(
            "volume label prefix {prefix:?} is longer than \
             {MAX_VOLUME_LABEL_PREFIX_LENGTH} characters"
        )));
    }
    if let Some(bad) = prefix
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '.'))
    {
        return Err(CsiError::InvalidArgument(format!(
            "volume label prefix {prefix:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> DriverConfig {
        DriverConfig {
            api_token: "token".into(),
            node_name: "worker-1".into(),
            region: "us-east".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_with_token_is_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn mode_parses() {
        assert_eq!("Controller".parse::<Mode>().unwrap(), Mode::Controller);
        assert_eq!("node".parse::<Mode>().unwrap(), Mode::Node);
        assert!("both".parse::<Mode>().is_err());
        assert!(Mode::All.runs_node() && Mode::All.runs_controller());
        assert!(!Mode::Controller.runs_node());
    }

    #[test]
    fn rejects_bad_settings() {
        let tcp = DriverConfig {
            endpoint: "tcp://127.0.0.1:10000".into(),
            ..valid()
        };
        assert!(tcp.validate().is_err());

        let no_token = DriverConfig {
            api_token: String::new(),
            ..valid()
        };
        assert!(no_token.validate().is_err());

        let anonymous_node = DriverConfig {
            node_name: String::new(),
            mode: Mode::Node,
            ..valid()
        };
        assert!(anonymous_node.validate().is_err());

        let controller_only = DriverConfig {
            node_name: String::new(),
            mode: Mode::Controller,
            ..valid()
        };
        controller_only.validate().unwrap();
    }

    #[test]
    fn label_prefix_rules() {
        validate_label_prefix("k8s_prod.1").unwrap();
        assert!(validate_label_prefix("thirteenchars").is_err());
        assert!(validate_label_prefix("has-dash").is_err());

        let cfg = DriverConfig {
            volume_label_prefix: Some(String::new()),
            ..valid()
        };
        assert_eq!(cfg.label_prefix(), None);
    }
}
