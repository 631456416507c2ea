use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, optionally loaded from a TOML file and then
/// overridden by command-line flags.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
#[derive(Default)]
pub struct ExporterConfig {
    pub web: WebConfig,
    pub varnishstat: VarnishstatConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WebConfig {
    /// `host:port`, or `:port` for all interfaces.
    pub listen_address: String,
    pub telemetry_path: String,
    /// Empty disables the health endpoint.
    pub health_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct VarnishstatConfig {
    pub path: String,
    /// varnishstat -n
    pub instance: String,
    /// varnishstat -N, only honored for varnish >= 4.0
    pub vsm: String,
    /// Run varnishstat via `docker exec` in this container.
    pub docker_container: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
#[derive(Default)]
pub struct PolicyConfig {
    pub exit_on_errors: bool,
    pub serve_stale_on_error: bool,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

// --- Default implementations ---

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            // Reserved for the varnish exporter in the Prometheus default port allocations.
            listen_address: ":9131".to_string(),
            telemetry_path: "/metrics".to_string(),
            health_path: String::new(),
        }
    }
}

impl Default for VarnishstatConfig {
    fn default() -> Self {
        Self {
            path: "varnishstat".to_string(),
            instance: String::new(),
            vsm: String::new(),
            docker_container: String::new(),
            timeout_secs: 10,
        }
    }
}

impl VarnishstatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ExporterConfig {
    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<ExporterConfig, ConfigError> {
        let Some(path) = path else {
            return Ok(ExporterConfig::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let web = &self.web;
        if !web.telemetry_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "web.telemetry-path cannot be empty and must start with a slash '/', given {:?}",
                web.telemetry_path
            )));
        }
        if !web.health_path.is_empty() && !web.health_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "web.health-path must start with a slash '/' if configured, given {:?}",
                web.health_path
            )));
        }
        if web.telemetry_path == web.health_path {
            return Err(ConfigError::Invalid(
                "web.telemetry-path and web.health-path cannot have same value".to_string(),
            ));
        }
        if self.varnishstat.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "varnishstat timeout must be at least one second".to_string(),
            ));
        }
        web.check_listen_address()?;
        Ok(())
    }
}

impl WebConfig {
    /// The address handed to the listener. Host names are resolved at bind
    /// time; `:9131` binds every interface, IPv6 and IPv4.
    pub fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("[::]{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    /// Check the `host:port` shape without resolving the host.
    fn check_listen_address(&self) -> Result<(), ConfigError> {
        let invalid = || {
            ConfigError::Invalid(format!(
                "web.listen-address must be host:port or :port, given {:?}",
                self.listen_address
            ))
        };
        let (host, port) = self.listen_address.rsplit_once(':').ok_or_else(invalid)?;
        port.parse::<u16>().map_err(|_| invalid())?;
        // A bare IPv6 host needs brackets, otherwise the port is ambiguous.
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(invalid());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExporterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.web.telemetry_path, "/metrics");
        assert_eq!(config.varnishstat.path, "varnishstat");
        assert_eq!(config.web.bind_address(), "[::]:9131");
    }

    #[test]
    fn test_load_without_path_gives_defaults() {
        assert_eq!(ExporterConfig::load(None).unwrap(), ExporterConfig::default());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("varnish-exporter.toml");
        std::fs::write(
            &path,
            r#"
[web]
health_path = "/health"

[varnishstat]
instance = "edge"
vsm = "/var/lib/varnish/_.vsm"

[policy]
exit_on_errors = true
"#,
        )
        .unwrap();

        let config = ExporterConfig::load(Some(&path)).unwrap();
        assert_eq!(config.web.health_path, "/health");
        assert_eq!(config.web.telemetry_path, "/metrics");
        assert_eq!(config.varnishstat.instance, "edge");
        assert_eq!(config.varnishstat.timeout_secs, 10);
        assert!(config.policy.exit_on_errors);
        assert!(!config.policy.serve_stale_on_error);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = ExporterConfig::load(Some(Path::new("/nonexistent/exporter.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[web\nlisten_address = ").unwrap();
        let err = ExporterConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let mut config = ExporterConfig::default();
        config.web.telemetry_path = String::new();
        assert!(config.validate().is_err());

        config.web.telemetry_path = "metrics".to_string();
        assert!(config.validate().is_err());

        config.web.telemetry_path = "/metrics".to_string();
        config.web.health_path = "health".to_string();
        assert!(config.validate().is_err());

        config.web.health_path = "/metrics".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("same value"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = ExporterConfig::default();
        config.varnishstat.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listen_address_forms() {
        let mut config = ExporterConfig::default();
        for addr in ["127.0.0.1:9200", "localhost:9131", "[::1]:9131", ":9131"] {
            config.web.listen_address = addr.to_string();
            config.validate().unwrap();
        }
        config.web.listen_address = "localhost:9131".to_string();
        assert_eq!(config.web.bind_address(), "localhost:9131");

        for addr in ["not-an-address", "localhost:http", "::1:9131", "localhost:70000"] {
            config.web.listen_address = addr.to_string();
            assert!(config.validate().is_err(), "{addr} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_bind_address_accepts_host_names() {
        let web = WebConfig {
            listen_address: "localhost:0".to_string(),
            ..Default::default()
        };
        let listener = tokio::net::TcpListener::bind(web.bind_address()).await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }
}
