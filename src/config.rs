use crate::error::{Error, Result};
use crate::handler::HandlerConfig;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerMode {
    #[default]
    Normal,
    /// Relay every request to the upstream server and return its replies.
    Proxy,
    /// Answer locally, forward a copy upstream, log response divergences.
    Diff,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    #[serde(default)]
    pub data_api_addr: Option<String>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub mode: ListenerMode,
    #[serde(default)]
    pub upstream_addr: Option<String>,
    #[serde(default)]
    pub upstream_timeout_ms: Option<u64>,
    #[serde(default)]
    pub auth: bool,
    pub request_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    /// None disables the capped-collection maintenance loop; zero is a
    /// configuration error.
    #[serde(default)]
    pub capped_cleanup_interval_secs: Option<u64>,
    #[serde(default)]
    pub capped_cleanup_percentage: Option<u32>,
    #[serde(default)]
    pub disable_pushdown: bool,
    #[serde(default)]
    pub enable_oplog: bool,
    // Server TLS configuration
    #[serde(default)]
    pub tls_cert_file: Option<String>,
    #[serde(default)]
    pub tls_key_file: Option<String>,
    #[serde(default)]
    pub tls_ca_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Default to the standard wire port locally
            listen_addr: "127.0.0.1:27017".to_string(),
            data_api_addr: None,
            log_level: None,
            mode: ListenerMode::Normal,
            upstream_addr: None,
            upstream_timeout_ms: None,
            auth: false,
            request_timeout_secs: Some(30),
            shutdown_grace_secs: Some(5),
            capped_cleanup_interval_secs: None,
            capped_cleanup_percentage: None,
            disable_pushdown: false,
            enable_oplog: false,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
        }
    }
}

impl Config {
    /// Read configuration from a TOML file. A missing or unreadable file
    /// falls back to defaults so a bare `stratumdb` invocation works; a file
    /// that exists but does not parse is an error.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        let Ok(contents) = fs::read_to_string(path) else {
            return Ok(Self::default());
        };
        toml::from_str(&contents)
            .map_err(|e| Error::Msg(format!("config file {path} is not valid TOML: {e}")))
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    pub fn with_overrides(
        mut self,
        listen_addr: Option<String>,
        data_api_addr: Option<String>,
        log_level: Option<String>,
        mode: Option<ListenerMode>,
        upstream_addr: Option<String>,
        auth: Option<bool>,
    ) -> Self {
        if let Some(addr) = listen_addr {
            self.listen_addr = addr;
        }
        if let Some(addr) = data_api_addr {
            self.data_api_addr = Some(addr);
        }
        if let Some(ll) = log_level {
            self.log_level = Some(ll);
        }
        if let Some(mode) = mode {
            self.mode = mode;
        }
        if let Some(addr) = upstream_addr {
            self.upstream_addr = Some(addr);
        }
        if let Some(auth) = auth {
            self.auth = auth;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Msg("listen_addr cannot be empty".to_string()));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::Msg(format!(
                "listen_addr '{}' must be in host:port format",
                self.listen_addr
            )));
        }

        if let Some(ref addr) = self.data_api_addr {
            if !addr.contains(':') {
                return Err(Error::Msg(format!(
                    "data_api_addr '{}' must be in host:port format",
                    addr
                )));
            }
        }

        // An unarmed ticker would spin; zero is rejected up front.
        if self.capped_cleanup_interval_secs == Some(0) {
            return Err(Error::Msg(
                "capped_cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(pct) = self.capped_cleanup_percentage {
            if pct > 100 {
                tracing::warn!(
                    percentage = pct,
                    "capped_cleanup_percentage out of range, will be clamped to 100"
                );
            }
        }

        match self.mode {
            ListenerMode::Normal => {}
            ListenerMode::Proxy | ListenerMode::Diff => {
                let Some(ref addr) = self.upstream_addr else {
                    return Err(Error::Msg(
                        "upstream_addr is required in proxy and diff modes".to_string(),
                    ));
                };
                if !addr.contains(':') {
                    return Err(Error::Msg(format!(
                        "upstream_addr '{}' must be in host:port format",
                        addr
                    )));
                }
            }
        }

        // Server TLS configuration: both halves or neither.
        if self.tls_cert_file.is_some() || self.tls_key_file.is_some() {
            if self.tls_cert_file.is_none() {
                return Err(Error::Msg(
                    "tls_cert_file must be set when tls_key_file is set".to_string(),
                ));
            }
            if self.tls_key_file.is_none() {
                return Err(Error::Msg(
                    "tls_key_file must be set when tls_cert_file is set".to_string(),
                ));
            }
            for (name, file) in [
                ("tls_cert_file", &self.tls_cert_file),
                ("tls_key_file", &self.tls_key_file),
                ("tls_ca_file", &self.tls_ca_file),
            ] {
                if let Some(path) = file {
                    if !std::path::Path::new(path).exists() {
                        return Err(Error::Msg(format!("{name} '{path}' does not exist")));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            auth: self.auth,
            capped_cleanup_interval: self
                .capped_cleanup_interval_secs
                .map(Duration::from_secs),
            capped_cleanup_percentage: self
                .capped_cleanup_percentage
                .map(|pct| pct.min(100) as u8)
                .unwrap_or(20),
            disable_pushdown: self.disable_pushdown,
            enable_oplog: self.enable_oplog,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(30))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs.unwrap_or(5))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms.unwrap_or(800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_cleanup_interval_rejected() {
        let cfg = Config {
            capped_cleanup_interval_secs: Some(0),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_out_of_range_percentage_clamps_not_fails() {
        let cfg = Config {
            capped_cleanup_percentage: Some(250),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.handler_config().capped_cleanup_percentage, 100);
    }

    #[test]
    fn test_proxy_mode_requires_upstream() {
        let cfg = Config {
            mode: ListenerMode::Proxy,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            mode: ListenerMode::Diff,
            upstream_addr: Some("127.0.0.1:27018".into()),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_tls_pairing() {
        let cfg = Config {
            tls_cert_file: Some("cert.pem".into()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_listen_addr() {
        let cfg = Config {
            listen_addr: "no-port".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let cfg: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:37017"
            mode = "diff"
            upstream_addr = "127.0.0.1:27017"
            auth = true
            capped_cleanup_interval_secs = 60
            capped_cleanup_percentage = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mode, ListenerMode::Diff);
        assert!(cfg.auth);
        assert_eq!(cfg.capped_cleanup_interval_secs, Some(60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let cfg = Config::default().with_overrides(
            Some("0.0.0.0:37017".into()),
            None,
            Some("debug".into()),
            Some(ListenerMode::Proxy),
            Some("127.0.0.1:27018".into()),
            Some(true),
        );
        assert_eq!(cfg.listen_addr, "0.0.0.0:37017");
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.mode, ListenerMode::Proxy);
        assert!(cfg.auth);
    }
}
