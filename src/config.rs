use std::net::SocketAddr;

use serde::Deserialize;

use crate::address::NetLocation;
use crate::pac::resolver::LoopGuardPolicy;
use crate::upstream::{UpstreamProtocol, UpstreamTarget};

/// Top-level YAML config for the gateway binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: SocketAddr,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pac: Option<PacConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    pub protocol: UpstreamProtocol,
    pub address: NetLocation,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl UpstreamConfig {
    pub fn to_target(&self) -> UpstreamTarget {
        let credentials = self.username.as_ref().map(|username| {
            (
                username.clone(),
                self.password.clone().unwrap_or_default(),
            )
        });
        UpstreamTarget {
            protocol: self.protocol,
            location: self.address.clone(),
            credentials,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacConfig {
    pub url: String,
    #[serde(default)]
    pub loop_guard: LoopGuardPolicy,
    /// Overrides the address `myIpAddress()` reports to scripts.
    #[serde(default)]
    pub my_ip_address: Option<String>,
}

/// Reads and parses a single YAML config file.
pub async fn load_config(config_filename: &str) -> std::io::Result<GatewayConfig> {
    let config_bytes = match tokio::fs::read(config_filename).await {
        Ok(b) => b,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not read config file {config_filename}: {e}"),
            ));
        }
    };

    let config_str = match String::from_utf8(config_bytes) {
        Ok(s) => s,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse config file {config_filename} as UTF8: {e}"),
            ));
        }
    };

    match serde_yaml::from_str::<GatewayConfig>(&config_str) {
        Ok(config) => Ok(config),
        Err(e) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Could not parse config file {config_filename} as config YAML: {e}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let yaml = r#"
bind_address: 127.0.0.1:1080
upstream:
  protocol: socks5
  address: 10.0.0.1:1080
  username: user
  password: pass
pac:
  url: http://wpad.example.com/wpad.dat
  loop_guard: direct
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_address.port(), 1080);
        assert_eq!(config.upstream.protocol, UpstreamProtocol::Socks5);

        let target = config.upstream.to_target();
        assert_eq!(
            target.credentials,
            Some(("user".to_string(), "pass".to_string()))
        );

        let pac = config.pac.unwrap();
        assert_eq!(pac.url, "http://wpad.example.com/wpad.dat");
        assert_eq!(pac.loop_guard, LoopGuardPolicy::Direct);
        assert!(pac.my_ip_address.is_none());
    }

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
bind_address: 0.0.0.0:0
upstream:
  protocol: http
  address: proxy.example.com:8080
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.pac.is_none());
        let target = config.upstream.to_target();
        assert!(target.credentials.is_none());
        assert_eq!(target.location.port(), 8080);
    }

    #[test]
    fn test_username_without_password_defaults_to_empty() {
        let yaml = r#"
bind_address: 127.0.0.1:1080
upstream:
  protocol: socks4
  address: 10.0.0.1:1080
  username: bob
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.upstream.to_target().credentials,
            Some(("bob".to_string(), String::new()))
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let yaml = r#"
bind_address: 127.0.0.1:1080
upstream:
  protocol: http
  address: 10.0.0.1:8080
  certificate: /tmp/cert.pem
"#;
        assert!(serde_yaml::from_str::<GatewayConfig>(yaml).is_err());
    }
}
