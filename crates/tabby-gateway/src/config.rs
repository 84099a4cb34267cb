//! Gateway configuration: TOML file + CLI overrides, auth token from the environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabby_gateway_core::{GatewayError, GatewayResult};
use tracing::info;

/// Environment variable holding the shared authentication token.
pub const AUTH_TOKEN_ENV: &str = "TABBY_AUTH_TOKEN";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer: usize,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
            relay_buffer: default_relay_buffer(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_relay_buffer() -> usize {
    16 * 1024
}
fn default_max_header_bytes() -> usize {
    8 * 1024
}

/// Values taken from the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub idle_timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
}

/// Resolved gateway configuration, immutable once the server starts.
#[derive(Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Shared client token. Empty disables authentication.
    pub auth_token: String,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub relay_buffer: usize,
    pub max_header_bytes: usize,
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides and the auth token.
    pub fn load(
        config_path: Option<&Path>,
        cli: CliOverrides,
        auth_token: Option<String>,
    ) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config.server, cli, auth_token)
    }

    fn resolve(
        server: ServerSection,
        cli: CliOverrides,
        auth_token: Option<String>,
    ) -> GatewayResult<Self> {
        let host = cli.host.unwrap_or(server.host);
        let port = cli.port.unwrap_or(server.port);
        let idle_timeout = cli.idle_timeout.unwrap_or(server.idle_timeout);
        let connect_timeout = cli.connect_timeout.unwrap_or(server.connect_timeout);

        if idle_timeout == 0 {
            return Err(GatewayError::Config("idle_timeout must be positive".into()));
        }
        if connect_timeout == 0 {
            return Err(GatewayError::Config("connect_timeout must be positive".into()));
        }
        if !(1024..=64 * 1024).contains(&server.relay_buffer) {
            return Err(GatewayError::Config(format!(
                "relay_buffer must be between 1024 and 65536 bytes, got {}",
                server.relay_buffer
            )));
        }
        if server.max_header_bytes < 512 {
            return Err(GatewayError::Config(format!(
                "max_header_bytes too small: {}",
                server.max_header_bytes
            )));
        }

        Ok(Self {
            listen_addr: SocketAddr::new(host, port),
            auth_token: auth_token.unwrap_or_default(),
            idle_timeout: Duration::from_secs(idle_timeout),
            connect_timeout: Duration::from_secs(connect_timeout),
            relay_buffer: server.relay_buffer,
            max_header_bytes: server.max_header_bytes,
        })
    }

    pub fn auth_required(&self) -> bool {
        !self.auth_token.is_empty()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(default_host(), default_port()),
            auth_token: String::new(),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            relay_buffer: default_relay_buffer(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

// Debug never prints the token.
impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("listen_addr", &self.listen_addr)
            .field("auth_required", &self.auth_required())
            .field("idle_timeout", &self.idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("relay_buffer", &self.relay_buffer)
            .field("max_header_bytes", &self.max_header_bytes)
            .finish()
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.relay_buffer, 16 * 1024);
        assert!(!cfg.auth_required());
    }

    #[test]
    fn empty_token_disables_auth() {
        let cfg = GatewayConfig::resolve(
            ServerSection::default(),
            CliOverrides::default(),
            Some(String::new()),
        )
        .unwrap();
        assert!(!cfg.auth_required());

        let cfg = GatewayConfig::resolve(
            ServerSection::default(),
            CliOverrides::default(),
            Some("s3cret".into()),
        )
        .unwrap();
        assert!(cfg.auth_required());
        assert_eq!(cfg.auth_token, "s3cret");
    }

    #[test]
    fn debug_hides_token() {
        let cfg = GatewayConfig::resolve(
            ServerSection::default(),
            CliOverrides::default(),
            Some("s3cret".into()),
        )
        .unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("auth_required: true"));
    }

    #[test]
    fn parse_partial_toml_config() {
        let toml_str = r#"
[server]
port = 9000
idle_timeout = 60
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(file.server.port, 9000);
        assert_eq!(file.server.idle_timeout, 60);
        assert_eq!(file.server.connect_timeout, 10);
        assert_eq!(file.server.host, default_host());
    }

    #[test]
    fn cli_overrides_file() {
        let server = ServerSection {
            port: 9000,
            ..ServerSection::default()
        };
        let cli = CliOverrides {
            host: Some("127.0.0.1".parse().unwrap()),
            port: Some(9100),
            idle_timeout: Some(30),
            connect_timeout: None,
        };
        let cfg = GatewayConfig::resolve(server, cli, None).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let cli = CliOverrides {
            idle_timeout: Some(0),
            ..CliOverrides::default()
        };
        assert!(GatewayConfig::resolve(ServerSection::default(), cli, None).is_err());

        let cli = CliOverrides {
            connect_timeout: Some(0),
            ..CliOverrides::default()
        };
        assert!(GatewayConfig::resolve(ServerSection::default(), cli, None).is_err());
    }

    #[test]
    fn rejects_out_of_range_relay_buffer() {
        let server = ServerSection {
            relay_buffer: 512,
            ..ServerSection::default()
        };
        assert!(GatewayConfig::resolve(server, CliOverrides::default(), None).is_err());
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let path = Path::new("/nonexistent/tabby-gateway/config.toml");
        let cfg = GatewayConfig::load(Some(path), CliOverrides::default(), None).unwrap();
        assert_eq!(cfg.listen_addr.port(), 8000);
    }
}
