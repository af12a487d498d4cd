//! Provisioner Configuration

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Provisioner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// HTTP listen address
    pub listen_addr: String,
    /// Shared secret expected in the `token` query parameter
    pub api_token: String,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Upper bound for any external command
    pub command_timeout_secs: u64,
    /// Client-facing server parameters
    pub server: ServerConfig,
    /// Tunnel technology of this deployment
    pub backend: BackendConfig,
    /// Reconciliation and upstream reporting
    pub reporter: ReporterConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            api_token: String::new(),
            database_path: "/var/lib/opensase/profiles.db".into(),
            command_timeout_secs: 30,
            server: ServerConfig::default(),
            backend: BackendConfig::WireGuard(WireGuardConfig::default()),
            reporter: ReporterConfig::default(),
        }
    }
}

impl ProvisionerConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Override deployment secrets and endpoints from the environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(token) = var("API_TOKEN") {
            self.api_token = token;
        }
        if let Some(port) = var("API_PORT") {
            let host = self
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".into());
            self.listen_addr = format!("{}:{}", host, port);
        }
        if let Some(path) = var("DATABASE_PATH") {
            self.database_path = path.into();
        }
        if let Some(url) = var("STATUS_URL") {
            self.reporter.url = Some(url);
        }
        if let Some(ip) = var("SERVER_ENDPOINT_IP") {
            self.server.endpoint_ip = ip;
        }
        if let Some(port) = var("SERVER_ENDPOINT_PORT").and_then(|p| p.parse().ok()) {
            self.server.endpoint_port = port;
        }
        if let Some(key) = var("SERVER_PUBLIC_KEY") {
            self.server.public_key = key;
        }
        if let Some(dns) = var("DNS_SERVERS") {
            self.server.dns_servers = dns
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_token.is_empty() {
            return Err(ConfigError::Invalid("api_token must be set".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid("command_timeout_secs must be positive".into()));
        }
        if self.reporter.interval_secs == 0 {
            return Err(ConfigError::Invalid("reporter.interval_secs must be positive".into()));
        }
        if let BackendConfig::WireGuard(wg) = &self.backend {
            wg.network()?;
        }
        Ok(())
    }

    /// Command timeout as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Server parameters rendered into client configs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public IP or domain clients connect to
    pub endpoint_ip: String,
    pub endpoint_port: u16,
    /// WireGuard server key or Xray REALITY public key
    pub public_key: String,
    pub dns_servers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint_ip: "1.2.3.4".into(),
            endpoint_port: 51830,
            public_key: String::new(),
            dns_servers: vec!["8.8.8.8".into()],
        }
    }
}

/// Tunnel technology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    WireGuard(WireGuardConfig),
    Xray(XrayConfig),
    OpenVpn(OpenVpnConfig),
}

impl BackendConfig {
    /// Backend name used in logs and status reports
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::WireGuard(_) => "wireguard",
            BackendConfig::Xray(_) => "xray",
            BackendConfig::OpenVpn(_) => "openvpn",
        }
    }
}

/// WireGuard / AmneziaWG backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardConfig {
    pub interface: String,
    /// `awg` for AmneziaWG, `wg` for stock WireGuard
    pub cli: String,
    pub config_path: PathBuf,
    /// Address pool; the first host is the server
    pub vpn_network: String,
    pub keygen: KeygenMode,
    /// Command issued after the conf file changed, if any
    pub reload_command: Option<Vec<String>>,
    /// AmneziaWG junk-packet parameters
    pub obfuscation: Option<AmneziaParams>,
    pub keepalive_secs: u16,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: "awg0".into(),
            cli: "awg".into(),
            config_path: "/etc/amnezia/amneziawg/awg0.conf".into(),
            vpn_network: "10.100.10.0/24".into(),
            keygen: KeygenMode::Cli,
            reload_command: None,
            obfuscation: None,
            keepalive_secs: 20,
        }
    }
}

impl WireGuardConfig {
    /// Parsed VPN network
    pub fn network(&self) -> Result<IpNetwork, ConfigError> {
        self.vpn_network
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("vpn_network {}: {}", self.vpn_network, e)))
    }
}

/// Where WireGuard key pairs come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeygenMode {
    /// `<cli> genkey | <cli> pubkey`
    Cli,
    /// In-process x25519
    Native,
}

/// AmneziaWG obfuscation parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmneziaParams {
    pub jc: u32,
    pub jmin: u32,
    pub jmax: u32,
    pub s1: u32,
    pub s2: u32,
    pub h1: u32,
    pub h2: u32,
    pub h3: u32,
    pub h4: u32,
}

/// Xray VLESS + REALITY backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XrayConfig {
    pub config_path: PathBuf,
    /// Inbound to patch; the first inbound when unset
    pub inbound_tag: Option<String>,
    pub reload_command: Vec<String>,
    pub sni: String,
    pub fingerprint: String,
    pub flow: String,
}

impl Default for XrayConfig {
    fn default() -> Self {
        Self {
            config_path: "/usr/local/etc/xray/config.json".into(),
            inbound_tag: None,
            reload_command: vec!["systemctl".into(), "restart".into(), "xray".into()],
            sni: "vk.com".into(),
            fingerprint: "chrome".into(),
            flow: "xtls-rprx-vision".into(),
        }
    }
}

/// OpenVPN with easy-rsa and tls-crypt-v2
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVpnConfig {
    pub easyrsa_dir: PathBuf,
    pub tls_crypt_v2_server_key: PathBuf,
    pub client_keys_dir: PathBuf,
    pub status_log: PathBuf,
    pub client_prefix: String,
    /// Upper bound of the client name sequence
    pub max_clients: u64,
    pub revoke_on_delete: bool,
    pub proto: String,
    pub cipher: String,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            easyrsa_dir: "/etc/openvpn/easy-rsa".into(),
            tls_crypt_v2_server_key: "/etc/openvpn/server/tc_v2_server.key".into(),
            client_keys_dir: "/etc/openvpn/clients".into(),
            status_log: "/var/log/openvpn-status.log".into(),
            client_prefix: "client".into(),
            max_clients: 65_535,
            revoke_on_delete: true,
            proto: "udp".into(),
            cipher: "AES-256-GCM".into(),
        }
    }
}

/// Reconciliation loop and upstream collector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Collector endpoint; reporting is skipped when unset
    pub url: Option<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// A peer is active when its last activity is younger than this
    pub freshness_secs: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval_secs: 60,
            timeout_secs: 30,
            freshness_secs: 180,
        }
    }
}
