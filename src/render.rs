//! Client Config Rendering
//!
//! Turns a stored profile plus static server parameters into the artifact a
//! client imports: a WireGuard `.conf`, a `vless://` share link or an inline
//! `.ovpn` file. Output depends on nothing but those inputs, so rendering the
//! same profile twice yields identical bytes.

use crate::config::{AmneziaParams, ServerConfig};
use crate::profile::{Identity, Profile};
use crate::sync::openvpn::PkiLayout;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Rendering errors
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("profile {0} has no private key")]
    MissingSecret(i64),

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile {0} does not belong to this deployment")]
    WrongBackend(i64),
}

/// A rendered client artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    /// Attachment name, `None` for inline text such as share links
    pub filename: Option<String>,
    pub content_type: &'static str,
    pub body: String,
}

/// Per-backend template parameters
#[derive(Debug, Clone)]
pub enum Template {
    WireGuard {
        obfuscation: Option<AmneziaParams>,
        keepalive_secs: u16,
    },
    Xray {
        sni: String,
        fingerprint: String,
        flow: String,
    },
    OpenVpn {
        layout: PkiLayout,
        proto: String,
        cipher: String,
    },
}

/// Renders client configs for one deployment
#[derive(Debug, Clone)]
pub struct Renderer {
    server: ServerConfig,
    template: Template,
}

impl Renderer {
    pub fn new(server: ServerConfig, template: Template) -> Self {
        Self { server, template }
    }

    pub async fn render(&self, profile: &Profile) -> Result<RenderedConfig, RenderError> {
        match (&self.template, &profile.identity) {
            (Template::WireGuard { obfuscation, keepalive_secs }, Identity::WireGuard { address, .. }) => {
                let private_key = profile
                    .secret
                    .as_deref()
                    .ok_or(RenderError::MissingSecret(profile.id))?;
                Ok(RenderedConfig {
                    filename: Some(format!("wg-profile-{address}.conf")),
                    content_type: "application/octet-stream",
                    body: self.wireguard(private_key, *address, obfuscation.as_ref(), *keepalive_secs),
                })
            }
            (Template::Xray { sni, fingerprint, flow }, Identity::Xray { uuid, short_id }) => {
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("type", "tcp")
                    .append_pair("security", "reality")
                    .append_pair("fp", fingerprint)
                    .append_pair("pbk", &self.server.public_key)
                    .append_pair("sni", sni)
                    .append_pair("sid", short_id)
                    .append_pair("flow", flow)
                    .finish();
                Ok(RenderedConfig {
                    filename: None,
                    content_type: "text/plain; charset=utf-8",
                    body: format!("vless://{uuid}@{}?{query}#profile-{}", self.endpoint(), profile.id),
                })
            }
            (Template::OpenVpn { layout, proto, cipher }, Identity::OpenVpn { name }) => Ok(RenderedConfig {
                filename: Some(format!("{name}.ovpn")),
                content_type: "application/octet-stream",
                body: self.openvpn(layout, name, proto, cipher).await?,
            }),
            _ => Err(RenderError::WrongBackend(profile.id)),
        }
    }

    /// `host:port`, bracketing IPv6 literals
    fn endpoint(&self) -> String {
        match self.server.endpoint_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.server.endpoint_port),
            _ => format!("{}:{}", self.server.endpoint_ip, self.server.endpoint_port),
        }
    }

    fn wireguard(
        &self,
        private_key: &str,
        address: IpAddr,
        obfuscation: Option<&AmneziaParams>,
        keepalive_secs: u16,
    ) -> String {
        let (prefix, allowed) = match address {
            IpAddr::V4(_) => (32, "0.0.0.0/0"),
            IpAddr::V6(_) => (128, "0.0.0.0/0, ::/0"),
        };

        let mut conf = String::from("[Interface]\n");
        let _ = writeln!(conf, "PrivateKey = {private_key}");
        let _ = writeln!(conf, "Address = {address}/{prefix}");
        if !self.server.dns_servers.is_empty() {
            let _ = writeln!(conf, "DNS = {}", self.server.dns_servers.join(", "));
        }
        if let Some(p) = obfuscation {
            for (key, value) in [
                ("Jc", p.jc),
                ("Jmin", p.jmin),
                ("Jmax", p.jmax),
                ("S1", p.s1),
                ("S2", p.s2),
                ("H1", p.h1),
                ("H2", p.h2),
                ("H3", p.h3),
                ("H4", p.h4),
            ] {
                let _ = writeln!(conf, "{key} = {value}");
            }
        }

        conf.push_str("\n[Peer]\n");
        let _ = writeln!(conf, "PublicKey = {}", self.server.public_key);
        let _ = writeln!(conf, "Endpoint = {}", self.endpoint());
        let _ = writeln!(conf, "AllowedIPs = {allowed}");
        if keepalive_secs > 0 {
            let _ = writeln!(conf, "PersistentKeepalive = {keepalive_secs}");
        }
        conf
    }

    async fn openvpn(&self, layout: &PkiLayout, name: &str, proto: &str, cipher: &str) -> Result<String, RenderError> {
        let ca = read_pem(layout.ca_cert()).await?;
        let cert = read_pem(layout.issued_cert(name)).await?;
        let key = read_pem(layout.private_key(name)).await?;
        let tls = read_pem(layout.tls_key(name)).await?;

        let mut conf = String::new();
        for line in [
            "client".to_string(),
            "dev tun".to_string(),
            format!("proto {proto}"),
            format!("remote {} {}", self.server.endpoint_ip, self.server.endpoint_port),
            "resolv-retry infinite".to_string(),
            "nobind".to_string(),
            "persist-key".to_string(),
            "persist-tun".to_string(),
            "remote-cert-tls server".to_string(),
            format!("cipher {cipher}"),
            "verb 3".to_string(),
        ] {
            conf.push_str(&line);
            conf.push('\n');
        }
        for (tag, body) in [("ca", ca), ("cert", cert), ("key", key), ("tls-crypt-v2", tls)] {
            let _ = write!(conf, "<{tag}>\n{body}</{tag}>\n");
        }
        Ok(conf)
    }
}

/// Read a PEM blob, normalized to end with a newline.
async fn read_pem(path: PathBuf) -> Result<String, RenderError> {
    let mut text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| RenderError::Unreadable { path, source })?;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn server() -> ServerConfig {
        ServerConfig {
            endpoint_ip: "203.0.113.10".into(),
            endpoint_port: 51830,
            public_key: "c2VydmVyLXB1YmxpYw==".into(),
            dns_servers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
        }
    }

    fn profile(id: i64, identity: Identity, secret: Option<&str>) -> Profile {
        Profile {
            id,
            identity,
            secret: secret.map(str::to_string),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            expires_at: None,
        }
    }

    fn wg_profile() -> Profile {
        profile(
            3,
            Identity::WireGuard {
                public_key: "client-pub".into(),
                address: "10.100.10.4".parse().unwrap(),
            },
            Some("client-priv"),
        )
    }

    #[tokio::test]
    async fn test_wireguard_conf() {
        let renderer = Renderer::new(
            server(),
            Template::WireGuard {
                obfuscation: None,
                keepalive_secs: 20,
            },
        );

        let rendered = renderer.render(&wg_profile()).await.unwrap();
        assert_eq!(rendered.filename.as_deref(), Some("wg-profile-10.100.10.4.conf"));
        assert_eq!(
            rendered.body,
            "[Interface]\nPrivateKey = client-priv\nAddress = 10.100.10.4/32\nDNS = 1.1.1.1, 8.8.8.8\n\n\
             [Peer]\nPublicKey = c2VydmVyLXB1YmxpYw==\nEndpoint = 203.0.113.10:51830\nAllowedIPs = 0.0.0.0/0\nPersistentKeepalive = 20\n"
        );
    }

    #[tokio::test]
    async fn test_amneziawg_params() {
        let renderer = Renderer::new(
            server(),
            Template::WireGuard {
                obfuscation: Some(AmneziaParams {
                    jc: 4,
                    jmin: 40,
                    jmax: 70,
                    s1: 0,
                    s2: 0,
                    h1: 1,
                    h2: 2,
                    h3: 3,
                    h4: 4,
                }),
                keepalive_secs: 20,
            },
        );

        let body = renderer.render(&wg_profile()).await.unwrap().body;
        assert!(body.contains("Jc = 4\nJmin = 40\nJmax = 70\nS1 = 0\nS2 = 0\nH1 = 1\nH2 = 2\nH3 = 3\nH4 = 4\n"));
        assert_eq!(body, renderer.render(&wg_profile()).await.unwrap().body);
    }

    #[tokio::test]
    async fn test_wireguard_requires_secret() {
        let renderer = Renderer::new(server(), Template::WireGuard { obfuscation: None, keepalive_secs: 0 });
        let mut p = wg_profile();
        p.secret = None;
        assert!(matches!(renderer.render(&p).await, Err(RenderError::MissingSecret(3))));
    }

    #[tokio::test]
    async fn test_vless_link() {
        let renderer = Renderer::new(
            ServerConfig {
                endpoint_ip: "vpn.example.com".into(),
                endpoint_port: 443,
                public_key: "pbk+/=".into(),
                dns_servers: vec![],
            },
            Template::Xray {
                sni: "vk.com".into(),
                fingerprint: "chrome".into(),
                flow: "xtls-rprx-vision".into(),
            },
        );
        let uuid = Uuid::parse_str("6f1c9a2e-1d3b-4c5a-9e7f-0a1b2c3d4e5f").unwrap();
        let p = profile(7, Identity::Xray { uuid, short_id: "0a1b2c3d".into() }, None);

        let rendered = renderer.render(&p).await.unwrap();
        assert_eq!(rendered.filename, None);
        assert_eq!(
            rendered.body,
            "vless://6f1c9a2e-1d3b-4c5a-9e7f-0a1b2c3d4e5f@vpn.example.com:443\
             ?type=tcp&security=reality&fp=chrome&pbk=pbk%2B%2F%3D&sni=vk.com&sid=0a1b2c3d&flow=xtls-rprx-vision#profile-7"
        );
    }

    #[tokio::test]
    async fn test_ipv6_endpoint_bracketed() {
        let mut srv = server();
        srv.endpoint_ip = "2001:db8::1".into();
        let renderer = Renderer::new(srv, Template::WireGuard { obfuscation: None, keepalive_secs: 20 });
        let body = renderer.render(&wg_profile()).await.unwrap().body;
        assert!(body.contains("Endpoint = [2001:db8::1]:51830\n"));
    }

    #[tokio::test]
    async fn test_openvpn_inline() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PkiLayout {
            easyrsa_dir: dir.path().join("easy-rsa"),
            tls_crypt_v2_server_key: dir.path().join("server.key"),
            client_keys_dir: dir.path().join("clients"),
        };
        for sub in ["issued", "private"] {
            std::fs::create_dir_all(layout.easyrsa_dir.join("pki").join(sub)).unwrap();
        }
        std::fs::create_dir_all(&layout.client_keys_dir).unwrap();
        std::fs::write(layout.ca_cert(), "CA\n").unwrap();
        std::fs::write(layout.issued_cert("client2"), "CERT\n").unwrap();
        std::fs::write(layout.private_key("client2"), "KEY").unwrap();
        std::fs::write(layout.tls_key("client2"), "TLS\n").unwrap();

        let renderer = Renderer::new(
            server(),
            Template::OpenVpn {
                layout,
                proto: "udp".into(),
                cipher: "AES-256-GCM".into(),
            },
        );
        let p = profile(2, Identity::OpenVpn { name: "client2".into() }, None);

        let rendered = renderer.render(&p).await.unwrap();
        assert_eq!(rendered.filename.as_deref(), Some("client2.ovpn"));
        assert!(rendered.body.starts_with("client\ndev tun\nproto udp\nremote 203.0.113.10 51830\n"));
        assert!(rendered.body.contains("cipher AES-256-GCM\nverb 3\n<ca>\nCA\n</ca>\n<cert>\nCERT\n</cert>\n<key>\nKEY\n</key>\n<tls-crypt-v2>\nTLS\n</tls-crypt-v2>\n"));
    }

    #[tokio::test]
    async fn test_openvpn_missing_material() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Renderer::new(
            server(),
            Template::OpenVpn {
                layout: PkiLayout {
                    easyrsa_dir: dir.path().to_path_buf(),
                    tls_crypt_v2_server_key: dir.path().join("server.key"),
                    client_keys_dir: dir.path().to_path_buf(),
                },
                proto: "udp".into(),
                cipher: "AES-256-GCM".into(),
            },
        );
        let p = profile(2, Identity::OpenVpn { name: "client2".into() }, None);
        assert!(matches!(renderer.render(&p).await, Err(RenderError::Unreadable { .. })));
    }

    #[tokio::test]
    async fn test_wrong_backend() {
        let renderer = Renderer::new(server(), Template::WireGuard { obfuscation: None, keepalive_secs: 20 });
        let p = profile(9, Identity::OpenVpn { name: "client9".into() }, None);
        assert!(matches!(renderer.render(&p).await, Err(RenderError::WrongBackend(9))));
    }
}
