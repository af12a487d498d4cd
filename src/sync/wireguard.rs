//! WireGuard / AmneziaWG peer synchronization
//!
//! Peers are registered with the running interface through the `wg`/`awg`
//! CLI and persisted as `[Peer]` blocks in the interface's conf file, so
//! they survive an interface restart.

use super::{read_document, reload, write_document, PeerSession, PeerSync, SyncError, SyncOutcome};
use crate::command::{CommandRunner, Invocation};
use crate::profile::Identity;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// WireGuard synchronizer
pub struct WireGuardSync {
    interface: String,
    cli: String,
    config_path: PathBuf,
    reload_command: Option<Vec<String>>,
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
}

impl WireGuardSync {
    pub fn new(
        interface: impl Into<String>,
        cli: impl Into<String>,
        config_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            interface: interface.into(),
            cli: cli.into(),
            config_path: config_path.into(),
            reload_command: None,
            runner,
            lock: Mutex::new(()),
        }
    }

    pub fn with_reload(mut self, argv: Option<Vec<String>>) -> Self {
        self.reload_command = argv;
        self
    }

    async fn load(&self) -> Result<WgConf, SyncError> {
        WgConf::parse(&read_document(&self.config_path).await?)
    }

    async fn add_live_peer(&self, public_key: &str, address: IpAddr) -> Result<(), SyncError> {
        self.runner
            .run(&Invocation::new(
                &self.cli,
                [
                    "set",
                    self.interface.as_str(),
                    "peer",
                    public_key,
                    "allowed-ips",
                    host_cidr(address).as_str(),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn remove_live_peer(&self, public_key: &str) -> Result<(), SyncError> {
        self.runner
            .run(&Invocation::new(
                &self.cli,
                ["set", self.interface.as_str(), "peer", public_key, "remove"],
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PeerSync for WireGuardSync {
    async fn attach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError> {
        let Identity::WireGuard { public_key, address } = identity else {
            return Err(SyncError::WrongIdentity(identity.clone()));
        };

        {
            let _guard = self.lock.lock().await;
            let mut conf = self.load().await?;

            self.add_live_peer(public_key, *address).await?;

            conf.add_peer(public_key, *address);
            if let Err(e) = write_document(&self.config_path, &conf.render()).await {
                tracing::warn!(public_key = %public_key, error = %e, "Conf write failed, detaching live peer");
                if let Err(undo) = self.remove_live_peer(public_key).await {
                    tracing::error!(public_key = %public_key, error = %undo, "Live peer left attached after failed conf write");
                }
                return Err(e);
            }
        }

        tracing::info!(interface = %self.interface, address = %address, "Peer attached");
        Ok(reload(self.runner.as_ref(), self.reload_command.as_deref()).await)
    }

    async fn detach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError> {
        let Identity::WireGuard { public_key, address } = identity else {
            return Err(SyncError::WrongIdentity(identity.clone()));
        };

        {
            let _guard = self.lock.lock().await;
            let mut conf = self.load().await?;

            self.remove_live_peer(public_key).await?;

            conf.remove_peer(public_key);
            if let Err(e) = write_document(&self.config_path, &conf.render()).await {
                tracing::warn!(public_key = %public_key, error = %e, "Conf write failed, restoring live peer");
                if let Err(undo) = self.add_live_peer(public_key, *address).await {
                    tracing::error!(public_key = %public_key, error = %undo, "Live peer lost after failed conf write");
                }
                return Err(e);
            }
        }

        tracing::info!(interface = %self.interface, address = %address, "Peer detached");
        Ok(reload(self.runner.as_ref(), self.reload_command.as_deref()).await)
    }

    async fn sessions(&self) -> Result<Vec<PeerSession>, SyncError> {
        let dump = self
            .runner
            .run(&Invocation::new(&self.cli, ["show", self.interface.as_str(), "dump"]))
            .await?;
        Ok(parse_dump(&dump))
    }

    async fn identities(&self) -> Result<Vec<String>, SyncError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.peers())
    }
}

fn host_cidr(address: IpAddr) -> String {
    match address {
        IpAddr::V4(_) => format!("{address}/32"),
        IpAddr::V6(_) => format!("{address}/128"),
    }
}

/// Parse `wg show <iface> dump`: the first line describes the interface,
/// every further line is `pubkey psk endpoint allowed-ips handshake rx tx keepalive`.
fn parse_dump(dump: &str) -> Vec<PeerSession> {
    dump.lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 5 {
                return None;
            }
            let handshake: i64 = parts[4].trim().parse().ok()?;
            let last_seen = (handshake > 0)
                .then(|| Utc.timestamp_opt(handshake, 0).single())
                .flatten();
            Some(PeerSession {
                peer_key: parts[0].to_string(),
                last_seen,
            })
        })
        .collect()
}

/// A WireGuard conf file, kept line-for-line so untouched sections
/// round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConf {
    preamble: Vec<String>,
    sections: Vec<Section>,
    trailing_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    /// Blank lines separating this section from the previous one
    leading: Vec<String>,
    header: String,
    lines: Vec<String>,
}

impl Section {
    fn name(&self) -> &str {
        self.header.trim().trim_start_matches('[').trim_end_matches(']').trim()
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
        })
    }

    fn is_peer(&self, public_key: &str) -> bool {
        self.name().eq_ignore_ascii_case("Peer") && self.get("PublicKey") == Some(public_key)
    }
}

impl WgConf {
    pub fn parse(text: &str) -> Result<Self, SyncError> {
        let mut preamble = Vec::new();
        let mut sections: Vec<Section> = Vec::new();

        for (n, raw) in text.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.starts_with('[') {
                if !trimmed.ends_with(']') {
                    return Err(SyncError::Corrupt(format!("line {}: malformed section header", n + 1)));
                }
                let previous = match sections.last_mut() {
                    Some(section) => &mut section.lines,
                    None => &mut preamble,
                };
                let keep = previous
                    .iter()
                    .rposition(|l| !l.trim().is_empty())
                    .map_or(0, |i| i + 1);
                let leading = previous.split_off(keep);
                let section = Section {
                    leading,
                    header: raw.to_string(),
                    lines: Vec::new(),
                };
                let name = section.name();
                if !name.eq_ignore_ascii_case("Interface") && !name.eq_ignore_ascii_case("Peer") {
                    return Err(SyncError::Corrupt(format!("line {}: unknown section [{}]", n + 1, name)));
                }
                sections.push(section);
                continue;
            }

            match sections.last_mut() {
                Some(section) => {
                    if !trimmed.is_empty() && !is_comment(trimmed) && !trimmed.contains('=') {
                        return Err(SyncError::Corrupt(format!("line {}: expected `key = value`", n + 1)));
                    }
                    section.lines.push(raw.to_string());
                }
                None if trimmed.is_empty() || is_comment(trimmed) => preamble.push(raw.to_string()),
                None => {
                    return Err(SyncError::Corrupt(format!("line {}: outside of any section", n + 1)));
                }
            }
        }

        if !sections.iter().any(|s| s.name().eq_ignore_ascii_case("Interface")) {
            return Err(SyncError::Corrupt("no [Interface] section".into()));
        }

        Ok(Self {
            preamble,
            sections,
            trailing_newline: text.ends_with('\n'),
        })
    }

    /// Public keys of all `[Peer]` sections
    pub fn peers(&self) -> Vec<String> {
        self.sections
            .iter()
            .filter(|s| s.name().eq_ignore_ascii_case("Peer"))
            .filter_map(|s| s.get("PublicKey").map(str::to_string))
            .collect()
    }

    /// Append a peer block, replacing any block with the same key.
    pub fn add_peer(&mut self, public_key: &str, address: IpAddr) {
        self.remove_peer(public_key);

        let last_line = match self.sections.last() {
            Some(section) => section.lines.last(),
            None => self.preamble.last(),
        };
        let ends_blank = last_line.is_some_and(|l| l.trim().is_empty());

        self.trailing_newline = true;
        self.sections.push(Section {
            leading: if ends_blank { Vec::new() } else { vec![String::new()] },
            header: "[Peer]".into(),
            lines: vec![
                format!("PublicKey = {public_key}"),
                format!("AllowedIPs = {}", host_cidr(address)),
            ],
        });
    }

    /// Drop every peer block with `public_key`.
    pub fn remove_peer(&mut self, public_key: &str) {
        self.sections.retain(|s| !s.is_peer(public_key));
    }

    pub fn render(&self) -> String {
        let mut lines: Vec<&str> = self.preamble.iter().map(String::as_str).collect();
        for section in &self.sections {
            lines.extend(section.leading.iter().map(String::as_str));
            lines.push(&section.header);
            lines.extend(section.lines.iter().map(String::as_str));
        }
        let mut out = lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with(';')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_server_conf, FakeWireGuard, SERVER_CONF};

    fn identity(key: &str, host: u8) -> Identity {
        Identity::WireGuard {
            public_key: key.into(),
            address: format!("10.100.10.{host}").parse().unwrap(),
        }
    }

    fn sync(runner: Arc<FakeWireGuard>, path: PathBuf) -> WireGuardSync {
        WireGuardSync::new("awg0", "awg", path, runner)
    }

    #[test]
    fn test_conf_roundtrip_untouched() {
        let conf = WgConf::parse(SERVER_CONF).unwrap();
        assert_eq!(conf.render(), SERVER_CONF);
    }

    #[test]
    fn test_add_then_remove_restores_bytes() {
        let mut conf = WgConf::parse(SERVER_CONF).unwrap();
        conf.add_peer("abc=", "10.100.10.2".parse().unwrap());
        let written = conf.render();
        assert!(written.ends_with("\n\n[Peer]\nPublicKey = abc=\nAllowedIPs = 10.100.10.2/32\n"));

        let mut reparsed = WgConf::parse(&written).unwrap();
        assert_eq!(reparsed.peers(), vec!["abc="]);
        reparsed.remove_peer("abc=");
        assert_eq!(reparsed.render(), SERVER_CONF);
    }

    #[test]
    fn test_remove_keeps_other_peers() {
        let text = "[Interface]\nPrivateKey = x\n\n[Peer]\nPublicKey = a=\nAllowedIPs = 10.0.0.2/32\n\n[Peer]\n# phone\nPublicKey = b=\nAllowedIPs = 10.0.0.3/32\n";
        let mut conf = WgConf::parse(text).unwrap();
        conf.remove_peer("a=");
        assert_eq!(conf.peers(), vec!["b="]);
        assert!(conf.render().contains("# phone"));
    }

    #[test]
    fn test_corrupt_documents() {
        assert!(matches!(WgConf::parse("PrivateKey = x\n"), Err(SyncError::Corrupt(_))));
        assert!(matches!(WgConf::parse("[Peer]\nPublicKey = a\n"), Err(SyncError::Corrupt(_))));
        assert!(matches!(WgConf::parse("[Interface\n"), Err(SyncError::Corrupt(_))));
        assert!(matches!(WgConf::parse("[Interface]\ngarbage\n"), Err(SyncError::Corrupt(_))));
        assert!(matches!(WgConf::parse("[Bogus]\n"), Err(SyncError::Corrupt(_))));
    }

    #[test]
    fn test_parse_dump() {
        let dump = "priv\tpub\t51830\toff\nk1\t(none)\t1.2.3.4:5\t10.0.0.2/32\t1700000000\t1\t2\toff\nk2\t(none)\t(none)\t10.0.0.3/32\t0\t0\t0\toff";
        let sessions = parse_dump(dump);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].peer_key, "k1");
        assert_eq!(sessions[0].last_seen.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(sessions[1].last_seen, None);
    }

    #[tokio::test]
    async fn test_attach_detach_live_and_conf() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_server_conf(dir.path());
        let fake = Arc::new(FakeWireGuard::new());
        let sync = sync(fake.clone(), path.clone());

        let outcome = sync.attach(&identity("k1=", 2)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Applied);
        assert_eq!(fake.peer_keys(), vec!["k1="]);
        assert_eq!(sync.identities().await.unwrap(), vec!["k1="]);

        sync.detach(&identity("k1=", 2)).await.unwrap();
        assert!(fake.peer_keys().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SERVER_CONF);
    }

    #[tokio::test]
    async fn test_conf_write_failure_detaches_live_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_server_conf(dir.path());
        let fake = Arc::new(FakeWireGuard::new());
        let sync = sync(fake.clone(), path.clone());

        // a directory squatting on the temp file name makes the write fail
        std::fs::create_dir(dir.path().join("awg0.conf.tmp")).unwrap();

        let err = sync.attach(&identity("k1=", 2)).await.unwrap_err();
        assert!(matches!(err, SyncError::Write { .. }));
        assert!(fake.peer_keys().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SERVER_CONF);
    }

    #[tokio::test]
    async fn test_live_failure_leaves_conf_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_server_conf(dir.path());
        let fake = Arc::new(FakeWireGuard::new());
        fake.fail_on("allowed-ips");
        let sync = sync(fake.clone(), path.clone());

        let err = sync.attach(&identity("k1=", 2)).await.unwrap_err();
        assert!(matches!(err, SyncError::Command(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SERVER_CONF);
    }

    #[tokio::test]
    async fn test_missing_conf_fails_before_live_change() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeWireGuard::new());
        let sync = sync(fake.clone(), dir.path().join("absent.conf"));

        let err = sync.attach(&identity("k1=", 2)).await.unwrap_err();
        assert!(matches!(err, SyncError::Unreadable { .. }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_attaches_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_server_conf(dir.path());
        let fake = Arc::new(FakeWireGuard::new());
        let sync = Arc::new(sync(fake.clone(), path));

        let tasks: Vec<_> = (2..22u8)
            .map(|host| {
                let sync = sync.clone();
                tokio::spawn(async move { sync.attach(&identity(&format!("k{host}="), host)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(sync.identities().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_reload_failure_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_server_conf(dir.path());
        let fake = Arc::new(FakeWireGuard::new());
        fake.fail_on("syncconf");
        let sync = sync(fake.clone(), path)
            .with_reload(Some(vec!["awg".into(), "syncconf".into(), "awg0".into()]));

        let outcome = sync.attach(&identity("k1=", 2)).await.unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(sync.identities().await.unwrap(), vec!["k1="]);
    }
}
