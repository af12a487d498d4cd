//! OpenVPN client certificate synchronization
//!
//! A client is "attached" once easy-rsa has issued its certificate and a
//! per-client tls-crypt-v2 key exists. Detaching revokes the certificate,
//! regenerates the CRL and removes the issued material.

use super::{PeerSession, PeerSync, SyncError, SyncOutcome};
use crate::command::{CommandRunner, Invocation};
use crate::profile::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Locations of the easy-rsa PKI and the per-client key directory
#[derive(Debug, Clone)]
pub struct PkiLayout {
    pub easyrsa_dir: PathBuf,
    pub tls_crypt_v2_server_key: PathBuf,
    pub client_keys_dir: PathBuf,
}

impl PkiLayout {
    pub fn ca_cert(&self) -> PathBuf {
        self.easyrsa_dir.join("pki").join("ca.crt")
    }

    pub fn issued_cert(&self, name: &str) -> PathBuf {
        self.easyrsa_dir.join("pki").join("issued").join(format!("{name}.crt"))
    }

    pub fn private_key(&self, name: &str) -> PathBuf {
        self.easyrsa_dir.join("pki").join("private").join(format!("{name}.key"))
    }

    pub fn request(&self, name: &str) -> PathBuf {
        self.easyrsa_dir.join("pki").join("reqs").join(format!("{name}.req"))
    }

    pub fn tls_key(&self, name: &str) -> PathBuf {
        self.client_keys_dir.join(format!("{name}.tls"))
    }
}

/// OpenVPN synchronizer
pub struct OpenVpnSync {
    layout: PkiLayout,
    status_log: PathBuf,
    revoke_on_delete: bool,
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
}

impl OpenVpnSync {
    pub fn new(layout: PkiLayout, status_log: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            layout,
            status_log: status_log.into(),
            revoke_on_delete: true,
            runner,
            lock: Mutex::new(()),
        }
    }

    pub fn with_revocation(mut self, revoke_on_delete: bool) -> Self {
        self.revoke_on_delete = revoke_on_delete;
        self
    }

    fn easyrsa<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Invocation {
        let program = self.layout.easyrsa_dir.join("easyrsa");
        Invocation::new(program.to_string_lossy(), args)
            .cwd(&self.layout.easyrsa_dir)
            .env("EASYRSA_BATCH", "1")
    }

    async fn issue(&self, name: &str) -> Result<(), SyncError> {
        self.runner
            .run(&self.easyrsa(["build-client-full", name, "nopass"]))
            .await?;

        let keys_dir = &self.layout.client_keys_dir;
        tokio::fs::create_dir_all(keys_dir)
            .await
            .map_err(|source| SyncError::Write {
                path: keys_dir.clone(),
                source,
            })?;

        let tls_key = self.layout.tls_key(name);
        self.runner
            .run(&Invocation::new(
                "openvpn",
                [
                    "--tls-crypt-v2".to_string(),
                    self.layout.tls_crypt_v2_server_key.to_string_lossy().into_owned(),
                    "--genkey".to_string(),
                    "tls-crypt-v2-client".to_string(),
                    tls_key.to_string_lossy().into_owned(),
                ],
            ))
            .await?;
        Ok(())
    }

    /// Revoke (when enabled) and delete everything issued for `name`.
    async fn retire(&self, name: &str) -> Result<(), SyncError> {
        if self.revoke_on_delete {
            if tokio::fs::try_exists(self.layout.issued_cert(name)).await.unwrap_or(false) {
                self.runner.run(&self.easyrsa(["revoke", name])).await?;
            }
            self.runner.run(&self.easyrsa(["gen-crl"])).await?;
        }

        for path in [
            self.layout.issued_cert(name),
            self.layout.private_key(name),
            self.layout.request(name),
            self.layout.tls_key(name),
        ] {
            remove_if_present(&path).await?;
        }
        Ok(())
    }
}

fn client_name(identity: &Identity) -> Result<&str, SyncError> {
    match identity {
        Identity::OpenVpn { name }
            if !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
        {
            Ok(name.as_str())
        }
        other => Err(SyncError::WrongIdentity(other.clone())),
    }
}

async fn remove_if_present(path: &Path) -> Result<(), SyncError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SyncError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl PeerSync for OpenVpnSync {
    async fn attach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError> {
        let name = client_name(identity)?;
        let _guard = self.lock.lock().await;

        if let Err(e) = self.issue(name).await {
            tracing::warn!(client = %name, error = %e, "Client issuance failed, retiring partial material");
            if let Err(undo) = self.retire(name).await {
                tracing::error!(client = %name, error = %undo, "Partial client material left in PKI");
            }
            return Err(e);
        }

        tracing::info!(client = %name, "Client certificate issued");
        Ok(SyncOutcome::Applied)
    }

    async fn detach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError> {
        let name = client_name(identity)?;
        let _guard = self.lock.lock().await;

        self.retire(name).await?;

        tracing::info!(client = %name, revoked = self.revoke_on_delete, "Client certificate retired");
        Ok(SyncOutcome::Applied)
    }

    async fn sessions(&self) -> Result<Vec<PeerSession>, SyncError> {
        let text = match tokio::fs::read_to_string(&self.status_log).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SyncError::Unreadable {
                    path: self.status_log.clone(),
                    source,
                })
            }
        };
        let updated = tokio::fs::metadata(&self.status_log)
            .await
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(parse_status_log(&text)
            .into_iter()
            .map(|peer_key| PeerSession {
                peer_key,
                last_seen: updated,
            })
            .collect())
    }

    async fn identities(&self) -> Result<Vec<String>, SyncError> {
        let _guard = self.lock.lock().await;
        let dir = &self.layout.client_keys_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            // nothing issued yet
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SyncError::Unreadable {
                    path: dir.clone(),
                    source,
                })
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| SyncError::Unreadable {
            path: dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tls") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Common names of connected clients from an OpenVPN status file
/// (`status-version` 1, or 2/3 with `CLIENT_LIST` rows).
fn parse_status_log(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_clients = false;

    for line in text.lines().map(str::trim) {
        if let Some(row) = line.strip_prefix("CLIENT_LIST,") {
            if let Some(name) = row.split(',').next().filter(|n| !n.is_empty()) {
                names.push(name.to_string());
            }
            continue;
        }
        if line.starts_with("Common Name") {
            in_clients = true;
            continue;
        }
        if line.starts_with("ROUTING TABLE") || line.starts_with("GLOBAL STATS") {
            in_clients = false;
            continue;
        }
        if in_clients && !line.is_empty() {
            if let Some(name) = line.split(',').next() {
                names.push(name.to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandError;
    use parking_lot::Mutex as SyncMutex;

    /// Simulates easy-rsa and `openvpn --genkey` by writing the files they would.
    #[derive(Default)]
    struct FakePki {
        calls: SyncMutex<Vec<String>>,
        fail_on: SyncMutex<Option<String>>,
    }

    impl FakePki {
        fn fail_on(&self, pattern: &str) {
            *self.fail_on.lock() = Some(pattern.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for FakePki {
        async fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
            let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
            self.calls.lock().push(args.join(" "));

            if let Some(pattern) = self.fail_on.lock().as_deref() {
                if args.join(" ").contains(pattern) {
                    return Err(CommandError::Failed {
                        program: invocation.program.clone(),
                        code: Some(1),
                        stderr: "injected".into(),
                    });
                }
            }

            assert!(invocation.program.ends_with("openvpn") || invocation.env.contains(&("EASYRSA_BATCH".into(), "1".into())));
            let pki = invocation.cwd.as_ref().map(|dir| dir.join("pki"));
            match (args.as_slice(), pki) {
                (["build-client-full", name, "nopass"], Some(pki)) => {
                    std::fs::write(pki.join("issued").join(format!("{name}.crt")), "CERT").unwrap();
                    std::fs::write(pki.join("private").join(format!("{name}.key")), "KEY").unwrap();
                    std::fs::write(pki.join("reqs").join(format!("{name}.req")), "REQ").unwrap();
                }
                (["revoke", name], Some(pki)) => {
                    std::fs::remove_file(pki.join("issued").join(format!("{name}.crt"))).unwrap();
                }
                ([.., "tls-crypt-v2-client", path], _) => {
                    // openvpn does not create missing parent directories
                    std::fs::write(path, "TLS").map_err(|e| CommandError::Failed {
                        program: invocation.program.clone(),
                        code: Some(1),
                        stderr: e.to_string(),
                    })?;
                }
                _ => {}
            }
            Ok(String::new())
        }
    }

    fn setup() -> (tempfile::TempDir, PkiLayout) {
        let dir = tempfile::tempdir().unwrap();
        let easyrsa_dir = dir.path().join("easy-rsa");
        for sub in ["issued", "private", "reqs"] {
            std::fs::create_dir_all(easyrsa_dir.join("pki").join(sub)).unwrap();
        }
        std::fs::write(easyrsa_dir.join("pki").join("ca.crt"), "CA").unwrap();
        let client_keys_dir = dir.path().join("client-keys");
        std::fs::create_dir(&client_keys_dir).unwrap();

        let layout = PkiLayout {
            easyrsa_dir,
            tls_crypt_v2_server_key: dir.path().join("tc_v2_server.key"),
            client_keys_dir,
        };
        (dir, layout)
    }

    fn client(name: &str) -> Identity {
        Identity::OpenVpn { name: name.into() }
    }

    #[tokio::test]
    async fn test_attach_issues_material() {
        let (dir, layout) = setup();
        let fake = Arc::new(FakePki::default());
        let sync = OpenVpnSync::new(layout.clone(), dir.path().join("status.log"), fake.clone());

        sync.attach(&client("client1")).await.unwrap();

        assert!(layout.issued_cert("client1").exists());
        assert!(layout.private_key("client1").exists());
        assert!(layout.tls_key("client1").exists());
        assert_eq!(sync.identities().await.unwrap(), vec!["client1"]);
        assert_eq!(fake.calls()[0], "build-client-full client1 nopass");
    }

    #[tokio::test]
    async fn test_attach_creates_client_keys_dir() {
        let (dir, mut layout) = setup();
        layout.client_keys_dir = dir.path().join("clients");
        let sync = OpenVpnSync::new(layout.clone(), dir.path().join("status.log"), Arc::new(FakePki::default()));

        assert!(sync.identities().await.unwrap().is_empty());
        sync.attach(&client("client1")).await.unwrap();

        assert!(layout.tls_key("client1").exists());
        assert_eq!(sync.identities().await.unwrap(), vec!["client1"]);
    }

    #[tokio::test]
    async fn test_detach_revokes_and_removes() {
        let (dir, layout) = setup();
        let fake = Arc::new(FakePki::default());
        let sync = OpenVpnSync::new(layout.clone(), dir.path().join("status.log"), fake.clone());

        sync.attach(&client("client1")).await.unwrap();
        sync.detach(&client("client1")).await.unwrap();

        assert!(!layout.private_key("client1").exists());
        assert!(!layout.tls_key("client1").exists());
        assert!(sync.identities().await.unwrap().is_empty());
        let calls = fake.calls();
        assert!(calls.contains(&"revoke client1".to_string()));
        assert!(calls.contains(&"gen-crl".to_string()));
    }

    #[tokio::test]
    async fn test_detach_without_revocation() {
        let (dir, layout) = setup();
        let fake = Arc::new(FakePki::default());
        let sync = OpenVpnSync::new(layout.clone(), dir.path().join("status.log"), fake.clone())
            .with_revocation(false);

        sync.attach(&client("client1")).await.unwrap();
        sync.detach(&client("client1")).await.unwrap();

        assert!(!layout.issued_cert("client1").exists());
        assert!(!fake.calls().iter().any(|c| c.starts_with("revoke")));
    }

    #[tokio::test]
    async fn test_detach_of_absent_client_succeeds() {
        let (dir, layout) = setup();
        let sync = OpenVpnSync::new(layout, dir.path().join("status.log"), Arc::new(FakePki::default()));

        sync.detach(&client("client9")).await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_key_failure_retires_certificate() {
        let (dir, layout) = setup();
        let fake = Arc::new(FakePki::default());
        fake.fail_on("tls-crypt-v2-client");
        let sync = OpenVpnSync::new(layout.clone(), dir.path().join("status.log"), fake.clone());

        let err = sync.attach(&client("client1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Command(_)));
        assert!(!layout.issued_cert("client1").exists());
        assert!(!layout.private_key("client1").exists());
        assert!(fake.calls().contains(&"revoke client1".to_string()));
    }

    #[tokio::test]
    async fn test_rejects_unsafe_names() {
        let (dir, layout) = setup();
        let fake = Arc::new(FakePki::default());
        let sync = OpenVpnSync::new(layout, dir.path().join("status.log"), fake.clone());

        let err = sync.attach(&client("../ca")).await.unwrap_err();
        assert!(matches!(err, SyncError::WrongIdentity(_)));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_parse_status_v1() {
        let log = "OpenVPN CLIENT LIST\nUpdated,2024-05-01 10:00:00\nCommon Name,Real Address,Bytes Received,Bytes Sent,Connected Since\nclient1,203.0.113.5:40000,100,200,2024-05-01 09:00:00\nclient3,203.0.113.6:40001,100,200,2024-05-01 09:30:00\nROUTING TABLE\nVirtual Address,Common Name,Real Address,Last Ref\n10.8.0.2,client1,203.0.113.5:40000,2024-05-01 10:00:00\nGLOBAL STATS\nMax bcast/mcast queue length,0\nEND\n";
        assert_eq!(parse_status_log(log), vec!["client1", "client3"]);
    }

    #[test]
    fn test_parse_status_v2() {
        let log = "TITLE,OpenVPN\nHEADER,CLIENT_LIST,Common Name,Real Address\nCLIENT_LIST,client2,203.0.113.5:40000,10.8.0.3\nHEADER,ROUTING_TABLE,Virtual Address\nROUTING_TABLE,10.8.0.3,client2\nEND\n";
        assert_eq!(parse_status_log(log), vec!["client2"]);
    }

    #[tokio::test]
    async fn test_sessions_use_log_mtime() {
        let (dir, layout) = setup();
        let status = dir.path().join("status.log");
        std::fs::write(&status, "Common Name,Real Address\nclient1,1.2.3.4:5\nROUTING TABLE\n").unwrap();
        let sync = OpenVpnSync::new(layout, &status, Arc::new(FakePki::default()));

        let sessions = sync.sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].peer_key, "client1");
        let age = Utc::now() - sessions[0].last_seen.unwrap();
        assert!(age.num_seconds() < 60);
    }

    #[tokio::test]
    async fn test_missing_status_log_is_empty() {
        let (dir, layout) = setup();
        let sync = OpenVpnSync::new(layout, dir.path().join("absent.log"), Arc::new(FakePki::default()));
        assert!(sync.sessions().await.unwrap().is_empty());
    }
}
