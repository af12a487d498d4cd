//! Test doubles shared by unit tests

use crate::command::{CommandError, CommandRunner, Invocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const SERVER_CONF: &str = "# managed by opensase\n[Interface]\nPrivateKey = c2VydmVyLXByaXZhdGU=\nAddress = 10.100.10.1/24\nListenPort = 51830\nJc = 4\n";

/// Writes a server-side WireGuard conf into `dir`.
pub fn write_server_conf(dir: &Path) -> PathBuf {
    let path = dir.join("awg0.conf");
    std::fs::write(&path, SERVER_CONF).unwrap();
    path
}

/// Simulates the `awg`/`wg` CLI and a live interface peer table.
#[derive(Default)]
pub struct FakeWireGuard {
    peers: Mutex<BTreeMap<String, (String, u64)>>,
    fail_on: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    keys: AtomicU64,
}

impl FakeWireGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn public_for(private_key: &str) -> String {
        format!("pub-{}", private_key.trim())
    }

    /// Fail every command whose command line contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.fail_on.lock().push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_on.lock().clear();
    }

    pub fn peer_keys(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn set_handshake(&self, public_key: &str, epoch: u64) {
        if let Some(peer) = self.peers.lock().get_mut(public_key) {
            peer.1 = epoch;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeWireGuard {
    async fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
        let line = invocation.to_string();
        self.calls.lock().push(line.clone());

        if self.fail_on.lock().iter().any(|p| line.contains(p.as_str())) {
            return Err(CommandError::Failed {
                program: invocation.program.clone(),
                code: Some(1),
                stderr: format!("injected failure: {line}"),
            });
        }

        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        let out = match args.as_slice() {
            ["genkey"] => format!("priv{}", self.keys.fetch_add(1, Ordering::SeqCst)),
            ["pubkey"] => Self::public_for(invocation.stdin.as_deref().unwrap_or_default()),
            ["set", _, "peer", key, "allowed-ips", ips] => {
                self.peers.lock().insert(key.to_string(), (ips.to_string(), 0));
                String::new()
            }
            ["set", _, "peer", key, "remove"] => {
                self.peers.lock().remove(*key);
                String::new()
            }
            ["show", _, "dump"] => {
                let mut out = String::from("c2VydmVyLXByaXZhdGU=\tc2VydmVyLXB1YmxpYw==\t51830\toff");
                for (key, (ips, handshake)) in self.peers.lock().iter() {
                    out.push_str(&format!("\n{key}\t(none)\t203.0.113.5:40000\t{ips}\t{handshake}\t100\t200\toff"));
                }
                out
            }
            _ => String::new(),
        };
        Ok(out)
    }
}
