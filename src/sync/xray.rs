//! Xray (VLESS + REALITY) client synchronization
//!
//! Clients live in the daemon's JSON config; the daemon only picks them up
//! after a restart, so every change ends with the reload command.

use super::{read_document, reload, write_document, PeerSession, PeerSync, SyncError, SyncOutcome};
use crate::command::CommandRunner;
use crate::profile::Identity;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Xray synchronizer
pub struct XraySync {
    config_path: PathBuf,
    inbound_tag: Option<String>,
    flow: String,
    reload_command: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
}

impl XraySync {
    pub fn new(config_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config_path: config_path.into(),
            inbound_tag: None,
            flow: "xtls-rprx-vision".into(),
            reload_command: vec!["systemctl".into(), "restart".into(), "xray".into()],
            runner,
            lock: Mutex::new(()),
        }
    }

    pub fn with_inbound_tag(mut self, tag: Option<String>) -> Self {
        self.inbound_tag = tag;
        self
    }

    pub fn with_flow(mut self, flow: impl Into<String>) -> Self {
        self.flow = flow.into();
        self
    }

    pub fn with_reload(mut self, argv: Vec<String>) -> Self {
        self.reload_command = argv;
        self
    }

    async fn load(&self) -> Result<Value, SyncError> {
        let text = read_document(&self.config_path).await?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| SyncError::Corrupt(format!("{}: {e}", self.config_path.display())))?;
        if !doc.is_object() {
            return Err(SyncError::Corrupt("top level is not an object".into()));
        }
        Ok(doc)
    }

    async fn store(&self, doc: &Value) -> Result<(), SyncError> {
        let mut text = serde_json::to_string_pretty(doc)
            .map_err(|e| SyncError::Corrupt(e.to_string()))?;
        text.push('\n');
        write_document(&self.config_path, &text).await
    }

    /// The inbound carrying our clients: by tag when configured, else the first.
    fn inbound<'a>(&self, doc: &'a mut Value) -> Result<&'a mut Map<String, Value>, SyncError> {
        let inbounds = doc
            .get_mut("inbounds")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| SyncError::Corrupt("missing `inbounds` array".into()))?;

        let inbound = match &self.inbound_tag {
            Some(tag) => inbounds
                .iter_mut()
                .find(|i| i.get("tag").and_then(Value::as_str) == Some(tag.as_str()))
                .ok_or_else(|| SyncError::Corrupt(format!("no inbound tagged `{tag}`")))?,
            None => inbounds
                .first_mut()
                .ok_or_else(|| SyncError::Corrupt("`inbounds` is empty".into()))?,
        };

        inbound
            .as_object_mut()
            .ok_or_else(|| SyncError::Corrupt("inbound is not an object".into()))
    }
}

/// Walk `path` below `root`, creating empty objects for missing keys.
fn object_at<'a>(
    root: &'a mut Map<String, Value>,
    path: &[&str],
) -> Result<&'a mut Map<String, Value>, SyncError> {
    let mut node = root;
    for key in path {
        node = node
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| SyncError::Corrupt(format!("`{key}` is not an object")))?;
    }
    Ok(node)
}

fn array_at<'a>(parent: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Vec<Value>, SyncError> {
    parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| SyncError::Corrupt(format!("`{key}` is not an array")))
}

/// Like [`object_at`] but never inserts; `None` when any key is absent.
fn existing_array<'a>(root: &'a mut Map<String, Value>, path: &[&str], key: &str) -> Option<&'a mut Vec<Value>> {
    let mut node = root;
    for k in path {
        node = node.get_mut(*k)?.as_object_mut()?;
    }
    node.get_mut(key)?.as_array_mut()
}

#[async_trait]
impl PeerSync for XraySync {
    async fn attach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError> {
        let Identity::Xray { uuid, short_id } = identity else {
            return Err(SyncError::WrongIdentity(identity.clone()));
        };

        {
            let _guard = self.lock.lock().await;
            let mut doc = self.load().await?;
            let inbound = self.inbound(&mut doc)?;

            let id = uuid.to_string();
            let clients = array_at(object_at(inbound, &["settings"])?, "clients")?;
            clients.retain(|c| c.get("id").and_then(Value::as_str) != Some(id.as_str()));
            clients.push(json!({ "id": id, "flow": self.flow }));

            let short_ids = array_at(object_at(inbound, &["streamSettings", "realitySettings"])?, "shortIds")?;
            if !short_ids.iter().any(|s| s.as_str() == Some(short_id.as_str())) {
                short_ids.push(Value::String(short_id.clone()));
            }

            self.store(&doc).await?;
        }

        tracing::info!(uuid = %uuid, "Client added to xray config");
        Ok(reload(self.runner.as_ref(), Some(self.reload_command.as_slice())).await)
    }

    async fn detach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError> {
        let Identity::Xray { uuid, short_id } = identity else {
            return Err(SyncError::WrongIdentity(identity.clone()));
        };

        {
            let _guard = self.lock.lock().await;
            let mut doc = self.load().await?;
            let inbound = self.inbound(&mut doc)?;

            let id = uuid.to_string();
            if let Some(clients) = existing_array(inbound, &["settings"], "clients") {
                clients.retain(|c| c.get("id").and_then(Value::as_str) != Some(id.as_str()));
            }
            if let Some(short_ids) = existing_array(inbound, &["streamSettings", "realitySettings"], "shortIds") {
                short_ids.retain(|s| s.as_str() != Some(short_id.as_str()));
            }

            self.store(&doc).await?;
        }

        tracing::info!(uuid = %uuid, "Client removed from xray config");
        Ok(reload(self.runner.as_ref(), Some(self.reload_command.as_slice())).await)
    }

    async fn sessions(&self) -> Result<Vec<PeerSession>, SyncError> {
        // xray exposes no per-client handshake data without its stats API
        Ok(Vec::new())
    }

    async fn identities(&self) -> Result<Vec<String>, SyncError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let inbound = self.inbound(&mut doc)?;
        Ok(existing_array(inbound, &["settings"], "clients")
            .map(|clients| {
                clients
                    .iter()
                    .filter_map(|c| c.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}
