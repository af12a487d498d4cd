//! External System Synchronization
//!
//! The only code allowed to mutate the enforcement surface: the live
//! interface, the daemon's config document, or the PKI. Each backend
//! serializes its whole read-modify-write behind one per-deployment lock,
//! so concurrent attach/detach calls never interleave and no appended
//! entry is lost.
//!
//! ```text
//!   attach(identity)                     detach(identity)
//!        │                                    │
//!   ┌────▼──────────── lock ──────────────────▼────┐
//!   │ read + parse document                         │
//!   │ live change (peer add / remove, cert issue)   │
//!   │ patch document ── write temp ── rename        │
//!   │   └─ on failure: undo live change             │
//!   └────────────────────┬──────────────────────────┘
//!                        ▼
//!                 reload daemon ── failure ⇒ SyncOutcome::Degraded
//! ```

pub mod openvpn;
pub mod wireguard;
pub mod xray;

use crate::command::{CommandError, CommandRunner, Invocation};
use crate::profile::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use openvpn::OpenVpnSync;
pub use wireguard::WireGuardSync;
pub use xray::XraySync;

/// Synchronization errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("enforcement command failed: {0}")]
    Command(#[from] CommandError),

    #[error("config document {path} missing or unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config document corrupt: {0}")]
    Corrupt(String),

    #[error("identity not managed by this backend: {0:?}")]
    WrongIdentity(Identity),
}

/// Result of a successful attach/detach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Enforcement surface updated and daemon notified
    Applied,
    /// Document updated, but the daemon could not be told to reload
    Degraded(String),
}

impl SyncOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, SyncOutcome::Degraded(_))
    }
}

/// Liveness record reported by the enforcement system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    /// Same key as [`Identity::peer_key`]
    pub peer_key: String,
    /// Most recent observed activity
    pub last_seen: Option<DateTime<Utc>>,
}

/// Enforcement surface of one deployment
#[async_trait]
pub trait PeerSync: Send + Sync {
    /// Make the enforcement system accept `identity`.
    async fn attach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError>;

    /// Make the enforcement system reject `identity`. Detaching an identity
    /// that is already absent succeeds.
    async fn detach(&self, identity: &Identity) -> Result<SyncOutcome, SyncError>;

    /// Current sessions, for the liveness report.
    async fn sessions(&self) -> Result<Vec<PeerSession>, SyncError>;

    /// Peer keys present in the persisted document.
    async fn identities(&self) -> Result<Vec<String>, SyncError>;
}

pub(crate) async fn read_document(path: &Path) -> Result<String, SyncError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SyncError::Unreadable {
            path: path.to_path_buf(),
            source,
        })
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub(crate) async fn write_document(path: &Path, contents: &str) -> Result<(), SyncError> {
    let write_err = |source| SyncError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await.map_err(write_err)?;
    if let Ok(meta) = tokio::fs::metadata(path).await {
        tokio::fs::set_permissions(&tmp, meta.permissions())
            .await
            .map_err(write_err)?;
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(e));
    }
    Ok(())
}

/// Issue the configured reload command. Never fails the caller.
pub(crate) async fn reload(runner: &dyn CommandRunner, argv: Option<&[String]>) -> SyncOutcome {
    let Some(invocation) = argv.and_then(Invocation::from_argv) else {
        return SyncOutcome::Applied;
    };
    match runner.run(&invocation).await {
        Ok(_) => {
            tracing::debug!(command = %invocation, "Daemon reloaded");
            SyncOutcome::Applied
        }
        Err(e) => {
            tracing::warn!(command = %invocation, error = %e, "Daemon reload failed; config updated but not applied");
            SyncOutcome::Degraded(e.to_string())
        }
    }
}
