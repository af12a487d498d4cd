//! OpenSASE Provisioner - VPN Peer Credential Service
//!
//! Issues and revokes peer credentials for one tunnel technology per
//! deployment (WireGuard/AmneziaWG, Xray VLESS+REALITY or OpenVPN), keeping
//! the address pool, the enforcement daemon and the profile database in
//! lockstep.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                       OPENSASE PROVISIONER                         │
//! │                                                                    │
//! │   HTTP API (axum)                      Reconciler (interval task)  │
//! │   create │ list │ config │ delete      expiry │ liveness │ report  │
//! │        └──────────────┬─────────────────────┘                      │
//! │  ┌────────────────────▼─────────────────────────────────────────┐  │
//! │  │                 PROFILE MANAGER (sagas)                      │  │
//! │  │  pool lease → generate → attach → persist   (undo on fail)   │  │
//! │  └───┬──────────────┬──────────────┬──────────────┬─────────────┘  │
//! │      │              │              │              │                │
//! │  ┌───▼────┐   ┌─────▼─────┐  ┌─────▼──────┐  ┌────▼─────┐          │
//! │  │  POOL  │   │  KEYGEN   │  │    SYNC    │  │  STORE   │          │
//! │  │ leases │   │ x25519/cli│  │ wg│xray│ovpn│  │ SQLite   │          │
//! │  └────────┘   └───────────┘  └─────┬──────┘  └──────────┘          │
//! └────────────────────────────────────┼───────────────────────────────┘
//!                                      ▼
//!                      awg/wg · xray config.json · easy-rsa PKI
//! ```

pub mod api;
pub mod command;
pub mod config;
pub mod keygen;
pub mod lifecycle;
pub mod pool;
pub mod profile;
pub mod reconcile;
pub mod render;
pub mod report;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use command::{CommandRunner, SystemCommandRunner};
use keygen::{
    ClientNameGenerator, CliKeyGenerator, CredentialGenerator, GenerateError, NativeKeyGenerator, XrayIdGenerator,
};
use pool::{PoolError, PoolSpace, ResourcePool};
use render::{RenderError, Renderer, Template};
use report::{Reporter, StatusReport};
use store::{ProfileStore, StoreError};
use sync::openvpn::PkiLayout;
use sync::{OpenVpnSync, PeerSync, SyncError, WireGuardSync, XraySync};

pub use config::{BackendConfig, ConfigError, ProvisionerConfig};
pub use lifecycle::{CreatedProfile, ProfileManager};
pub use profile::{Identity, Profile, ProfileId, ProfileSummary};
pub use reconcile::Reconciler;

/// Provisioner error types
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid or missing token")]
    Unauthorized,
    #[error("profile {0} not found")]
    NotFound(ProfileId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("address pool exhausted ({capacity} values)")]
    PoolExhausted { capacity: u64 },
    #[error("credential generation failed: {0}")]
    GenerationFailed(#[from] GenerateError),
    #[error("external sync failed: {0}")]
    ExternalSync(SyncError),
    #[error("config updated but daemon not reloaded: {0}")]
    SyncDegraded(String),
    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),
    #[error("external config corrupt: {0}")]
    ConfigCorrupt(String),
    #[error("cannot render config: {0}")]
    Render(#[from] RenderError),
    #[error("metadata store error: {0}")]
    Store(StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SyncError> for ProvisionError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Corrupt(detail) => ProvisionError::ConfigCorrupt(detail),
            other => ProvisionError::ExternalSync(other),
        }
    }
}

impl From<StoreError> for ProvisionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(detail) => ProvisionError::DuplicateIdentity(detail),
            other => ProvisionError::Store(other),
        }
    }
}

impl From<PoolError> for ProvisionError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted { capacity } => ProvisionError::PoolExhausted { capacity },
            PoolError::Store(e) => e.into(),
        }
    }
}

/// One deployment: API server plus reconciler over a shared manager
pub struct Provisioner {
    config: ProvisionerConfig,
    manager: Arc<ProfileManager>,
    reconciler: Reconciler,
}

impl Provisioner {
    /// Assemble a deployment that runs real host commands
    pub fn from_config(config: ProvisionerConfig) -> Result<Self, ProvisionError> {
        let runner = Arc::new(SystemCommandRunner::new(config.command_timeout()));
        Self::with_runner(config, runner)
    }

    /// Assemble a deployment around `runner`
    pub fn with_runner(config: ProvisionerConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, ProvisionError> {
        config.validate()?;

        let store = ProfileStore::open(&config.database_path)?;
        let server = config.server.clone();

        let mut base = StatusReport {
            api_key: config.api_token.clone(),
            backend: config.backend.name().to_string(),
            wg_interface: None,
            server_public_key: server.public_key.clone(),
            server_endpoint_ip: server.endpoint_ip.clone(),
            server_endpoint_port: server.endpoint_port,
            vpn_network: None,
            dns_servers: server.dns_servers.clone(),
            profiles: Vec::new(),
            active_profile_ids: Vec::new(),
        };

        let (pool, generator, sync, template): (
            Option<ResourcePool>,
            Arc<dyn CredentialGenerator>,
            Arc<dyn PeerSync>,
            Template,
        ) = match &config.backend {
            BackendConfig::WireGuard(wg) => {
                let generator: Arc<dyn CredentialGenerator> = match wg.keygen {
                    config::KeygenMode::Cli => Arc::new(CliKeyGenerator::new(&wg.cli, runner.clone())),
                    config::KeygenMode::Native => Arc::new(NativeKeyGenerator),
                };
                base.wg_interface = Some(wg.interface.clone());
                base.vpn_network = Some(wg.vpn_network.clone());
                (
                    Some(ResourcePool::new(PoolSpace::Addresses(wg.network()?))),
                    generator,
                    Arc::new(
                        WireGuardSync::new(&wg.interface, &wg.cli, &wg.config_path, runner)
                            .with_reload(wg.reload_command.clone()),
                    ),
                    Template::WireGuard {
                        obfuscation: wg.obfuscation.clone(),
                        keepalive_secs: wg.keepalive_secs,
                    },
                )
            }
            BackendConfig::Xray(xray) => (
                None,
                Arc::new(XrayIdGenerator),
                Arc::new(
                    XraySync::new(&xray.config_path, runner)
                        .with_inbound_tag(xray.inbound_tag.clone())
                        .with_flow(&xray.flow)
                        .with_reload(xray.reload_command.clone()),
                ),
                Template::Xray {
                    sni: xray.sni.clone(),
                    fingerprint: xray.fingerprint.clone(),
                    flow: xray.flow.clone(),
                },
            ),
            BackendConfig::OpenVpn(ovpn) => {
                let layout = PkiLayout {
                    easyrsa_dir: ovpn.easyrsa_dir.clone(),
                    tls_crypt_v2_server_key: ovpn.tls_crypt_v2_server_key.clone(),
                    client_keys_dir: ovpn.client_keys_dir.clone(),
                };
                (
                    Some(ResourcePool::new(PoolSpace::Names {
                        prefix: ovpn.client_prefix.clone(),
                        limit: ovpn.max_clients,
                    })),
                    Arc::new(ClientNameGenerator),
                    Arc::new(
                        OpenVpnSync::new(layout.clone(), &ovpn.status_log, runner)
                            .with_revocation(ovpn.revoke_on_delete),
                    ),
                    Template::OpenVpn {
                        layout,
                        proto: ovpn.proto.clone(),
                        cipher: ovpn.cipher.clone(),
                    },
                )
            }
        };

        let manager = Arc::new(ProfileManager::new(
            pool,
            generator,
            sync,
            store,
            Renderer::new(server, template),
        ));

        let reporter = match &config.reporter.url {
            Some(url) => Some(
                Reporter::new(url, std::time::Duration::from_secs(config.reporter.timeout_secs))
                    .map_err(|e| ConfigError::Invalid(format!("reporter: {e}")))?,
            ),
            None => None,
        };
        let reconciler = Reconciler::new(manager.clone(), base)
            .with_reporter(reporter)
            .with_interval(std::time::Duration::from_secs(config.reporter.interval_secs))
            .with_freshness(std::time::Duration::from_secs(config.reporter.freshness_secs));

        tracing::info!(
            backend = config.backend.name(),
            database = %config.database_path.display(),
            "Provisioner assembled"
        );

        Ok(Self {
            config,
            manager,
            reconciler,
        })
    }

    pub fn manager(&self) -> &Arc<ProfileManager> {
        &self.manager
    }

    /// Serve the API and run the reconciler until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), ProvisionError> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ProvisionError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let reconciler = tokio::spawn(self.reconciler.run(stop_rx));

        let state = api::AppState::new(self.manager.clone(), &self.config.api_token);
        let result = api::serve(listener, state, async move {
            shutdown.await;
            tracing::info!("Shutdown requested");
            let _ = stop_tx.send(true);
        })
        .await;

        // the sender is gone by now, so the reconciler exits even if serving failed
        if let Err(e) = reconciler.await {
            tracing::error!(error = %e, "Reconciler task panicked");
        }
        result
    }
}
