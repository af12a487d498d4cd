//! Credential Generation
//!
//! Produces technology-appropriate credential material: a WireGuard key pair,
//! a VLESS UUID plus REALITY short id, or an OpenVPN client name. Failures
//! are fatal for the enclosing create and are never retried.

use crate::command::{CommandError, CommandRunner, Invocation};
use crate::profile::{Credential, Identity, Slot};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Generation errors
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("key tool failed: {0}")]
    Command(#[from] CommandError),

    #[error("key tool returned malformed output: {0}")]
    Malformed(String),

    #[error("generator needs a pool value of the right kind, got {0:?}")]
    MissingSlot(Option<Slot>),
}

/// Produces fresh credential material
#[async_trait]
pub trait CredentialGenerator: Send + Sync {
    /// `slot` is the value leased from the deployment's pool, if it has one.
    async fn generate(&self, slot: Option<&Slot>) -> Result<Credential, GenerateError>;
}

/// WireGuard key pair via the `wg`/`awg` CLI
pub struct CliKeyGenerator {
    cli: String,
    runner: Arc<dyn CommandRunner>,
}

impl CliKeyGenerator {
    pub fn new(cli: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cli: cli.into(), runner }
    }
}

#[async_trait]
impl CredentialGenerator for CliKeyGenerator {
    async fn generate(&self, slot: Option<&Slot>) -> Result<Credential, GenerateError> {
        let address = address_slot(slot)?;

        let private_key = self.runner.run(&Invocation::new(&self.cli, ["genkey"])).await?;
        if private_key.is_empty() {
            return Err(GenerateError::Malformed("empty private key".into()));
        }
        let public_key = self
            .runner
            .run(&Invocation::new(&self.cli, ["pubkey"]).stdin(format!("{private_key}\n")))
            .await?;
        if public_key.is_empty() {
            return Err(GenerateError::Malformed("empty public key".into()));
        }

        Ok(Credential {
            identity: Identity::WireGuard { public_key, address },
            secret: Some(private_key),
        })
    }
}

/// WireGuard key pair generated in-process with x25519
#[derive(Default)]
pub struct NativeKeyGenerator;

impl NativeKeyGenerator {
    fn keypair() -> WgKeyPair {
        let private = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
        let public = x25519_dalek::PublicKey::from(&private);
        WgKeyPair {
            private_key: BASE64.encode(private.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }
}

#[async_trait]
impl CredentialGenerator for NativeKeyGenerator {
    async fn generate(&self, slot: Option<&Slot>) -> Result<Credential, GenerateError> {
        let address = address_slot(slot)?;
        let keypair = Self::keypair();
        Ok(Credential {
            identity: Identity::WireGuard {
                public_key: keypair.public_key,
                address,
            },
            secret: Some(keypair.private_key),
        })
    }
}

struct WgKeyPair {
    private_key: String,
    public_key: String,
}

/// VLESS UUID plus an 8 hex digit REALITY short id
#[derive(Default)]
pub struct XrayIdGenerator;

impl XrayIdGenerator {
    fn short_id() -> String {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl CredentialGenerator for XrayIdGenerator {
    async fn generate(&self, _slot: Option<&Slot>) -> Result<Credential, GenerateError> {
        Ok(Credential {
            identity: Identity::Xray {
                uuid: Uuid::new_v4(),
                short_id: Self::short_id(),
            },
            secret: None,
        })
    }
}

/// OpenVPN client name taken from the pool; certificates are issued on attach
#[derive(Default)]
pub struct ClientNameGenerator;

#[async_trait]
impl CredentialGenerator for ClientNameGenerator {
    async fn generate(&self, slot: Option<&Slot>) -> Result<Credential, GenerateError> {
        match slot {
            Some(Slot::Name(name)) => Ok(Credential {
                identity: Identity::OpenVpn { name: name.clone() },
                secret: None,
            }),
            other => Err(GenerateError::MissingSlot(other.cloned())),
        }
    }
}

fn address_slot(slot: Option<&Slot>) -> Result<std::net::IpAddr, GenerateError> {
    match slot {
        Some(Slot::Address(address)) => Ok(*address),
        other => Err(GenerateError::MissingSlot(other.cloned())),
    }
}
