//! Profile Records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Store-assigned profile id
pub type ProfileId = i64;

/// Identity of an issued credential; one variant per tunnel technology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Identity {
    WireGuard { public_key: String, address: IpAddr },
    Xray { uuid: Uuid, short_id: String },
    OpenVpn { name: String },
}

impl Identity {
    /// Key under which the enforcement system reports this peer
    pub fn peer_key(&self) -> String {
        match self {
            Identity::WireGuard { public_key, .. } => public_key.clone(),
            Identity::Xray { uuid, .. } => uuid.to_string(),
            Identity::OpenVpn { name } => name.clone(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Identity::WireGuard { .. } => "wireguard",
            Identity::Xray { .. } => "xray",
            Identity::OpenVpn { .. } => "openvpn",
        }
    }
}

/// A pool-allocated identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    Address(IpAddr),
    Name(String),
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Address(addr) => write!(f, "{}", addr),
            Slot::Name(name) => f.write_str(name),
        }
    }
}

/// Identity plus client-facing secret material
#[derive(Debug, Clone)]
pub struct Credential {
    pub identity: Identity,
    /// Opaque secret stored with the profile (WireGuard private key)
    pub secret: Option<String>,
}

/// Profile about to be persisted
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub credential: Credential,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One issued credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: ProfileId,
    pub identity: Identity,
    pub secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// Projection without secret material or keys
    pub fn summary(&self) -> ProfileSummary {
        let mut summary = ProfileSummary {
            id: self.id,
            vpn_address: None,
            name: None,
            uuid: None,
            short_id: None,
            created_at: self.created_at,
            expires_at: self.expires_at,
        };
        match &self.identity {
            Identity::WireGuard { address, .. } => summary.vpn_address = Some(address.to_string()),
            Identity::Xray { uuid, short_id } => {
                summary.uuid = Some(*uuid);
                summary.short_id = Some(short_id.clone());
            }
            Identity::OpenVpn { name } => summary.name = Some(name.clone()),
        }
        summary
    }
}

/// Public view of a profile, as listed by the API and reported upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: ProfileId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}
