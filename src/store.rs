//! Profile Metadata Store
//!
//! `SQLite`-backed, uniquely-keyed records of issued credentials. The store
//! is the single source of truth for which credentials exist; a profile's
//! state is its presence or absence here.

use crate::profile::{Identity, NewProfile, Profile, ProfileId, Slot};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const SELECT_PROFILE: &str = "SELECT p.id, p.kind, p.name, p.public_key, p.private_key, p.address, p.uuid, p.short_id, p.created_at, e.expires_at
     FROM profiles p LEFT JOIN profile_expiry e ON e.profile_id = p.id";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate identity: {0}")]
    Duplicate(String),

    #[error("database connection unavailable")]
    Unavailable,
}

/// Profile store
///
/// Owns one connection. A connection-level failure drops it so that the
/// next operation reopens the database file.
#[derive(Clone)]
pub struct ProfileStore {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
}

impl ProfileStore {
    /// Opens or creates the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Self::connect(&path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: Some(path),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: None,
        })
    }

    fn connect(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            let path = self.path.as_ref().ok_or(StoreError::Unavailable)?;
            tracing::info!(path = %path.display(), "Reopening profile database");
            *guard = Some(Self::connect(path)?);
        }
        let conn = guard.as_mut().ok_or(StoreError::Unavailable)?;

        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_fault(&e) && self.path.is_some() {
                    tracing::warn!(error = %e, "Dropping faulty database connection");
                    *guard = None;
                }
                Err(classify(e))
            }
        }
    }

    /// Inserts a profile (and its expiry, if any) in one transaction.
    pub fn insert(&self, profile: &NewProfile) -> Result<Profile, StoreError> {
        let identity = &profile.credential.identity;
        let mut row = IdentityColumns::default();
        match identity {
            Identity::WireGuard { public_key, address } => {
                row.public_key = Some(public_key.clone());
                row.address = Some(address.to_string());
            }
            Identity::Xray { uuid, short_id } => {
                row.uuid = Some(uuid.to_string());
                row.short_id = Some(short_id.clone());
            }
            Identity::OpenVpn { name } => row.name = Some(name.clone()),
        }

        let id = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO profiles (kind, name, public_key, private_key, address, uuid, short_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    identity.kind(),
                    row.name,
                    row.public_key,
                    profile.credential.secret,
                    row.address,
                    row.uuid,
                    row.short_id,
                    profile.created_at.timestamp(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            if let Some(expires_at) = profile.expires_at {
                tx.execute(
                    "INSERT INTO profile_expiry (profile_id, expires_at) VALUES (?1, ?2)",
                    params![id, expires_at.timestamp()],
                )?;
            }
            tx.commit()?;
            Ok(id)
        })?;

        Ok(Profile {
            id,
            identity: identity.clone(),
            secret: profile.credential.secret.clone(),
            created_at: profile.created_at,
            expires_at: profile.expires_at,
        })
    }

    /// Reads a single profile.
    pub fn get(&self, id: ProfileId) -> Result<Option<Profile>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(&format!("{SELECT_PROFILE} WHERE p.id = ?1"), params![id], row_to_profile)
                .optional()
        })
    }

    /// All live profiles in id order.
    pub fn list(&self) -> Result<Vec<Profile>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_PROFILE} ORDER BY p.id ASC"))?;
            let profiles = stmt
                .query_map([], row_to_profile)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(profiles)
        })
    }

    /// Time-bounded profiles whose expiry is at or before `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Profile>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_PROFILE} WHERE e.expires_at <= ?1 ORDER BY e.expires_at ASC"
            ))?;
            let profiles = stmt
                .query_map(params![now.timestamp()], row_to_profile)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(profiles)
        })
    }

    /// Removes a profile. Returns `false` if it did not exist.
    pub fn delete(&self, id: ProfileId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM profile_expiry WHERE profile_id = ?1", params![id])?;
            let removed = tx.execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Pool values held by live profiles.
    pub fn slots(&self) -> Result<Vec<Slot>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT address, name FROM profiles WHERE address IS NOT NULL OR name IS NOT NULL",
            )?;
            let slots = stmt
                .query_map([], |row| {
                    let address: Option<String> = row.get(0)?;
                    let name: Option<String> = row.get(1)?;
                    match (address, name) {
                        (Some(address), _) => address
                            .parse::<IpAddr>()
                            .map(Slot::Address)
                            .map_err(|e| corrupt(0, e)),
                        (None, Some(name)) => Ok(Slot::Name(name)),
                        (None, None) => Err(corrupt(0, "profile without pool value")),
                    }
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(slots)
        })
    }
}

#[derive(Default)]
struct IdentityColumns {
    name: Option<String>,
    public_key: Option<String>,
    address: Option<String>,
    uuid: Option<String>,
    short_id: Option<String>,
}

fn row_to_profile(row: &Row<'_>) -> Result<Profile, rusqlite::Error> {
    let kind: String = row.get(1)?;
    let identity = match kind.as_str() {
        "wireguard" => {
            let address: String = row.get(5)?;
            Identity::WireGuard {
                public_key: row.get(3)?,
                address: address.parse().map_err(|e| corrupt(5, e))?,
            }
        }
        "xray" => {
            let uuid: String = row.get(6)?;
            Identity::Xray {
                uuid: Uuid::parse_str(&uuid).map_err(|e| corrupt(6, e))?,
                short_id: row.get(7)?,
            }
        }
        "openvpn" => Identity::OpenVpn { name: row.get(2)? },
        other => return Err(corrupt(1, format!("unknown profile kind {other}"))),
    };

    let created_at: i64 = row.get(8)?;
    let expires_at: Option<i64> = row.get(9)?;

    Ok(Profile {
        id: row.get(0)?,
        identity,
        secret: row.get(4)?,
        created_at: timestamp(8, created_at)?,
        expires_at: expires_at.map(|secs| timestamp(9, secs)).transpose()?,
    })
}

fn timestamp(column: usize, secs: i64) -> Result<DateTime<Utc>, rusqlite::Error> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| corrupt(column, format!("timestamp out of range: {secs}")))
}

fn corrupt(column: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err.into())
}

fn classify(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
            let detail = msg.clone().unwrap_or_else(|| err.to_string());
            if detail.contains("UNIQUE") || detail.contains("PRIMARY KEY") {
                StoreError::Duplicate(detail)
            } else {
                StoreError::Database(e)
            }
        }
        _ => StoreError::Database(e),
    }
}

fn is_connection_fault(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Credential;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(Utc::now().timestamp(), 0).unwrap()
    }

    fn wireguard(address: &str, key: &str) -> NewProfile {
        NewProfile {
            credential: Credential {
                identity: Identity::WireGuard {
                    public_key: key.into(),
                    address: address.parse().unwrap(),
                },
                secret: Some(format!("{key}-private")),
            },
            created_at: now(),
            expires_at: None,
        }
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let store = ProfileStore::in_memory().unwrap();
        let inserted = store.insert(&wireguard("10.0.0.2", "k1")).unwrap();

        let loaded = store.get(inserted.id).unwrap().unwrap();
        assert_eq!(loaded, inserted);
        assert_eq!(loaded.secret.as_deref(), Some("k1-private"));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let store = ProfileStore::in_memory().unwrap();
        store.insert(&wireguard("10.0.0.2", "k1")).unwrap();

        let err = store.insert(&wireguard("10.0.0.2", "k2")).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)), "got {err:?}");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let store = ProfileStore::in_memory().unwrap();
        let profile = store.insert(&wireguard("10.0.0.2", "k1")).unwrap();

        assert!(store.delete(profile.id).unwrap());
        assert!(!store.delete(profile.id).unwrap());
        assert!(!store.delete(4242).unwrap());
        assert!(store.get(profile.id).unwrap().is_none());
    }

    #[test]
    fn test_expired_only_returns_past_deadlines() {
        let store = ProfileStore::in_memory().unwrap();
        let mut past = wireguard("10.0.0.2", "k1");
        past.expires_at = Some(now() - Duration::minutes(5));
        let mut future = wireguard("10.0.0.3", "k2");
        future.expires_at = Some(now() + Duration::hours(1));
        let permanent = wireguard("10.0.0.4", "k3");

        let past = store.insert(&past).unwrap();
        store.insert(&future).unwrap();
        store.insert(&permanent).unwrap();

        let expired = store.expired(now()).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, past.id);
        assert_eq!(expired[0].expires_at, past.expires_at);
    }

    #[test]
    fn test_slots_and_kinds() {
        let store = ProfileStore::in_memory().unwrap();
        store.insert(&wireguard("10.0.0.2", "k1")).unwrap();
        store
            .insert(&NewProfile {
                credential: Credential {
                    identity: Identity::OpenVpn { name: "client1".into() },
                    secret: None,
                },
                created_at: now(),
                expires_at: None,
            })
            .unwrap();
        store
            .insert(&NewProfile {
                credential: Credential {
                    identity: Identity::Xray { uuid: Uuid::new_v4(), short_id: "deadbeef".into() },
                    secret: None,
                },
                created_at: now(),
                expires_at: None,
            })
            .unwrap();

        let slots = store.slots().unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.contains(&Slot::Address("10.0.0.2".parse().unwrap())));
        assert!(slots.contains(&Slot::Name("client1".into())));
        assert_eq!(store.list().unwrap().len(), 3);
    }

    #[test]
    fn test_file_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("profiles.db");
        let id = {
            let store = ProfileStore::open(&path).unwrap();
            store.insert(&wireguard("10.0.0.2", "k1")).unwrap().id
        };

        let store = ProfileStore::open(&path).unwrap();
        assert!(store.get(id).unwrap().is_some());
    }
}
