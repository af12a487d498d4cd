//! Profile Lifecycle
//!
//! Create and delete are sagas over the pool, the generator, the
//! enforcement surface and the store. Each completed step is compensated
//! when a later one fails, so a failed create leaves no trace anywhere and
//! a failed delete leaves the profile fully intact.

use crate::keygen::CredentialGenerator;
use crate::pool::{Lease, ResourcePool};
use crate::profile::{NewProfile, Profile, ProfileId};
use crate::render::{RenderedConfig, Renderer};
use crate::store::ProfileStore;
use crate::sync::{PeerSync, SyncOutcome};
use crate::ProvisionError;
use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Progress of a create saga, for logging where it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateStage {
    Start,
    Allocated,
    Synced,
    Persisted,
}

/// A freshly issued profile
#[derive(Debug, Clone)]
pub struct CreatedProfile {
    /// Includes the secret; only ever returned to the creating caller
    pub profile: Profile,
    pub outcome: SyncOutcome,
}

/// Orchestrates profile creation and deletion
pub struct ProfileManager {
    pool: Option<ResourcePool>,
    generator: Arc<dyn CredentialGenerator>,
    sync: Arc<dyn PeerSync>,
    store: ProfileStore,
    renderer: Renderer,
}

impl ProfileManager {
    pub fn new(
        pool: Option<ResourcePool>,
        generator: Arc<dyn CredentialGenerator>,
        sync: Arc<dyn PeerSync>,
        store: ProfileStore,
        renderer: Renderer,
    ) -> Self {
        Self {
            pool,
            generator,
            sync,
            store,
            renderer,
        }
    }

    pub fn sync(&self) -> &Arc<dyn PeerSync> {
        &self.sync
    }

    /// Issue a new profile, optionally expiring `ttl` after creation.
    pub async fn create(&self, ttl: Option<Duration>) -> Result<CreatedProfile, ProvisionError> {
        let created_at = now_secs();
        let expires_at = ttl.map(|ttl| expiry_after(created_at, ttl)).transpose()?;

        let mut stage = CreateStage::Start;
        let result = self.create_inner(created_at, expires_at, &mut stage).await;
        match &result {
            Ok(created) => {
                tracing::info!(
                    profile_id = created.profile.id,
                    kind = created.profile.identity.kind(),
                    degraded = created.outcome.is_degraded(),
                    "Profile created"
                );
            }
            Err(e) => tracing::warn!(stage = ?stage, error = %e, "Profile creation failed"),
        }
        result
    }

    async fn create_inner(
        &self,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        stage: &mut CreateStage,
    ) -> Result<CreatedProfile, ProvisionError> {
        // held until the profile is persisted or the saga is abandoned
        let lease = self.pool.as_ref().map(|pool| pool.allocate(&self.store)).transpose()?;
        *stage = CreateStage::Allocated;

        let credential = self.generator.generate(lease.as_ref().map(Lease::value)).await?;

        let outcome = self.sync.attach(&credential.identity).await?;
        *stage = CreateStage::Synced;

        let new = NewProfile {
            credential,
            created_at,
            expires_at,
        };

        let profile = match self.store.insert(&new) {
            Ok(profile) => profile,
            Err(e) => {
                let identity = &new.credential.identity;
                if let Err(undo) = self.sync.detach(identity).await {
                    tracing::error!(
                        peer = %identity.peer_key(),
                        error = %undo,
                        "Compensating detach failed; peer attached without a profile"
                    );
                }
                return Err(e.into());
            }
        };
        *stage = CreateStage::Persisted;
        drop(lease);

        Ok(CreatedProfile { profile, outcome })
    }

    /// Revoke a profile. The profile is only forgotten once the
    /// enforcement system has dropped it.
    pub async fn delete(&self, id: ProfileId) -> Result<SyncOutcome, ProvisionError> {
        let profile = self.store.get(id)?.ok_or(ProvisionError::NotFound(id))?;

        let outcome = self.sync.detach(&profile.identity).await.map_err(|e| {
            tracing::warn!(profile_id = id, error = %e, "Detach failed, profile kept");
            e
        })?;

        if !self.store.delete(id)? {
            // a concurrent delete won the race after both detached
            return Err(ProvisionError::NotFound(id));
        }
        tracing::info!(profile_id = id, degraded = outcome.is_degraded(), "Profile deleted");
        Ok(outcome)
    }

    pub fn get(&self, id: ProfileId) -> Result<Profile, ProvisionError> {
        self.store.get(id)?.ok_or(ProvisionError::NotFound(id))
    }

    pub fn list(&self) -> Result<Vec<Profile>, ProvisionError> {
        Ok(self.store.list()?)
    }

    /// Profiles whose expiry has passed at `now`
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Profile>, ProvisionError> {
        Ok(self.store.expired(now)?)
    }

    pub async fn render(&self, id: ProfileId) -> Result<RenderedConfig, ProvisionError> {
        let profile = self.get(id)?;
        Ok(self.renderer.render(&profile).await?)
    }
}

fn expiry_after(created_at: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, ProvisionError> {
    if ttl.is_zero() {
        return Err(ProvisionError::InvalidRequest("ttl must be positive".into()));
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .ok_or_else(|| ProvisionError::InvalidRequest("ttl out of range".into()))
}

/// Current time at the store's one-second resolution
fn now_secs() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}
