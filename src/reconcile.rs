//! Reconciliation Loop
//!
//! One background task that, every interval, expires profiles past their
//! TTL, works out which profiles have live sessions and reports the result
//! upstream. The three steps are independent: a failure in one is logged
//! and the others still run. When the profile list is unavailable the
//! report still carries the static deployment fields with no profiles.
//! Nothing here propagates errors; the next tick is the retry.

use crate::lifecycle::ProfileManager;
use crate::profile::{Profile, ProfileId};
use crate::report::{Reporter, StatusReport};
use crate::sync::PeerSession;
use crate::ProvisionError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub expired: Vec<ProfileId>,
    pub expiry_failures: usize,
    pub active: Vec<ProfileId>,
    pub reported: bool,
}

/// Periodic expiry, liveness and reporting
pub struct Reconciler {
    manager: Arc<ProfileManager>,
    reporter: Option<Reporter>,
    /// Static report fields; profiles and active ids are filled per tick
    base: StatusReport,
    interval: Duration,
    freshness: Duration,
}

impl Reconciler {
    pub fn new(manager: Arc<ProfileManager>, base: StatusReport) -> Self {
        Self {
            manager,
            reporter: None,
            base,
            interval: Duration::from_secs(60),
            freshness: Duration::from_secs(180),
        }
    }

    pub fn with_reporter(mut self, reporter: Option<Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Tick until `shutdown` flips to true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            reporting = self.reporter.is_some(),
            "Starting reconciler"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        break;
                    }
                }
            }
        }
        tracing::info!("Reconciler stopped");
    }

    pub async fn tick(&self) -> TickSummary {
        self.tick_at(Utc::now()).await
    }

    async fn tick_at(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        self.sweep_expired(now, &mut summary).await;

        let profiles = match self.manager.list() {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list profiles; reporting without them");
                Vec::new()
            }
        };

        let sessions = match self.manager.sync().sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot read peer sessions");
                Vec::new()
            }
        };
        summary.active = active_profiles(&profiles, &sessions, now, self.freshness);

        if let Some(reporter) = &self.reporter {
            let report = StatusReport {
                profiles: profiles.iter().map(Profile::summary).collect(),
                active_profile_ids: summary.active.clone(),
                ..self.base.clone()
            };
            match reporter.send(&report).await {
                Ok(()) => summary.reported = true,
                Err(e) => tracing::warn!(url = reporter.url(), error = %e, "Status report failed"),
            }
        }

        tracing::debug!(
            expired = summary.expired.len(),
            active = summary.active.len(),
            total = profiles.len(),
            "Reconciliation tick done"
        );
        summary
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, summary: &mut TickSummary) {
        let expired = match self.manager.expired(now) {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot query expired profiles");
                return;
            }
        };

        for profile in expired {
            match self.manager.delete(profile.id).await {
                Ok(outcome) => {
                    if outcome.is_degraded() {
                        tracing::warn!(profile_id = profile.id, "Expired profile removed, daemon reload pending");
                    }
                    summary.expired.push(profile.id);
                }
                // deleted through the API since the query
                Err(ProvisionError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(profile_id = profile.id, error = %e, "Failed to expire profile; retrying next tick");
                    summary.expiry_failures += 1;
                }
            }
        }
    }
}

/// Ids of profiles with a session seen within `freshness` of `now`
fn active_profiles(
    profiles: &[Profile],
    sessions: &[PeerSession],
    now: DateTime<Utc>,
    freshness: Duration,
) -> Vec<ProfileId> {
    let window = chrono::Duration::from_std(freshness).unwrap_or_else(|_| chrono::Duration::days(365));
    let fresh: HashMap<&str, DateTime<Utc>> = sessions
        .iter()
        .filter_map(|s| s.last_seen.map(|seen| (s.peer_key.as_str(), seen)))
        .filter(|(_, seen)| now.signed_duration_since(*seen) < window)
        .collect();

    profiles
        .iter()
        .filter(|p| fresh.contains_key(p.identity.peer_key().as_str()))
        .map(|p| p.id)
        .collect()
}
