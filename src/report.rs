//! Upstream Status Reporting

use crate::profile::{ProfileId, ProfileSummary};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Reporting errors
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("collector request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector answered {0}")]
    Status(reqwest::StatusCode),
}

/// Snapshot posted to the collector on every reconciliation tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub api_key: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wg_interface: Option<String>,
    pub server_public_key: String,
    pub server_endpoint_ip: String,
    pub server_endpoint_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_network: Option<String>,
    pub dns_servers: Vec<String>,
    pub profiles: Vec<ProfileSummary>,
    pub active_profile_ids: Vec<ProfileId>,
}

/// Posts status reports to the collector
#[derive(Clone)]
pub struct Reporter {
    client: reqwest::Client,
    url: String,
}

impl Reporter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&self, report: &StatusReport) -> Result<(), ReportError> {
        let resp = self.client.post(&self.url).json(report).send().await?;

        if resp.status().is_success() {
            tracing::debug!(
                status = %resp.status(),
                profiles = report.profiles.len(),
                active = report.active_profile_ids.len(),
                "Status report delivered"
            );
            Ok(())
        } else {
            Err(ReportError::Status(resp.status()))
        }
    }
}
