//! Structured-data-store synchronization job.

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::*;

use crate::context::OrchestratorContext;
use crate::error::JobError;
use crate::import_service::parse_base_url;
use crate::{JobKind, SdsSyncSettings};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub elements_updated: usize,
    pub files_changed: usize,
}

/// Pushes the project's structured data elements into its content files.
#[async_trait]
pub trait SdsSynchronizer: Send + Sync {
    async fn synchronize(&self, project_id: &str) -> Result<SyncReport, Error>;

    async fn invalidate_caches(&self, project_id: &str) -> Result<(), Error>;
}

/// Talks to the content service that owns the project data stores.
pub struct HttpSdsSynchronizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSdsSynchronizer {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, Error> {
        let base_url = parse_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("importq/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpSdsSynchronizer { client, base_url })
    }

    async fn post(&self, path: &str, project_id: &str) -> Result<reqwest::Response, Error> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(message = "Calling content service", url = %url, project_id = project_id);
        let response = self
            .client
            .post(&url)
            .query(&[("projectId", project_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("{} returned {}", url, response.status()));
        }
        Ok(response)
    }
}

#[async_trait]
impl SdsSynchronizer for HttpSdsSynchronizer {
    async fn synchronize(&self, project_id: &str) -> Result<SyncReport, Error> {
        Ok(self.post("sds/sync", project_id).await?.json().await?)
    }

    async fn invalidate_caches(&self, project_id: &str) -> Result<(), Error> {
        self.post("cache/invalidate", project_id).await?;
        Ok(())
    }
}

async fn synchronize(ctx: &OrchestratorContext, project_id: &str) -> Result<SyncReport, Error> {
    let report = ctx.synchronizer.synchronize(project_id).await?;
    ctx.synchronizer.invalidate_caches(project_id).await?;
    Ok(report)
}

#[instrument(skip(ctx, settings), fields(run_id = %settings.run_id, project_id = %settings.project_id))]
pub async fn run(ctx: &OrchestratorContext, settings: SdsSyncSettings) -> Result<(), JobError> {
    let run_id = settings.run_id;
    ctx.ensure_registered(JobKind::SdsSync, run_id, &settings.project_id);

    let _running = ctx.state.running(JobKind::SdsSync, &settings.project_id);
    if settings.combined_with_erp_import {
        ctx.registry.set_progress(run_id, 0.5);
    }
    ctx.registry.add_log(run_id, "Starting SDS synchronization");

    let outcome = match synchronize(ctx, &settings.project_id).await {
        Ok(report) => {
            info!(
                message = "SDS sync succeeded",
                elements_updated = report.elements_updated,
                files_changed = report.files_changed
            );
            ctx.registry.set_progress(run_id, 1.0);
            ctx.registry.add_log(
                run_id,
                format!(
                    "Synchronized {} structured data elements in {} files",
                    report.elements_updated, report.files_changed
                ),
            );
            Ok(())
        }
        Err(err) => {
            error!(message = "SDS sync failed", error = ?err);
            let err = JobError::Sync(format!("{err:#}"));
            ctx.registry.add_log(run_id, err.to_string());
            Err(err)
        }
    };

    ctx.finalize_run(run_id, outcome.is_ok()).await;
    outcome
}
