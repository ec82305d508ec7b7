//! The chain orchestrator, per spec.md §4.9: a named lock around the
//! ingest → rule-match → export → poll → reidentify chain, plus the
//! periodic statistics-sampling job. All state the chain needs to resume
//! lives in the catalog; the only in-memory state carried between runs is
//! the ingest scanner's stability snapshot, which is an optimization (it
//! saves a database round trip per series) rather than a correctness
//! requirement — a restart just means the next pass treats every series as
//! newly seen for one stability check.

use crate::catalog::{CatalogRepo, ProcessingStatus};
use crate::error::StageOutcome;
use crate::http_client::RemoteSegmentationClient;
use crate::ingest::{scan_once, SeriesSnapshot};
use crate::rules::run_rule_match_for_series;
use crate::token::TokenManager;
use crate::{export, poll, reidentify};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const CHAIN_LOCK_NAME: &str = "dicom_processing_chain";

/// Carried by the caller across successive `run_once` calls; not persisted.
#[derive(Default)]
pub struct ChainState {
    snapshots: HashMap<String, SeriesSnapshot>,
    last_scan: Option<Instant>,
    scan_interval: Duration,
}

impl ChainState {
    pub fn new(scan_interval: Duration) -> Self {
        Self { snapshots: HashMap::new(), last_scan: None, scan_interval }
    }
}

/// Run one full pass of the chain under the exclusive lock, per spec.md
/// §4.9 and §3 invariant 6. Returns `false` without doing any work if the
/// lock is held by another (non-expired) orchestrator process.
pub async fn run_once(
    repo: &CatalogRepo,
    client: &reqwest::Client,
    state: &mut ChainState,
    lock_duration: Duration,
) -> Result<bool, sqlx::Error> {
    let chain_id = uuid::Uuid::new_v4().to_string();
    let acquired = repo
        .try_acquire_chain_lock(CHAIN_LOCK_NAME, &chain_id, "draw-client", lock_duration.as_secs() as i64)
        .await?;
    if !acquired {
        tracing::debug!("chain lock held by another process, skipping this pass");
        return Ok(false);
    }

    let result = run_chain(repo, client, state).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "chain pass ended with an unrecoverable error");
    }
    repo.release_chain_lock(CHAIN_LOCK_NAME).await?;
    Ok(true)
}

async fn run_chain(
    repo: &CatalogRepo,
    client: &reqwest::Client,
    state: &mut ChainState,
) -> Result<(), sqlx::Error> {
    let config = repo.load_system_configuration().await?;
    let tokens = TokenManager::new(client.clone(), repo.clone());
    let remote = RemoteSegmentationClient::new(
        client.clone(),
        config.base_url.clone(),
        config.upload_endpoint.clone(),
        config.status_endpoint.clone(),
        config.download_endpoint.clone(),
        config.notify_endpoint.clone(),
    );

    // Stage E: ingest.
    let scan_interval_elapsed = state.last_scan.is_none_or(|t| t.elapsed() >= state.scan_interval);
    match scan_once(
        repo,
        Utf8Path::new(&config.ingest_root),
        config.pull_start_at,
        config.study_date_based_filtering,
        &state.snapshots,
        scan_interval_elapsed,
    )
    .await
    {
        Ok(outcome) => {
            tracing::info!(files_seen = outcome.files_seen, errors = outcome.errors, "ingest pass complete");
            state.snapshots = outcome.snapshots;
            if scan_interval_elapsed {
                state.last_scan = Some(Instant::now());
            }
        }
        Err(e) => tracing::warn!(error = %e, "ingest pass failed"),
    }

    // Stage D: rule match, one series at a time per spec.md §5 "no
    // concurrency across stages for the same series" — across series this
    // loop is sequential too, which is a simplification the orchestrator's
    // single worker makes deliberately (spec.md §5 "Orchestrator pool:
    // single worker").
    for series in repo.series_in_status(ProcessingStatus::Unprocessed).await? {
        let Some(instance_path) = first_instance_path(repo, series.id).await? else {
            continue;
        };
        match run_rule_match_for_series(repo, series.id, &instance_path).await {
            StageOutcome::Success(status) => {
                tracing::info!(series_id = series.id, ?status, "rule match complete")
            }
            StageOutcome::TerminalFailure(e) => {
                tracing::warn!(series_id = series.id, error = %e, "rule match failed")
            }
            _ => {}
        }
    }

    // Stage F: export. Series left in MULTIPLE_RULES_MATCHED await operator
    // disambiguation per spec.md §9 Open Questions; only unambiguous
    // RULE_MATCHED series export automatically.
    for series in repo.series_in_status(ProcessingStatus::RuleMatched).await? {
        let instances = repo.instances_for_series(series.id).await?;
        if instances.is_empty() {
            continue;
        }
        let instance_paths: Vec<String> = instances.iter().map(|i| i.file_path.clone()).collect();
        let staging_dir = export_staging_dir(series.id);
        match export::run_export_for_series(repo, &tokens, &remote, series.id, &instance_paths, &staging_dir).await {
            StageOutcome::Success(task_id) => tracing::info!(series_id = series.id, task_id, "export complete"),
            StageOutcome::RetryableFailure(e) => {
                tracing::warn!(series_id = series.id, error = %e, "export failed, will retry next pass")
            }
            StageOutcome::TerminalFailure(e) => {
                tracing::error!(series_id = series.id, error = %e, "export failed terminally")
            }
            StageOutcome::SkippedStable => {}
        }
    }

    // Stage G: poll.
    for export_record in repo.exports_pending_poll().await? {
        let series = repo.series_by_id(export_record.series_id).await?;
        let series_root = Utf8Path::new(&series.root_path);
        match poll::poll_export(repo, &tokens, &remote, &export_record, series_root).await {
            StageOutcome::Success(()) => {
                tracing::info!(export_id = export_record.id, "poll advanced export")
            }
            StageOutcome::RetryableFailure(e) => {
                tracing::warn!(export_id = export_record.id, error = %e, "poll failed, will retry next pass")
            }
            StageOutcome::TerminalFailure(e) => {
                tracing::error!(export_id = export_record.id, error = %e, "poll failed terminally")
            }
            StageOutcome::SkippedStable => {}
        }
    }

    // Stage H: reidentify.
    for series in repo.series_in_status(ProcessingStatus::RtstructureReceived).await? {
        match reidentify::run_reidentify(repo, series.id).await {
            StageOutcome::Success(path) => {
                tracing::info!(series_id = series.id, path = %path, "reidentify complete")
            }
            StageOutcome::TerminalFailure(e) => {
                tracing::error!(series_id = series.id, error = %e, "reidentify failed")
            }
            _ => {}
        }
    }

    Ok(())
}

async fn first_instance_path(repo: &CatalogRepo, series_id: i64) -> Result<Option<String>, sqlx::Error> {
    let mut instances = repo.instances_for_series(series_id).await?;
    instances.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    Ok(instances.into_iter().next().map(|i| i.file_path))
}

fn export_staging_dir(series_id: i64) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        .join(format!("draw-client-export-{series_id}"))
}

/// Statistics sampler, per spec.md §4.9: "a separate periodic job (every
/// 30 min) collects statistics deltas since the last sample". Samples the
/// service-status counters verbatim; deltas are derivable by the consumer
/// from two consecutive samples' timestamps.
pub async fn sample_statistics(repo: &CatalogRepo) -> Result<(), sqlx::Error> {
    let status = repo.get_service_status().await?;
    repo.insert_statistics_sample("total_connections", status.total_connections as f64).await?;
    repo.insert_statistics_sample("active_connections", status.active_connections as f64).await?;
    repo.insert_statistics_sample("total_files_received", status.total_files_received as f64).await?;
    repo.insert_statistics_sample("total_bytes_received", status.total_bytes_received as f64).await?;
    repo.insert_statistics_sample("total_errors", status.total_errors as f64).await?;
    repo.insert_statistics_sample("cached_storage_bytes", status.cached_storage_bytes as f64).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_staging_dir_is_unique_per_series() {
        assert_ne!(export_staging_dir(1), export_staging_dir(2));
    }
}
