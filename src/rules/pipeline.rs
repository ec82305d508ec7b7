//! Applies the RuleGroup tree to one series' representative instance and
//! persists the outcome.

use super::engine::{evaluate_series, SeriesOutcome};
use crate::catalog::{CatalogRepo, ProcessingStatus};
use crate::dicom_adapter;
use crate::error::{DrawClientError, StageOutcome};

/// Evaluate the rules against `instance_path` (the series' first instance
/// by file path) and transition the series to the matching status.
pub async fn run_rule_match_for_series(
    repo: &CatalogRepo,
    series_id: i64,
    instance_path: &str,
) -> StageOutcome<ProcessingStatus> {
    match run(repo, series_id, instance_path).await {
        Ok(status) => StageOutcome::Success(status),
        Err(e) => StageOutcome::TerminalFailure(e),
    }
}

async fn run(
    repo: &CatalogRepo,
    series_id: i64,
    instance_path: &str,
) -> Result<ProcessingStatus, DrawClientError> {
    let groups = repo.load_rule_groups().await?;
    let obj = dicom_adapter::read_metadata(instance_path)?;
    let tags = dicom_adapter::representative_tag_map(&obj.into_inner());

    let outcome = evaluate_series(&groups, &tags);

    let (status, ruleset_ids, template_ids) = match &outcome {
        SeriesOutcome::Unmatched => (ProcessingStatus::RuleNotMatched, vec![], vec![]),
        SeriesOutcome::Matched(g) => (
            ProcessingStatus::RuleMatched,
            g.matched_ruleset_ids.clone(),
            g.template_ids.clone(),
        ),
        SeriesOutcome::Multiple(groups) => {
            let ruleset_ids = groups.iter().flat_map(|g| g.matched_ruleset_ids.clone()).collect();
            let template_ids = groups.iter().flat_map(|g| g.template_ids.clone()).collect();
            (ProcessingStatus::MultipleRulesMatched, ruleset_ids, template_ids)
        }
    };

    repo.record_rule_match(series_id, &ruleset_ids, &template_ids).await?;
    repo.transition_series(series_id, status).await?;

    Ok(status)
}
