//! Retention-based storage cleanup, per spec.md §4.10: delete `.dcm` files
//! older than `retention_days`, oldest-first, until the requested amount of
//! space is free, then remove directories left empty behind them.

use crate::catalog::{CatalogRepo, TransactionLogRow, TransactionStatus, TransactionType};
use camino::Utf8Path;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupResult {
    pub files_deleted: u64,
    pub bytes_freed: u64,
}

/// Delete the oldest eligible `.dcm` files under `root` until `bytes_to_free`
/// bytes have been reclaimed or no more candidates remain, then prune empty
/// directories.
pub fn delete_oldest_until(root: &Utf8Path, retention_days: i64, bytes_to_free: u64) -> CleanupResult {
    let cutoff = SystemTime::now() - Duration::from_secs((retention_days.max(0) as u64) * 86_400);

    let mut candidates: Vec<(std::path::PathBuf, SystemTime, u64)> = WalkDir::new(root.as_std_path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext.eq_ignore_ascii_case("dcm")))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            let mtime = meta.modified().ok()?;
            (mtime < cutoff).then_some((e.path().to_path_buf(), mtime, meta.len()))
        })
        .collect();
    candidates.sort_by_key(|(_, mtime, _)| *mtime);

    let mut result = CleanupResult::default();
    for (path, _, size) in candidates {
        if result.bytes_freed >= bytes_to_free {
            break;
        }
        if fs_err::remove_file(&path).is_ok() {
            result.files_deleted += 1;
            result.bytes_freed += size;
        }
    }

    remove_empty_dirs(root.as_std_path());
    result
}

fn remove_empty_dirs(root: &std::path::Path) {
    let dirs: Vec<std::path::PathBuf> = WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect();
    for dir in dirs {
        if dir == root {
            continue;
        }
        let _ = std::fs::remove_dir(&dir);
    }
}

/// Run a cleanup pass and log a single CLEANUP transaction row, per
/// spec.md §6 "The cleanup transaction type logs a single row per cleanup
/// pass."
pub async fn run_cleanup_and_log(
    repo: &CatalogRepo,
    root: &Utf8Path,
    retention_days: i64,
    bytes_to_free: u64,
) -> CleanupResult {
    let result = delete_oldest_until(root, retention_days, bytes_to_free);
    let row = TransactionLogRow {
        transaction_type: TransactionType::Cleanup,
        status: TransactionStatus::Success,
        calling_ae: None,
        called_ae: None,
        remote_ip: None,
        remote_port: None,
        patient_id: None,
        study_uid: None,
        series_uid: None,
        sop_instance_uid: None,
        sop_class_uid: None,
        file_path: Some(root.to_string()),
        file_size: Some(result.bytes_freed as i64),
        transfer_syntax: None,
        duration_s: None,
        transfer_speed_mbps: None,
        error: None,
    };
    if let Err(e) = repo.insert_transaction_log_batch(&[row]).await {
        tracing::warn!(error = %e, "failed to log cleanup transaction");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread::sleep;

    #[test]
    fn deletes_eligible_files_until_target_freed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        fs::write(root.join("a.dcm").as_std_path(), vec![0u8; 10]).unwrap();
        fs::write(root.join("b.dcm").as_std_path(), vec![0u8; 10]).unwrap();
        fs::write(root.join("keep.txt").as_std_path(), vec![0u8; 10]).unwrap();

        // retention_days = 0 makes every file written before "now" eligible.
        sleep(Duration::from_millis(10));
        let result = delete_oldest_until(root, 0, 10);

        assert_eq!(result.files_deleted, 1);
        assert_eq!(result.bytes_freed, 10);
        assert!(root.join("keep.txt").as_std_path().exists());
    }
}
