//! Background writer pool for the append-only transaction log, per spec.md
//! §4.10 "Transaction logging is asynchronous" and §5 "Background writer
//! pool". Publishing is non-blocking: a full queue drops the row with a
//! warning rather than stalling a DICOM transfer.

use crate::batcher::Batcher;
use crate::catalog::{CatalogRepo, TransactionLogRow};
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_ATTEMPTS: u32 = 3;
const BATCH_SIZE: usize = 32;

#[derive(Clone)]
pub struct TransactionLogSender {
    tx: mpsc::Sender<TransactionLogRow>,
}

impl TransactionLogSender {
    /// Enqueue a row for the background writer. Never blocks the calling
    /// association thread.
    pub fn enqueue(&self, row: TransactionLogRow) {
        if self.tx.try_send(row).is_err() {
            tracing::warn!("transaction log queue full, dropping row");
        }
    }
}

/// Spawn the writer task and return a handle producers can clone freely.
/// `capacity` bounds the channel; per spec.md §5 a full queue drops rows
/// rather than applying backpressure to the SCP.
pub fn spawn_transaction_log_writer(repo: CatalogRepo, capacity: usize) -> TransactionLogSender {
    let (tx, mut rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        let mut batches = Batcher::new(BATCH_SIZE);
        while let Some(row) = rx.recv().await {
            let (next, full_batch) = batches.push(row);
            batches = next;
            if let Some(rows) = full_batch {
                insert_with_retry(&repo, &rows).await;
            }
            // Drain whatever else is already queued before waiting again, so
            // a burst of C-STOREs is written in one statement instead of one
            // round trip per row.
            while let Ok(row) = rx.try_recv() {
                let (next, full_batch) = batches.push(row);
                batches = next;
                if let Some(rows) = full_batch {
                    insert_with_retry(&repo, &rows).await;
                }
            }
            let remaining = batches.into_inner();
            if !remaining.is_empty() {
                insert_with_retry(&repo, &remaining).await;
            }
            batches = Batcher::new(BATCH_SIZE);
        }
    });
    TransactionLogSender { tx }
}

async fn insert_with_retry(repo: &CatalogRepo, rows: &[TransactionLogRow]) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match repo.insert_transaction_log_batch(rows).await {
            Ok(()) => return,
            Err(e) if attempt < MAX_ATTEMPTS => {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tracing::warn!(error = %e, attempt, "transaction log insert failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::error!(error = %e, count = rows.len(), "transaction log insert failed permanently, dropping rows");
                return;
            }
        }
    }
}
