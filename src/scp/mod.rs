//! DICOM SCP: accept associations, dispatch C-ECHO/C-STORE/C-FIND/C-MOVE/
//! C-GET against the catalog and the storage root, per spec.md §4.10.
//!
//! Built directly on `dicom-ul`'s synchronous association API, kept off the
//! Tokio runtime via a dedicated `ThreadPool`. Catalog access from inside a
//! worker thread goes through a captured `tokio::runtime::Handle` and
//! `block_on`, the one place this crate deliberately crosses from sync
//! network I/O back into the async database layer.

mod abstract_syntaxes;
mod association;
mod c_echo;
mod c_find;
mod c_get;
mod c_move;
mod c_store;
pub mod cleanup;
mod dimse_status;
pub mod storage_cache;
pub mod transaction_log;

pub use dimse_status::DimseStatus;
pub use storage_cache::StorageCache;
pub use transaction_log::{spawn_transaction_log_writer, TransactionLogSender};

use crate::catalog::{CatalogRepo, DicomScpConfig};
use camino::Utf8PathBuf;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use crate::thread_pool::ThreadPool;

/// Everything an association handler needs, shared across every worker
/// thread in the SCP's `ThreadPool`.
pub struct ScpContext {
    pub repo: CatalogRepo,
    pub config: DicomScpConfig,
    pub storage_root: Utf8PathBuf,
    pub storage_cache: Arc<StorageCache>,
    pub tx_log: TransactionLogSender,
    pub runtime: tokio::runtime::Handle,
}

/// Bind and serve forever, handing each accepted connection to the
/// `ThreadPool`. Intended to run inside `tokio::task::spawn_blocking`.
pub fn run_scp_listener(ctx: Arc<ScpContext>) -> std::io::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", ctx.config.bind_host, ctx.config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(bind_addr)?;
    tracing::info!(address = %bind_addr, ae_title = %ctx.config.ae_title, "DICOM SCP listening");

    let n_threads = (ctx.config.max_associations.max(1)) as usize;
    let mut pool = ThreadPool::new(n_threads, "dicom_scp");

    for stream in listener.incoming() {
        let Ok(stream) = stream else {
            continue;
        };
        let ctx = Arc::clone(&ctx);
        pool.execute(move || {
            let peer = stream.peer_addr().ok();
            ctx.runtime.block_on(async {
                let _ = ctx.repo.record_connection_opened().await;
            });
            if let Err(e) = association::handle_association(&ctx, stream) {
                tracing::error!(?peer, error = %e, "association ended with error");
            }
            ctx.runtime.block_on(async {
                let _ = ctx.repo.record_connection_closed().await;
            });
        });
    }
    pool.shutdown();
    Ok(())
}
