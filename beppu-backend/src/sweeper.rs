use crate::assembler::ChunkAssembler;
use crate::database::file_ops;
use crate::error::Result;
use crate::status::StatusBoard;
use crate::storage::StorageRouter;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Records newly marked pending deletion this pass
    pub marked: u64,
    /// Records whose bytes and metadata were physically removed
    pub deleted: u64,
    /// Abandoned upload sessions reaped
    pub sessions_reaped: u64,
    /// Idle status channels dropped
    pub channels_reaped: u64,
}

/// Periodic scan that moves expired records into pending deletion, then
/// physically removes them once the grace window has elapsed — bytes
/// before metadata, so an interrupted pass leaves at worst a record the
/// download gate resolves as NotFound. Also reaps abandoned upload
/// sessions and idle status channels.
pub struct ExpirySweeper {
    db: DatabaseConnection,
    storage: Arc<StorageRouter>,
    assembler: Arc<ChunkAssembler>,
    status: Arc<StatusBoard>,
    interval: Duration,
    grace: chrono::Duration,
    session_idle: Duration,
}

impl ExpirySweeper {
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<StorageRouter>,
        assembler: Arc<ChunkAssembler>,
        status: Arc<StatusBoard>,
        interval: Duration,
        grace: chrono::Duration,
        session_idle: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            assembler,
            status,
            interval,
            grace,
            session_idle,
        }
    }

    /// Run the sweeper until the process exits.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(stats) => {
                        if stats != SweepStats::default() {
                            tracing::debug!(
                                "🧹 Sweep: {} marked, {} deleted, {} sessions reaped, {} channels reaped",
                                stats.marked,
                                stats.deleted,
                                stats.sessions_reaped,
                                stats.channels_reaped
                            );
                        }
                    }
                    Err(e) => tracing::warn!("Sweep pass failed: {}", e),
                }
            }
        })
    }

    pub async fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = chrono::Utc::now();

        for file in file_ops::list_all(&self.db).await? {
            match file.pending_deletion_at {
                // Grace elapsed: bytes first, then metadata
                Some(due) if due <= now => {
                    let backend = match self.storage.backend_for(file.bucket.as_deref()) {
                        Ok(backend) => backend,
                        Err(e) => {
                            tracing::warn!(
                                "Cannot resolve backend for {}: {}; retrying next pass",
                                file.file_id,
                                e
                            );
                            continue;
                        }
                    };
                    if let Err(e) = backend.delete(&file.storage_key).await {
                        tracing::warn!(
                            "Failed to delete bytes for {}: {}; retrying next pass",
                            file.file_id,
                            e
                        );
                        continue;
                    }
                    file_ops::delete_file_record(&self.db, &file.file_id).await?;
                    stats.deleted += 1;
                    tracing::debug!("🗑️  Deleted expired file {}", file.file_id);
                }
                // Still inside the grace window
                Some(_) => {}
                None if file.is_expired() => {
                    if file_ops::mark_pending_deletion(&self.db, &file.file_id, now + self.grace)
                        .await?
                    {
                        stats.marked += 1;
                    }
                }
                None => {}
            }
        }

        stats.sessions_reaped = self.assembler.gc(self.session_idle).await;
        stats.channels_reaped = self.status.reap_idle(self.session_idle) as u64;

        Ok(stats)
    }
}
