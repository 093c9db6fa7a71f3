use crate::error::{AppError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Outcome of a single accepted chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAccepted {
    pub received_bytes: i64,
    pub total_size: i64,
    pub complete: bool,
}

/// A completed session handed off to the upload processor.
#[derive(Debug)]
pub struct StagedUpload {
    pub session_id: String,
    pub staging_path: PathBuf,
    pub total_size: i64,
}

struct SessionSlot {
    total_size: i64,
    /// offset -> length of each received chunk
    received: BTreeMap<i64, i64>,
    received_bytes: i64,
    staging_path: PathBuf,
    last_activity: Instant,
    /// Set while the upload processor owns the staging data; blocks
    /// duplicate handoff and garbage collection.
    handed_off: bool,
    /// Set once the session is torn down; a late chunk writer holding a
    /// stale slot handle must not recreate the staging file.
    discarded: bool,
}

/// Receives chunk uploads keyed by session id and stages them into one
/// file per session. Writes within a session are serialized by the slot
/// mutex; unrelated sessions proceed fully in parallel.
pub struct ChunkAssembler {
    staging_root: PathBuf,
    capacity: i64,
    used: AtomicI64,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionSlot>>>>,
}

impl ChunkAssembler {
    pub fn new(storage_root: impl AsRef<Path>, capacity: i64) -> Self {
        Self {
            staging_root: storage_root.as_ref().join("staging"),
            capacity,
            used: AtomicI64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize the staging directory
    pub async fn init(&self) -> Result<()> {
        if !self.staging_root.exists() {
            fs::create_dir_all(&self.staging_root).await.map_err(|e| {
                AppError::ServerError(format!("Failed to create staging directory: {}", e))
            })?;
            tracing::info!(
                "📁 Created staging directory: {}",
                self.staging_root.display()
            );
        }
        Ok(())
    }

    fn slot_for(&self, session_id: &str, total_size: i64) -> Arc<Mutex<SessionSlot>> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionSlot {
                    total_size,
                    received: BTreeMap::new(),
                    received_bytes: 0,
                    staging_path: self.staging_root.join(session_id),
                    last_activity: Instant::now(),
                    handed_off: false,
                    discarded: false,
                }))
            })
            .clone()
    }

    fn existing_slot(&self, session_id: &str) -> Option<Arc<Mutex<SessionSlot>>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Accept one chunk for a session, creating the session on first
    /// contact. Chunks may arrive in any order; a chunk whose offset was
    /// already received is rejected without altering the received total.
    pub async fn submit_chunk(
        &self,
        session_id: &str,
        offset: i64,
        total_size: i64,
        data: &[u8],
    ) -> Result<ChunkAccepted> {
        if session_id.is_empty() {
            return Err(AppError::BadRequest("Missing upload session id".to_string()));
        }
        // Session ids become staging file names; keep them path-safe
        if !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::BadRequest("Invalid upload session id".to_string()));
        }
        if total_size <= 0 {
            return Err(AppError::SizeMismatch(
                "Declared total size must be positive".to_string(),
            ));
        }
        if offset < 0 {
            return Err(AppError::BadRequest("Negative chunk offset".to_string()));
        }
        if data.is_empty() {
            return Err(AppError::BadRequest("Empty chunk".to_string()));
        }

        let len = data.len() as i64;
        let slot = self.slot_for(session_id, total_size);
        let mut session = slot.lock().await;

        if session.discarded {
            return Err(AppError::SessionNotFound);
        }
        if session.handed_off {
            return Err(AppError::FinalizeInProgress);
        }
        if session.total_size != total_size {
            return Err(AppError::SizeMismatch(format!(
                "Declared total size {} does not match session total {}",
                total_size, session.total_size
            )));
        }
        if offset + len > total_size {
            return Err(AppError::SizeMismatch(format!(
                "Chunk at offset {} with {} bytes overruns declared total {}",
                offset, len, total_size
            )));
        }
        if session.received.contains_key(&offset) {
            return Err(AppError::DuplicateChunk);
        }
        // Distinct offsets must not overlap, or the completeness check on
        // summed lengths would pass with corrupt content
        if let Some((prev_offset, prev_len)) = session.received.range(..offset).next_back() {
            if prev_offset + prev_len > offset {
                return Err(AppError::SizeMismatch(format!(
                    "Chunk at offset {} overlaps chunk at offset {}",
                    offset, prev_offset
                )));
            }
        }
        if let Some((next_offset, _)) = session.received.range(offset..).next() {
            if offset + len > *next_offset {
                return Err(AppError::SizeMismatch(format!(
                    "Chunk at offset {} overlaps chunk at offset {}",
                    offset, next_offset
                )));
            }
        }

        if self.used.fetch_add(len, Ordering::SeqCst) + len > self.capacity {
            self.used.fetch_sub(len, Ordering::SeqCst);
            return Err(AppError::StorageFull);
        }

        // The slot lock is held across the write: that is the per-session
        // serialization contract. Other sessions are untouched.
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&session.staging_path)
                .await?;
            file.seek(std::io::SeekFrom::Start(offset as u64)).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            self.used.fetch_sub(len, Ordering::SeqCst);
            return Err(AppError::IoError(e));
        }

        session.received.insert(offset, len);
        session.received_bytes += len;
        session.last_activity = Instant::now();

        let complete = session.received_bytes == session.total_size;

        tracing::debug!(
            "📦 Stored chunk for session {} at offset {} ({}/{} bytes)",
            session_id,
            offset,
            session.received_bytes,
            session.total_size
        );

        Ok(ChunkAccepted {
            received_bytes: session.received_bytes,
            total_size: session.total_size,
            complete,
        })
    }

    /// Claim a complete session for finalization. The completeness check
    /// and the handoff mark happen under the slot lock, so two racing
    /// finalize calls cannot both claim the same session.
    pub async fn take_for_processing(&self, session_id: &str) -> Result<StagedUpload> {
        let slot = self
            .existing_slot(session_id)
            .ok_or(AppError::SessionNotFound)?;
        let mut session = slot.lock().await;

        if session.discarded {
            return Err(AppError::SessionNotFound);
        }
        if session.handed_off {
            return Err(AppError::FinalizeInProgress);
        }
        if session.received_bytes != session.total_size {
            return Err(AppError::BadRequest(format!(
                "Upload incomplete: {}/{} bytes received",
                session.received_bytes, session.total_size
            )));
        }

        session.handed_off = true;
        session.last_activity = Instant::now();

        Ok(StagedUpload {
            session_id: session_id.to_string(),
            staging_path: session.staging_path.clone(),
            total_size: session.total_size,
        })
    }

    /// Return a handed-off session to the pool after a failed finalize so
    /// the client gets one retry with the staged bytes intact.
    pub async fn release_for_retry(&self, session_id: &str) {
        if let Some(slot) = self.existing_slot(session_id) {
            let mut session = slot.lock().await;
            session.handed_off = false;
            session.last_activity = Instant::now();
        }
    }

    /// Drop a session and delete its staging data.
    pub async fn discard(&self, session_id: &str) -> Result<()> {
        let slot = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.remove(session_id)
        };

        if let Some(slot) = slot {
            let mut session = slot.lock().await;
            if session.discarded {
                return Ok(());
            }
            session.discarded = true;
            self.used.fetch_sub(session.received_bytes, Ordering::SeqCst);
            match fs::remove_file(&session.staging_path).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        "Failed to remove staging file for session {}: {}",
                        session_id,
                        e
                    );
                }
            }
            tracing::debug!("🧹 Discarded upload session {}", session_id);
        }

        Ok(())
    }

    /// Garbage-collect sessions idle past `max_idle`. A session that is
    /// mid-handoff or currently receiving a chunk is skipped.
    pub async fn gc(&self, max_idle: Duration) -> u64 {
        let candidates: Vec<(String, Arc<Mutex<SessionSlot>>)> = {
            let sessions = self
                .sessions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect()
        };

        let mut reaped = 0u64;
        for (session_id, slot) in candidates {
            let stale = match slot.try_lock() {
                Ok(session) => !session.handed_off && session.last_activity.elapsed() > max_idle,
                // Locked means actively in use
                Err(_) => false,
            };

            if stale {
                if self.discard(&session_id).await.is_ok() {
                    reaped += 1;
                    tracing::debug!("🧹 Reaped abandoned upload session {}", session_id);
                }
            }
        }

        reaped
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn used_bytes(&self) -> i64 {
        self.used.load(Ordering::SeqCst)
    }
}
