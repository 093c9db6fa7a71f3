use crate::error::Result;
use beppu_migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;

pub async fn setup_database(database_url: &str) -> Result<DatabaseConnection> {
    tracing::info!("🔗 Connecting to database: {}", database_url);

    // Configure connection options
    let mut opt = ConnectOptions::new(database_url.to_string());
    opt.max_connections(100)
        .min_connections(5)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(8))
        .max_lifetime(Duration::from_secs(8))
        .sqlx_logging(true);

    // Connect to database
    let db = Database::connect(opt).await?;

    // Run migrations
    tracing::info!("🔄 Running database migrations...");
    Migrator::up(&db, None).await?;
    tracing::info!("✅ Migrations completed successfully");

    Ok(db)
}

/// Single-connection in-memory database for tests. A pooled
/// `sqlite::memory:` hands every pool connection its own empty database,
/// so the pool is pinned to one connection here.
#[cfg(test)]
pub async fn setup_test_database() -> DatabaseConnection {
    let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.expect("connect test database");
    Migrator::up(&db, None).await.expect("migrate test database");
    db
}

// Helper functions for file record operations
pub mod file_ops {
    use super::*;
    use crate::error::AppError;
    use beppu_entity::{file, prelude::*};
    use sea_orm::sea_query::Expr;
    use sea_orm::*;

    pub struct CreateFileParams {
        pub file_id: String,
        pub name: String,
        pub content_type: Option<String>,
        pub size_bytes: i64,
        pub sha256: String,
        pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
        pub downloads_remaining: Option<i32>,
        pub password_hash: Option<String>,
        pub hotlink_id: Option<String>,
        pub is_encrypted: bool,
        pub decryption_key: Option<Vec<u8>>,
        pub nonce: Option<Vec<u8>>,
        pub bucket: Option<String>,
        pub storage_key: String,
        pub user_id: i64,
    }

    pub async fn create_file_record(
        db: &DatabaseConnection,
        params: CreateFileParams,
    ) -> Result<file::Model> {
        let file_model = file::ActiveModel {
            file_id: Set(params.file_id),
            name: Set(params.name),
            content_type: Set(params.content_type),
            size_bytes: Set(params.size_bytes),
            sha256: Set(params.sha256),
            expires_at: Set(params.expires_at),
            downloads_remaining: Set(params.downloads_remaining),
            password_hash: Set(params.password_hash),
            hotlink_id: Set(params.hotlink_id),
            is_encrypted: Set(params.is_encrypted),
            decryption_key: Set(params.decryption_key),
            nonce: Set(params.nonce),
            bucket: Set(params.bucket),
            storage_key: Set(params.storage_key),
            user_id: Set(params.user_id),
            ..Default::default()
        };

        let file = file_model.insert(db).await?;
        Ok(file)
    }

    pub async fn get_file_by_id(
        db: &DatabaseConnection,
        file_id: &str,
    ) -> Result<Option<file::Model>> {
        let file = File::find()
            .filter(file::Column::FileId.eq(file_id))
            .one(db)
            .await?;

        Ok(file)
    }

    pub async fn get_file_by_hotlink(
        db: &DatabaseConnection,
        hotlink_id: &str,
    ) -> Result<Option<file::Model>> {
        let file = File::find()
            .filter(file::Column::HotlinkId.eq(hotlink_id))
            .one(db)
            .await?;

        Ok(file)
    }

    /// Decrement the remaining-download counter for a limited file.
    ///
    /// Single conditional UPDATE: the counter only moves when it is still
    /// positive and the record is not pending deletion, so a decrement
    /// racing a sweeper mark cannot both succeed. Returns the remaining
    /// count after the decrement.
    pub async fn decrement_downloads(db: &DatabaseConnection, file_id: &str) -> Result<i32> {
        let result = File::update_many()
            .col_expr(
                file::Column::DownloadsRemaining,
                Expr::col(file::Column::DownloadsRemaining).sub(1),
            )
            .filter(file::Column::FileId.eq(file_id))
            .filter(file::Column::DownloadsRemaining.gt(0))
            .filter(file::Column::PendingDeletionAt.is_null())
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::FileExpired);
        }

        let remaining = File::find()
            .filter(file::Column::FileId.eq(file_id))
            .one(db)
            .await?
            .and_then(|f| f.downloads_remaining)
            .unwrap_or(0);

        Ok(remaining)
    }

    /// Record one completed download; the counter is monotonic and applies
    /// to unlimited files as well.
    pub async fn increment_download_count(db: &DatabaseConnection, file_id: &str) -> Result<()> {
        File::update_many()
            .col_expr(
                file::Column::DownloadCount,
                Expr::col(file::Column::DownloadCount).add(1),
            )
            .filter(file::Column::FileId.eq(file_id))
            .exec(db)
            .await?;

        Ok(())
    }

    /// Schedule physical deletion. Only the first caller moves the record
    /// into the pending state; a racing caller observes rows_affected == 0
    /// and no-ops.
    pub async fn mark_pending_deletion(
        db: &DatabaseConnection,
        file_id: &str,
        when: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool> {
        let result = File::update_many()
            .col_expr(file::Column::PendingDeletionAt, Expr::value(when))
            .filter(file::Column::FileId.eq(file_id))
            .filter(file::Column::PendingDeletionAt.is_null())
            .exec(db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Snapshot of all records, for the sweeper and the listing API.
    pub async fn list_all(db: &DatabaseConnection) -> Result<Vec<file::Model>> {
        let files = File::find().all(db).await?;
        Ok(files)
    }

    pub async fn delete_file_record(db: &DatabaseConnection, file_id: &str) -> Result<bool> {
        let result = File::delete_many()
            .filter(file::Column::FileId.eq(file_id))
            .exec(db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}
