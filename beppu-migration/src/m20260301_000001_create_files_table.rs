use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Files::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Files::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Files::FileId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Files::Name).string().not_null())
                    .col(ColumnDef::new(Files::ContentType).string())
                    .col(ColumnDef::new(Files::SizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(Files::Sha256).string().not_null())
                    .col(ColumnDef::new(Files::ExpiresAt).timestamp_with_time_zone())
                    .col(ColumnDef::new(Files::DownloadsRemaining).integer())
                    .col(ColumnDef::new(Files::PasswordHash).string())
                    .col(ColumnDef::new(Files::HotlinkId).string().unique_key())
                    .col(
                        ColumnDef::new(Files::IsEncrypted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Files::DecryptionKey).binary())
                    .col(ColumnDef::new(Files::Nonce).binary())
                    .col(ColumnDef::new(Files::Bucket).string())
                    .col(ColumnDef::new(Files::StorageKey).string().not_null())
                    .col(ColumnDef::new(Files::UserId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Files::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Files::DownloadCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Files::PendingDeletionAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        // Create index on file_id for faster lookups
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-files-file_id")
                    .table(Files::Table)
                    .col(Files::FileId)
                    .to_owned(),
            )
            .await?;

        // Secondary unique index for hotlink lookups
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-files-hotlink_id")
                    .table(Files::Table)
                    .col(Files::HotlinkId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create index on expires_at for sweeper queries
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-files-expires_at")
                    .table(Files::Table)
                    .col(Files::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        // Create index on pending_deletion_at for sweeper queries
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx-files-pending_deletion_at")
                    .table(Files::Table)
                    .col(Files::PendingDeletionAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Files::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Files {
    Table,
    Id,
    FileId,
    Name,
    ContentType,
    SizeBytes,
    Sha256,
    ExpiresAt,
    DownloadsRemaining,
    PasswordHash,
    HotlinkId,
    IsEncrypted,
    DecryptionKey,
    Nonce,
    Bucket,
    StorageKey,
    UserId,
    CreatedAt,
    DownloadCount,
    PendingDeletionAt,
}
