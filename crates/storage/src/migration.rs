use sea_orm::sea_query::{ColumnDef, Expr, Index, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};
use visitproof_domain::storage::{StorageError, StorageResult};

use crate::entity::{
    idempotency_records, places, qr_tokens, rate_limit_counters, receipts, settlement_jobs,
    verifications,
};

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let backend = db.get_database_backend();

    let places_table = Table::create()
        .if_not_exists()
        .table(places::Entity)
        .col(
            ColumnDef::new(places::Column::PlaceId)
                .string_len(128)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(places::Column::Geohash)
                .string_len(12)
                .not_null(),
        )
        .col(ColumnDef::new(places::Column::RadiusM).integer().not_null())
        .col(
            ColumnDef::new(places::Column::MissionId)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(places::Column::RewardAmount)
                .big_integer()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, places_table).await?;

    let qr_tokens_table = Table::create()
        .if_not_exists()
        .table(qr_tokens::Entity)
        .col(
            ColumnDef::new(qr_tokens::Column::CodeHash)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(qr_tokens::Column::PlaceId)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(qr_tokens::Column::Status)
                .small_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(qr_tokens::Column::TtlSec)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(qr_tokens::Column::CreatedAt)
                .date_time()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(ColumnDef::new(qr_tokens::Column::UsedAt).date_time().null())
        .col(ColumnDef::new(qr_tokens::Column::UsedBy).string().null())
        .col(
            ColumnDef::new(qr_tokens::Column::FailReason)
                .string()
                .null(),
        )
        .col(
            ColumnDef::new(qr_tokens::Column::DistanceM)
                .integer()
                .null(),
        )
        .to_owned();
    create_table(db, backend, qr_tokens_table).await?;

    let receipts_table = Table::create()
        .if_not_exists()
        .table(receipts::Entity)
        .col(
            ColumnDef::new(receipts::Column::UserId)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(receipts::Column::PlaceId)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(receipts::Column::MediaUrl)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(receipts::Column::OcrStatus)
                .small_integer()
                .not_null(),
        )
        .col(ColumnDef::new(receipts::Column::OcrData).json().null())
        .col(
            ColumnDef::new(receipts::Column::ValidationErrors)
                .json()
                .not_null(),
        )
        .col(ColumnDef::new(receipts::Column::Total).big_integer().null())
        .col(ColumnDef::new(receipts::Column::PaidAt).date_time().null())
        .col(
            ColumnDef::new(receipts::Column::CreatedAt)
                .date_time()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new(receipts::Column::UpdatedAt)
                .date_time()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .primary_key(
            Index::create()
                .col(receipts::Column::UserId)
                .col(receipts::Column::PlaceId)
                .col(receipts::Column::MediaUrl),
        )
        .to_owned();
    create_table(db, backend, receipts_table).await?;

    let verifications_table = Table::create()
        .if_not_exists()
        .table(verifications::Entity)
        .col(
            ColumnDef::new(verifications::Column::UserId)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(verifications::Column::PlaceId)
                .string_len(128)
                .not_null(),
        )
        .col(
            ColumnDef::new(verifications::Column::GpsOk)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(verifications::Column::QrOk)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(verifications::Column::ReceiptOk)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(verifications::Column::GpsGeohash)
                .string_len(12)
                .null(),
        )
        .col(
            ColumnDef::new(verifications::Column::GpsDistanceM)
                .integer()
                .null(),
        )
        .col(
            ColumnDef::new(verifications::Column::GpsAccuracyM)
                .double()
                .null(),
        )
        .col(
            ColumnDef::new(verifications::Column::GpsCheckedAt)
                .date_time()
                .null(),
        )
        .col(
            ColumnDef::new(verifications::Column::UpdatedAt)
                .date_time()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .primary_key(
            Index::create()
                .col(verifications::Column::UserId)
                .col(verifications::Column::PlaceId),
        )
        .to_owned();
    create_table(db, backend, verifications_table).await?;

    let idempotency_table = Table::create()
        .if_not_exists()
        .table(idempotency_records::Entity)
        .col(
            ColumnDef::new(idempotency_records::Column::Key)
                .string_len(128)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(idempotency_records::Column::Response)
                .json()
                .not_null(),
        )
        .col(
            ColumnDef::new(idempotency_records::Column::ExpiresAt)
                .date_time()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, idempotency_table).await?;

    let counters_table = Table::create()
        .if_not_exists()
        .table(rate_limit_counters::Entity)
        .col(
            ColumnDef::new(rate_limit_counters::Column::Key)
                .string_len(128)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(rate_limit_counters::Column::Count)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(rate_limit_counters::Column::WindowExpiresAt)
                .date_time()
                .not_null(),
        )
        .to_owned();
    create_table(db, backend, counters_table).await?;

    let settlement_table = Table::create()
        .if_not_exists()
        .table(settlement_jobs::Entity)
        .col(
            ColumnDef::new(settlement_jobs::Column::IdempotencyKey)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::Payload)
                .json()
                .not_null(),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::Status)
                .small_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::RetryCount)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::NextAttemptAt)
                .date_time()
                .not_null(),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::LastError)
                .string()
                .null(),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::CreatedAt)
                .date_time()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .col(
            ColumnDef::new(settlement_jobs::Column::UpdatedAt)
                .date_time()
                .not_null()
                .default(Expr::current_timestamp()),
        )
        .to_owned();
    create_table(db, backend, settlement_table).await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}
