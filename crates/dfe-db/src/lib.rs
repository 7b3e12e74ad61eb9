//! Durable state for the distribution sync service (Postgres).
//!
//! The sync core only sees the traits in [`store`]; [`PgRepository`] is the
//! production implementation. Schema lives in `./migrations` and is embedded
//! at compile time.

mod pg;
pub mod store;

pub use pg::PgRepository;
pub use store::{
    DocumentStore, ManifestationStore, QuotaReservation, QuotaStore, Repository, StoredDocument,
    UpsertOutcome, WatermarkRow, WatermarkStore, WatermarkWrite,
};

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub const ENV_DB_URL: &str = "DFE_DATABASE_URL";

/// Connect to Postgres using DFE_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&url)
        .await
        .with_context(|| format!("connecting to Postgres via {ENV_DB_URL}"))
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_watermarks_table: bool,
}

/// Round-trip check plus whether the schema has been migrated.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let row: (i32, bool) =
        sqlx::query_as("select 1, to_regclass('public.watermarks') is not null")
            .fetch_one(pool)
            .await
            .context("db status query failed")?;

    Ok(DbStatus {
        ok: row.0 == 1,
        has_watermarks_table: row.1,
    })
}
