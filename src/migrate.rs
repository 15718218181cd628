//! Idempotent schema setup for the SQLite vector store.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `collections` | One row per (prefixed) collection name |
//! | `records` | Chunk text, metadata JSON, classification label + rank, embedding BLOB |

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT NOT NULL,
            collection TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            classification TEXT NOT NULL,
            classification_level INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            PRIMARY KEY (collection, id),
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_collection_level ON records(collection, classification_level)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
