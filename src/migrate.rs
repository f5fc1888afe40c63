use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create documents table. Ids are unique per tenant, so two tenants can
    // import the same snapshot.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            workspace TEXT NOT NULL DEFAULT 'default',
            status TEXT NOT NULL DEFAULT 'pending',
            title TEXT,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create chunks table. Rowid order is insertion order and breaks
    // similarity ties.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            workspace TEXT NOT NULL DEFAULT 'default',
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            embedding TEXT,
            PRIMARY KEY (tenant_id, id),
            UNIQUE(tenant_id, document_id, chunk_index),
            FOREIGN KEY (tenant_id, document_id) REFERENCES documents(tenant_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create entities table; source_chunk_ids is a JSON array
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            workspace TEXT NOT NULL DEFAULT 'default',
            name TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            description TEXT,
            source_chunk_ids TEXT NOT NULL DEFAULT '[]',
            embedding TEXT,
            PRIMARY KEY (tenant_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relations (
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            workspace TEXT NOT NULL DEFAULT 'default',
            source_entity_id TEXT NOT NULL,
            target_entity_id TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            description TEXT,
            source_chunk_ids TEXT NOT NULL DEFAULT '[]',
            embedding TEXT,
            PRIMARY KEY (tenant_id, id),
            FOREIGN KEY (tenant_id, source_entity_id) REFERENCES entities(tenant_id, id),
            FOREIGN KEY (tenant_id, target_entity_id) REFERENCES entities(tenant_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenant_plans (
            tenant_id TEXT PRIMARY KEY,
            plan TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Monthly counters; period is 'YYYY-MM' in UTC
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage (
            tenant_id TEXT NOT NULL,
            period TEXT NOT NULL,
            queries INTEGER NOT NULL DEFAULT 0,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant_id, period)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_tenant_workspace ON chunks(tenant_id, workspace)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(tenant_id, document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_tenant_workspace ON entities(tenant_id, workspace)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_relations_tenant_workspace ON relations(tenant_id, workspace)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
