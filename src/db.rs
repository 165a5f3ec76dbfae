//! Database connection and schema management.
//!
//! Creates the shared Postgres pool and ensures all required tables exist.
//! Designed to be run on every startup.
//!
//! # Schema
//!
//! ```text
//! ┌────────────────┐     ┌────────────────┐
//! │ research_jobs  │──┐  │ research_logs  │
//! │                │  │  │                │
//! │ id (PK)        │  └──│ job_id         │
//! │ topic          │     │ timestamp      │
//! │ status         │     │ level          │
//! │ config         │     │ message        │
//! │ state          │     │ metadata       │
//! │ report         │     └────────────────┘
//! └────────────────┘
//!
//! ┌────────────────┐     ┌────────────────┐
//! │ conversations  │──┐  │   messages     │
//! │                │  │  │                │
//! │ id (PK)        │  └──│ conversation_id│
//! │ title          │     │ role           │
//! │ created_at     │     │ content        │
//! │ updated_at     │     │ created_at     │
//! └────────────────┘     └────────────────┘
//! ```
//!
//! Vector collections are created on demand by the vector store and are
//! not part of the fixed schema.
//!
//! # Idempotency
//!
//! All statements use `CREATE ... IF NOT EXISTS` or
//! `ADD COLUMN IF NOT EXISTS`. Running the init multiple times is safe.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open the shared connection pool.
///
/// All database access in the application flows through this pool.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .connect(database_url)
        .await
        .with_context(|| "failed to create connection pool")?;

    Ok(pool)
}

/// Create all application tables and indexes. Safe to call repeatedly.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_jobs (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            topic TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            config JSONB,
            report TEXT,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .with_context(|| "failed to create research_jobs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_logs (
            id SERIAL PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES research_jobs(id) ON DELETE CASCADE,
            timestamp TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            metadata JSONB
        )
        "#,
    )
    .execute(pool)
    .await
    .with_context(|| "failed to create research_logs table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_research_logs_job_id ON research_logs(job_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_research_jobs_created_at ON research_jobs(created_at DESC)",
    )
    .execute(pool)
    .await?;

    // Migration: older deployments predate the state snapshot column.
    sqlx::query("ALTER TABLE research_jobs ADD COLUMN IF NOT EXISTS state JSONB")
        .execute(pool)
        .await
        .with_context(|| "failed to add state column")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            title TEXT NOT NULL DEFAULT 'New Conversation',
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .with_context(|| "failed to create conversations table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            conversation_id UUID NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .with_context(|| "failed to create messages table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
