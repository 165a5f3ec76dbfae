//! Vector store over Postgres with the pgvector extension.
//!
//! Each collection is a dynamically named table holding embedded documents.
//! Because the table name flows into SQL text, every entry point validates
//! it against a strict identifier pattern; all user-supplied *data* reaches
//! the database exclusively through bind parameters.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`DocumentStore::ensure_collection`] | Idempotent table + HNSW index creation |
//! | [`DocumentStore::add_documents`] | Batched multi-row insert |
//! | [`DocumentStore::similarity_search`] | kNN by cosine distance, optional source filter |
//! | [`DocumentStore::get_by_source`] | All documents for one `source` metadata value |
//! | [`DocumentStore::get_by_metadata`] | Recursive `$and`/`$or`/`$not` filter query |
//! | [`DocumentStore::update_metadata`] | JSONB merge patch on one document |
//!
//! # Metadata filter grammar
//!
//! - `{}` → `TRUE`
//! - `{"$and": [f, ...]}` / `{"$or": [f, ...]}` → parenthesized conjunction
//!   or disjunction of sub-filters; an empty list compiles to `TRUE`
//! - `{"$not": f}` → `NOT (...)`
//! - any other key → containment predicate `metadata @> $n` bound to the
//!   JSON-encoded `{key: value}` pair
//! - multiple plain keys in one object are joined with `AND`

use async_trait::async_trait;
use pgvector::Vector;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::postgres::PgPool;
use sqlx::{QueryBuilder, Row};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::models::{Document, ScoredDocument};

/// Table names must look like unquoted Postgres identifiers: start with a
/// lowercase letter or underscore, 1–63 characters total.
static TABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-zA-Z0-9_]{0,62}$").expect("valid pattern"));

/// Errors produced by the vector store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(
        "invalid collection name: must contain only alphanumeric characters and underscores, \
         start with a letter or underscore, and be 1-63 characters long"
    )]
    InvalidCollectionName,

    #[error("invalid metadata filter: {0}")]
    FilterType(String),

    #[error("no document found with id {0}")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage seam for everything that indexes or retrieves documents.
///
/// The production implementation is [`PgVectorStore`]; tests drive the
/// orchestrator and the retrieval tools through in-memory fakes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotently create the collection table (and index) for `dims`.
    async fn ensure_collection(&self, dims: u32) -> Result<(), StoreError>;

    /// Insert all documents in one batched round-trip.
    async fn add_documents(&self, docs: Vec<Document>) -> Result<(), StoreError>;

    /// Return up to `top_k` documents by ascending cosine distance.
    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: i64,
        source_filter: Option<&str>,
    ) -> Result<Vec<ScoredDocument>, StoreError>;

    /// Return all documents whose metadata `source` equals the argument.
    async fn get_by_source(&self, source: &str) -> Result<Vec<Document>, StoreError>;

    /// Return documents matching a recursive metadata filter.
    async fn get_by_metadata(&self, filter: &Map<String, Value>)
        -> Result<Vec<Document>, StoreError>;

    /// Merge `patch` into the metadata of one document.
    async fn update_metadata(
        &self,
        id: Uuid,
        patch: &Map<String, Value>,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed vector store bound to one collection.
#[derive(Clone)]
pub struct PgVectorStore {
    pool: PgPool,
    table: String,
}

impl PgVectorStore {
    /// Bind a store to a collection, validating the table name.
    pub fn new(pool: PgPool, table: &str) -> Result<Self, StoreError> {
        if !is_valid_table_name(table) {
            return Err(StoreError::InvalidCollectionName);
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Quoted identifier for SQL interpolation. Only safe because the name
    /// passed the identifier pattern at construction.
    fn ident(&self) -> String {
        format!("\"{}\"", self.table)
    }
}

fn is_valid_table_name(name: &str) -> bool {
    TABLE_NAME_RE.is_match(name)
}

/// Build the DDL statements for a collection table.
///
/// HNSW supports at most 2000 dimensions; beyond that only the table is
/// created and searches fall back to exact scans.
fn collection_ddl(table: &str, dims: u32) -> Vec<String> {
    let mut statements = vec![format!(
        r#"CREATE TABLE IF NOT EXISTS "{table}" (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            content TEXT NOT NULL,
            metadata JSONB,
            embedding vector({dims}),
            created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
        )"#
    )];

    if dims <= 2000 {
        statements.push(format!(
            r#"CREATE INDEX IF NOT EXISTS {table}_embedding_idx
            ON "{table}" USING hnsw (embedding vector_cosine_ops)"#
        ));
    }

    statements
}

/// Compile a metadata filter tree into a SQL predicate.
///
/// Bind values are appended to `params` in visitation order, and each
/// emitted placeholder `$n` refers to the n-th element of `params`. User
/// keys and values never appear in the returned SQL text.
fn compile_filter(filter: &Map<String, Value>, params: &mut Vec<Value>) -> Result<String, StoreError> {
    if filter.is_empty() {
        return Ok("TRUE".to_string());
    }

    let mut conditions = Vec::new();

    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                let list = value.as_array().ok_or_else(|| {
                    StoreError::FilterType(format!("value for {key} must be a list of conditions"))
                })?;

                let mut sub = Vec::with_capacity(list.len());
                for item in list {
                    let obj = item.as_object().ok_or_else(|| {
                        StoreError::FilterType(format!("item in {key} list must be a JSON object"))
                    })?;
                    sub.push(format!("({})", compile_filter(obj, params)?));
                }

                if sub.is_empty() {
                    continue;
                }

                let op = if key == "$or" { " OR " } else { " AND " };
                conditions.push(format!("({})", sub.join(op)));
            }
            "$not" => {
                let obj = value.as_object().ok_or_else(|| {
                    StoreError::FilterType("value for $not must be a JSON object".to_string())
                })?;
                conditions.push(format!("NOT ({})", compile_filter(obj, params)?));
            }
            _ => {
                // Plain key: containment match on the single-pair object.
                let mut pair = Map::new();
                pair.insert(key.clone(), value.clone());
                params.push(Value::Object(pair));
                conditions.push(format!("metadata @> ${}", params.len()));
            }
        }
    }

    if conditions.is_empty() {
        return Ok("TRUE".to_string());
    }

    Ok(conditions.join(" AND "))
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let content: String = row.try_get("content")?;
    let metadata: Option<Value> = row.try_get("metadata")?;

    let metadata = match metadata {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    Ok(Document {
        id: id.to_string(),
        content,
        metadata,
        embedding: None,
    })
}

#[async_trait]
impl DocumentStore for PgVectorStore {
    async fn ensure_collection(&self, dims: u32) -> Result<(), StoreError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;
        for statement in collection_ddl(&self.table, dims) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn add_documents(&self, docs: Vec<Document>) -> Result<(), StoreError> {
        if docs.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} (content, metadata, embedding) ",
            self.ident()
        ));
        builder.push_values(docs, |mut b, doc| {
            let embedding = doc.embedding.unwrap_or_default();
            b.push_bind(doc.content)
                .push_bind(Value::Object(doc.metadata))
                .push_bind(Vector::from(embedding));
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        top_k: i64,
        source_filter: Option<&str>,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        let embedding = Vector::from(query.to_vec());

        let rows = match source_filter.filter(|s| !s.is_empty()) {
            Some(source) => {
                let sql = format!(
                    r#"
                    SELECT id, content, metadata, 1 - (embedding <=> $1) AS similarity
                    FROM {}
                    WHERE metadata->>'source' = $2
                    ORDER BY embedding <=> $1
                    LIMIT $3
                    "#,
                    self.ident()
                );
                sqlx::query(&sql)
                    .bind(&embedding)
                    .bind(source)
                    .bind(top_k)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    r#"
                    SELECT id, content, metadata, 1 - (embedding <=> $1) AS similarity
                    FROM {}
                    ORDER BY embedding <=> $1
                    LIMIT $2
                    "#,
                    self.ident()
                );
                sqlx::query(&sql)
                    .bind(&embedding)
                    .bind(top_k)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let score: f64 = row.try_get("similarity")?;
            results.push(ScoredDocument {
                document: row_to_document(row)?,
                score,
            });
        }
        Ok(results)
    }

    async fn get_by_source(&self, source: &str) -> Result<Vec<Document>, StoreError> {
        let sql = format!(
            "SELECT id, content, metadata FROM {} WHERE metadata->>'source' = $1",
            self.ident()
        );
        let rows = sqlx::query(&sql).bind(source).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn get_by_metadata(
        &self,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Document>, StoreError> {
        let mut params = Vec::new();
        let predicate = compile_filter(filter, &mut params)?;

        let sql = format!(
            "SELECT id, content, metadata FROM {} WHERE {}",
            self.ident(),
            predicate
        );

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = query.bind(param);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn update_metadata(
        &self,
        id: Uuid,
        patch: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET metadata = metadata || $1 WHERE id = $2",
            self.ident()
        );
        let result = sqlx::query(&sql)
            .bind(Value::Object(patch.clone()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().expect("object literal").clone()
    }

    #[test]
    fn test_table_name_accepts_minimal() {
        assert!(is_valid_table_name("a"));
        assert!(is_valid_table_name("_private"));
        assert!(is_valid_table_name("thesis_db"));
    }

    #[test]
    fn test_table_name_length_boundary() {
        let ok: String = std::iter::repeat('a').take(63).collect();
        let too_long: String = std::iter::repeat('a').take(64).collect();
        assert!(is_valid_table_name(&ok));
        assert!(!is_valid_table_name(&too_long));
    }

    #[test]
    fn test_table_name_rejects_bad_shapes() {
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("1abc"));
        assert!(!is_valid_table_name("Upper"));
        assert!(!is_valid_table_name("users; DROP TABLE x"));
        assert!(!is_valid_table_name("has space"));
        assert!(!is_valid_table_name("semi;colon"));
    }

    #[test]
    fn test_collection_ddl_creates_index_up_to_2000() {
        let stmts = collection_ddl("docs", 1536);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("vector(1536)"));
        assert!(stmts[1].contains("docs_embedding_idx"));
        assert!(stmts[1].contains("vector_cosine_ops"));

        let boundary = collection_ddl("docs", 2000);
        assert_eq!(boundary.len(), 2);
    }

    #[test]
    fn test_collection_ddl_skips_index_above_2000() {
        let stmts = collection_ddl("docs", 2001);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains("vector(2001)"));
    }

    #[test]
    fn test_empty_filter_is_true() {
        let mut params = Vec::new();
        let sql = compile_filter(&Map::new(), &mut params).unwrap();
        assert_eq!(sql, "TRUE");
        assert!(params.is_empty());
    }

    #[test]
    fn test_plain_key_binds_pair() {
        let mut params = Vec::new();
        let sql = compile_filter(&obj(json!({"source": "arxiv"})), &mut params).unwrap();
        assert_eq!(sql, "metadata @> $1");
        assert_eq!(params, vec![json!({"source": "arxiv"})]);
    }

    #[test]
    fn test_multiple_plain_keys_join_with_and() {
        let mut params = Vec::new();
        let sql = compile_filter(&obj(json!({"a": 1, "b": 2})), &mut params).unwrap();
        assert_eq!(sql, "metadata @> $1 AND metadata @> $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_empty_or_is_true() {
        let mut params = Vec::new();
        let sql = compile_filter(&obj(json!({"$or": []})), &mut params).unwrap();
        assert_eq!(sql, "TRUE");
        assert!(params.is_empty());
    }

    #[test]
    fn test_and_of_empty_object() {
        let mut params = Vec::new();
        let sql = compile_filter(&obj(json!({"$and": [{}]})), &mut params).unwrap();
        assert_eq!(sql, "((TRUE))");
        assert!(params.is_empty());
    }

    #[test]
    fn test_nested_or_and() {
        let mut params = Vec::new();
        let filter = obj(json!({
            "$or": [
                {"a": 1},
                {"$and": [{"b": 2}, {"c": 3}]}
            ]
        }));
        let sql = compile_filter(&filter, &mut params).unwrap();
        assert_eq!(
            sql,
            "((metadata @> $1) OR (((metadata @> $2) AND (metadata @> $3))))"
        );
        assert_eq!(
            params,
            vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]
        );
    }

    #[test]
    fn test_not_wraps_predicate() {
        let mut params = Vec::new();
        let sql = compile_filter(&obj(json!({"$not": {"a": 1}})), &mut params).unwrap();
        assert_eq!(sql, "NOT (metadata @> $1)");
        assert_eq!(params, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_operator_type_errors() {
        let mut params = Vec::new();
        assert!(matches!(
            compile_filter(&obj(json!({"$and": "not-a-list"})), &mut params),
            Err(StoreError::FilterType(_))
        ));
        assert!(matches!(
            compile_filter(&obj(json!({"$or": [42]})), &mut params),
            Err(StoreError::FilterType(_))
        ));
        assert!(matches!(
            compile_filter(&obj(json!({"$not": [1, 2]})), &mut params),
            Err(StoreError::FilterType(_))
        ));
    }

    #[test]
    fn test_user_data_never_reaches_sql_text() {
        let mut params = Vec::new();
        let filter = obj(json!({
            "source'; DROP TABLE docs; --": "x') OR 1=1",
            "$or": [{"k": "'); DELETE FROM docs; --"}]
        }));
        let sql = compile_filter(&filter, &mut params).unwrap();
        assert!(!sql.contains("DROP"));
        assert!(!sql.contains("DELETE"));
        assert!(!sql.contains('\''));
        // Everything user-supplied rides in the bind parameters.
        assert_eq!(params.len(), 2);
    }
}
