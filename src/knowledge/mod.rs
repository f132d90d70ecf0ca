//! Knowledge retrieval seam.
//!
//! The vector store proper is an external collaborator; [`KnowledgePort`]
//! is its contract, always tenant-filtered. The bundled implementation
//! ranks stored chunks by term overlap against the SQLite mirror, which is
//! enough for tests and small deployments. Retrieval is lazy: only
//! Decision or a handler asks for it.

use async_trait::async_trait;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{Db, StoreError};
use crate::types::Classification;

/// A retrieved knowledge chunk.
#[derive(Debug, Clone)]
pub struct KnowledgeChunk {
    pub id: Uuid,
    pub content: String,
    pub source: Option<String>,
    pub classification: Classification,
    pub score: f64,
}

/// Knowledge retrieval errors.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Backing store failed.
    #[error("knowledge store error: {0}")]
    Store(#[from] StoreError),
    /// Upstream vector service failed.
    #[error("knowledge service unavailable: {0}")]
    Unavailable(String),
}

/// The retrieval seam. Every query carries the tenant filter.
#[async_trait]
pub trait KnowledgePort: Send + Sync {
    /// Top-k chunks relevant to the query within the tenant, best first.
    /// Chunks classified above `max_classification` are excluded.
    async fn search(
        &self,
        tenant_id: Uuid,
        query: &str,
        top_k: usize,
        max_classification: Classification,
    ) -> Result<Vec<KnowledgeChunk>, KnowledgeError>;
}

/// Term-overlap retrieval over the SQLite chunk mirror.
pub struct SqliteKnowledge {
    pool: sqlx::SqlitePool,
}

impl SqliteKnowledge {
    /// Create a retriever over the shared pool.
    pub fn new(db: &Db) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl KnowledgePort for SqliteKnowledge {
    async fn search(
        &self,
        tenant_id: Uuid,
        query: &str,
        top_k: usize,
        max_classification: Classification,
    ) -> Result<Vec<KnowledgeChunk>, KnowledgeError> {
        let rows = sqlx::query(
            "SELECT id, content, source, classification FROM knowledge_chunks \
             WHERE tenant_id = ?1",
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        let terms = query_terms(query);
        let mut scored = Vec::new();
        for row in rows {
            let raw_class: String = row.get("classification");
            let classification: Classification = raw_class
                .parse()
                .map_err(|_| StoreError::InvalidValue {
                    field: "classification",
                    value: raw_class.clone(),
                })?;
            if classification > max_classification {
                continue;
            }
            let content: String = row.get("content");
            let score = overlap_score(&terms, &content);
            if score <= 0.0 {
                continue;
            }
            scored.push(KnowledgeChunk {
                id: crate::store::parse_uuid(row.get::<String, _>("id").as_str())?,
                content,
                source: row.get("source"),
                classification,
                score,
            });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Split a query into lowercase terms, keeping CJK runs whole.
fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
        .filter(|t| !t.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Fraction of query terms present in the chunk.
fn overlap_score(terms: &[String], content: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lowered = content.to_lowercase();
    let hits = terms.iter().filter(|t| lowered.contains(t.as_str())).count();
    hits_as_fraction(hits, terms.len())
}

fn hits_as_fraction(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        let hits = u32::try_from(hits).unwrap_or(u32::MAX);
        let total = u32::try_from(total).unwrap_or(u32::MAX);
        f64::from(hits) / f64::from(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::seed_tenant;

    async fn seed_chunk(db: &Db, tenant_id: Uuid, content: &str, classification: &str) {
        sqlx::query(
            "INSERT INTO knowledge_chunks (tenant_id, id, content, classification) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(tenant_id.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(content)
        .bind(classification)
        .execute(db.pool())
        .await
        .expect("seed chunk");
    }

    #[tokio::test]
    async fn ranked_by_term_overlap() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        seed_chunk(&db, t, "expense report procedure for travel costs", "internal").await;
        seed_chunk(&db, t, "office cleaning roster", "internal").await;

        let knowledge = SqliteKnowledge::new(&db);
        let chunks = knowledge
            .search(t, "expense report", 5, Classification::Confidential)
            .await
            .expect("search");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("expense"));
        db.shutdown().await;
    }

    #[tokio::test]
    async fn classification_ceiling_applies() {
        let db = Db::open_in_memory().await.expect("open");
        let t = seed_tenant(&db, "org-1").await;
        seed_chunk(&db, t, "salary bands by grade", "restricted").await;

        let knowledge = SqliteKnowledge::new(&db);
        let chunks = knowledge
            .search(t, "salary bands", 5, Classification::Internal)
            .await
            .expect("search");
        assert!(chunks.is_empty());
        db.shutdown().await;
    }

    #[tokio::test]
    async fn tenant_filter_blocks_cross_reads() {
        let db = Db::open_in_memory().await.expect("open");
        let t1 = seed_tenant(&db, "org-1").await;
        let t2 = seed_tenant(&db, "org-2").await;
        seed_chunk(&db, t1, "tenant one secret recipe", "internal").await;

        let knowledge = SqliteKnowledge::new(&db);
        let chunks = knowledge
            .search(t2, "secret recipe", 5, Classification::Restricted)
            .await
            .expect("search");
        assert!(chunks.is_empty());
        db.shutdown().await;
    }
}
