//! SQLite-backed [`Store`] implementation.
//!
//! Structured document state (classification, stage map) is stored as JSON
//! columns; vectors are little-endian `f32` BLOBs. Similarity is computed in
//! Rust by the retriever over the candidates returned here.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use property_rag_core::embedding::{blob_to_vec, vec_to_blob};
use property_rag_core::models::{
    Chunk, Document, DocumentType, Embedding, ExtractedRecord, Page, QueryFilter, Stage,
    StageState, StageTransition,
};
use property_rag_core::retrieval::VectorCandidate;
use property_rag_core::store::Store;

use crate::migrate;

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap `pool` after making sure the schema exists.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        migrate::migrate_pool(&pool).await?;
        Ok(Self { pool })
    }
}

const DOCUMENT_COLUMNS: &str = "id, filename, project_id, content_hash, declared_type, \
     classification_json, page_count, stages_json, created_at, updated_at";

const CHUNK_COLUMNS: &str = "c.seq, c.id, c.document_id, c.chunk_index, c.text, c.hash, \
     c.token_start, c.token_count, c.start_offset, c.end_offset, c.page_start, c.page_end";

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let id: String = row.get("id");
    let declared: Option<String> = row.get("declared_type");
    let classification: Option<String> = row.get("classification_json");
    let stages: String = row.get("stages_json");
    let page_count: i64 = row.get("page_count");

    Ok(Document {
        declared_type: declared.as_deref().and_then(DocumentType::from_label),
        classification: classification
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .with_context(|| format!("corrupt classification for document {id}"))?,
        stages: serde_json::from_str(&stages)
            .with_context(|| format!("corrupt stage map for document {id}"))?,
        filename: row.get("filename"),
        project_id: row.get("project_id"),
        content_hash: row.get("content_hash"),
        page_count: page_count as usize,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        id,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let usize_col = |name: &str| row.get::<i64, _>(name) as usize;
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        hash: row.get("hash"),
        token_start: usize_col("token_start"),
        token_count: usize_col("token_count"),
        start_offset: usize_col("start_offset"),
        end_offset: usize_col("end_offset"),
        page_start: row.get::<i64, _>("page_start") as u32,
        page_end: row.get::<i64, _>("page_end") as u32,
    }
}

fn state_to_json(state: &StageState) -> Result<String> {
    Ok(serde_json::to_string(state)?)
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_document(&self, doc: &Document) -> Result<()> {
        let classification = doc
            .classification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let stages = serde_json::to_string(&doc.stages)?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, project_id, content_hash, declared_type,
                                   classification_json, page_count, stages_json,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                project_id = excluded.project_id,
                content_hash = excluded.content_hash,
                declared_type = excluded.declared_type,
                classification_json = excluded.classification_json,
                page_count = excluded.page_count,
                stages_json = excluded.stages_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.project_id)
        .bind(&doc.content_hash)
        .bind(doc.declared_type.map(|t| t.as_str()))
        .bind(classification)
        .bind(doc.page_count as i64)
        .bind(stages)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, project_id: Option<&str>) -> Result<Vec<Document>> {
        let rows = match project_id {
            Some(project) => {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE project_id = ? \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(project)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at ASC, id ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(document_from_row).collect()
    }

    async fn save_source(&self, document_id: &str, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (document_id, bytes) VALUES (?, ?)
            ON CONFLICT(document_id) DO UPDATE SET bytes = excluded.bytes
            "#,
        )
        .bind(document_id)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_source(&self, document_id: &str) -> Result<Option<Vec<u8>>> {
        let bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT bytes FROM sources WHERE document_id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(bytes)
    }

    async fn replace_pages(&self, document_id: &str, pages: &[Page]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pages WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for page in pages {
            sqlx::query("INSERT INTO pages (document_id, page_number, text) VALUES (?, ?, ?)")
                .bind(document_id)
                .bind(page.number as i64)
                .bind(&page.text)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_pages(&self, document_id: &str) -> Result<Vec<Page>> {
        let rows = sqlx::query(
            "SELECT page_number, text FROM pages WHERE document_id = ? ORDER BY page_number ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Page {
                number: row.get::<i64, _>("page_number") as u32,
                text: row.get("text"),
            })
            .collect())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, hash, token_start,
                                    token_count, start_offset, end_offset, page_start, page_end)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(chunk.token_start as i64)
            .bind(chunk.token_count as i64)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(chunk.page_start as i64)
            .bind(chunk.page_end as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.document_id = ? ORDER BY c.chunk_index ASC"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn replace_embeddings(&self, document_id: &str, embeddings: &[Embedding]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for e in embeddings {
            sqlx::query(
                r#"
                INSERT INTO embeddings (chunk_id, document_id, model, dims, vector)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&e.chunk_id)
            .bind(document_id)
            .bind(&e.model)
            .bind(e.vector.len() as i64)
            .bind(vec_to_blob(&e.vector))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to store embedding for chunk {}", e.chunk_id))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn count_embeddings(&self, document_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn save_record(&self, record: &ExtractedRecord) -> Result<()> {
        let fields = serde_json::to_string(&record.fields)?;

        sqlx::query(
            r#"
            INSERT INTO extracted_records (document_id, document_type, fields_json,
                                           confidence, extracted_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                document_type = excluded.document_type,
                fields_json = excluded.fields_json,
                confidence = excluded.confidence,
                extracted_at = excluded.extracted_at
            "#,
        )
        .bind(&record.document_id)
        .bind(record.document_type.as_str())
        .bind(fields)
        .bind(record.confidence as f64)
        .bind(record.extracted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_record(&self, document_id: &str) -> Result<Option<ExtractedRecord>> {
        let row = sqlx::query(
            "SELECT document_id, document_type, fields_json, confidence, extracted_at \
             FROM extracted_records WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let type_label: String = row.get("document_type");
        let fields_json: String = row.get("fields_json");
        let confidence: f64 = row.get("confidence");

        Ok(Some(ExtractedRecord {
            document_id: row.get("document_id"),
            document_type: DocumentType::from_label(&type_label)
                .with_context(|| format!("unknown stored document type '{type_label}'"))?,
            fields: serde_json::from_str(&fields_json)
                .with_context(|| format!("corrupt record for document {document_id}"))?,
            confidence: confidence as f32,
            extracted_at: row.get("extracted_at"),
        }))
    }

    async fn clear_derived(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["embeddings", "chunks", "pages", "extracted_records"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE document_id = ?"))
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_transition(&self, transition: &StageTransition) -> Result<()> {
        sqlx::query(
            "INSERT INTO stage_transitions (document_id, stage, from_state, to_state, at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&transition.document_id)
        .bind(transition.stage.as_str())
        .bind(state_to_json(&transition.from)?)
        .bind(state_to_json(&transition.to)?)
        .bind(transition.at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transitions(&self, document_id: &str) -> Result<Vec<StageTransition>> {
        let rows = sqlx::query(
            "SELECT document_id, stage, from_state, to_state, at FROM stage_transitions \
             WHERE document_id = ? ORDER BY id ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StageTransition> {
                let stage: String = row.get("stage");
                let from: String = row.get("from_state");
                let to: String = row.get("to_state");
                Ok(StageTransition {
                    document_id: row.get("document_id"),
                    stage: stage.parse::<Stage>().map_err(anyhow::Error::msg)?,
                    from: serde_json::from_str(&from)?,
                    to: serde_json::from_str(&to)?,
                    at: row.get("at"),
                })
            })
            .collect()
    }

    async fn vector_candidates(&self, filter: &QueryFilter) -> Result<Vec<VectorCandidate>> {
        let eligible: HashMap<String, String> = self
            .list_documents(filter.project_id.as_deref())
            .await?
            .into_iter()
            .filter(|d| filter.matches(d))
            .map(|d| (d.id, d.filename))
            .collect();
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS}, e.vector FROM chunks c \
             JOIN embeddings e ON e.chunk_id = c.id ORDER BY c.seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let document_id: String = row.get("document_id");
                let filename = eligible.get(&document_id)?;
                let blob: Vec<u8> = row.get("vector");
                Some(VectorCandidate {
                    chunk: chunk_from_row(row),
                    filename: filename.clone(),
                    vector: blob_to_vec(&blob),
                    ordinal: row.get("seq"),
                })
            })
            .collect())
    }
}
