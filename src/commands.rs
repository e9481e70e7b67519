//! CLI command implementations.
//!
//! Each `run_*` function backs one `prag` subcommand. Results go to stdout;
//! logs and progress go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};

use property_rag_core::models::{Document, DocumentType, Lifecycle, QueryFilter, Stage};
use property_rag_core::value::FieldValue;

use property_rag_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::engine::PropertyRag;
use crate::ingest::IngestRequest;
use crate::progress::ProgressMode;
use crate::sqlite_store::SqliteStore;

async fn open(config: &Config, progress: ProgressMode) -> Result<PropertyRag> {
    let rag = PropertyRag::open(config).await?;
    Ok(rag.with_progress(Arc::from(progress.reporter())))
}

/// Store-only access for read commands, which need no providers.
async fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(db::connect(config).await?).await
}

fn read_pdf(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn filename_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub async fn run_ingest(
    config: &Config,
    files: &[PathBuf],
    declared_type: Option<DocumentType>,
    project: Option<String>,
    progress: ProgressMode,
) -> Result<()> {
    if files.is_empty() {
        bail!("No files given");
    }
    let rag = open(config, progress).await?;

    let mut uploads = Vec::with_capacity(files.len());
    for path in files {
        let request = IngestRequest {
            filename: filename_of(path),
            declared_type,
            project_id: project.clone(),
        };
        uploads.push((read_pdf(path)?, request));
    }

    let mut ready = 0;
    for (path, result) in files.iter().zip(rag.ingest_many(uploads).await) {
        match result {
            Ok(doc) => {
                if doc.lifecycle() == Lifecycle::Ready {
                    ready += 1;
                }
                println!(
                    "{}  {}  {}  {}",
                    doc.id,
                    doc.lifecycle(),
                    doc.document_type(),
                    doc.filename
                );
                for (stage, state) in doc.stages.iter() {
                    if state.is_terminal_failure() {
                        println!("    {stage}: {state}");
                    }
                }
            }
            Err(e) => println!("error  {}  {}", path.display(), e),
        }
    }
    println!("ingested: {} / {} ready", ready, files.len());
    Ok(())
}

pub async fn run_list(config: &Config, project: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let docs = store.list_documents(project).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in &docs {
        println!(
            "{}  {:<10}  {:<22}  {}",
            doc.id,
            doc.lifecycle().as_str(),
            doc.document_type().as_str(),
            doc.filename
        );
    }
    Ok(())
}

pub async fn run_status(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config).await?;
    let Some(doc) = store.get_document(id).await? else {
        bail!("document not found: {}", id);
    };
    print_document(&doc);

    println!();
    println!("--- Transitions ---");
    for t in &store.transitions(id).await? {
        println!(
            "{}  {:<16}  {} -> {}",
            format_ts_iso(t.at),
            t.stage.as_str(),
            t.from,
            t.to
        );
    }
    Ok(())
}

fn print_document(doc: &Document) {
    println!("--- Document ---");
    println!("id:             {}", doc.id);
    println!("filename:       {}", doc.filename);
    if let Some(ref project) = doc.project_id {
        println!("project:        {}", project);
    }
    println!("lifecycle:      {}", doc.lifecycle());
    match &doc.classification {
        Some(c) => println!(
            "type:           {} (confidence {:.2}, {:?})",
            c.document_type, c.confidence, c.source
        ),
        None => println!("type:           (not classified)"),
    }
    if let Some(declared) = doc.declared_type {
        println!("declared_type:  {}", declared);
    }
    println!("pages:          {}", doc.page_count);
    println!("content_hash:   {}", doc.content_hash);
    println!("created_at:     {}", format_ts_iso(doc.created_at));
    println!("updated_at:     {}", format_ts_iso(doc.updated_at));
    println!();
    println!("--- Stages ---");
    for (stage, state) in doc.stages.iter() {
        println!("{:<16} {}", stage.as_str(), state);
    }
}

pub async fn run_record(config: &Config, id: &str, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    if store.get_document(id).await?.is_none() {
        bail!("document not found: {}", id);
    }
    let Some(record) = store.get_record(id).await? else {
        bail!("document {} has no extracted record yet", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("--- Extracted Record ---");
    println!("document_id:   {}", record.document_id);
    println!("type:          {}", record.document_type);
    println!(
        "confidence:    {:.2} ({} / {} fields)",
        record.confidence,
        record.filled(),
        record.fields.len()
    );
    println!("extracted_at:  {}", format_ts_iso(record.extracted_at));
    println!();
    for field in &record.fields {
        match &field.value {
            Some(value) => println!("{:<22} {}", field.name, display_value(value)),
            None => println!("{:<22} (not found)", field.name),
        }
    }
    Ok(())
}

fn display_value(value: &FieldValue) -> String {
    let s = value.to_string();
    if s.chars().count() > 100 {
        let cut: String = s.chars().take(100).collect();
        format!("{cut}...")
    } else {
        s
    }
}

pub async fn run_query(
    config: &Config,
    question: &str,
    project: Option<String>,
    documents: Vec<String>,
    types: Vec<DocumentType>,
    top_k: Option<usize>,
) -> Result<()> {
    let rag = PropertyRag::open(config).await?;
    let filter = QueryFilter {
        project_id: project,
        document_ids: documents,
        document_types: types,
    };
    let result = rag.query_top_k(question, Some(filter), top_k).await?;

    println!("{}", result.answer);
    if !result.citations.is_empty() {
        println!();
        println!("Sources:");
        for c in &result.citations {
            println!(
                "  [{}] {}, page {}  (score: {:.2})",
                c.label, c.filename, c.page, c.score
            );
            println!("      chunk: {}", c.chunk_id);
        }
    }
    Ok(())
}

pub async fn run_retry(
    config: &Config,
    id: &str,
    stage: Stage,
    progress: ProgressMode,
) -> Result<()> {
    let rag = open(config, progress).await?;
    let doc = rag.retry_stage(id, stage).await?;
    print_document(&doc);
    Ok(())
}

pub async fn run_reingest(
    config: &Config,
    id: &str,
    file: &Path,
    progress: ProgressMode,
) -> Result<()> {
    let rag = open(config, progress).await?;
    let doc = rag.reingest(id, read_pdf(file)?).await?;
    print_document(&doc);
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
