//! Core data models for the ingestion and query pipeline.
//!
//! A [`Document`] is one uploaded PDF. The orchestrator is the only writer
//! of its stage map; every other component receives inputs by value and
//! returns results for the orchestrator to apply.
//!
//! ```text
//! bytes ──▶ Page[] ──▶ Chunk[] ──▶ Embedding[]
//!              │
//!              └──▶ Classification ──▶ ExtractedRecord
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::value::FieldValue;

/// Closed taxonomy of real-estate document types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    Lease,
    Appraisal,
    LandRegistryExtract,
    UtilityStatement,
    Unknown,
}

impl DocumentType {
    pub const ALL: [DocumentType; 5] = [
        DocumentType::Lease,
        DocumentType::Appraisal,
        DocumentType::LandRegistryExtract,
        DocumentType::UtilityStatement,
        DocumentType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Lease => "lease",
            DocumentType::Appraisal => "appraisal",
            DocumentType::LandRegistryExtract => "land-registry-extract",
            DocumentType::UtilityStatement => "utility-statement",
            DocumentType::Unknown => "unknown",
        }
    }

    /// Short description used when enumerating the taxonomy in prompts.
    pub fn description(&self) -> &'static str {
        match self {
            DocumentType::Lease => "residential or commercial lease agreement (Mietvertrag)",
            DocumentType::Appraisal => "property valuation report (Gutachten, Wertgutachten)",
            DocumentType::LandRegistryExtract => "land registry extract (Grundbuchauszug)",
            DocumentType::UtilityStatement => {
                "utility or service-charge statement (Nebenkostenabrechnung)"
            }
            DocumentType::Unknown => "none of the above",
        }
    }

    /// Resolve a label exactly as listed in the taxonomy.
    pub fn from_label(label: &str) -> Option<DocumentType> {
        Self::ALL.iter().copied().find(|t| t.as_str() == label)
    }

    /// Resolve a loosely written label: case, `_`/space separators, and
    /// German document names are accepted.
    pub fn from_alias(raw: &str) -> Option<DocumentType> {
        let norm: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '_' || c == ' ' { '-' } else { c })
            .collect();
        if let Some(t) = Self::from_label(&norm) {
            return Some(t);
        }
        let t = match norm.as_str() {
            "mietvertrag" | "gewerbemietvertrag" | "rental-agreement" | "lease-agreement" => {
                DocumentType::Lease
            }
            "gutachten" | "wertgutachten" | "verkehrswertgutachten" | "valuation" => {
                DocumentType::Appraisal
            }
            "grundbuchauszug" | "grundbuch" | "land-registry" | "land-register-extract" => {
                DocumentType::LandRegistryExtract
            }
            "nebenkostenabrechnung" | "betriebskostenabrechnung" | "utility-bill"
            | "service-charge-statement" => DocumentType::UtilityStatement,
            "sonstiges" | "other" => DocumentType::Unknown,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentType::from_alias(s).ok_or_else(|| format!("unknown document type: {s}"))
    }
}

/// Pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    Classification,
    Chunking,
    FieldExtraction,
    Embedding,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Extraction,
        Stage::Classification,
        Stage::Chunking,
        Stage::FieldExtraction,
        Stage::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Classification => "classification",
            Stage::Chunking => "chunking",
            Stage::FieldExtraction => "field_extraction",
            Stage::Embedding => "embedding",
        }
    }

    /// Stages whose outputs this stage consumes.
    pub fn prerequisites(&self) -> &'static [Stage] {
        match self {
            Stage::Extraction => &[],
            Stage::Classification | Stage::Chunking => &[Stage::Extraction],
            Stage::FieldExtraction => &[Stage::Extraction, Stage::Classification],
            Stage::Embedding => &[Stage::Chunking],
        }
    }

    /// This stage plus every stage that transitively depends on it.
    pub fn with_dependents(&self) -> BTreeSet<Stage> {
        let mut out = BTreeSet::from([*self]);
        loop {
            let before = out.len();
            for s in Stage::ALL {
                if s.prerequisites().iter().any(|p| out.contains(p)) {
                    out.insert(s);
                }
            }
            if out.len() == before {
                return out;
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_lowercase().replace('-', "_");
        Stage::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == norm)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl StageState {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, StageState::Failed(_) | StageState::Cancelled)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Pending => f.write_str("pending"),
            StageState::Running => f.write_str("running"),
            StageState::Succeeded => f.write_str("succeeded"),
            StageState::Failed(reason) => write!(f, "failed({reason})"),
            StageState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Per-stage state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStates {
    pub extraction: StageState,
    pub classification: StageState,
    pub chunking: StageState,
    pub field_extraction: StageState,
    pub embedding: StageState,
}

impl Default for StageStates {
    fn default() -> Self {
        Self {
            extraction: StageState::Pending,
            classification: StageState::Pending,
            chunking: StageState::Pending,
            field_extraction: StageState::Pending,
            embedding: StageState::Pending,
        }
    }
}

impl StageStates {
    pub fn get(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Extraction => &self.extraction,
            Stage::Classification => &self.classification,
            Stage::Chunking => &self.chunking,
            Stage::FieldExtraction => &self.field_extraction,
            Stage::Embedding => &self.embedding,
        }
    }

    pub fn set(&mut self, stage: Stage, state: StageState) {
        let slot = match stage {
            Stage::Extraction => &mut self.extraction,
            Stage::Classification => &mut self.classification,
            Stage::Chunking => &mut self.chunking,
            Stage::FieldExtraction => &mut self.field_extraction,
            Stage::Embedding => &mut self.embedding,
        };
        *slot = state;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &StageState)> + '_ {
        Stage::ALL.into_iter().map(move |s| (s, self.get(s)))
    }
}

/// Coarse document lifecycle, derived from the stage map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uploaded,
    Extracted,
    Classified,
    Chunked,
    Embedded,
    Ready,
    Failed,
    Cancelled,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Uploaded => "uploaded",
            Lifecycle::Extracted => "extracted",
            Lifecycle::Classified => "classified",
            Lifecycle::Chunked => "chunked",
            Lifecycle::Embedded => "embedded",
            Lifecycle::Ready => "ready",
            Lifecycle::Failed => "failed",
            Lifecycle::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// The model answered with an exact taxonomy label.
    Model,
    /// The label was recovered from a looser model answer.
    Alias,
    /// The model gave no usable label; the uploader's declared type was used.
    Declared,
    /// Nothing usable; defaulted to `unknown`.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub document_type: DocumentType,
    pub confidence: f32,
    pub source: ClassificationSource,
    /// SHA-256 of the text window that was classified.
    pub text_hash: String,
}

/// An uploaded PDF and its pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub project_id: Option<String>,
    /// SHA-256 of the raw PDF bytes, which are stored alongside the document.
    pub content_hash: String,
    pub declared_type: Option<DocumentType>,
    pub classification: Option<Classification>,
    pub page_count: usize,
    pub stages: StageStates,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    pub fn new(
        filename: &str,
        bytes: &[u8],
        project_id: Option<String>,
        declared_type: Option<DocumentType>,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            project_id,
            content_hash: sha256_hex(bytes),
            declared_type,
            classification: None,
            page_count: 0,
            stages: StageStates::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Detected type, or `unknown` before classification has run.
    pub fn document_type(&self) -> DocumentType {
        self.classification
            .as_ref()
            .map(|c| c.document_type)
            .unwrap_or(DocumentType::Unknown)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let s = &self.stages;
        if s.iter().any(|(_, st)| matches!(st, StageState::Failed(_))) {
            return Lifecycle::Failed;
        }
        if s.iter().all(|(_, st)| *st == StageState::Succeeded) {
            return Lifecycle::Ready;
        }
        if s.iter().any(|(_, st)| *st == StageState::Cancelled) {
            return Lifecycle::Cancelled;
        }
        let done = |stage| *s.get(stage) == StageState::Succeeded;
        if done(Stage::Embedding) {
            Lifecycle::Embedded
        } else if done(Stage::Chunking) {
            Lifecycle::Chunked
        } else if done(Stage::Classification) {
            Lifecycle::Classified
        } else if done(Stage::Extraction) {
            Lifecycle::Extracted
        } else {
            Lifecycle::Uploaded
        }
    }
}

/// One extracted page. Page numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// Separator placed between pages when they are concatenated.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Concatenate page texts the way the chunker sees them.
pub fn join_pages(pages: &[Page]) -> String {
    pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

/// A token window of a document's concatenated page text.
///
/// `start_offset..end_offset` is a byte range into [`join_pages`] output
/// and always lies on UTF-8 character boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    pub token_start: usize,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub page_start: u32,
    pub page_end: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: String,
    pub document_id: String,
    pub model: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub name: String,
    /// `None` means the field was not found or failed validation.
    pub value: Option<FieldValue>,
}

/// Structured fields extracted from one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub document_id: String,
    pub document_type: DocumentType,
    pub fields: Vec<ExtractedField>,
    /// Share of schema fields that were filled, in `[0, 1]`.
    pub confidence: f32,
    pub extracted_at: i64,
}

impl ExtractedRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_ref())
    }

    pub fn filled(&self) -> usize {
        self.fields.iter().filter(|f| f.value.is_some()).count()
    }
}

/// Append-only record of one stage state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub document_id: String,
    pub stage: Stage,
    pub from: StageState,
    pub to: StageState,
    pub at: i64,
}

/// Restricts retrieval to part of the corpus. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub project_id: Option<String>,
    #[serde(default)]
    pub document_ids: Vec<String>,
    #[serde(default)]
    pub document_types: Vec<DocumentType>,
}

impl QueryFilter {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(project) = &self.project_id {
            if doc.project_id.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        if !self.document_ids.is_empty() && !self.document_ids.contains(&doc.id) {
            return false;
        }
        if !self.document_types.is_empty() && !self.document_types.contains(&doc.document_type())
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Inline label used in the answer, e.g. `C2`.
    pub label: String,
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub page: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
