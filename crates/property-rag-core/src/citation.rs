//! Inline citation labels.
//!
//! Retrieved chunks are shown to the model as `[C1]`, `[C2]`, … and the
//! model cites them inline, alone (`[C2]`) or grouped (`[C1, C3]`).
//! [`resolve_citations`] reads those references back, keeps only labels
//! that were actually handed to the model, and rewrites the answer so no
//! unknown label survives in the text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s?\[\s*(C\d+(?:\s*[,;]\s*C\d+)*)\s*\]").unwrap()
});

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)C(\d+)").unwrap());

/// Label of the `index`-th (zero-based) retrieved chunk.
pub fn label_for(index: usize) -> String {
    format!("C{}", index + 1)
}

/// Answer text after citation filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCitations {
    pub answer: String,
    /// Known labels in order of first appearance, without duplicates.
    pub labels: Vec<String>,
}

/// Keep references to `known` labels and strip everything else.
///
/// ```rust
/// use property_rag_core::citation::resolve_citations;
///
/// let r = resolve_citations("Rent is 1200 EUR [C2, C9]. Deposit 3 months [C1][C2].", &["C1", "C2"]);
/// assert_eq!(r.labels, vec!["C2", "C1"]);
/// assert_eq!(r.answer, "Rent is 1200 EUR [C2]. Deposit 3 months [C1][C2].");
/// ```
pub fn resolve_citations(answer: &str, known: &[&str]) -> ResolvedCitations {
    let known: HashSet<String> = known.iter().map(|l| l.to_uppercase()).collect();
    let mut seen = HashSet::new();
    let mut labels = Vec::new();

    let rewritten = CITATION_RE.replace_all(answer, |caps: &Captures| {
        let kept: Vec<String> = LABEL_RE
            .captures_iter(&caps[1])
            .map(|c| format!("C{}", c[1].trim_start_matches('0')))
            .filter(|l| known.contains(l))
            .collect();
        if kept.is_empty() {
            return String::new();
        }
        for l in &kept {
            if seen.insert(l.clone()) {
                labels.push(l.clone());
            }
        }
        let lead = if caps[0].starts_with(char::is_whitespace) {
            " "
        } else {
            ""
        };
        format!("{lead}[{}]", kept.join(", "))
    });

    ResolvedCitations {
        answer: rewritten.trim().to_string(),
        labels,
    }
}
