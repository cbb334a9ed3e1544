//! Existing-document corpus: snapshot loading and the change-proposal sink.
//!
//! The corpus itself is owned by an external collaborator (a checkout of
//! the knowledge base repository). This crate reads it once per processing
//! run into an immutable [`CorpusSnapshot`], and hands finished documents
//! back out as one aggregated change proposal via [`ProposalSink`]. No
//! direct write path to the corpus exists here.

pub mod frontmatter;
pub mod sink;

use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use lorekeeper_shared::{
    DocMetadata, ExistingDocument, KbCategory, LorekeeperError, Result,
};

pub use frontmatter::{FmValue, Frontmatter, parse_document};
pub use sink::{ChangeSet, LocalSink, ProposalRef, ProposalSink};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One consistent view of the existing corpus, fetched at run start and
/// immutable for the run's duration. All matching decisions within a run
/// are made against this single view.
#[derive(Debug, Clone, Default)]
pub struct CorpusSnapshot {
    documents: Vec<ExistingDocument>,
}

impl CorpusSnapshot {
    /// Load every parseable markdown document under `root`.
    ///
    /// Files that fail to parse are skipped with a warning; a broken
    /// document must not block a whole processing run.
    #[instrument(skip_all, fields(root = %root.display()))]
    pub fn load(root: &Path) -> Result<Self> {
        if !root.exists() {
            return Err(LorekeeperError::validation(format!(
                "corpus root does not exist: {}",
                root.display()
            )));
        }

        let mut files = Vec::new();
        collect_markdown_files(root, &mut files)?;
        files.sort();

        let mut documents = Vec::with_capacity(files.len());
        for file in files {
            let rel_path = file
                .strip_prefix(root)
                .unwrap_or(&file)
                .to_string_lossy()
                .replace('\\', "/");

            let content = std::fs::read_to_string(&file)
                .map_err(|e| LorekeeperError::io(&file, e))?;

            match document_from_markdown(&rel_path, &content) {
                Ok(doc) => documents.push(doc),
                Err(e) => {
                    warn!(path = %rel_path, error = %e, "skipping unparseable document");
                }
            }
        }

        debug!(count = documents.len(), "loaded corpus snapshot");
        Ok(Self { documents })
    }

    /// Build a snapshot from already-parsed documents (tests, callers that
    /// fetch the corpus through an API instead of a checkout).
    pub fn from_documents(documents: Vec<ExistingDocument>) -> Self {
        Self { documents }
    }

    /// Documents in stable load order. Prefilter tie-breaking depends on
    /// this order being deterministic.
    pub fn documents(&self) -> &[ExistingDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Look a document up by its corpus path.
    pub fn get(&self, path: &str) -> Option<&ExistingDocument> {
        self.documents.iter().find(|d| d.path == path)
    }
}

/// Recursively collect `.md` files, skipping dot-directories.
fn collect_markdown_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| LorekeeperError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| LorekeeperError::io(dir, e))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_markdown_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "md") {
            out.push(path);
        }
    }
    Ok(())
}

/// Parse one corpus document from its markdown source.
pub fn document_from_markdown(rel_path: &str, content: &str) -> Result<ExistingDocument> {
    let (fm, body) = frontmatter::parse_document(content)?;

    let title = fm
        .get_str("title")
        .ok_or_else(|| LorekeeperError::validation(format!("{rel_path}: missing title")))?
        .to_string();

    let category = match fm.get_str("category") {
        Some(raw) => KbCategory::parse(raw)?,
        // Fall back to the top-level directory name
        None => {
            let dir = rel_path.split('/').next().unwrap_or_default();
            KbCategory::parse(dir)?
        }
    };

    let tags = fm.get_list("tags").map(<[String]>::to_vec).unwrap_or_default();

    let metadata = DocMetadata {
        created_at: fm.get_datetime("created_at"),
        updated_at: fm.get_datetime("updated_at"),
        difficulty: fm.get_str("difficulty").map(str::to_string),
        sources: fm
            .get_list("sources")
            .map(<[String]>::to_vec)
            .unwrap_or_default(),
    };

    Ok(ExistingDocument {
        path: rel_path.to_string(),
        category,
        tags,
        title,
        content: body,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../../fixtures/md")
    }

    #[test]
    fn loads_fixture_corpus() {
        let snapshot = CorpusSnapshot::load(&fixture_root()).expect("load fixtures");
        assert!(snapshot.len() >= 3, "expected fixture docs, got {}", snapshot.len());

        let doc = snapshot
            .get("troubleshooting/connection-pool-exhaustion.md")
            .expect("fixture doc present");
        assert_eq!(doc.category, KbCategory::Troubleshooting);
        assert!(doc.tags.iter().any(|t| t == "database"));
        assert!(doc.content.contains("## Solution"));
        // Frontmatter must not leak into the body
        assert!(!doc.content.contains("---\ntitle"));
    }

    #[test]
    fn load_order_is_deterministic() {
        let a = CorpusSnapshot::load(&fixture_root()).unwrap();
        let b = CorpusSnapshot::load(&fixture_root()).unwrap();
        let paths_a: Vec<&str> = a.documents().iter().map(|d| d.path.as_str()).collect();
        let paths_b: Vec<&str> = b.documents().iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths_a, paths_b);
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = CorpusSnapshot::load(Path::new("/nonexistent/kb")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn unparseable_document_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cat_dir = dir.path().join("process");
        std::fs::create_dir_all(&cat_dir).unwrap();
        std::fs::write(
            cat_dir.join("good.md"),
            "---\ntitle: \"Deploys\"\ncategory: \"process\"\n---\nbody\n",
        )
        .unwrap();
        std::fs::write(cat_dir.join("bad.md"), "no frontmatter at all\n").unwrap();

        let snapshot = CorpusSnapshot::load(dir.path()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.documents()[0].title, "Deploys");
    }

    #[test]
    fn category_falls_back_to_directory() {
        let doc = document_from_markdown(
            "decision/adopt-rust.md",
            "---\ntitle: \"Adopt Rust\"\n---\nWe decided.\n",
        )
        .unwrap();
        assert_eq!(doc.category, KbCategory::Decision);
    }

    #[test]
    fn unknown_category_is_rejected() {
        let err = document_from_markdown(
            "howto/thing.md",
            "---\ntitle: \"Thing\"\ncategory: \"howto\"\n---\nbody\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown category"));
    }
}
