//! Change-proposal sink.
//!
//! A processing run's generated documents are aggregated into one
//! [`ChangeSet`]: a single reviewable unit referencing every source
//! conversation record and the aggregate confidence. The sink collaborator
//! turns it into a proposal; the [`LocalSink`] implementation assembles a
//! proposal directory on disk.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use lorekeeper_shared::{
    GeneratedDocument, LorekeeperError, RecordId, Result, RunId, slugify,
};

// ---------------------------------------------------------------------------
// Change set
// ---------------------------------------------------------------------------

/// One run's aggregated output: a single reviewable change proposal.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub run_id: RunId,
    /// Proposal branch name, e.g. `kb/database-timeouts-0192ab34`.
    pub branch: String,
    pub title: String,
    /// Markdown body describing the per-file operations.
    pub body: String,
    pub documents: Vec<GeneratedDocument>,
    /// Mean confidence across all documents.
    pub aggregate_confidence: f64,
}

impl ChangeSet {
    /// Aggregate a run's documents into one proposal.
    pub fn assemble(
        run_id: RunId,
        branch_prefix: &str,
        documents: Vec<GeneratedDocument>,
    ) -> Result<Self> {
        if documents.is_empty() {
            return Err(LorekeeperError::validation(
                "cannot assemble a change set with no documents",
            ));
        }

        let aggregate_confidence =
            documents.iter().map(|d| d.confidence).sum::<f64>() / documents.len() as f64;

        let lead_slug = slugify(&documents[0].title);
        let branch = format!("{branch_prefix}/{lead_slug}-{}", run_id.short());

        let title = if documents.len() == 1 {
            format!("kb: {} {}", documents[0].action, documents[0].title)
        } else {
            format!("kb: {} document changes", documents.len())
        };

        let body = render_body(&run_id, &documents, aggregate_confidence);

        Ok(Self {
            run_id,
            branch,
            title,
            body,
            documents,
            aggregate_confidence,
        })
    }

    /// All source conversation records referenced by this change set.
    pub fn source_records(&self) -> Vec<&RecordId> {
        let mut records: Vec<&RecordId> = Vec::new();
        for doc in &self.documents {
            for id in &doc.source_records {
                if !records.contains(&id) {
                    records.push(id);
                }
            }
        }
        records
    }
}

fn render_body(run_id: &RunId, documents: &[GeneratedDocument], aggregate: f64) -> String {
    let mut body = String::from("## Knowledge base changes\n\n");
    for doc in documents {
        body.push_str(&format!(
            "- `{}` {} ({}, confidence {:.2})\n",
            doc.action, doc.path, doc.category, doc.confidence
        ));
    }

    body.push_str(&format!(
        "\nAggregate AI confidence: {aggregate:.2}\n\n### Source conversations\n\n"
    ));
    let mut seen = Vec::new();
    for doc in documents {
        for record in &doc.source_records {
            if !seen.contains(record) {
                body.push_str(&format!("- {record}\n"));
                seen.push(record.clone());
            }
        }
    }
    body.push_str(&format!("\nProcessing run: {run_id}\n"));
    body
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// Reference to a submitted proposal.
#[derive(Debug, Clone)]
pub struct ProposalRef {
    /// Proposal identifier (branch name for the local sink).
    pub id: String,
    /// Where the proposal can be reviewed.
    pub location: String,
}

/// The document sink collaborator: accepts one aggregated change proposal.
pub trait ProposalSink {
    fn submit(&self, change_set: &ChangeSet) -> Result<ProposalRef>;
}

// ---------------------------------------------------------------------------
// Local sink
// ---------------------------------------------------------------------------

/// Assembles change proposals as directories under a local root.
///
/// Layout: `<root>/<branch>/files/<doc path>` plus a `proposal.json`
/// manifest. A branch-name collision counts as a [`SinkConflict`] and is
/// retried once with a regenerated identifier.
///
/// [`SinkConflict`]: LorekeeperError::SinkConflict
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn try_submit(&self, change_set: &ChangeSet, branch: &str) -> Result<ProposalRef> {
        let proposal_dir = self.root.join(branch);
        if proposal_dir.exists() {
            return Err(LorekeeperError::SinkConflict(format!(
                "proposal {branch} already exists"
            )));
        }

        let files_dir = proposal_dir.join("files");
        std::fs::create_dir_all(&files_dir).map_err(|e| LorekeeperError::io(&files_dir, e))?;

        for doc in &change_set.documents {
            let target = files_dir.join(&doc.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| LorekeeperError::io(parent, e))?;
            }
            write_atomic(&target, &doc.body)?;
        }

        let manifest = serde_json::json!({
            "run_id": change_set.run_id,
            "branch": branch,
            "title": change_set.title,
            "body": change_set.body,
            "aggregate_confidence": change_set.aggregate_confidence,
            "operations": change_set.documents.iter().map(|d| {
                serde_json::json!({
                    "action": d.action,
                    "path": d.path,
                    "category": d.category,
                    "confidence": d.confidence,
                    "source_records": d.source_records,
                })
            }).collect::<Vec<_>>(),
        });
        let manifest_path = proposal_dir.join("proposal.json");
        write_atomic(
            &manifest_path,
            &serde_json::to_string_pretty(&manifest)
                .map_err(|e| LorekeeperError::Storage(e.to_string()))?,
        )?;

        Ok(ProposalRef {
            id: branch.to_string(),
            location: proposal_dir.to_string_lossy().into_owned(),
        })
    }
}

/// Write a file atomically: temp file in the same directory, then rename.
fn write_atomic(target: &Path, content: &str) -> Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    let temp = target.with_file_name(format!(".{file_name}.tmp"));

    std::fs::write(&temp, content).map_err(|e| LorekeeperError::io(&temp, e))?;
    std::fs::rename(&temp, target).map_err(|e| LorekeeperError::io(target, e))?;
    Ok(())
}

impl ProposalSink for LocalSink {
    #[instrument(skip_all, fields(branch = %change_set.branch, docs = change_set.documents.len()))]
    fn submit(&self, change_set: &ChangeSet) -> Result<ProposalRef> {
        match self.try_submit(change_set, &change_set.branch) {
            Err(LorekeeperError::SinkConflict(original)) => {
                // One retry with a regenerated identifier before surfacing
                let regenerated = format!("{}-{}", change_set.branch, RunId::new().short());
                warn!(%original, retry = %regenerated, "proposal name collision, retrying");
                self.try_submit(change_set, &regenerated)
            }
            other => other,
        }
        .inspect(|proposal| {
            info!(id = %proposal.id, location = %proposal.location, "proposal submitted");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorekeeper_shared::{KbCategory, MatchAction};

    fn make_doc(title: &str, path: &str, action: MatchAction, confidence: f64) -> GeneratedDocument {
        GeneratedDocument {
            title: title.into(),
            category: KbCategory::Troubleshooting,
            body: format!("# {title}\n\ncontent\n"),
            metadata: serde_json::Map::new(),
            path: path.into(),
            action,
            confidence,
            source_records: vec![RecordId::new()],
        }
    }

    #[test]
    fn assemble_aggregates_confidence_and_sources() {
        let docs = vec![
            make_doc("A", "troubleshooting/a.md", MatchAction::Create, 0.9),
            make_doc("B", "troubleshooting/b.md", MatchAction::Update, 0.7),
        ];
        let change_set = ChangeSet::assemble(RunId::new(), "kb", docs).unwrap();

        assert!((change_set.aggregate_confidence - 0.8).abs() < 1e-9);
        assert!(change_set.branch.starts_with("kb/a-"));
        assert_eq!(change_set.source_records().len(), 2);
        assert!(change_set.body.contains("`create` troubleshooting/a.md"));
        assert!(change_set.body.contains("`update` troubleshooting/b.md"));
    }

    #[test]
    fn assemble_rejects_empty_runs() {
        assert!(ChangeSet::assemble(RunId::new(), "kb", vec![]).is_err());
    }

    #[test]
    fn local_sink_writes_files_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalSink::new(dir.path());

        let docs = vec![make_doc(
            "Pool exhaustion",
            "troubleshooting/pool-exhaustion.md",
            MatchAction::Create,
            0.85,
        )];
        let change_set = ChangeSet::assemble(RunId::new(), "kb", docs).unwrap();
        let proposal = sink.submit(&change_set).unwrap();

        let proposal_dir = dir.path().join(&proposal.id);
        assert!(proposal_dir.join("proposal.json").exists());
        let written = std::fs::read_to_string(
            proposal_dir.join("files/troubleshooting/pool-exhaustion.md"),
        )
        .unwrap();
        assert!(written.contains("# Pool exhaustion"));

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(proposal_dir.join("proposal.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["operations"][0]["action"], "create");
    }

    #[test]
    fn name_collision_is_retried_with_new_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalSink::new(dir.path());

        let docs = vec![make_doc("A", "troubleshooting/a.md", MatchAction::Create, 0.9)];
        let change_set = ChangeSet::assemble(RunId::new(), "kb", docs).unwrap();

        // Occupy the branch directory ahead of the submit
        std::fs::create_dir_all(dir.path().join(&change_set.branch)).unwrap();

        let proposal = sink.submit(&change_set).unwrap();
        assert_ne!(proposal.id, change_set.branch);
        assert!(proposal.id.starts_with(&change_set.branch));
    }
}
