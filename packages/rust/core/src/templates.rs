//! Category templates for rendered knowledge documents.
//!
//! Each of the five categories renders with its own section structure.
//! The match over [`KbCategory`] is exhaustive, so adding a category
//! without a template fails at compile time.

use chrono::{DateTime, Utc};

use lorekeeper_corpus::Frontmatter;
use lorekeeper_shared::{ExistingDocument, ExtractionResult, KbCategory, RecordId, slugify};

/// Suggested corpus path for a new document.
pub fn suggest_path(category: KbCategory, title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{category}/untitled.md")
    } else {
        format!("{category}/{slug}.md")
    }
}

/// Section headers for a category, applied to the extraction's summary
/// and key points.
fn sections(category: KbCategory) -> (&'static str, &'static str) {
    match category {
        KbCategory::Troubleshooting => ("## Problem", "## Resolution"),
        KbCategory::Process => ("## Overview", "## Steps"),
        KbCategory::Decision => ("## Context", "## Decision"),
        KbCategory::Reference => ("## Summary", "## Details"),
        KbCategory::General => ("## Summary", "## Notes"),
    }
}

/// Render the document body (no frontmatter) from an extraction.
///
/// Also used to present new content to the arbiter in the same shape the
/// final document would take.
pub fn render_body(extraction: &ExtractionResult) -> String {
    let (lead_header, points_header) = sections(extraction.category);

    let mut body = format!("# {}\n\n", extraction.title);

    body.push_str(lead_header);
    body.push_str("\n\n");
    body.push_str(extraction.summary.trim());
    body.push('\n');

    if !extraction.key_points.is_empty() {
        body.push('\n');
        body.push_str(points_header);
        body.push_str("\n\n");
        let numbered = matches!(
            extraction.category,
            KbCategory::Troubleshooting | KbCategory::Process
        );
        for (i, point) in extraction.key_points.iter().enumerate() {
            if numbered {
                body.push_str(&format!("{}. {}\n", i + 1, point.trim()));
            } else {
                body.push_str(&format!("- {}\n", point.trim()));
            }
        }
    }

    if !extraction.key_topics.is_empty() {
        body.push_str("\n## Related Topics\n\n");
        for topic in &extraction.key_topics {
            body.push_str(&format!("- {}\n", topic.trim()));
        }
    }

    body
}

/// Build frontmatter for a freshly created document.
pub fn new_frontmatter(
    extraction: &ExtractionResult,
    sources: &[RecordId],
    now: DateTime<Utc>,
) -> Frontmatter {
    let mut fm = Frontmatter::new();
    fm.set_str("title", &extraction.title);
    fm.set_str("category", extraction.category.as_str());
    fm.set_list("tags", &extraction.tags);
    fm.set_str("created_at", now.to_rfc3339());
    fm.set_str("updated_at", now.to_rfc3339());
    fm.set_str("confidence", format!("{:.2}", extraction.confidence));
    let sources: Vec<String> = sources.iter().map(ToString::to_string).collect();
    fm.set_list("sources", &sources);
    fm
}

/// Build frontmatter for an updated document: title, tags, and creation
/// date carry over; the update timestamp, confidence, and source list are
/// refreshed.
pub fn updated_frontmatter(
    existing: &ExistingDocument,
    extraction: &ExtractionResult,
    sources: &[RecordId],
    now: DateTime<Utc>,
) -> Frontmatter {
    let mut fm = Frontmatter::new();
    fm.set_str("title", &existing.title);
    fm.set_str("category", existing.category.as_str());
    fm.set_list("tags", &existing.tags);
    if let Some(created) = existing.metadata.created_at {
        fm.set_str("created_at", created.to_rfc3339());
    }
    fm.set_str("updated_at", now.to_rfc3339());
    fm.set_str("confidence", format!("{:.2}", extraction.confidence));
    if let Some(difficulty) = &existing.metadata.difficulty {
        fm.set_str("difficulty", difficulty);
    }

    let mut all_sources = existing.metadata.sources.clone();
    for id in sources {
        let id = id.to_string();
        if !all_sources.contains(&id) {
            all_sources.push(id);
        }
    }
    fm.set_list("sources", &all_sources);
    fm
}

/// Render a complete new document: frontmatter plus templated body.
pub fn render_new_document(
    extraction: &ExtractionResult,
    sources: &[RecordId],
    now: DateTime<Utc>,
) -> String {
    format!(
        "{}\n{}",
        new_frontmatter(extraction, sources, now).render(),
        render_body(extraction)
    )
}
