//! Relevance prefilter: cheap, deterministic lexical scoring of new
//! content against the existing-document snapshot.
//!
//! Purely lexical, no external calls, no clocks: identical query and
//! snapshot always yield identical scores and an identical ranking. Ties
//! break on the candidate's original snapshot position so the ordering is
//! reproducible in tests.

use tracing::{debug, instrument};

use lorekeeper_shared::{ExistingDocument, ExtractionResult};

// Scoring weights
const W_PHRASE_TITLE: f64 = 1.5;
const W_PHRASE_BODY: f64 = 1.0;
const W_KEYWORD_TITLE: f64 = 0.5;
const W_BIGRAM_TITLE: f64 = 0.8;
const W_BIGRAM_BODY: f64 = 0.5;
const W_KEYWORD_BODY: f64 = 0.15;
const W_CATEGORY: f64 = 0.3;
const W_TAG: f64 = 0.25;

/// Tokens shorter than this carry no signal and are not keywords.
const MIN_KEYWORD_LEN: usize = 3;

/// Options for one prefilter pass.
#[derive(Debug, Clone)]
pub struct PrefilterOptions {
    /// Candidates scoring below this are discarded.
    pub min_score: f64,
    /// Maximum shortlist size.
    pub shortlist_max: usize,
}

impl Default for PrefilterOptions {
    fn default() -> Self {
        Self {
            min_score: 0.1,
            shortlist_max: 30,
        }
    }
}

/// A shortlist entry: the candidate document, its score, and its original
/// position in the snapshot (the deterministic tie-break).
#[derive(Debug, Clone)]
pub struct ScoredCandidate<'a> {
    pub document: &'a ExistingDocument,
    pub score: f64,
    pub snapshot_pos: usize,
}

/// The derived query: text from the extraction's title + topics + tags +
/// category, tokenized once.
#[derive(Debug, Clone)]
pub struct Query {
    /// Normalized full query text.
    pub phrase: String,
    /// Distinct keywords (lowercased tokens of at least 3 chars).
    pub keywords: Vec<String>,
    /// Consecutive two-word sub-phrases of the query text.
    pub bigrams: Vec<String>,
    /// Category to favor; `None` for free-text questions, which rank on
    /// lexical overlap alone.
    pub category: Option<lorekeeper_shared::KbCategory>,
    pub tags: Vec<String>,
}

impl Query {
    /// Derive the query from an extraction result.
    pub fn from_extraction(extraction: &ExtractionResult) -> Self {
        let mut parts: Vec<&str> = vec![extraction.title.as_str()];
        parts.extend(extraction.key_topics.iter().map(String::as_str));
        parts.extend(extraction.tags.iter().map(String::as_str));
        parts.push(extraction.category.as_str());

        Self::from_text(
            &parts.join(" "),
            Some(extraction.category),
            extraction.tags.clone(),
        )
    }

    /// Derive a query from a free-text question (the consumer surface).
    pub fn from_question(question: &str) -> Self {
        Self::from_text(question, None, Vec::new())
    }

    fn from_text(
        text: &str,
        category: Option<lorekeeper_shared::KbCategory>,
        tags: Vec<String>,
    ) -> Self {
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let phrase = tokens.join(" ");

        let mut keywords: Vec<String> = Vec::new();
        for token in &tokens {
            if token.len() >= MIN_KEYWORD_LEN && !keywords.contains(token) {
                keywords.push(token.clone());
            }
        }

        let bigrams: Vec<String> = tokens
            .windows(2)
            .map(|pair| format!("{} {}", pair[0], pair[1]))
            .collect();

        let tags = tags.into_iter().map(|t| t.to_lowercase()).collect();

        Self {
            phrase,
            keywords,
            bigrams,
            category,
            tags,
        }
    }
}

/// Normalize document text the same way the query is normalized, so phrase
/// and bigram containment checks are token-based, not byte-based.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    !phrase.is_empty()
        && haystack
            .split(' ')
            .collect::<Vec<_>>()
            .windows(phrase.split(' ').count())
            .any(|w| w.join(" ") == phrase)
}

/// Score one candidate against the query. Pure and deterministic.
pub fn score_candidate(query: &Query, document: &ExistingDocument) -> f64 {
    let title = normalize(&document.title);
    let body = normalize(&document.content);

    let mut score = 0.0;

    if contains_phrase(&title, &query.phrase) {
        score += W_PHRASE_TITLE;
    }
    if contains_phrase(&body, &query.phrase) {
        score += W_PHRASE_BODY;
    }

    for keyword in &query.keywords {
        if contains_phrase(&title, keyword) {
            score += W_KEYWORD_TITLE;
        }
        if contains_phrase(&body, keyword) {
            score += W_KEYWORD_BODY;
        }
    }

    if query.bigrams.iter().any(|b| contains_phrase(&title, b)) {
        score += W_BIGRAM_TITLE;
    }
    if query.bigrams.iter().any(|b| contains_phrase(&body, b)) {
        score += W_BIGRAM_BODY;
    }

    if query.category == Some(document.category) {
        score += W_CATEGORY;
    }

    for tag in &document.tags {
        if query.tags.contains(&tag.to_lowercase()) {
            score += W_TAG;
        }
    }

    score
}

/// Whether a document is a candidate at all: same category, or at least
/// one shared tag (value can be added across categories). Free-text
/// queries carry no category and consider every document.
fn is_candidate(query: &Query, document: &ExistingDocument) -> bool {
    match query.category {
        None => true,
        Some(category) => {
            document.category == category
                || document
                    .tags
                    .iter()
                    .any(|t| query.tags.contains(&t.to_lowercase()))
        }
    }
}

/// Produce the ranked, capped shortlist for an extraction against the
/// snapshot. Sorting is descending by score with the snapshot position as
/// a stable tie-break.
#[instrument(skip_all, fields(candidates = snapshot.len()))]
pub fn shortlist<'a>(
    extraction: &ExtractionResult,
    snapshot: &'a [ExistingDocument],
    opts: &PrefilterOptions,
) -> Vec<ScoredCandidate<'a>> {
    let query = Query::from_extraction(extraction);
    rank(&query, snapshot, opts)
}

/// Rank an arbitrary query against the snapshot (shared with the consumer
/// query surface).
pub fn rank<'a>(
    query: &Query,
    snapshot: &'a [ExistingDocument],
    opts: &PrefilterOptions,
) -> Vec<ScoredCandidate<'a>> {
    let mut scored: Vec<ScoredCandidate<'a>> = snapshot
        .iter()
        .enumerate()
        .filter(|(_, doc)| is_candidate(query, doc))
        .map(|(snapshot_pos, document)| ScoredCandidate {
            document,
            score: score_candidate(query, document),
            snapshot_pos,
        })
        .filter(|c| c.score >= opts.min_score)
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.snapshot_pos.cmp(&b.snapshot_pos))
    });
    scored.truncate(opts.shortlist_max);

    debug!(shortlisted = scored.len(), "prefilter pass complete");
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorekeeper_shared::{DocMetadata, KbCategory};

    fn make_doc(
        path: &str,
        title: &str,
        category: KbCategory,
        tags: &[&str],
        content: &str,
    ) -> ExistingDocument {
        ExistingDocument {
            path: path.into(),
            category,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            title: title.into(),
            content: content.into(),
            metadata: DocMetadata::default(),
        }
    }

    fn make_extraction(title: &str, tags: &[&str], topics: &[&str]) -> ExtractionResult {
        ExtractionResult {
            is_kb_worthy: true,
            confidence: 0.85,
            category: KbCategory::Troubleshooting,
            title: title.into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            key_topics: topics.iter().map(|t| t.to_string()).collect(),
            summary: String::new(),
            key_points: vec![],
            reasoning: String::new(),
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let extraction = make_extraction("database timeouts", &["database"], &["pool"]);
        let docs = vec![
            make_doc(
                "troubleshooting/a.md",
                "Database timeouts in production",
                KbCategory::Troubleshooting,
                &["database"],
                "The connection pool was exhausted.",
            ),
            make_doc(
                "troubleshooting/b.md",
                "Unrelated networking notes",
                KbCategory::Troubleshooting,
                &[],
                "Nothing about storage here.",
            ),
        ];

        let opts = PrefilterOptions::default();
        let first = shortlist(&extraction, &docs, &opts);
        let second = shortlist(&extraction, &docs, &opts);

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.document.path, b.document.path);
            assert_eq!(a.score, b.score);
        }
    }

    #[test]
    fn category_weight_alone() {
        // Query shares nothing with the document except the category.
        let extraction = make_extraction("zzz yyy", &[], &[]);
        let doc = make_doc(
            "troubleshooting/a.md",
            "Alpha",
            KbCategory::Troubleshooting,
            &[],
            "Beta",
        );
        let query = Query::from_extraction(&extraction);
        // category token "troubleshooting" appears nowhere in title/body
        assert!((score_candidate(&query, &doc) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn tag_overlap_weight_per_tag() {
        let extraction = make_extraction("zzz", &["database", "timeout"], &[]);
        let doc = make_doc(
            "process/a.md",
            "Alpha",
            KbCategory::Process,
            &["database", "timeout", "other"],
            "Beta",
        );
        let query = Query::from_extraction(&extraction);
        // Two overlapping tags, no category match, no text overlap:
        // "database"/"timeout" appear as tags only, not in title/body.
        assert!((score_candidate(&query, &doc) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn keyword_and_bigram_title_weights() {
        let extraction = make_extraction("pool exhaustion", &[], &[]);
        let doc = make_doc(
            "troubleshooting/a.md",
            "Pool exhaustion follow-up",
            KbCategory::Troubleshooting,
            &[],
            "empty",
        );
        let query = Query::from_extraction(&extraction);

        // Query text is "pool exhaustion troubleshooting".
        // Title hits: keywords "pool" (+0.5) and "exhaustion" (+0.5),
        // bigram "pool exhaustion" (+0.8). Category matches (+0.3).
        // Phrase "pool exhaustion troubleshooting" is not in the title.
        let expected = 0.5 + 0.5 + 0.8 + 0.3;
        assert!((score_candidate(&query, &doc) - expected).abs() < 1e-9);
    }

    #[test]
    fn exact_phrase_weights() {
        let extraction = ExtractionResult {
            category: KbCategory::General,
            ..make_extraction("staging deploy", &[], &[])
        };
        // Full query text is "staging deploy general".
        let doc = make_doc(
            "general/a.md",
            "How the staging deploy general checklist works",
            KbCategory::General,
            &[],
            "Run the staging deploy general checklist before merging.",
        );
        let query = Query::from_extraction(&extraction);

        // Phrase in title (+1.5) and body (+1.0); keywords staging/deploy/
        // general in title (3 x 0.5) and body (3 x 0.15); bigrams in title
        // (+0.8) and body (+0.5); category (+0.3).
        let expected = 1.5 + 1.0 + 1.5 + 0.45 + 0.8 + 0.5 + 0.3;
        assert!((score_candidate(&query, &doc) - expected).abs() < 1e-9);
    }

    #[test]
    fn below_threshold_candidates_are_discarded() {
        let extraction = make_extraction("zzz yyy", &[], &[]);
        // Same category gives 0.3, above the default 0.1 threshold;
        // with a higher threshold nothing survives.
        let docs = vec![make_doc(
            "troubleshooting/a.md",
            "Alpha",
            KbCategory::Troubleshooting,
            &[],
            "Beta",
        )];

        let kept = shortlist(&extraction, &docs, &PrefilterOptions::default());
        assert_eq!(kept.len(), 1);

        let strict = shortlist(
            &extraction,
            &docs,
            &PrefilterOptions {
                min_score: 0.5,
                shortlist_max: 30,
            },
        );
        assert!(strict.is_empty());
    }

    #[test]
    fn cross_category_needs_tag_overlap() {
        let extraction = make_extraction("database timeouts", &["database"], &[]);
        let docs = vec![
            // Different category, shared tag: candidate
            make_doc(
                "process/backup.md",
                "Database backup process",
                KbCategory::Process,
                &["database"],
                "How we back the database up.",
            ),
            // Different category, no shared tag: not a candidate
            make_doc(
                "decision/logging.md",
                "Logging stack decision",
                KbCategory::Decision,
                &["logging"],
                "We picked structured logging.",
            ),
        ];

        let kept = shortlist(&extraction, &docs, &PrefilterOptions::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].document.path, "process/backup.md");
    }

    #[test]
    fn ties_break_on_snapshot_position() {
        let extraction = make_extraction("zzz", &[], &[]);
        // Both candidates score exactly the category weight
        let docs = vec![
            make_doc("troubleshooting/first.md", "A", KbCategory::Troubleshooting, &[], "x"),
            make_doc("troubleshooting/second.md", "B", KbCategory::Troubleshooting, &[], "y"),
        ];

        let kept = shortlist(&extraction, &docs, &PrefilterOptions::default());
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].document.path, "troubleshooting/first.md");
        assert_eq!(kept[1].document.path, "troubleshooting/second.md");
    }

    #[test]
    fn shortlist_is_capped() {
        let extraction = make_extraction("zzz", &[], &[]);
        let docs: Vec<ExistingDocument> = (0..40)
            .map(|i| {
                make_doc(
                    &format!("troubleshooting/{i}.md"),
                    "A",
                    KbCategory::Troubleshooting,
                    &[],
                    "x",
                )
            })
            .collect();

        let kept = shortlist(&extraction, &docs, &PrefilterOptions::default());
        assert_eq!(kept.len(), 30);

        let small = shortlist(
            &extraction,
            &docs,
            &PrefilterOptions {
                min_score: 0.1,
                shortlist_max: 5,
            },
        );
        assert_eq!(small.len(), 5);
    }

    #[test]
    fn higher_overlap_ranks_first() {
        let extraction =
            make_extraction("database connection timeouts", &["database"], &["pool"]);
        let docs = vec![
            make_doc(
                "troubleshooting/unrelated.md",
                "Disk space alerts",
                KbCategory::Troubleshooting,
                &[],
                "The disk filled up.",
            ),
            make_doc(
                "troubleshooting/pool.md",
                "Database connection pool exhaustion",
                KbCategory::Troubleshooting,
                &["database", "connection-pool"],
                "Connection timeouts caused by pool exhaustion.",
            ),
        ];

        let kept = shortlist(&extraction, &docs, &PrefilterOptions::default());
        assert_eq!(kept[0].document.path, "troubleshooting/pool.md");
        assert!(kept[0].score > kept[1].score);
    }

    #[test]
    fn word_boundaries_are_respected() {
        let extraction = make_extraction("cat", &[], &[]);
        let doc = make_doc(
            "troubleshooting/a.md",
            "Concatenation helpers",
            KbCategory::Troubleshooting,
            &[],
            "catalog of categories",
        );
        let query = Query::from_extraction(&extraction);
        // "cat" must not match inside "concatenation" or "catalog";
        // only the category weight applies.
        assert!((score_candidate(&query, &doc) - 0.3).abs() < 1e-9);
    }
}
