//! YAML frontmatter reading and writing.
//!
//! The corpus stores document metadata as a hand-built frontmatter block:
//! double-quoted scalar values and inline string lists only. Writer and
//! parser live together so the two sides cannot drift apart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use lorekeeper_shared::{LorekeeperError, Result};

/// A parsed frontmatter value.
#[derive(Debug, Clone, PartialEq)]
pub enum FmValue {
    Str(String),
    List(Vec<String>),
}

/// Parsed frontmatter fields, in file order.
#[derive(Debug, Clone, Default)]
pub struct Frontmatter {
    fields: BTreeMap<String, FmValue>,
}

impl Frontmatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.into(), FmValue::Str(value.into()));
    }

    pub fn set_list(&mut self, key: &str, values: &[String]) {
        self.fields.insert(key.into(), FmValue::List(values.to_vec()));
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FmValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[String]> {
        match self.fields.get(key) {
            Some(FmValue::List(l)) => Some(l),
            _ => None,
        }
    }

    pub fn get_datetime(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get_str(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Render the frontmatter block, delimiters included.
    pub fn render(&self) -> String {
        let mut out = String::from("---\n");
        for (key, value) in &self.fields {
            match value {
                FmValue::Str(s) => {
                    out.push_str(&format!("{key}: \"{}\"\n", escape(s)));
                }
                FmValue::List(items) => {
                    let quoted: Vec<String> =
                        items.iter().map(|i| format!("\"{}\"", escape(i))).collect();
                    out.push_str(&format!("{key}: [{}]\n", quoted.join(", ")));
                }
            }
        }
        out.push_str("---\n");
        out
    }
}

/// Escape special characters in a quoted value.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a document into its frontmatter block and body.
///
/// Returns an error when the leading block is missing or unterminated;
/// value lines that do not parse are skipped.
pub fn parse_document(content: &str) -> Result<(Frontmatter, String)> {
    let rest = content
        .strip_prefix("---\n")
        .ok_or_else(|| LorekeeperError::validation("missing frontmatter block"))?;

    let (block, body) = rest
        .split_once("\n---\n")
        .or_else(|| rest.strip_suffix("\n---").map(|b| (b, "")))
        .ok_or_else(|| LorekeeperError::validation("unterminated frontmatter block"))?;

    let mut fm = Frontmatter::new();
    for line in block.lines() {
        let Some((key, raw_value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let raw_value = raw_value.trim();

        if let Some(value) = parse_scalar(raw_value) {
            fm.fields.insert(key.to_string(), FmValue::Str(value));
        } else if let Some(values) = parse_list(raw_value) {
            fm.fields.insert(key.to_string(), FmValue::List(values));
        }
    }

    Ok((fm, body.trim_start_matches('\n').to_string()))
}

fn parse_scalar(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    Some(unescape(inner))
}

fn parse_list(raw: &str) -> Option<Vec<String>> {
    let inner = raw.strip_prefix('[')?.strip_suffix(']')?;
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    let mut items = Vec::new();
    for part in trimmed.split(',') {
        items.push(parse_scalar(part.trim())?);
    }
    Some(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_fields() {
        let mut fm = Frontmatter::new();
        fm.set_str("title", "Database \"Pool\" Exhaustion");
        fm.set_str("category", "troubleshooting");
        fm.set_list(
            "tags",
            &["database".to_string(), "connection-pool".to_string()],
        );
        fm.set_list("sources", &[]);

        let document = format!("{}\n# Body\n\ncontent here\n", fm.render());
        let (parsed, body) = parse_document(&document).unwrap();

        assert_eq!(parsed.get_str("title"), Some(r#"Database "Pool" Exhaustion"#));
        assert_eq!(parsed.get_str("category"), Some("troubleshooting"));
        assert_eq!(
            parsed.get_list("tags"),
            Some(&["database".to_string(), "connection-pool".to_string()][..])
        );
        assert_eq!(parsed.get_list("sources"), Some(&[][..]));
        assert!(body.starts_with("# Body"));
    }

    #[test]
    fn datetime_fields_parse() {
        let doc = "---\nupdated_at: \"2026-08-07T10:30:00Z\"\n---\nbody\n";
        let (fm, _) = parse_document(doc).unwrap();
        let ts = fm.get_datetime("updated_at").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-08-07T10:30:00+00:00");
    }

    #[test]
    fn missing_block_is_rejected() {
        assert!(parse_document("# Just markdown\n").is_err());
        assert!(parse_document("---\ntitle: \"unterminated\"\n").is_err());
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let doc = "---\ntitle: \"ok\"\nweird: {nested: true}\nplain: no quotes\n---\nbody";
        let (fm, _) = parse_document(doc).unwrap();
        assert_eq!(fm.get_str("title"), Some("ok"));
        assert_eq!(fm.get_str("weird"), None);
        assert_eq!(fm.get_str("plain"), None);
    }
}
