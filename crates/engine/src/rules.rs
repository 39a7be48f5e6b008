//! Rule bundle builder for the rule-scanning preset.

use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::NamedTempFile;
use tqbundle_common::{Error, Result};
use tracing::debug;

static RULE_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:(?:private|global)\s+)*rule\s+[A-Za-z_][A-Za-z0-9_]*").unwrap()
});

static PATH_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\n,]").unwrap());

/// Materialized rules for one run.
///
/// The inline rule file, if any, is deleted when the bundle is dropped.
#[derive(Debug)]
pub struct RuleBundle {
    inline: Option<NamedTempFile>,
    paths: Vec<PathBuf>,
}

impl RuleBundle {
    /// Build a bundle from inline text and a delimited path list.
    ///
    /// Returns `Ok(None)` when neither yields anything, so no rule scan runs.
    pub fn build(inline: Option<&str>, paths: Option<&str>) -> Result<Option<Self>> {
        let text = inline.map(str::trim).filter(|t| !t.is_empty());
        let paths = paths.map(split_rule_paths).unwrap_or_default();

        if text.is_none() && paths.is_empty() {
            return Ok(None);
        }

        if let Some(text) = text {
            validate_rule_text(text)?;
        }
        for path in &paths {
            if !Path::new(path).exists() {
                return Err(Error::RuleBundleInvalid(format!(
                    "Rule path is not accessible: {}",
                    path
                )));
            }
        }

        let inline = match text {
            Some(text) => {
                let mut file = tempfile::Builder::new()
                    .prefix("tqbundle-rule-")
                    .suffix(".yar")
                    .tempfile()?;
                file.write_all(text.as_bytes())?;
                file.flush()?;
                debug!("Materialized inline rule at {:?}", file.path());
                Some(file)
            }
            None => None,
        };

        Ok(Some(Self {
            inline,
            paths: paths.into_iter().map(PathBuf::from).collect(),
        }))
    }

    /// Path of the materialized inline rule.
    pub fn inline_path(&self) -> Option<&Path> {
        self.inline.as_ref().map(|f| f.path())
    }

    /// All rule paths: inline file first, then supplied paths.
    pub fn paths(&self) -> Vec<String> {
        self.inline_path()
            .into_iter()
            .chain(self.paths.iter().map(PathBuf::as_path))
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }
}

/// Split a comma or newline separated path list, trimming and deduplicating.
pub fn split_rule_paths(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for segment in PATH_SEPARATOR.split(raw) {
        let cleaned = segment.trim();
        if !cleaned.is_empty() && !out.iter().any(|p| p == cleaned) {
            out.push(cleaned.to_string());
        }
    }
    out
}

/// Reject inline text that cannot be a rule set.
///
/// Braces are counted outside strings, comments and `/regex/` literals;
/// anything finer is left to the scanner.
fn validate_rule_text(text: &str) -> Result<()> {
    if !RULE_DECLARATION.is_match(text) {
        return Err(Error::RuleBundleInvalid(
            "Inline rule text does not declare any rule".to_string(),
        ));
    }

    let mut depth: i64 = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let next = chars.peek().map(|&(_, n)| n);
        match c {
            '/' if next == Some('/') => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if next == Some('*') => {
                chars.next();
                let mut prev = ' ';
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err(unbalanced("an unterminated comment"));
                }
            }
            '/' if starts_regex(&text[..i]) => {
                skip_literal(chars.by_ref().map(|(_, c)| c), '/')
                    .ok_or_else(|| unbalanced("an unterminated regex"))?;
            }
            '"' => {
                skip_literal(chars.by_ref().map(|(_, c)| c), '"')
                    .ok_or_else(|| unbalanced("an unterminated string"))?;
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(unbalanced("unbalanced braces"));
                }
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(unbalanced("unbalanced braces"));
    }
    Ok(())
}

/// A `/` opens a regex literal after an assignment or `matches`.
fn starts_regex(before: &str) -> bool {
    let before = before.trim_end();
    before.ends_with('=') || before.ends_with("matches")
}

/// Consume up to the unescaped `end`; `None` if the text runs out first.
fn skip_literal(chars: impl Iterator<Item = char>, end: char) -> Option<()> {
    let mut escaped = false;
    for c in chars {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            c if c == end => return Some(()),
            _ => {}
        }
    }
    None
}

fn unbalanced(what: &str) -> Error {
    Error::RuleBundleInvalid(format!("Inline rule text has {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULE: &str = r#"
rule suspicious_string {
    strings:
        $a = "evil {payload"
        $h = { 6A 40 68 00 30 00 00 }
    condition:
        any of them
}
"#;

    #[test]
    fn test_split_rule_paths() {
        let paths = split_rule_paths(" /rules/a.yar,\n/rules/dir , ,/rules/a.yar\n\n");
        assert_eq!(paths, vec!["/rules/a.yar", "/rules/dir"]);
    }

    #[test]
    fn test_nothing_supplied_is_no_bundle() {
        assert!(RuleBundle::build(None, None).unwrap().is_none());
        assert!(RuleBundle::build(Some("   \n"), Some(" , \n")).unwrap().is_none());
    }

    #[test]
    fn test_inline_rule_materialized_and_released() {
        let bundle = RuleBundle::build(Some(RULE), None).unwrap().unwrap();
        let path = bundle.inline_path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.extension().unwrap(), "yar");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), RULE.trim());
        assert_eq!(bundle.paths(), vec![path.to_string_lossy().into_owned()]);

        drop(bundle);
        assert!(!path.exists());
    }

    #[test]
    fn test_inline_first_then_paths() {
        let dir = tempfile::tempdir().unwrap();
        let rule_dir = dir.path().join("rules");
        std::fs::create_dir(&rule_dir).unwrap();
        let supplied = rule_dir.to_string_lossy().into_owned();

        let bundle = RuleBundle::build(Some(RULE), Some(&supplied)).unwrap().unwrap();
        let paths = bundle.paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with(".yar"));
        assert_eq!(paths[1], supplied);
    }

    #[test]
    fn test_missing_path_is_invalid() {
        let err = RuleBundle::build(None, Some("/definitely/not/here.yar")).unwrap_err();
        assert!(matches!(err, Error::RuleBundleInvalid(_)));
    }

    #[test]
    fn test_malformed_inline_rule_is_invalid() {
        let err = RuleBundle::build(Some("this is not a rule"), None).unwrap_err();
        assert!(matches!(err, Error::RuleBundleInvalid(_)));

        let err = RuleBundle::build(Some("rule broken { condition: true"), None).unwrap_err();
        assert!(matches!(err, Error::RuleBundleInvalid(_)));

        let err = RuleBundle::build(Some("rule open { strings: $a = \"x"), None).unwrap_err();
        assert!(matches!(err, Error::RuleBundleInvalid(_)));
    }

    #[test]
    fn test_regex_and_comments_do_not_count() {
        let text = r#"
// matches "quoted { things
/* block comment with } and " */
rule braces_in_regex {
    strings:
        $re = /\{[0-9]+/ nocase
        $re2 = /a\/b}/
        $s = "}"
    condition:
        any of them // trailing "
}
"#;
        let bundle = RuleBundle::build(Some(text), None).unwrap().unwrap();
        assert_eq!(bundle.paths().len(), 1);
    }
}
