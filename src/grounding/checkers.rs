//! Grounding checkers: phantom files, structural claims, language
//! confusion.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use super::{Severity, Violation, ViolationKind};

/// Searchable index over the evidence a session has actually collected.
#[derive(Debug, Clone, Default)]
pub struct EvidenceIndex {
    /// File paths observed in tool output
    files: BTreeSet<String>,
    /// Directory names observed via listing tools
    directories: BTreeSet<String>,
    /// Languages observed in the project
    languages: BTreeSet<String>,
    /// Lower-cased concatenation of all tool output
    corpus: String,
}

static FILE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\w][\w./\-]*\.(rs|go|py|ts|tsx|js|jsx|java|c|h|cpp|hpp|rb|php|md|toml|yaml|yml|json|sql|sh)\b")
        .expect("invalid regex")
});

impl EvidenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one piece of tool output.
    pub fn add_tool_output(&mut self, tool: &str, output: &str) {
        for captures in FILE_REF.captures_iter(output) {
            if let Some(path) = captures.get(0) {
                self.files.insert(path.as_str().to_string());
            }
            if let Some(language) = captures
                .get(1)
                .and_then(|ext| language_for_extension(ext.as_str()))
            {
                self.languages.insert(language.to_string());
            }
        }
        if matches!(tool, "ls" | "tree" | "file_search" | "list_dir") {
            for line in output.lines() {
                let trimmed = line.trim().trim_end_matches('/');
                if !trimmed.is_empty() && !trimmed.contains(char::is_whitespace) {
                    self.directories.insert(trimmed.to_string());
                }
            }
        }
        self.corpus.push_str(&output.to_lowercase());
        self.corpus.push('\n');
    }

    /// Record an observed project language.
    pub fn add_language(&mut self, language: &str) {
        self.languages.insert(language.to_lowercase());
    }

    /// Whether a file path was observed, exactly or as a suffix.
    pub fn has_file(&self, path: &str) -> bool {
        if self.files.contains(path) {
            return true;
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        self.files
            .iter()
            .any(|seen| seen == name || seen.ends_with(path) || path.ends_with(seen.as_str()))
    }

    /// Whether any structural listing evidence exists.
    pub fn has_structure_evidence(&self) -> bool {
        !self.directories.is_empty()
    }

    /// Whether a term appears anywhere in collected output.
    pub fn observed(&self, term: &str) -> bool {
        !term.is_empty() && self.corpus.contains(&term.to_lowercase())
    }

    pub fn languages(&self) -> &BTreeSet<String> {
        &self.languages
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

fn language_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "rs" => Some("rust"),
        "go" => Some("go"),
        "py" => Some("python"),
        "java" => Some("java"),
        "js" | "jsx" | "ts" | "tsx" => Some("javascript"),
        _ => None,
    }
}

/// File paths referenced in an answer.
pub fn extract_file_refs(answer: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    FILE_REF
        .find_iter(answer)
        .map(|m| m.as_str().to_string())
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

/// Flag files the answer cites that no tool ever observed.
pub fn check_phantom_files(answer: &str, evidence: &EvidenceIndex) -> Vec<Violation> {
    extract_file_refs(answer)
        .into_iter()
        .filter(|path| !evidence.has_file(path) && !evidence.observed(path))
        .map(|path| {
            Violation::new(
                ViolationKind::PhantomFile,
                Severity::Critical,
                format!("answer references '{path}', which no tool output contains"),
                path,
            )
            .with_suggestion("cite only files observed in tool output")
        })
        .collect()
}

static STRUCTURAL_CLAIM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        the\s+`?([\w/.\-]+)`?\s+(directory|folder)\s+contains|
        organi[sz]ed\s+into\s+\d+\s+(modules|crates|packages|layers)|
        directory\s+structure|
        top.level\s+(modules|directories|folders)
        ",
    )
    .expect("invalid regex")
});

/// Flag layout claims made without structural listing evidence.
pub fn check_structural_claims(answer: &str, evidence: &EvidenceIndex) -> Vec<Violation> {
    let mut violations = Vec::new();
    for captures in STRUCTURAL_CLAIM.captures_iter(answer) {
        let claim = captures.get(0).map(|m| m.as_str()).unwrap_or("");
        let named_dir = captures.get(1).map(|m| m.as_str());

        let supported = match named_dir {
            Some(dir) => evidence.observed(dir),
            None => evidence.has_structure_evidence(),
        };
        if !supported {
            violations.push(
                Violation::new(
                    ViolationKind::StructuralClaim,
                    Severity::High,
                    format!("structural claim '{claim}' has no listing evidence"),
                    claim,
                )
                .with_suggestion("list the directory before describing its layout"),
            );
        }
    }
    violations
}

/// Language markers that betray confusion with another ecosystem.
const LANGUAGE_MARKERS: &[(&str, &[&str])] = &[
    ("python", &["def ", "__init__", "self.", ".py"]),
    ("go", &["func ", "goroutine", "go.mod"]),
    ("rust", &["fn ", "impl ", "cargo.toml", "crate::"]),
    ("java", &["public class", "extends ", ".java"]),
    ("javascript", &["const ", "=> {", "package.json"]),
];

/// Flag answers describing the project in terms of a language it does not
/// use.
pub fn check_language_confusion(answer: &str, evidence: &EvidenceIndex) -> Vec<Violation> {
    if evidence.languages().is_empty() {
        return Vec::new();
    }
    let lower = answer.to_lowercase();
    let mut violations = Vec::new();

    for (language, markers) in LANGUAGE_MARKERS {
        if evidence.languages().contains(*language) {
            continue;
        }
        let claims_language = lower.contains(&format!("written in {language}"))
            || lower.contains(&format!("this {language} project"))
            || markers.iter().filter(|m| lower.contains(*m)).count() >= 2;
        if claims_language {
            violations.push(
                Violation::new(
                    ViolationKind::LanguageConfusion,
                    Severity::High,
                    format!(
                        "answer describes {language} constructs; observed languages: {}",
                        evidence
                            .languages()
                            .iter()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                    language.to_string(),
                )
                .with_suggestion("describe the project in its own language's terms"),
            );
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(outputs: &[(&str, &str)], language: &str) -> EvidenceIndex {
        let mut evidence = EvidenceIndex::new();
        for (tool, output) in outputs {
            evidence.add_tool_output(tool, output);
        }
        evidence.add_language(language);
        evidence
    }

    #[test]
    fn test_extract_file_refs() {
        let refs =
            extract_file_refs("See src/agent/mod.rs and config.toml; also notes.txt stays out");
        assert_eq!(refs, vec!["src/agent/mod.rs", "config.toml"]);
    }

    #[test]
    fn test_phantom_file_flagged() {
        let evidence = indexed(&[("grep", "match in src/session/store.rs:40")], "rust");
        let violations =
            check_phantom_files("The logic lives in src/wizard/magic.rs", &evidence);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::PhantomFile);
        assert_eq!(violations[0].severity, Severity::Critical);
    }

    #[test]
    fn test_observed_file_not_flagged() {
        let evidence = indexed(&[("grep", "match in src/session/store.rs:40")], "rust");
        let violations =
            check_phantom_files("The store is src/session/store.rs", &evidence);
        assert!(violations.is_empty());

        // Bare file name matches an observed path suffix.
        let violations = check_phantom_files("See store.rs for details", &evidence);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_structural_claim_without_listing() {
        let evidence = indexed(&[("grep", "one match")], "rust");
        let violations = check_structural_claims(
            "The src/session directory contains the store and the state machine.",
            &evidence,
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::StructuralClaim);
    }

    #[test]
    fn test_structural_claim_with_listing_passes() {
        let evidence = indexed(&[("ls", "src/session\nsrc/router\n")], "rust");
        let violations = check_structural_claims(
            "The src/session directory contains the store.",
            &evidence,
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn test_language_confusion() {
        let evidence = indexed(&[("grep", "fn main() in src/main.rs")], "rust");
        let violations = check_language_confusion(
            "This python project defines def handlers with self.state everywhere.",
            &evidence,
        );
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::LanguageConfusion);

        let clean = check_language_confusion("The fn main entry point uses crate::run.", &evidence);
        assert!(clean.is_empty());
    }

    #[test]
    fn test_no_language_evidence_skips_check() {
        let evidence = EvidenceIndex::new();
        let violations =
            check_language_confusion("written in python, def everything", &evidence);
        assert!(violations.is_empty());
    }
}
