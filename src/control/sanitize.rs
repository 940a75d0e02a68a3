//! Output sanitisation: strip leaked tool markup, preserve code.
//!
//! Models occasionally leak their tool-call scaffolding into final
//! answers. The sanitizer locates preservation zones first (fenced code
//! blocks and inline code spans) and applies tag stripping only to the
//! gaps between them, so code examples survive byte-for-byte.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Tag families whose markup is native output for some models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Strip every known tool/thinking tag.
    Generic,
    /// The model legitimately emits `function_calls`/`invoke` tags;
    /// preserve those and strip the rest.
    NativeFunctionTags,
}

/// Result of one sanitisation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizeOutcome {
    /// Cleaned text
    pub text: String,
    /// Whether any markup was stripped
    pub stripped: bool,
    /// Whether the output was cut at the length limit
    pub truncated: bool,
}

const COMMON_TAGS: &[&str] = &[
    "tool_call",
    "execute",
    "think",
    "thought",
    "reasoning",
    "reflection",
];

const GENERIC_ONLY_TAGS: &[&str] = &["function_calls", "invoke"];

struct TagPatterns {
    /// `<tag ...>...</tag>` including content
    paired: Regex,
    /// Stray opening or closing tag
    stray: Regex,
}

fn compile_tag_patterns(tags: &[&str]) -> Vec<TagPatterns> {
    tags.iter()
        .map(|tag| TagPatterns {
            paired: Regex::new(&format!(r"(?is)<{tag}(?:\s[^>]*)?>.*?</{tag}\s*>"))
                .expect("invalid regex"),
            stray: Regex::new(&format!(r"(?i)</?{tag}(?:\s[^>]*)?>")).expect("invalid regex"),
        })
        .collect()
}

static GENERIC_PATTERNS: LazyLock<Vec<TagPatterns>> = LazyLock::new(|| {
    let mut tags: Vec<&str> = COMMON_TAGS.to_vec();
    tags.extend_from_slice(GENERIC_ONLY_TAGS);
    compile_tag_patterns(&tags)
});

static NATIVE_PATTERNS: LazyLock<Vec<TagPatterns>> =
    LazyLock::new(|| compile_tag_patterns(COMMON_TAGS));

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("invalid regex"));

/// Strips leaked tool markup outside code.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    family: ModelFamily,
    /// Optional byte cap on the sanitised output
    max_output_len: Option<usize>,
}

impl Sanitizer {
    pub fn new(family: ModelFamily) -> Self {
        Self {
            family,
            max_output_len: None,
        }
    }

    pub fn with_max_output_len(mut self, len: usize) -> Self {
        self.max_output_len = Some(len);
        self
    }

    /// Sanitize `input`. Idempotent: sanitising the output again yields
    /// the same text.
    pub fn sanitize(&self, input: &str) -> SanitizeOutcome {
        let patterns: &[TagPatterns] = match self.family {
            ModelFamily::Generic => &GENERIC_PATTERNS,
            ModelFamily::NativeFunctionTags => &NATIVE_PATTERNS,
        };

        let zones = find_preservation_zones(input);
        let mut output = String::with_capacity(input.len());
        let mut stripped = false;
        let mut cursor = 0;

        for (start, end) in &zones {
            let gap = &input[cursor..*start];
            let cleaned = clean_gap(gap, patterns);
            if cleaned != gap {
                stripped = true;
            }
            output.push_str(&cleaned);
            output.push_str(&input[*start..*end]);
            cursor = *end;
        }
        let tail = &input[cursor..];
        let cleaned = clean_gap(tail, patterns);
        if cleaned != tail {
            stripped = true;
        }
        output.push_str(&cleaned);

        let mut text = output.trim().to_string();
        let mut truncated = false;
        if let Some(max) = self.max_output_len {
            if text.len() > max {
                let mut end = max;
                while end > 0 && !text.is_char_boundary(end) {
                    end -= 1;
                }
                text.truncate(end);
                truncated = true;
            }
        }

        SanitizeOutcome {
            text,
            stripped,
            truncated,
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(ModelFamily::Generic)
    }
}

fn clean_gap(gap: &str, patterns: &[TagPatterns]) -> String {
    let mut text = gap.to_string();
    for pattern in patterns {
        text = pattern.paired.replace_all(&text, "").into_owned();
        text = pattern.stray.replace_all(&text, "").into_owned();
    }
    EXCESS_NEWLINES.replace_all(&text, "\n\n").into_owned()
}

/// Byte ranges of fenced code blocks and inline code spans, sorted and
/// non-overlapping. An unterminated fence preserves through to the end.
fn find_preservation_zones(text: &str) -> Vec<(usize, usize)> {
    let mut zones = Vec::new();
    let fences: Vec<usize> = text.match_indices("```").map(|(i, _)| i).collect();

    for pair in fences.chunks(2) {
        match pair {
            [open, close] => zones.push((*open, *close + 3)),
            [open] => zones.push((*open, text.len())),
            _ => {}
        }
    }

    // Inline spans in the gaps between fenced zones.
    let mut inline_zones = Vec::new();
    let mut cursor = 0;
    for (start, end) in zones.iter().copied().chain([(text.len(), text.len())]) {
        let gap = &text[cursor..start];
        let mut offset = 0;
        while let Some(open_rel) = gap[offset..].find('`') {
            let open = offset + open_rel;
            let rest = &gap[open + 1..];
            match rest.find('`') {
                Some(close_rel) if !rest[..close_rel].contains('\n') => {
                    inline_zones.push((cursor + open, cursor + open + 1 + close_rel + 1));
                    offset = open + 1 + close_rel + 1;
                }
                _ => {
                    offset = open + 1;
                }
            }
        }
        cursor = end;
    }

    zones.extend(inline_zones);
    zones.sort_by_key(|(start, _)| *start);
    zones
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fenced_block_preserved_outer_tag_stripped() {
        let sanitizer = Sanitizer::default();
        let input =
            "Here's code:\n```go\n<tool_call>inside</tool_call>\n```\nOutside: <think>strip</think>";
        let outcome = sanitizer.sanitize(input);

        assert!(outcome.text.contains("<tool_call>inside</tool_call>"));
        assert!(!outcome.text.contains("strip"));
        assert!(outcome.stripped);
    }

    #[test]
    fn test_inline_code_span_preserved() {
        let sanitizer = Sanitizer::default();
        let input = "Use `<execute>` carefully. <execute>rm -rf</execute> Done.";
        let outcome = sanitizer.sanitize(input);

        assert!(outcome.text.contains("`<execute>`"));
        assert!(!outcome.text.contains("rm -rf"));
    }

    #[test]
    fn test_native_family_preserves_function_tags() {
        let native = Sanitizer::new(ModelFamily::NativeFunctionTags);
        let input = "<function_calls>keep</function_calls> but <think>drop</think>";
        let outcome = native.sanitize(input);
        assert!(outcome.text.contains("<function_calls>keep</function_calls>"));
        assert!(!outcome.text.contains("drop"));

        let generic = Sanitizer::new(ModelFamily::Generic);
        let outcome = generic.sanitize(input);
        assert!(!outcome.text.contains("keep"));
    }

    #[test]
    fn test_stray_tags_stripped() {
        let sanitizer = Sanitizer::default();
        let outcome = sanitizer.sanitize("Answer </tool_call> with stray <reasoning> tags");
        assert_eq!(outcome.text, "Answer  with stray  tags");
        assert!(outcome.stripped);
    }

    #[test]
    fn test_newline_runs_collapsed_and_trimmed() {
        let sanitizer = Sanitizer::default();
        let outcome = sanitizer.sanitize("\n\nFirst\n\n\n\nSecond\n\n\n");
        assert_eq!(outcome.text, "First\n\nSecond");
        assert!(!outcome.stripped);
    }

    #[test]
    fn test_newlines_inside_fences_untouched() {
        let sanitizer = Sanitizer::default();
        let input = "```\na\n\n\n\nb\n```";
        let outcome = sanitizer.sanitize(input);
        assert_eq!(outcome.text, input);
    }

    #[test]
    fn test_unterminated_fence_preserved_to_end() {
        let sanitizer = Sanitizer::default();
        let input = "Before <think>x</think>\n```rust\n<think>keep me</think>";
        let outcome = sanitizer.sanitize(input);
        assert!(outcome.text.contains("<think>keep me</think>"));
        assert!(!outcome.text.contains("x</think>\n"));
    }

    #[test]
    fn test_clean_text_passes_through() {
        let sanitizer = Sanitizer::default();
        let input = "The loop drives phases until a terminal state.";
        let outcome = sanitizer.sanitize(input);
        assert_eq!(outcome.text, input);
        assert!(!outcome.stripped);
        assert!(!outcome.truncated);
    }

    #[test]
    fn test_truncation_is_surfaced() {
        let sanitizer = Sanitizer::default().with_max_output_len(10);
        let outcome = sanitizer.sanitize("This answer is longer than ten bytes.");
        assert!(outcome.truncated);
        assert_eq!(outcome.text.len(), 10);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let sanitizer = Sanitizer::default();
        let inputs = [
            "Here's code:\n```go\n<tool_call>x</tool_call>\n```\n<think>y</think>",
            "plain answer",
            "a\n\n\n\nb `code` <execute>z</execute>",
            "<thought>only markup</thought>",
        ];
        for input in inputs {
            let once = sanitizer.sanitize(input);
            let twice = sanitizer.sanitize(&once.text);
            assert_eq!(once.text, twice.text, "input: {input:?}");
            assert!(!twice.stripped, "second pass stripped: {input:?}");
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sanitize_is_idempotent(input in ".{0,400}") {
                let sanitizer = Sanitizer::default();
                let once = sanitizer.sanitize(&input);
                let twice = sanitizer.sanitize(&once.text);
                prop_assert_eq!(&once.text, &twice.text);
            }

            #[test]
            fn fenced_content_survives(body in "[a-zA-Z0-9 <>/_]{0,80}") {
                let input = format!("before <think>gone</think>\n```\n{}\n```\nafter", body);
                let sanitizer = Sanitizer::default();
                let outcome = sanitizer.sanitize(&input);
                let fenced = format!("```\n{}\n```", body);
                let fence_survived = outcome.text.contains(&fenced);
                prop_assert!(fence_survived);
                prop_assert!(!outcome.text.contains("gone"));
            }
        }
    }
}
