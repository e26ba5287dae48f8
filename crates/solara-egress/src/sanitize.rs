//! Scrubbing of internal artefacts that leak into generated replies.
//!
//! This is a denylist: it removes the leak shapes we know about (runtime
//! object handles, reasoning blocks, self-narration, debug output) and lets
//! everything else through. A leak shape not listed here reaches the user.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of leaked artefact a rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakCategory {
    /// Runtime object/handle representations, e.g. `<Foo object at 0x7f..>`.
    ObjectRepr,
    /// `<thinking>…</thinking>` and similar internal blocks.
    InternalBlock,
    /// Whole lines where the model narrates its own process.
    SelfNarration,
    /// Debug/trace-prefixed lines and stack traces.
    DebugOutput,
}

/// What [`ResponseSanitizer::analyze`] found in a text, without modifying it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakageReport {
    pub has_leakage: bool,
    pub match_count: usize,
    /// Fraction of the input's characters covered by leak matches, in [0, 1].
    pub leakage_score: f64,
    /// Distinct categories found, in rule order.
    pub categories: Vec<LeakCategory>,
}

struct Rule {
    category: LeakCategory,
    regex: Regex,
}

/// Compiled leak rules plus structural cleanup.
pub struct ResponseSanitizer {
    rules: Vec<Rule>,
    cleanup: Vec<(Regex, &'static str)>,
}

/// Removed anywhere in the text, together with one leading blank so the
/// surrounding sentence closes up.
const INLINE_RULES: &[(LeakCategory, &str)] = &[
    (
        LeakCategory::ObjectRepr,
        r"[ \t]?<[A-Za-z_][\w.]* object at 0x[0-9A-Fa-f]+>",
    ),
    (
        LeakCategory::ObjectRepr,
        r"[ \t]?<(?:built-in )?function [^<>\n]+>",
    ),
    (LeakCategory::ObjectRepr, r"[ \t]?<bound method [^<>\n]+>"),
    (LeakCategory::ObjectRepr, r"[ \t]?<class '[^'\n]+'>"),
    (LeakCategory::ObjectRepr, r"[ \t]?<module '[^'\n]+'[^<>\n]*>"),
    (
        LeakCategory::InternalBlock,
        r"(?is)[ \t]?<(?:thinking|reasoning|scratchpad|internal)>.*?</(?:thinking|reasoning|scratchpad|internal)>",
    ),
];

/// Anchored at line start; the whole line (and its newline) is removed.
/// The same phrase in the middle of a sentence is left alone.
const LINE_RULES: &[(LeakCategory, &str)] = &[
    (
        LeakCategory::SelfNarration,
        r"(?im)^[ \t]*(?:I'll|I will|Let me)\s+(?:continue\s+(?:the|this|our)\s+conversation|process\s+(?:this|that|the\s+(?:user'?s?\s+)?(?:request|message|input))|analy[sz]e\s+(?:this|the\s+(?:user'?s?\s+)?(?:request|message|input))|now\s+(?:respond|generate\s+(?:a|the)\s+response))[^\n]*\n?",
    ),
    (
        LeakCategory::DebugOutput,
        r"(?m)^[ \t]*(?:DEBUG:|\[DEBUG\]|TRACE:|\[TRACE\]|\[INTERNAL\])[^\n]*\n?",
    ),
    (
        LeakCategory::DebugOutput,
        r"(?m)^Traceback \(most recent call last\):[^\n]*\n(?:[ \t]+[^\n]*\n?)*(?:[A-Za-z_][\w.]*(?:Error|Exception)\b[^\n]*\n?)?",
    ),
];

const CLEANUP_RULES: &[(&str, &str)] = &[
    // Whitespace-only lines count as blank.
    (r"(?m)^[ \t]+$", ""),
    (r"\n{3,}", "\n\n"),
    (r" {3,}", " "),
];

fn compile(pattern: &str) -> Regex {
    // Patterns are compile-time constants covered by the tests below.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid sanitizer pattern {pattern:?}: {e}"))
}

impl ResponseSanitizer {
    pub fn new() -> Self {
        let rules = INLINE_RULES
            .iter()
            .chain(LINE_RULES)
            .map(|(category, pattern)| Rule {
                category: *category,
                regex: compile(pattern),
            })
            .collect();
        let cleanup = CLEANUP_RULES
            .iter()
            .map(|(pattern, replacement)| (compile(pattern), *replacement))
            .collect();
        Self { rules, cleanup }
    }

    /// Return `text` with every known leak removed and whitespace tidied.
    ///
    /// Pure and idempotent: passes repeat until the output stops changing.
    pub fn sanitize(&self, text: &str) -> String {
        // Every pass only removes text or collapses whitespace, so this ends.
        let mut current = text.to_string();
        loop {
            let next = self.pass(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    fn pass(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            out = rule.regex.replace_all(&out, "").into_owned();
        }
        for (regex, replacement) in &self.cleanup {
            out = regex.replace_all(&out, *replacement).into_owned();
        }
        out.trim().to_string()
    }

    /// Report leaks in `text` without changing it.
    pub fn analyze(&self, text: &str) -> LeakageReport {
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut categories: Vec<LeakCategory> = Vec::new();

        for rule in &self.rules {
            for m in rule.regex.find_iter(text) {
                spans.push((m.start(), m.end()));
                if !categories.contains(&rule.category) {
                    categories.push(rule.category);
                }
            }
        }

        let match_count = spans.len();
        let total = text.chars().count();
        let leakage_score = if total == 0 {
            0.0
        } else {
            (covered_chars(text, spans) as f64 / total as f64).min(1.0)
        };

        LeakageReport {
            has_leakage: match_count > 0,
            match_count,
            leakage_score,
            categories,
        }
    }
}

impl Default for ResponseSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Characters covered by the union of byte spans (overlaps counted once).
fn covered_chars(text: &str, mut spans: Vec<(usize, usize)>) -> usize {
    spans.sort_unstable();
    let mut covered = 0;
    let mut cursor = 0;
    for (start, end) in spans {
        let start = start.max(cursor);
        if end > start {
            covered += text[start..end].chars().count();
            cursor = end;
        }
    }
    covered
}

static DEFAULT_SANITIZER: LazyLock<ResponseSanitizer> = LazyLock::new(ResponseSanitizer::new);

/// [`ResponseSanitizer::sanitize`] with the shared default rule set.
pub fn sanitize(text: &str) -> String {
    DEFAULT_SANITIZER.sanitize(text)
}

/// [`ResponseSanitizer::analyze`] with the shared default rule set.
pub fn analyze(text: &str) -> LeakageReport {
    DEFAULT_SANITIZER.analyze(text)
}
