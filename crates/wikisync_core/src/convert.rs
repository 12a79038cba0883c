//! Conversion between Backlog wiki notation and Markdown.
//!
//! Conversion table:
//!
//! | Backlog                 | Markdown                |
//! |-------------------------|-------------------------|
//! | `![label][file.png]`    | `![label](file.png)`    |
//! | `* item`                | `- item`                |
//! | `** nested`             | `  - nested`            |
//!
//! Everything else (ordered lists, tables, emphasis) passes through untouched,
//! and nothing inside a code fence is rewritten.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Serialize;

const INDENT_PER_LEVEL: &str = "  ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionWarning {
    /// 1-based line number in the input text.
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub text: String,
    pub warnings: Vec<ConversionWarning>,
}

pub fn to_markdown(source: &str) -> String {
    to_markdown_with_warnings(source).text
}

pub fn to_source_markup(markdown: &str) -> String {
    to_source_markup_with_warnings(markdown).text
}

pub fn to_markdown_with_warnings(source: &str) -> Conversion {
    convert_lines(source, |line| {
        let line = backlog_image_pattern().replace_all(line, |caps: &Captures| {
            format!("![{}]({})", &caps[1], &caps[2])
        });
        backlog_list_to_markdown(&line)
    })
}

pub fn to_source_markup_with_warnings(markdown: &str) -> Conversion {
    convert_lines(markdown, |line| {
        let line = markdown_image_pattern().replace_all(line, |caps: &Captures| {
            format!("![{}][{}]", &caps[1], &caps[2])
        });
        markdown_list_to_backlog(&line)
    })
}

/// Local image targets referenced by Markdown content, in order of first use.
///
/// Absolute URLs, site-rooted paths and anything inside a code fence are
/// ignored.
pub fn image_references(markdown: &str) -> Vec<String> {
    let mut fences = FenceTracker::default();
    let mut output: Vec<String> = Vec::new();
    for line in markdown.split('\n') {
        if fences.observe(line) {
            continue;
        }
        for caps in markdown_image_pattern().captures_iter(line) {
            let target = caps[2].trim();
            if is_external_target(target) {
                continue;
            }
            if !output.iter().any(|existing| existing == target) {
                output.push(target.to_string());
            }
        }
    }
    output
}

/// Rewrite Markdown image targets outside code fences.
///
/// `rewrite` returns the replacement target, or `None` to keep the original.
pub fn rewrite_image_targets<F>(markdown: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut fences = FenceTracker::default();
    let mut lines = Vec::new();
    for line in markdown.split('\n') {
        if fences.observe(line) {
            lines.push(line.to_string());
            continue;
        }
        let replaced = markdown_image_pattern().replace_all(line, |caps: &Captures| {
            match rewrite(&caps[2]) {
                Some(target) => format!("![{}]({})", &caps[1], target),
                None => caps[0].to_string(),
            }
        });
        lines.push(replaced.into_owned());
    }
    lines.join("\n")
}

pub fn is_external_target(target: &str) -> bool {
    target.contains("://")
        || target.starts_with('/')
        || target.starts_with('#')
        || target.starts_with("mailto:")
        || target.starts_with("data:")
}

/// Tracks whether the current line sits inside a fenced code block.
///
/// Recognizes Markdown fences (```` ``` ````, `~~~`) and Backlog's
/// `{code}` … `{/code}` blocks. A fence closes only with the same marker
/// that opened it.
#[derive(Debug, Default)]
pub(crate) struct FenceTracker {
    open: Option<FenceMarker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceMarker {
    Backticks(usize),
    Tildes(usize),
    BacklogCode,
}

impl FenceTracker {
    /// Returns true when `line` is a fence marker or fenced content, i.e.
    /// when conversion rules must not touch it.
    pub(crate) fn observe(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self.open {
            Some(marker) => {
                if closes_fence(marker, trimmed) {
                    self.open = None;
                }
                true
            }
            None => match opening_marker(trimmed) {
                Some(marker) => {
                    if !(marker == FenceMarker::BacklogCode && trimmed.contains("{/code}")) {
                        self.open = Some(marker);
                    }
                    true
                }
                None => false,
            },
        }
    }
}

fn opening_marker(trimmed: &str) -> Option<FenceMarker> {
    if trimmed.starts_with("{code") {
        return Some(FenceMarker::BacklogCode);
    }
    let ticks = trimmed.chars().take_while(|ch| *ch == '`').count();
    if ticks >= 3 {
        return Some(FenceMarker::Backticks(ticks));
    }
    let tildes = trimmed.chars().take_while(|ch| *ch == '~').count();
    if tildes >= 3 {
        return Some(FenceMarker::Tildes(tildes));
    }
    None
}

fn closes_fence(marker: FenceMarker, trimmed: &str) -> bool {
    match marker {
        FenceMarker::BacklogCode => trimmed.starts_with("{/code}"),
        FenceMarker::Backticks(width) => {
            let ticks = trimmed.chars().take_while(|ch| *ch == '`').count();
            ticks >= width && trimmed[ticks..].trim().is_empty()
        }
        FenceMarker::Tildes(width) => {
            let tildes = trimmed.chars().take_while(|ch| *ch == '~').count();
            tildes >= width && trimmed[tildes..].trim().is_empty()
        }
    }
}

fn convert_lines<F>(input: &str, mut convert: F) -> Conversion
where
    F: FnMut(&str) -> String,
{
    let mut fences = FenceTracker::default();
    let mut lines = Vec::new();
    let mut warnings = Vec::new();
    for (index, line) in input.split('\n').enumerate() {
        if fences.observe(line) {
            lines.push(line.to_string());
            continue;
        }
        if let Some(message) = malformed_image(line) {
            warnings.push(ConversionWarning {
                line: index + 1,
                message,
            });
        }
        lines.push(convert(line));
    }
    Conversion {
        text: lines.join("\n"),
        warnings,
    }
}

/// `![` that does not start a complete image in either notation.
fn malformed_image(line: &str) -> Option<String> {
    let opened = line.matches("![").count();
    if opened == 0 {
        return None;
    }
    let complete = backlog_image_pattern().find_iter(line).count()
        + markdown_image_pattern().find_iter(line).count();
    if complete >= opened {
        return None;
    }
    Some(format!(
        "incomplete image reference left unchanged: {}",
        line.trim()
    ))
}

fn backlog_list_to_markdown(line: &str) -> String {
    let Some(caps) = backlog_list_pattern().captures(line) else {
        return line.to_string();
    };
    let leading = &caps[1];
    let depth = caps[2].len();
    let rest = &line[caps[0].len()..];
    format!("{leading}{}- {rest}", INDENT_PER_LEVEL.repeat(depth - 1))
}

fn markdown_list_to_backlog(line: &str) -> String {
    let Some(caps) = markdown_list_pattern().captures(line) else {
        return line.to_string();
    };
    let width: usize = caps[1]
        .chars()
        .map(|ch| if ch == '\t' { INDENT_PER_LEVEL.len() } else { 1 })
        .sum();
    let depth = width / INDENT_PER_LEVEL.len() + 1;
    let rest = &line[caps[0].len()..];
    format!("{} {rest}", "*".repeat(depth))
}

fn backlog_image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"!\[([^\]\[]*)\]\[([^\]\[]+)\]").expect("valid backlog image pattern")
    })
}

fn markdown_image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"!\[([^\]\[]*)\]\(([^()]+)\)").expect("valid markdown image pattern")
    })
}

fn backlog_list_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([ \t]*)(\*+) ").expect("valid backlog list pattern"))
}

fn markdown_list_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([ \t]*)- ").expect("valid markdown list pattern"))
}
