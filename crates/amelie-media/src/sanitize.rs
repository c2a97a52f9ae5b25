//! Plain-text sanitizer for engine output.
//!
//! Screen readers announce markdown punctuation literally, so replies are
//! reduced to plain prose: emphasis, headings, bullets, code fences, links,
//! images, HTML tags and tables are stripped while the words are kept.
//! Applying [`sanitize`] to its own output changes nothing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Text that is safe to read aloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizedReply {
    pub plain_text: String,
}

impl SanitizedReply {
    pub fn is_empty(&self) -> bool {
        self.plain_text.is_empty()
    }
}

static IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
// Known element names only, so prose like "<x and y>" survives.
static HTML_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)</?(a|abbr|b|big|blockquote|body|br|center|cite|code|dd|del|details|div|dl|dt|em|font|h[1-6]|head|hr|html|i|img|ins|kbd|li|mark|ol|p|pre|q|s|small|span|strike|strong|sub|summary|sup|table|tbody|td|tfoot|th|thead|tr|tt|u|ul)\b[^<>]*>",
    )
    .unwrap()
});
static QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*>+\s?").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*#{1,6}(\s+|$)").unwrap());
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[-+•]\s+").unwrap());
static RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(-{3,}|={3,})\s*$").unwrap());
static TABLE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\|?\s*:?-+:?\s*(\|\s*:?-+:?\s*)*\|?\s*$").unwrap());
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());

/// Reduce `raw` to plain text.
pub fn sanitize(raw: &str) -> SanitizedReply {
    // Every pass that changes the text removes characters or turns an
    // underscore into a space, so this reaches a fixed point.
    let mut current = sanitize_pass(raw);
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    SanitizedReply {
        plain_text: current,
    }
}

fn sanitize_pass(input: &str) -> String {
    let text: String = input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let mut lines = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            continue;
        }
        if RULE.is_match(line) {
            continue;
        }
        if is_table_row(line) {
            if TABLE_SEPARATOR.is_match(line) {
                continue;
            }
            lines.push(table_row_to_text(line));
            continue;
        }

        let mut line = strip_inline(line);
        loop {
            let before = line.len();
            line = QUOTE.replace(&line, "").into_owned();
            line = HEADING.replace(&line, "").into_owned();
            line = BULLET.replace(&line, "").into_owned();
            if line.len() == before {
                break;
            }
        }
        lines.push(line);
    }

    collapse_whitespace(&lines)
}

fn strip_inline(line: &str) -> String {
    let line = IMAGE.replace_all(line, "$1");
    let line = LINK.replace_all(&line, "$1");
    let line = HTML_TAG.replace_all(&line, "");
    line.chars()
        .filter(|c| !matches!(c, '*' | '`' | '~'))
        .map(|c| if c == '_' { ' ' } else { c })
        .collect()
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() > 1 && trimmed.starts_with('|') && trimmed.ends_with('|')
}

fn table_row_to_text(line: &str) -> String {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| strip_inline(cell).trim().to_string())
        .filter(|cell| !cell.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn collapse_whitespace(lines: &[String]) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_run = false;
    for line in lines {
        let line = SPACES.replace_all(line, " ").trim().to_string();
        if line.is_empty() {
            if !out.is_empty() {
                blank_run = true;
            }
            continue;
        }
        if blank_run {
            out.push(String::new());
            blank_run = false;
        }
        out.push(line);
    }
    out.join("\n")
}
