//! Body reducer: raw message body bytes to bounded, LLM-ready text.
//!
//! Steps, in order:
//! 1. Decode as UTF-8 (anything else is [`MalformedInputError::NotUtf8`]).
//! 2. Drop `<script>`/`<style>` blocks and comments, turn block tags into
//!    line breaks, strip remaining tags, decode character entities.
//! 3. Optionally remove newsletter boilerplate and embedded addresses.
//! 4. Collapse whitespace to single spaces.
//! 5. Truncate to the character budget at a sentence or word boundary.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::MalformedInputError;

/// Reduced text plus size metrics for the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedBody {
    pub text: String,
    /// Characters in the decoded body before any reduction.
    pub original_chars: usize,
    pub truncated: bool,
}

impl ReducedBody {
    pub fn chars(&self) -> usize {
        self.text.chars().count()
    }

    pub fn savings_percentage(&self) -> f64 {
        savings_percentage(self.original_chars, self.chars())
    }
}

/// `(start - end) / start * 100`, or 0 for an empty start.
pub fn savings_percentage(start: usize, end: usize) -> f64 {
    if start == 0 {
        return 0.0;
    }
    (start as f64 - end as f64) / start as f64 * 100.0
}

struct MarkupPatterns {
    hidden_blocks: Vec<Regex>,
    block_breaks: Vec<Regex>,
    tags: Vec<Regex>,
    entities: Vec<Regex>,
}

static MARKUP: LazyLock<MarkupPatterns> = LazyLock::new(|| MarkupPatterns {
    hidden_blocks: compile(&[
        r"(?is)<script\b[^>]*>.*?</script\s*>",
        r"(?is)<style\b[^>]*>.*?</style\s*>",
        r"(?is)<head\b[^>]*>.*?</head\s*>",
        r"(?s)<!--.*?-->",
    ]),
    block_breaks: compile(&[
        r"(?i)<br\s*/?>",
        r"(?i)</(p|div|li|tr|table|ul|ol|blockquote|h[1-6])\s*>",
    ]),
    tags: compile(&[r"<[a-zA-Z/!][^>]*>"]),
    entities: compile(&[r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});"]),
});

const HEADER_PATTERNS: &[&str] = &[
    r"(?im)^.*?Newsletter\s*\n",
    r"(?im)Your customized.*?newsletter.*?\n",
    r"(?im)^Hello,?\s*\n",
    r"(?im)Here is your customized.*?\n",
];

const FOOTER_PATTERNS: &[&str] = &[
    r"(?is)This email is a free service.*?$",
    r"(?is)You received this email because.*?$",
    r"(?is)If you do not wish to receive.*?unsubscribe.*?\.",
    r"(?is)You are subscribed as\s+[\w.\-+]+@[\w.\-]+\.\w+\s*\.",
    r"(?is)You may manage your subscription.*?\.",
    r"(?is)Story previews are generated using AI.*?\.",
    r"(?is)For the most complete and accurate information.*?\.",
    r"(?is)Read the full disclaimer\s*\.",
    r"(?is)©\s*\d{4}.*?All rights reserved\.",
];

const EMAIL_PATTERN: &str = r"\b[\w.\-+]+@[\w.\-]+\.\w+\b";

/// Literal `\r\n`, `\n`, `\r` escape sequences left in text by some senders.
const ESCAPED_NEWLINES: &str = r"\\r\\n|\\n|\\r";

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// Configured reducer. Cheap to share; holds only compiled patterns.
#[derive(Debug, Clone)]
pub struct BodyReducer {
    boilerplate: Option<Boilerplate>,
}

#[derive(Debug, Clone)]
struct Boilerplate {
    escapes: Vec<Regex>,
    header: Vec<Regex>,
    footer: Vec<Regex>,
    addresses: Vec<Regex>,
}

impl BodyReducer {
    pub fn new(strip_boilerplate: bool) -> Self {
        let boilerplate = strip_boilerplate.then(|| Boilerplate {
            escapes: compile(&[ESCAPED_NEWLINES]),
            header: compile(HEADER_PATTERNS),
            footer: compile(FOOTER_PATTERNS),
            addresses: compile(&[EMAIL_PATTERN]),
        });
        Self { boilerplate }
    }

    /// Reduce `raw` to at most `max_length` characters.
    ///
    /// Returns [`MalformedInputError::Empty`] when nothing readable is left,
    /// and [`MalformedInputError::Untruncatable`] when the first word alone
    /// is over budget.
    pub fn reduce(&self, raw: &[u8], max_length: usize) -> Result<ReducedBody, MalformedInputError> {
        let decoded = std::str::from_utf8(raw)
            .map_err(|e| MalformedInputError::NotUtf8 { offset: e.valid_up_to() })?;
        let original_chars = decoded.chars().count();

        let mut text = strip_markup(decoded);
        if let Some(bp) = &self.boilerplate {
            text = bp.apply(text);
        }
        let collapsed = collapse_whitespace(&text);
        if collapsed.is_empty() {
            return Err(MalformedInputError::Empty);
        }
        let reduced = truncate_at_boundary(&collapsed, max_length);
        if reduced.is_empty() {
            let first = collapsed.split(' ').next().unwrap_or_default();
            return Err(MalformedInputError::Untruncatable {
                word_chars: first.chars().count(),
                max_chars: max_length,
            });
        }

        Ok(ReducedBody {
            truncated: reduced.len() < collapsed.len(),
            text: reduced.to_string(),
            original_chars,
        })
    }
}

impl Default for BodyReducer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Boilerplate {
    fn apply(&self, text: String) -> String {
        let mut text = replace_all(&self.escapes, text, "\n");
        text = replace_all(&self.header, text, "");
        text = replace_all(&self.footer, text, "");
        replace_all(&self.addresses, text, "")
    }
}

/// Markup-only reduction, no boilerplate removal.
pub fn reduce(raw: &[u8], max_length: usize) -> Result<String, MalformedInputError> {
    BodyReducer::new(false)
        .reduce(raw, max_length)
        .map(|r| r.text)
}

fn replace_all(patterns: &[Regex], text: String, with: &str) -> String {
    patterns
        .iter()
        .fold(text, |acc, re| re.replace_all(&acc, with).into_owned())
}

fn strip_markup(input: &str) -> String {
    let markup = &*MARKUP;
    let mut text = replace_all(&markup.hidden_blocks, input.to_string(), " ");
    text = replace_all(&markup.block_breaks, text, "\n");
    text = replace_all(&markup.tags, text, " ");
    markup
        .entities
        .iter()
        .fold(text, |acc, re| re.replace_all(&acc, decode_entity).into_owned())
}

fn decode_entity(caps: &Captures) -> String {
    let whole = &caps[0];
    let name = &caps[1];
    let decoded = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
    } else if let Some(dec) = name.strip_prefix('#') {
        dec.parse::<u32>().ok().and_then(char::from_u32)
    } else {
        match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            "mdash" => Some('—'),
            "ndash" => Some('–'),
            "hellip" => Some('…'),
            "copy" => Some('©'),
            "rsquo" | "lsquo" => Some('\''),
            "rdquo" | "ldquo" => Some('"'),
            _ => None,
        }
    };
    decoded.map_or_else(|| whole.to_string(), String::from)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Longest prefix of `text` with at most `max_chars` characters that ends
/// on a sentence or word boundary. Prefers a sentence end in the back half.
fn truncate_at_boundary(text: &str, max_chars: usize) -> &str {
    let cut = match text.char_indices().nth(max_chars) {
        Some((idx, _)) => idx,
        None => return text,
    };
    let window = &text[..cut];
    let boundary_after = |end: usize| text[end..].chars().next().is_none_or(char::is_whitespace);

    let half = window.len() / 2;
    let sentence_end = window
        .char_indices()
        .rev()
        .take_while(|(i, _)| *i >= half)
        .find(|(i, c)| matches!(*c, '.' | '!' | '?') && boundary_after(*i + c.len_utf8()))
        .map(|(i, c)| i + c.len_utf8());
    if let Some(end) = sentence_end {
        return &text[..end];
    }

    if boundary_after(cut) {
        return window.trim_end();
    }
    match window.rfind(char::is_whitespace) {
        Some(pos) => window[..pos].trim_end(),
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ends_on_word_boundary(full: &str, reduced: &str) -> bool {
        full.starts_with(reduced)
            && full[reduced.len()..]
                .chars()
                .next()
                .is_none_or(char::is_whitespace)
    }

    #[test]
    fn all_patterns_compile() {
        let markup = &*MARKUP;
        assert_eq!(markup.hidden_blocks.len(), 4);
        assert_eq!(markup.block_breaks.len(), 2);
        assert_eq!(markup.tags.len(), 1);
        assert_eq!(markup.entities.len(), 1);
        assert_eq!(compile(HEADER_PATTERNS).len(), HEADER_PATTERNS.len());
        assert_eq!(compile(FOOTER_PATTERNS).len(), FOOTER_PATTERNS.len());
        assert_eq!(compile(&[EMAIL_PATTERN, ESCAPED_NEWLINES]).len(), 2);
    }

    #[test]
    fn strips_tags() {
        let out = reduce(b"<p>Novel compound X inhibits Y</p>", 1000).unwrap();
        assert_eq!(out, "Novel compound X inhibits Y");
    }

    #[test]
    fn drops_script_and_style_contents() {
        let html = b"<html><head><title>t</title></head><body><style>p{color:red}</style>\
            <script>alert('x')</script><div>Hello<br/>world</div></body></html>";
        assert_eq!(reduce(html, 1000).unwrap(), "Hello world");
    }

    #[test]
    fn decodes_entities() {
        let out = reduce(b"Fish &amp; chips &lt;3 &#65;&#x42; &bogus;", 1000).unwrap();
        assert_eq!(out, "Fish & chips <3 AB &bogus;");
    }

    #[test]
    fn plain_text_keeps_comparisons() {
        let out = reduce(b"if a < b and c > d then", 1000).unwrap();
        assert_eq!(out, "if a < b and c > d then");
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let err = reduce(b"ok \xff\xfe bad", 100).unwrap_err();
        assert_eq!(err, MalformedInputError::NotUtf8 { offset: 3 });
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert_eq!(reduce(b"  <p> </p>\n\t", 100).unwrap_err(), MalformedInputError::Empty);
    }

    #[test]
    fn truncates_at_sentence_end() {
        let text = "First sentence here. Second sentence runs on and on";
        let out = reduce(text.as_bytes(), 30).unwrap();
        assert_eq!(out, "First sentence here.");
    }

    #[test]
    fn truncates_at_word_when_no_sentence() {
        let text = "alpha beta gamma delta epsilon";
        let out = reduce(text.as_bytes(), 13).unwrap();
        assert_eq!(out, "alpha beta");
        assert!(ends_on_word_boundary(text, &out));
    }

    #[test]
    fn exact_word_end_is_kept() {
        let out = reduce(b"alpha beta gamma", 10).unwrap();
        assert_eq!(out, "alpha beta");
    }

    #[test]
    fn first_word_over_budget_is_untruncatable() {
        assert_eq!(
            reduce(b"supercalifragilistic", 5).unwrap_err(),
            MalformedInputError::Untruncatable {
                word_chars: 20,
                max_chars: 5
            }
        );
        let err = reduce(b"https://example.org/a-very-long-path-segment-here", 20).unwrap_err();
        assert!(matches!(err, MalformedInputError::Untruncatable { max_chars: 20, .. }));
        assert!(!err.to_string().contains("no readable text"));
    }

    #[test]
    fn output_bounded_and_never_mid_word() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod \
                    tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, \
                    quis nostrud exercitation ullamco laboris nisi ut aliquip ex ea commodo.";
        let collapsed = collapse_whitespace(text);
        for max in 1..collapsed.chars().count() + 5 {
            match reduce(text.as_bytes(), max) {
                Ok(out) => {
                    assert!(out.chars().count() <= max, "max {max}: {out:?}");
                    assert!(ends_on_word_boundary(&collapsed, &out), "max {max}: {out:?}");
                }
                Err(e) => assert!(
                    matches!(e, MalformedInputError::Untruncatable { .. }),
                    "max {max}: {e:?}"
                ),
            }
        }
    }

    #[test]
    fn multibyte_text_truncates_on_char_boundary() {
        let text = "Größe und Übermaß sind gleich. Ähnlich wie früher";
        let out = reduce(text.as_bytes(), 20).unwrap();
        assert!(out.chars().count() <= 20);
        assert!(ends_on_word_boundary(text, &out));
    }

    #[test]
    fn boilerplate_removed_when_enabled() {
        let body = "Science Weekly Newsletter\nHello,\nResearchers found that enzyme Q \
                    speeds up digestion. Contact editor@news.example.com for more.\n\
                    You received this email because you subscribed. Unsubscribe anytime.";
        let reducer = BodyReducer::new(true);
        let out = reducer.reduce(body.as_bytes(), 1000).unwrap();
        assert_eq!(
            out.text,
            "Researchers found that enzyme Q speeds up digestion. Contact for more."
        );
        assert!(out.savings_percentage() > 0.0);
        assert!(!out.truncated);

        let kept = BodyReducer::new(false).reduce(body.as_bytes(), 1000).unwrap();
        assert!(kept.text.contains("editor@news.example.com"));
    }

    #[test]
    fn escaped_newlines_normalized() {
        let reducer = BodyReducer::new(true);
        let out = reducer.reduce(br"line one\nline two\r\nline three", 100).unwrap();
        assert_eq!(out.text, "line one line two line three");
    }

    #[test]
    fn savings_math() {
        assert_eq!(savings_percentage(0, 0), 0.0);
        assert_eq!(savings_percentage(200, 50), 75.0);
    }
}
