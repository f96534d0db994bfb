//! Client-side search over the conversation.
//!
//! `filter` derives a view of matching messages; the highlight functions split
//! a string into matched and unmatched spans for display. Matching is always
//! case-insensitive.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::message::{Message, MessagePart};

/// Compiled pattern size cap; anything larger is treated as invalid.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// A run of text that either matched the query or didn't
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span<'a> {
    pub text: &'a str,
    pub is_match: bool,
}

impl<'a> Span<'a> {
    fn plain(text: &'a str) -> Self {
        Self { text, is_match: false }
    }
}

pub fn is_blank(query: &str) -> bool {
    query.trim().is_empty()
}

/// Messages with a text part containing `query`, in conversation order.
/// A blank query returns every message.
///
/// Uses the same case folding as [`highlight`], so every message returned
/// has at least one highlighted span.
pub fn filter<'a>(messages: &'a [Message], query: &str) -> Vec<&'a Message> {
    if is_blank(query) {
        return messages.iter().collect();
    }

    let re = match compile(&regex::escape(query)) {
        Ok(re) => re,
        Err(e) => {
            debug!(query, error = %e, "Search query rejected");
            return Vec::new();
        }
    };
    messages
        .iter()
        .filter(|message| {
            message
                .parts
                .iter()
                .filter_map(MessagePart::as_text)
                .any(|text| re.is_match(text))
        })
        .collect()
}

/// Split `text` around literal occurrences of `query`
pub fn highlight<'a>(text: &'a str, query: &str) -> Vec<Span<'a>> {
    if is_blank(query) {
        return vec![Span::plain(text)];
    }
    highlight_with(text, &regex::escape(query))
}

/// Like [`highlight`], but `pattern` is a regular expression. An invalid
/// pattern leaves the text unhighlighted instead of failing.
pub fn highlight_pattern<'a>(text: &'a str, pattern: &str) -> Vec<Span<'a>> {
    if is_blank(pattern) {
        return vec![Span::plain(text)];
    }
    highlight_with(text, pattern)
}

/// Number of literal, non-overlapping occurrences of `query` in `text`
pub fn match_count(text: &str, query: &str) -> usize {
    if is_blank(query) {
        return 0;
    }
    compile(&regex::escape(query))
        .map(|re| re.find_iter(text).filter(|m| !m.is_empty()).count())
        .unwrap_or(0)
}

fn highlight_with<'a>(text: &'a str, pattern: &str) -> Vec<Span<'a>> {
    match compile(pattern) {
        Ok(re) => split_matches(text, &re),
        Err(e) => {
            debug!(pattern, error = %e, "Search pattern rejected, leaving text unhighlighted");
            vec![Span::plain(text)]
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
}

fn split_matches<'a>(text: &'a str, re: &Regex) -> Vec<Span<'a>> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    for found in re.find_iter(text).filter(|m| !m.is_empty()) {
        if found.start() > cursor {
            spans.push(Span::plain(&text[cursor..found.start()]));
        }
        spans.push(Span {
            text: found.as_str(),
            is_match: true,
        });
        cursor = found.end();
    }

    if cursor < text.len() || spans.is_empty() {
        spans.push(Span::plain(&text[cursor..]));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn conversation() -> Vec<Message> {
        vec![
            Message::model("Hello! How can I help?"),
            Message::user("say hello back"),
            Message::with_parts(
                Role::Model,
                vec![MessagePart::image("image/png", "aGVsbG8="), MessagePart::text("A picture")],
            ),
            Message::model("Goodbye"),
        ]
    }

    fn texts(messages: &[&Message]) -> Vec<String> {
        messages.iter().map(|m| m.text()).collect()
    }

    #[test]
    fn blank_query_returns_everything_in_order() {
        let messages = conversation();
        for query in ["", "   ", "\t\n"] {
            let view = filter(&messages, query);
            assert_eq!(view.len(), messages.len());
            assert!(view.iter().zip(&messages).all(|(a, b)| std::ptr::eq(*a, b)));
        }
    }

    #[test]
    fn filter_is_case_insensitive() {
        let messages = conversation();
        let upper = filter(&messages, "HELLO");
        let lower = filter(&messages, "hello");
        assert_eq!(texts(&upper), texts(&lower));
        assert_eq!(texts(&upper), vec!["Hello! How can I help?", "say hello back"]);
    }

    #[test]
    fn filter_ignores_image_payloads() {
        let messages = conversation();
        // base64 of "hello" must not be searchable
        assert!(filter(&messages, "aGVsbG8").is_empty());
        assert_eq!(texts(&filter(&messages, "picture")), vec!["A picture"]);
    }

    #[test]
    fn filter_matches_within_a_single_part() {
        let messages = vec![Message::with_parts(
            Role::Model,
            vec![MessagePart::text("Hel"), MessagePart::text("lo there")],
        )];
        assert!(filter(&messages, "hello").is_empty());
        assert_eq!(filter(&messages, "LO THE").len(), 1);
    }

    #[test]
    fn filter_and_highlight_fold_case_alike() {
        let messages = vec![Message::model("ΟΔΟΣ")];
        assert_eq!(filter(&messages, "σ").len(), 1);
        assert_eq!(highlight("ΟΔΟΣ", "σ").iter().filter(|s| s.is_match).count(), 1);
    }

    #[test]
    fn filter_does_not_trim_query() {
        let messages = conversation();
        assert_eq!(texts(&filter(&messages, "hello ")), vec!["say hello back"]);
    }

    #[test]
    fn highlight_marks_every_occurrence() {
        let spans = highlight("Hello, hello HELLO", "hello");
        let matched: Vec<&str> = spans.iter().filter(|s| s.is_match).map(|s| s.text).collect();
        assert_eq!(matched, vec!["Hello", "hello", "HELLO"]);
        assert_eq!(spans.iter().map(|s| s.text).collect::<String>(), "Hello, hello HELLO");
    }

    #[test]
    fn highlight_treats_query_literally() {
        let spans = highlight("call f(x) now", "f(x)");
        assert_eq!(
            spans,
            vec![
                Span { text: "call ", is_match: false },
                Span { text: "f(x)", is_match: true },
                Span { text: " now", is_match: false },
            ]
        );
    }

    #[test]
    fn highlight_without_match_or_query_is_one_plain_span() {
        assert_eq!(highlight("abc", "zzz"), vec![Span::plain("abc")]);
        assert_eq!(highlight("abc", "  "), vec![Span::plain("abc")]);
        assert_eq!(highlight("", "a"), vec![Span::plain("")]);
    }

    #[test]
    fn invalid_pattern_degrades_to_plain_text() {
        assert_eq!(highlight_pattern("a (b", "(b"), vec![Span::plain("a (b")]);
        assert_eq!(highlight_pattern("a [x", "[x"), vec![Span::plain("a [x")]);
    }

    #[test]
    fn pattern_highlight_skips_empty_matches() {
        let spans = highlight_pattern("abc", "x*");
        assert_eq!(spans, vec![Span::plain("abc")]);

        let spans = highlight_pattern("cat cot", "c.t");
        assert_eq!(spans.iter().filter(|s| s.is_match).count(), 2);
    }

    #[test]
    fn counts_matches() {
        assert_eq!(match_count("Hello hello", "HELLO"), 2);
        assert_eq!(match_count("Hello", ""), 0);
        assert_eq!(match_count("a.b a.b", "."), 2);
    }
}
