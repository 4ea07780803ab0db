//! Tokenizer adapter: string-literal and comment spans via syntect.
//!
//! The backing library parses line by line; byte offsets of whole-file
//! spans are accumulated here. Parsing is re-entrant, so one immutable
//! [`Highlighter`] is shared across all workers without locking. Any
//! failure — an unknown language, a broken syntax definition — yields an
//! error the caller degrades on (shebang-only rewriting), never an
//! abort.

use std::path::Path;

use syntect::parsing::{ParseState, ScopeStack, SyntaxReference, SyntaxSet};
use thiserror::Error;
use tracing::trace;

use crate::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    StringLiteral,
    Comment,
}

/// A half-open byte range classified by the tokenizer. Spans are
/// ascending and non-overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub kind: SpanKind,
}

#[derive(Error, Debug)]
pub enum TokenizeError {
    #[error("no syntax definition for `{0}`")]
    MissingSyntax(Language),

    #[error("syntax parsing failed: {0}")]
    Parse(String),

    #[error("cannot load syntax definitions from {dir}: {message}")]
    BadSyntaxDir { dir: String, message: String },
}

pub struct Highlighter {
    syntaxes: SyntaxSet,
}

impl Highlighter {
    /// Bundled syntax definitions only.
    pub fn new() -> Self {
        Self {
            syntaxes: SyntaxSet::load_defaults_newlines(),
        }
    }

    /// Bundled definitions plus a folder of extra `.sublime-syntax`
    /// files layered on top.
    pub fn with_extra_syntaxes(dir: &Path) -> Result<Self, TokenizeError> {
        let mut builder = SyntaxSet::load_defaults_newlines().into_builder();
        builder
            .add_from_folder(dir, true)
            .map_err(|err| TokenizeError::BadSyntaxDir {
                dir: dir.display().to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            syntaxes: builder.build(),
        })
    }

    fn syntax_for(&self, lang: Language) -> Option<&SyntaxReference> {
        let candidates: &[&str] = match lang {
            Language::Sh => &["sh", "bash"],
            Language::Zsh => &["zsh", "sh"],
            Language::Python => &["py"],
            Language::Perl => &["pl"],
            Language::Ruby => &["rb"],
            Language::Lua => &["lua"],
            Language::Tcl => &["tcl"],
            Language::Javascript => &["js"],
            Language::Json => &["json"],
            Language::Conf => &["conf"],
            Language::Desktop => &["desktop"],
            Language::Properties => &["properties"],
            Language::Ini => &["ini"],
            Language::Makefile => &["mk", "makefile"],
            Language::M4 => &["m4"],
            Language::Xml => &["xml"],
            Language::Awk => &["awk"],
        };
        candidates
            .iter()
            .find_map(|token| self.syntaxes.find_syntax_by_token(token))
    }

    /// String-literal and comment spans of the whole content, in
    /// ascending byte order.
    pub fn spans(&self, content: &str, lang: Language) -> Result<Vec<Span>, TokenizeError> {
        let syntax = self
            .syntax_for(lang)
            .ok_or(TokenizeError::MissingSyntax(lang))?;

        let mut parse_state = ParseState::new(syntax);
        let mut stack = ScopeStack::new();
        let mut spans: Vec<Span> = Vec::new();
        let mut line_offset = 0;

        for line in content.split_inclusive('\n') {
            let ops = parse_state
                .parse_line(line, &self.syntaxes)
                .map_err(|err| TokenizeError::Parse(err.to_string()))?;

            let mut cursor = 0;
            for (pos, op) in ops {
                push_region(
                    &mut spans,
                    classify_stack(&stack),
                    line_offset + cursor,
                    line_offset + pos,
                );
                cursor = pos;
                stack
                    .apply(&op)
                    .map_err(|err| TokenizeError::Parse(err.to_string()))?;
            }
            push_region(
                &mut spans,
                classify_stack(&stack),
                line_offset + cursor,
                line_offset + line.len(),
            );
            line_offset += line.len();
        }

        trace!(lang = %lang, spans = spans.len(), "tokenized");
        Ok(spans)
    }
}

impl Default for Highlighter {
    fn default() -> Self {
        Self::new()
    }
}

/// A comment scope anywhere on the stack wins; otherwise any string
/// scope (escapes and interpolation nest inside string scopes, so the
/// whole literal still counts).
fn classify_stack(stack: &ScopeStack) -> Option<SpanKind> {
    let mut kind = None;
    for scope in stack.as_slice() {
        let name = scope.build_string();
        if name.starts_with("comment") {
            return Some(SpanKind::Comment);
        }
        if name.starts_with("string") {
            kind = Some(SpanKind::StringLiteral);
        }
    }
    kind
}

/// Append a classified region, coalescing with an adjacent region of
/// the same kind.
fn push_region(spans: &mut Vec<Span>, kind: Option<SpanKind>, start: usize, end: usize) {
    let Some(kind) = kind else { return };
    if start >= end {
        return;
    }
    if let Some(last) = spans.last_mut() {
        if last.kind == kind && last.end == start {
            last.end = end;
            return;
        }
    }
    spans.push(Span { start, end, kind });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_text<'a>(content: &'a str, span: &Span) -> &'a str {
        &content[span.start..span.end]
    }

    #[test]
    fn shell_strings_and_comments() {
        let highlighter = Highlighter::new();
        let content = "#!/bin/sh\n# a comment\nX=\"/nix/var/log\"\necho $X\n";
        let spans = highlighter.spans(content, Language::Sh).unwrap();

        assert!(spans
            .iter()
            .any(|s| s.kind == SpanKind::Comment && span_text(content, s).contains("a comment")));
        assert!(spans.iter().any(|s| s.kind == SpanKind::StringLiteral
            && span_text(content, s).contains("/nix/var/log")));

        // Ascending and non-overlapping.
        for pair in spans.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn json_strings() {
        let highlighter = Highlighter::new();
        let content = "{\"path\": \"/nix/store/abc-foo/bin\"}\n";
        let spans = highlighter.spans(content, Language::Json).unwrap();
        assert!(spans.iter().any(|s| s.kind == SpanKind::StringLiteral
            && span_text(content, s).contains("/nix/store/abc-foo/bin")));
    }

    #[test]
    fn code_outside_literals_is_unspanned() {
        let highlighter = Highlighter::new();
        let content = "FOO=5\n";
        let spans = highlighter.spans(content, Language::Sh).unwrap();
        assert!(!spans.iter().any(|s| span_text(content, s).contains("FOO")));
    }

    #[test]
    fn missing_syntax_is_an_error() {
        let highlighter = Highlighter::new();
        // No bundled grammar covers .desktop files.
        let result = highlighter.spans("[Desktop Entry]\n", Language::Desktop);
        assert!(matches!(result, Err(TokenizeError::MissingSyntax(_))));
    }
}
