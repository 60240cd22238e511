//! Lexer/scanner: comment stripping and include-reference scanning.
//!
//! The scanner runs before directive parsing. It strips `//` and `/* */`
//! comments while preserving every newline, so line numbers in later
//! diagnostics still match the original file. Comment-like sequences inside
//! string and character literals are left alone.
//!
//! It also produces the file's include references — both the host-language
//! `#include` forms and the directive `#pragma supdef include` form — as a
//! lazy iterator in first-seen order.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{Pos, PrepError, PrepResult};

/// Where an include reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeKind {
    /// `#include "path"`
    HostQuote,
    /// `#include <path>`
    HostAngle,
    /// `#pragma supdef include "path"`
    Directive,
}

/// One include reference located in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeRef {
    pub path: String,
    pub kind: IncludeKind,
    /// 1-based line the reference appears on.
    pub line: usize,
}

fn host_include_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*#\s*include\s*(?:"([^"]+)"|<([^>]+)>)"#).expect("static regex")
    })
}

fn directive_include_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*#\s*pragma\s+supdef\s+include\s+"([^"]+)""#).expect("static regex")
    })
}

/// Scan `source` for include references.
///
/// The returned iterator is lazy and finite; calling `include_refs` again
/// restarts the scan from the top. Each distinct path is yielded once, at
/// its first occurrence.
pub fn include_refs(source: &str) -> impl Iterator<Item = IncludeRef> + '_ {
    let mut seen: Vec<String> = Vec::new();
    source
        .lines()
        .enumerate()
        .filter_map(move |(idx, raw)| {
            let line = idx + 1;
            let found = if let Some(caps) = directive_include_re().captures(raw) {
                Some(IncludeRef {
                    path: caps[1].to_string(),
                    kind: IncludeKind::Directive,
                    line,
                })
            } else if let Some(caps) = host_include_re().captures(raw) {
                if let Some(quoted) = caps.get(1) {
                    Some(IncludeRef {
                        path: quoted.as_str().to_string(),
                        kind: IncludeKind::HostQuote,
                        line,
                    })
                } else {
                    caps.get(2).map(|angled| IncludeRef {
                        path: angled.as_str().to_string(),
                        kind: IncludeKind::HostAngle,
                        line,
                    })
                }
            } else {
                None
            };

            match found {
                Some(r) if !seen.contains(&r.path) => {
                    seen.push(r.path.clone());
                    Some(r)
                }
                _ => None,
            }
        })
}

/// Scanner state while stripping comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Str,
    Chr,
}

/// Strip `//` and `/* */` comments from `source`.
///
/// Newlines inside comments are preserved so the output has exactly the same
/// line count as the input; a block comment additionally collapses to a
/// single space so adjacent tokens stay separated. String and character
/// literals are passed through untouched, including any comment-like
/// sequences they contain.
///
/// An unterminated block comment is an error for this file, reported at the
/// line the comment opened on.
pub fn strip_comments(file: &Path, source: &str) -> PrepResult<String> {
    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut line = 1usize;
    let mut comment_open_line = 0usize;
    let mut escaped = false;

    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
        }
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    comment_open_line = line;
                    out.push(' ');
                    state = State::BlockComment;
                }
                '"' => {
                    escaped = false;
                    out.push(c);
                    state = State::Str;
                }
                '\'' => {
                    escaped = false;
                    out.push(c);
                    state = State::Chr;
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    out.push(c);
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if c == '\n' {
                    out.push(c);
                } else if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
            State::Str => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    state = State::Code;
                }
            }
            State::Chr => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '\'' {
                    state = State::Code;
                }
            }
        }
    }

    if state == State::BlockComment {
        return Err(PrepError::Lex {
            pos: Pos::new(file, comment_open_line),
        });
    }
    Ok(out)
}
