//! Directive parser.
//!
//! A single linear pass over comment-stripped text, line-oriented, with an
//! explicit stack of open block frames — nesting depth is bounded only by
//! memory, and a partial parse can always report the opening line of the
//! block it is stuck in.
//!
//! Directive lines have the shape `#pragma supdef <verb> …` with verb one
//! of `begin`, `end`, `include`, `dump`, `if`, `else`, `runnable … begin`.
//! Every other line is passthrough text. Inside a `begin`/`end` body, lines
//! are captured verbatim (nested openers are tracked only so the matching
//! `end` is found); inside an `if`, directives form real nested nodes.

use std::path::Path;

use crate::ast::{
    arity_of, parse_fragments, DirectiveTree, IfBlock, MacroBody, MacroDefinition, Node,
    RunnableBody,
};
use crate::cond;
use crate::errors::{Pos, PrepError, PrepResult};

/// An open block on the parse stack.
enum Frame {
    Define {
        name: String,
        line: usize,
        body: Vec<String>,
        /// Nested opener count; the matching `end` arrives at depth zero.
        depth: usize,
    },
    Runnable {
        name: String,
        flavor: String,
        line: usize,
        body: Vec<String>,
        depth: usize,
    },
    If {
        block: IfBlock,
        in_else: bool,
    },
}

impl Frame {
    fn describe(&self) -> (&str, usize) {
        match self {
            Frame::Define { name, line, .. } => (name, *line),
            Frame::Runnable { name, line, .. } => (name, *line),
            Frame::If { block, .. } => ("if", block.line),
        }
    }
}

/// A recognized directive line, split into verb and remainder.
#[derive(Debug, PartialEq, Eq)]
enum Directive<'a> {
    Begin { name: &'a str },
    RunnableBegin { flavor: &'a str, name: &'a str },
    End,
    Include { path: &'a str },
    Dump { on: bool },
    If { cond: &'a str },
    Else,
}

/// Body-mode classification: only block openers and a bare `end` matter
/// inside a begin/end body; everything else is literal text.
enum BodyVerb {
    Opener,
    End,
    Other,
}

fn body_verb(rest: &str) -> BodyVerb {
    let verb = rest.split_whitespace().next().unwrap_or("");
    match verb {
        "end" if rest.trim() == "end" => BodyVerb::End,
        "begin" | "if" => BodyVerb::Opener,
        "runnable" if matches!(parse_directive(rest), Ok(Directive::RunnableBegin { .. })) => {
            BodyVerb::Opener
        }
        _ => BodyVerb::Other,
    }
}

/// Parse one file's comment-stripped source into a directive tree.
pub fn parse(file: &Path, source: &str) -> PrepResult<DirectiveTree> {
    let mut parser = FileParser {
        file,
        stack: Vec::new(),
        nodes: Vec::new(),
        pending: String::new(),
        pending_line: 0,
    };

    for (idx, segment) in source.split_inclusive('\n').enumerate() {
        parser.feed(idx + 1, segment)?;
    }
    parser.finish()
}

struct FileParser<'a> {
    file: &'a Path,
    stack: Vec<Frame>,
    nodes: Vec<Node>,
    pending: String,
    pending_line: usize,
}

impl<'a> FileParser<'a> {
    fn pos(&self, line: usize) -> Pos {
        Pos::new(self.file, line)
    }

    fn syntax(&self, line: usize, msg: impl Into<String>) -> PrepError {
        PrepError::DirectiveSyntax {
            pos: self.pos(line),
            msg: msg.into(),
        }
    }

    fn feed(&mut self, line: usize, segment: &str) -> PrepResult<()> {
        let content = segment
            .strip_suffix('\n')
            .map(|s| s.strip_suffix('\r').unwrap_or(s))
            .unwrap_or(segment);

        // Bodies of begin/end blocks swallow every line, directives
        // included, until their matching end. Nested openers only bump a
        // counter so the right end closes the block; nothing in a body is
        // parsed as a real directive.
        if self.in_body() {
            match directive_of(content).map(body_verb) {
                Some(BodyVerb::End) => {
                    if self.body_depth() == 0 {
                        let frame = self.stack.pop().expect("in_body checked above");
                        let node = self.close_body_frame(frame)?;
                        self.push_node(node);
                    } else {
                        self.body_adjust(-1);
                        self.body_push(content);
                    }
                }
                Some(BodyVerb::Opener) => {
                    self.body_adjust(1);
                    self.body_push(content);
                }
                _ => self.body_push(content),
            }
            return Ok(());
        }

        let Some(rest) = directive_of(content) else {
            if self.pending.is_empty() {
                self.pending_line = line;
            }
            self.pending.push_str(segment);
            return Ok(());
        };

        self.flush_pending();
        let d = parse_directive(rest).map_err(|msg| self.syntax_for_line(line, msg))?;
        match d {
            Directive::Begin { name } => {
                self.stack.push(Frame::Define {
                    name: name.to_string(),
                    line,
                    body: Vec::new(),
                    depth: 0,
                });
            }
            Directive::RunnableBegin { flavor, name } => {
                self.stack.push(Frame::Runnable {
                    name: name.to_string(),
                    flavor: flavor.to_string(),
                    line,
                    body: Vec::new(),
                    depth: 0,
                });
            }
            Directive::If { cond } => {
                let parsed = cond::parse(cond, &self.pos(line))?;
                self.stack.push(Frame::If {
                    block: IfBlock {
                        cond: parsed,
                        raw: cond.to_string(),
                        line,
                        then_branch: Vec::new(),
                        else_branch: Vec::new(),
                    },
                    in_else: false,
                });
            }
            Directive::Else => match self.stack.last_mut() {
                Some(Frame::If { in_else, .. }) if !*in_else => *in_else = true,
                Some(Frame::If { .. }) => {
                    return Err(self.syntax(line, "duplicate 'else' in if block"))
                }
                _ => return Err(self.syntax(line, "'else' outside an if block")),
            },
            Directive::End => match self.stack.pop() {
                Some(Frame::If { block, .. }) => self.push_node(Node::If(block)),
                Some(_) => unreachable!("body frames are handled above"),
                None => return Err(self.syntax(line, "'end' with no open directive block")),
            },
            Directive::Include { path } => {
                self.push_node(Node::Include {
                    path: path.to_string(),
                    line,
                });
            }
            Directive::Dump { on } => {
                self.push_node(Node::Dump { on, line });
            }
        }
        Ok(())
    }

    fn syntax_for_line(&self, line: usize, msg: String) -> PrepError {
        PrepError::DirectiveSyntax {
            pos: self.pos(line),
            msg,
        }
    }

    fn in_body(&self) -> bool {
        matches!(
            self.stack.last(),
            Some(Frame::Define { .. } | Frame::Runnable { .. })
        )
    }

    fn body_depth(&self) -> usize {
        match self.stack.last() {
            Some(Frame::Define { depth, .. } | Frame::Runnable { depth, .. }) => *depth,
            _ => 0,
        }
    }

    fn body_adjust(&mut self, delta: isize) {
        if let Some(Frame::Define { depth, .. } | Frame::Runnable { depth, .. }) =
            self.stack.last_mut()
        {
            *depth = depth.saturating_add_signed(delta);
        }
    }

    fn body_push(&mut self, content: &str) {
        if let Some(Frame::Define { body, .. } | Frame::Runnable { body, .. }) =
            self.stack.last_mut()
        {
            body.push(content.to_string());
        }
    }

    fn finish(mut self) -> PrepResult<DirectiveTree> {
        if let Some(frame) = self.stack.last() {
            let (name, line) = frame.describe();
            return Err(PrepError::UnterminatedDirective {
                pos: self.pos(line),
                name: name.to_string(),
            });
        }
        self.flush_pending();
        Ok(DirectiveTree { nodes: self.nodes })
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            let text = std::mem::take(&mut self.pending);
            let line = self.pending_line;
            self.push_node(Node::Passthrough { text, line });
        }
    }

    /// Append a node to the innermost open container: the active branch of
    /// the nearest `if` frame, or the file's top level.
    fn push_node(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(Frame::If { block, in_else }) => {
                if *in_else {
                    block.else_branch.push(node);
                } else {
                    block.then_branch.push(node);
                }
            }
            Some(_) => unreachable!("body frames never receive nodes"),
            None => self.nodes.push(node),
        }
    }

    fn close_body_frame(&self, frame: Frame) -> PrepResult<Node> {
        match frame {
            Frame::Define { name, line, body, .. } => {
                let raw = body.join("\n");
                let fragments = parse_fragments(&raw);
                Ok(Node::Define(MacroDefinition {
                    arity: arity_of(&fragments),
                    name,
                    body: MacroBody::Substitution(fragments),
                    defined_at: self.pos(line),
                }))
            }
            Frame::Runnable {
                name,
                flavor,
                line,
                body,
                ..
            } => {
                let mut includes = Vec::new();
                let mut snippet_lines = Vec::new();
                for l in body {
                    if let Some(header) = parse_include_decl(&l) {
                        includes.push(header);
                    } else {
                        snippet_lines.push(l);
                    }
                }
                let snippet = snippet_lines.join("\n");
                let returns = snippet.matches("RETURN(").count();
                if returns != 1 {
                    return Err(self.syntax(
                        line,
                        format!(
                            "runnable '{name}' must contain exactly one RETURN(...), found {returns}"
                        ),
                    ));
                }
                let fragments = parse_fragments(&snippet);
                Ok(Node::Define(MacroDefinition {
                    arity: arity_of(&fragments),
                    name,
                    body: MacroBody::Runnable(RunnableBody {
                        flavor,
                        includes,
                        snippet,
                    }),
                    defined_at: self.pos(line),
                }))
            }
            Frame::If { .. } => unreachable!("if frames close in feed"),
        }
    }
}

/// If `line` is a directive line, return the text after `#pragma supdef`.
fn directive_of(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('#')?;
    let rest = rest.trim_start().strip_prefix("pragma")?;
    let rest = rest.strip_prefix(char::is_whitespace)?.trim_start();
    let rest = rest.strip_prefix("supdef")?;
    match rest.chars().next() {
        None => Some(""),
        Some(c) if c.is_whitespace() => Some(rest.trim_start()),
        _ => None,
    }
}

/// Split a directive remainder into its verb form.
fn parse_directive(rest: &str) -> Result<Directive<'_>, String> {
    let rest = rest.trim();
    let (verb, tail) = match rest.split_once(char::is_whitespace) {
        Some((v, t)) => (v, t.trim()),
        None => (rest, ""),
    };
    match verb {
        "begin" => {
            let name = expect_macro_name(tail)?;
            Ok(Directive::Begin { name })
        }
        "runnable" => {
            let (flavor, tail) = tail
                .split_once(char::is_whitespace)
                .ok_or_else(|| "expected: runnable <flavor> begin <name>".to_string())?;
            let tail = tail.trim();
            let name = tail
                .strip_prefix("begin")
                .filter(|r| r.is_empty() || r.starts_with(char::is_whitespace))
                .map(str::trim)
                .ok_or_else(|| "expected 'begin' after runnable flavor".to_string())?;
            let name = expect_macro_name(name)?;
            Ok(Directive::RunnableBegin { flavor, name })
        }
        "end" => {
            if tail.is_empty() {
                Ok(Directive::End)
            } else {
                Err(format!("unexpected text after 'end': '{tail}'"))
            }
        }
        "else" => {
            if tail.is_empty() {
                Ok(Directive::Else)
            } else {
                Err(format!("unexpected text after 'else': '{tail}'"))
            }
        }
        "include" => {
            let path = tail
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .ok_or_else(|| "include path must be quoted".to_string())?;
            if path.is_empty() {
                return Err("include path is empty".to_string());
            }
            Ok(Directive::Include { path })
        }
        "dump" => match tail {
            "0" => Ok(Directive::Dump { on: false }),
            "1" => Ok(Directive::Dump { on: true }),
            other => Err(format!("dump takes 0 or 1, got '{other}'")),
        },
        "if" => {
            if tail.is_empty() {
                Err("if requires a condition".to_string())
            } else {
                Ok(Directive::If { cond: tail })
            }
        }
        "" => Err("missing directive verb".to_string()),
        other => Err(format!("unknown directive verb '{other}'")),
    }
}

fn expect_macro_name(s: &str) -> Result<&str, String> {
    let mut chars = s.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(s)
    } else {
        Err(format!("invalid macro name '{s}'"))
    }
}

/// Parse an `INCLUDE(header)` declaration line inside a runnable body.
fn parse_include_decl(line: &str) -> Option<String> {
    let t = line.trim();
    let inner = t.strip_prefix("INCLUDE(")?.strip_suffix(')')?;
    Some(inner.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Arity;
    use std::path::PathBuf;

    fn parse_src(src: &str) -> PrepResult<DirectiveTree> {
        parse(&PathBuf::from("test.c"), src)
    }

    fn def_of(node: &Node) -> &MacroDefinition {
        match node {
            Node::Define(d) => d,
            other => panic!("expected define, got {other:?}"),
        }
    }

    #[test]
    fn test_passthrough_only() {
        let tree = parse_src("int main() {}\nreturn 0;\n").unwrap();
        assert_eq!(tree.nodes.len(), 1);
        match &tree.nodes[0] {
            Node::Passthrough { text, line } => {
                assert_eq!(text, "int main() {}\nreturn 0;\n");
                assert_eq!(*line, 1);
            }
            other => panic!("expected passthrough, got {other:?}"),
        }
    }

    #[test]
    fn test_define_block() {
        let src = "#pragma supdef begin pair\n($1, $2)\n#pragma supdef end\n";
        let tree = parse_src(src).unwrap();
        let def = def_of(&tree.nodes[0]);
        assert_eq!(def.name, "pair");
        assert_eq!(def.arity, Arity::Fixed(2));
        assert!(!def.is_runnable());
    }

    #[test]
    fn test_runnable_block() {
        let src = "#pragma supdef runnable c begin answer\nINCLUDE(stdint.h)\nRETURN($1 * 2)\n#pragma supdef end\n";
        let tree = parse_src(src).unwrap();
        let def = def_of(&tree.nodes[0]);
        assert_eq!(def.name, "answer");
        assert_eq!(def.arity, Arity::Fixed(1));
        match &def.body {
            MacroBody::Runnable(r) => {
                assert_eq!(r.flavor, "c");
                assert_eq!(r.includes, vec!["stdint.h"]);
                assert_eq!(r.snippet, "RETURN($1 * 2)");
            }
            other => panic!("expected runnable body, got {other:?}"),
        }
    }

    #[test]
    fn test_runnable_requires_one_return() {
        let none = "#pragma supdef runnable c begin r\nint x;\n#pragma supdef end\n";
        assert!(matches!(
            parse_src(none).unwrap_err(),
            PrepError::DirectiveSyntax { .. }
        ));
        let two = "#pragma supdef runnable c begin r\nRETURN(1)\nRETURN(2)\n#pragma supdef end\n";
        assert!(parse_src(two).is_err());
    }

    #[test]
    fn test_if_else_nesting() {
        let src = "\
#pragma supdef if 1
then-text
#pragma supdef if 0
inner
#pragma supdef end
#pragma supdef else
else-text
#pragma supdef end
";
        let tree = parse_src(src).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        match &tree.nodes[0] {
            Node::If(block) => {
                assert_eq!(block.raw, "1");
                assert_eq!(block.then_branch.len(), 2);
                assert!(matches!(block.then_branch[1], Node::If(_)));
                assert_eq!(block.else_branch.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn test_define_body_keeps_nested_blocks_literal() {
        let src = "\
#pragma supdef begin outer
#pragma supdef if 1
$1
#pragma supdef end
#pragma supdef end
";
        let tree = parse_src(src).unwrap();
        let def = def_of(&tree.nodes[0]);
        match &def.body {
            MacroBody::Substitution(_) => {}
            other => panic!("expected substitution, got {other:?}"),
        }
        // The nested if/end stays inside the body as literal text.
        assert_eq!(tree.nodes.len(), 1);
    }

    #[test]
    fn test_unterminated_block_reports_opening_line() {
        let src = "text\n#pragma supdef begin lost\nbody\n";
        match parse_src(src).unwrap_err() {
            PrepError::UnterminatedDirective { pos, name } => {
                assert_eq!(pos.line, 2);
                assert_eq!(name, "lost");
            }
            other => panic!("expected UnterminatedDirective, got {other:?}"),
        }
    }

    #[test]
    fn test_dangling_end_is_syntax_error() {
        assert!(matches!(
            parse_src("#pragma supdef end\n").unwrap_err(),
            PrepError::DirectiveSyntax { .. }
        ));
    }

    #[test]
    fn test_else_outside_if_is_syntax_error() {
        assert!(parse_src("#pragma supdef else\n").is_err());
    }

    #[test]
    fn test_include_and_dump() {
        let src = "#pragma supdef include \"defs.sd\"\n#pragma supdef dump 1\n";
        let tree = parse_src(src).unwrap();
        assert_eq!(
            tree.nodes[0],
            Node::Include {
                path: "defs.sd".into(),
                line: 1
            }
        );
        assert_eq!(tree.nodes[1], Node::Dump { on: true, line: 2 });
    }

    #[test]
    fn test_bad_verbs() {
        assert!(parse_src("#pragma supdef frobnicate\n").is_err());
        assert!(parse_src("#pragma supdef begin 9bad\n").is_err());
        assert!(parse_src("#pragma supdef dump 2\n").is_err());
        assert!(parse_src("#pragma supdef include nope\n").is_err());
        assert!(parse_src("#pragma supdef runnable c start x\n").is_err());
    }

    #[test]
    fn test_host_pragmas_are_passthrough() {
        let src = "#pragma once\n#pragma pack(1)\n";
        let tree = parse_src(src).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert!(matches!(tree.nodes[0], Node::Passthrough { .. }));
    }
}
