//! Macro expansion engine.
//!
//! Walks a file's directive tree in order: definitions land in the table,
//! `if` conditions are evaluated once at encounter time, includes splice in
//! other files, and passthrough text is scanned for call sites.
//!
//! Call-site rules: an identifier immediately followed by `(` is matched
//! against the table; unmatched identifiers are left untouched, and string
//! or character literals are never scanned. Arguments are split balancing
//! nested parentheses and respecting quotes, and are substituted verbatim —
//! never pre-expanded. The substituted result is re-scanned, left to right,
//! outside-in, with the active macro chain bounding recursion depth.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::ast::{substitute, Arity, DirectiveTree, MacroBody, MacroDefinition, Node, SourceUnit};
use crate::cond::{self, CallRunner};
use crate::diag::Diagnostics;
use crate::errors::{Pos, PrepError, PrepResult};
use crate::lexer::strip_comments;
use crate::parser;
use crate::runner::Runner;
use crate::table::SharedTable;

/// What to do when a runnable call fails during expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// The failure aborts expansion of the enclosing file.
    #[default]
    Abort,
    /// Splice an inline error marker, count an error, and continue.
    Marker,
}

/// Expansion knobs, copied out of the engine configuration.
#[derive(Debug, Clone)]
pub struct ExpandOptions {
    pub recursion_limit: usize,
    pub error_policy: ErrorPolicy,
    pub default_deadline: Duration,
    pub include_paths: Vec<PathBuf>,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            recursion_limit: 64,
            error_policy: ErrorPolicy::Abort,
            default_deadline: Duration::from_secs(5),
            include_paths: Vec::new(),
        }
    }
}

/// The result of processing one file.
#[derive(Debug, Clone, Default)]
pub struct FileOutput {
    /// Expanded text, ready for the caller's writer.
    pub text: String,
    /// Call sites echoed while the dump flag was on.
    pub dump_trace: Vec<String>,
}

/// Per-file expansion state.
pub struct Expander {
    table: SharedTable,
    runner: Arc<Runner>,
    diag: Arc<Diagnostics>,
    opts: ExpandOptions,
    /// The file being expanded; swapped while inside an include.
    unit: SourceUnit,
    dump: bool,
    trace: Vec<String>,
    out: String,
}

impl Expander {
    pub fn new(
        table: SharedTable,
        runner: Arc<Runner>,
        diag: Arc<Diagnostics>,
        opts: ExpandOptions,
        unit: SourceUnit,
    ) -> Self {
        Self {
            table,
            runner,
            diag,
            opts,
            unit,
            dump: false,
            trace: Vec::new(),
            out: String::new(),
        }
    }

    /// Expand a parsed tree to its final output.
    pub async fn run(mut self, tree: &DirectiveTree) -> PrepResult<FileOutput> {
        self.walk(&tree.nodes).await?;
        Ok(FileOutput {
            text: self.out,
            dump_trace: self.trace,
        })
    }

    fn lookup(&self, name: &str) -> Option<Arc<MacroDefinition>> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.lookup(name)
    }

    fn walk<'a>(
        &'a mut self,
        nodes: &'a [Node],
    ) -> Pin<Box<dyn Future<Output = PrepResult<()>> + Send + 'a>> {
        Box::pin(async move {
            for node in nodes {
                match node {
                    Node::Passthrough { text, line } => {
                        let mut chain = Vec::new();
                        let expanded = self.expand_text(text, *line, &mut chain).await?;
                        self.out.push_str(&expanded);
                    }
                    Node::Define(def) => {
                        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
                        table.define(def.clone(), &self.diag)?;
                    }
                    Node::Include { path, line } => {
                        self.include(path, *line).await?;
                    }
                    Node::Dump { on, line } => {
                        debug!(on = *on, line = *line, "dump flag toggled");
                        self.dump = *on;
                    }
                    Node::If(block) => {
                        let pos = Pos::new(self.unit.path.clone(), block.line);
                        let taken = cond::eval(&block.cond, &mut *self, &pos).await?;
                        debug!(cond = %block.raw, taken, "if evaluated");
                        if taken {
                            self.walk(&block.then_branch).await?;
                        } else {
                            self.walk(&block.else_branch).await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Resolve an include against the current file's directory, then the
    /// configured include paths, in order.
    fn resolve_include(&self, path: &str) -> Option<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        if let Some(parent) = self.unit.path.parent() {
            dirs.push(parent.to_path_buf());
        }
        dirs.extend(self.opts.include_paths.iter().cloned());
        for dir in dirs {
            let candidate = dir.join(path);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        // A bare absolute (or cwd-relative) path still works.
        let direct = PathBuf::from(path);
        direct.is_file().then_some(direct)
    }

    async fn include(&mut self, path: &str, line: usize) -> PrepResult<()> {
        let pos = Pos::new(self.unit.path.clone(), line);
        let Some(resolved) = self.resolve_include(path) else {
            return Err(PrepError::Include {
                pos,
                msg: format!("'{path}' not found on the include path"),
            });
        };
        let canon = resolved.canonicalize().map_err(|e| PrepError::Include {
            pos: pos.clone(),
            msg: format!("resolving '{path}': {e}"),
        })?;
        if self.unit.include_stack.contains(&canon) {
            return Err(PrepError::Include {
                pos,
                msg: format!("include cycle through '{path}'"),
            });
        }
        let source = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| PrepError::Include {
                pos: pos.clone(),
                msg: format!("reading '{path}': {e}"),
            })?;
        let stripped = strip_comments(&resolved, &source)?;
        let tree = parser::parse(&resolved, &stripped)?;

        debug!(file = %resolved.display(), "entering include");
        let mut stack = self.unit.include_stack.clone();
        stack.push(canon);
        let child = SourceUnit {
            path: resolved,
            content: stripped,
            include_stack: stack,
        };
        let saved_unit = std::mem::replace(&mut self.unit, child);
        let saved_dump = self.dump;
        self.dump = false;
        let result = self.walk(&tree.nodes).await;
        self.dump = saved_dump;
        self.unit = saved_unit;
        result
    }

    /// Scan `text` for call sites and expand them.
    async fn expand_text(
        &mut self,
        text: &str,
        first_line: usize,
        chain: &mut Vec<String>,
    ) -> PrepResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut line = first_line;
        let mut i = 0usize;

        while i < text.len() {
            let rest = &text[i..];
            let Some(c) = rest.chars().next() else { break };

            if c == '\n' {
                line += 1;
                out.push(c);
                i += 1;
                continue;
            }
            if c == '"' || c == '\'' {
                let end = skip_literal(text, i);
                out.push_str(&text[i..end]);
                line += text[i..end].matches('\n').count();
                i = end;
                continue;
            }
            if c.is_ascii_alphabetic() || c == '_' {
                let end = ident_end(text, i);
                let name = &text[i..end];
                if text[end..].starts_with('(') {
                    if let Some(def) = self.lookup(name) {
                        let pos = Pos::new(self.unit.path.clone(), line);
                        let Some((args, consumed)) = split_args(&text[end + 1..]) else {
                            return Err(PrepError::DirectiveSyntax {
                                pos,
                                msg: format!("unterminated argument list for macro '{name}'"),
                            });
                        };
                        let call_end = end + 1 + consumed;
                        if !def.arity.accepts(args.len()) {
                            return Err(PrepError::Arity {
                                pos,
                                name: name.to_string(),
                                expected: def.arity.expected(),
                                got: args.len(),
                            });
                        }
                        let call_text = &text[i..call_end];
                        if self.dump {
                            debug!(target: "supdef::dump", call = %call_text, "macro call");
                            self.trace.push(call_text.to_string());
                        }
                        if chain.len() >= self.opts.recursion_limit {
                            let mut named = chain.clone();
                            named.push(name.to_string());
                            return Err(PrepError::RecursionLimit {
                                pos,
                                limit: self.opts.recursion_limit,
                                chain: named.join(" -> "),
                            });
                        }
                        chain.push(name.to_string());
                        let invoked = self.invoke(def, args, pos, chain).await;
                        chain.pop();
                        let expanded = match invoked {
                            Ok(v) => v,
                            Err(e)
                                if e.is_execution_failure()
                                    && self.opts.error_policy == ErrorPolicy::Marker =>
                            {
                                self.diag.reg_error();
                                error!(%e, "runnable failed; continuing with marker");
                                format!("[supdef:error {}: {}]", name, e.kind())
                            }
                            Err(e) => return Err(e),
                        };
                        out.push_str(&expanded);
                        line += text[i..call_end].matches('\n').count();
                        i = call_end;
                        continue;
                    }
                }
                out.push_str(name);
                i = end;
                continue;
            }
            out.push(c);
            i += c.len_utf8();
        }
        Ok(out)
    }

    /// Expand one matched call: substitute or execute, then re-scan the
    /// splice under the same chain guard.
    fn invoke<'a>(
        &'a mut self,
        def: Arc<MacroDefinition>,
        args: Vec<String>,
        pos: Pos,
        chain: &'a mut Vec<String>,
    ) -> Pin<Box<dyn Future<Output = PrepResult<String>> + Send + 'a>> {
        Box::pin(async move {
            match &def.body {
                MacroBody::Substitution(fragments) => {
                    let fixed = match def.arity {
                        Arity::Fixed(n) | Arity::Variadic(n) => n,
                    };
                    let substituted = substitute(fragments, &args, fixed);
                    self.expand_text(&substituted, pos.line, chain).await
                }
                MacroBody::Runnable(_) => {
                    let value = self
                        .runner
                        .execute(&def, &args, &pos, self.opts.default_deadline)
                        .await?;
                    self.expand_text(&value, pos.line, chain).await
                }
            }
        })
    }
}

#[async_trait]
impl CallRunner for Expander {
    async fn call(&mut self, name: &str, args: &[String], pos: &Pos) -> PrepResult<String> {
        let Some(def) = self.lookup(name) else {
            return Err(PrepError::ConditionType {
                pos: pos.clone(),
                msg: format!("unknown macro '{name}' in condition"),
            });
        };
        if !def.arity.accepts(args.len()) {
            return Err(PrepError::Arity {
                pos: pos.clone(),
                name: name.to_string(),
                expected: def.arity.expected(),
                got: args.len(),
            });
        }
        let mut chain = vec![name.to_string()];
        self.invoke(def, args.to_vec(), pos.clone(), &mut chain).await
    }
}

/// Byte offset just past an identifier starting at `start`.
fn ident_end(text: &str, start: usize) -> usize {
    let mut end = start;
    for (off, c) in text[start..].char_indices() {
        if c.is_ascii_alphanumeric() || c == '_' {
            end = start + off + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Byte offset just past a string/char literal starting at `start`.
fn skip_literal(text: &str, start: usize) -> usize {
    let mut chars = text[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return text.len();
    };
    let mut escaped = false;
    for (off, c) in chars {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return start + off + c.len_utf8();
        }
    }
    text.len()
}

/// Split a call's arguments, starting just after the opening parenthesis.
///
/// Balances nested parentheses and respects quoted strings. Returns the
/// trimmed argument texts and the byte count consumed including the
/// closing parenthesis, or `None` if the list never closes.
pub(crate) fn split_args(text: &str) -> Option<(Vec<String>, usize)> {
    let mut args = Vec::new();
    let mut depth = 1usize;
    let mut arg_start = 0usize;
    let mut i = 0usize;

    while i < text.len() {
        let Some(c) = text[i..].chars().next() else { break };
        match c {
            '"' | '\'' => {
                i = skip_literal(text, i);
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let last = text[arg_start..i].trim();
                    if !last.is_empty() || !args.is_empty() {
                        args.push(last.to_string());
                    }
                    return Some((args, i + 1));
                }
            }
            ',' if depth == 1 => {
                args.push(text[arg_start..i].trim().to_string());
                arg_start = i + 1;
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::table::{MacroTable, Redefinition};
    use crate::signals::SignalManager;
    use crate::toolchain::ToolchainRegistry;
    use std::path::PathBuf;

    fn expander(table: SharedTable) -> Expander {
        let runner = Runner::new(
            Arc::new(ToolchainRegistry::new()),
            Arc::new(SignalManager::new()),
        )
        .unwrap();
        Expander::new(
            table,
            Arc::new(runner),
            Arc::new(Diagnostics::new()),
            ExpandOptions::default(),
            SourceUnit::new(PathBuf::from("test.c"), String::new()),
        )
    }

    async fn expand_all(src: &str) -> PrepResult<FileOutput> {
        let table = MacroTable::shared(Redefinition::Warn);
        let tree = parser::parse(&PathBuf::from("test.c"), src)?;
        expander(table).run(&tree).await
    }

    async fn expand_ok(src: &str) -> String {
        expand_all(src).await.unwrap().text
    }

    #[tokio::test]
    async fn test_verbatim_substitution() {
        let src = "\
#pragma supdef begin test
#if !defined($1)
#define $1 $2
#endif
#pragma supdef end
test(FOO, 1)
";
        assert_eq!(
            expand_ok(src).await,
            "#if !defined(FOO)\n#define FOO 1\n#endif\n"
        );
    }

    #[tokio::test]
    async fn test_no_call_sites_is_identity() {
        let src = "plain text with idents and (parens), no macros\n";
        assert_eq!(expand_ok(src).await, src);
    }

    #[tokio::test]
    async fn test_unmatched_identifier_untouched() {
        let src = "\
#pragma supdef begin m
[$1]
#pragma supdef end
other(1) m(2)x
";
        assert_eq!(expand_ok(src).await, "other(1) [2]x\n");
    }

    #[tokio::test]
    async fn test_string_literals_not_scanned() {
        let src = "\
#pragma supdef begin m
[$1]
#pragma supdef end
\"m(1)\" 'm' m(2)
";
        assert_eq!(expand_ok(src).await, "\"m(1)\" 'm' [2]\n");
    }

    #[tokio::test]
    async fn test_nested_args_balance() {
        let src = "\
#pragma supdef begin m
<$1|$2>
#pragma supdef end
m(f(a, b), \"x,y\")
";
        assert_eq!(expand_ok(src).await, "<f(a, b)|\"x,y\">\n");
    }

    #[tokio::test]
    async fn test_arguments_not_pre_expanded() {
        let src = "\
#pragma supdef begin wrap
[$1]
#pragma supdef end
wrap(wrap(x))
";
        // The inner call survives substitution verbatim, then expands on
        // the re-scan of the spliced body.
        assert_eq!(expand_ok(src).await, "[[x]]\n");
    }

    #[tokio::test]
    async fn test_rescan_expands_generated_calls() {
        let src = "\
#pragma supdef begin inner
42
#pragma supdef end
#pragma supdef begin outer
inner()
#pragma supdef end
outer()
";
        assert_eq!(expand_ok(src).await, "42\n");
    }

    #[tokio::test]
    async fn test_arity_mismatch() {
        let src = "\
#pragma supdef begin two
$1 $2
#pragma supdef end
two(a)
";
        let err = expand_all(src).await.unwrap_err();
        match err {
            PrepError::Arity { name, got, .. } => {
                assert_eq!(name, "two");
                assert_eq!(got, 1);
            }
            other => panic!("expected Arity, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_variadic_tail() {
        let src = "\
#pragma supdef begin call
$1($*)
#pragma supdef end
call(f, 1, 2, 3)
";
        assert_eq!(expand_ok(src).await, "f(1, 2, 3)\n");
    }

    #[tokio::test]
    async fn test_self_recursion_hits_limit() {
        let src = "\
#pragma supdef begin spin
spin($1)
#pragma supdef end
spin(x)
";
        let err = expand_all(src).await.unwrap_err();
        match err {
            PrepError::RecursionLimit { chain, limit, .. } => {
                assert_eq!(limit, 64);
                assert!(chain.starts_with("spin -> spin"));
            }
            other => panic!("expected RecursionLimit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_if_else_selects_branch() {
        let src = "\
#pragma supdef if 1 == 1
yes
#pragma supdef else
no
#pragma supdef end
";
        assert_eq!(expand_ok(src).await, "yes\n");

        let src = "\
#pragma supdef if 1 == 2
yes
#pragma supdef else
no
#pragma supdef end
";
        assert_eq!(expand_ok(src).await, "no\n");
    }

    #[tokio::test]
    async fn test_define_inside_taken_branch_only() {
        let src = "\
#pragma supdef if 0
#pragma supdef begin m
dead
#pragma supdef end
#pragma supdef else
#pragma supdef begin m
live
#pragma supdef end
#pragma supdef end
m()
";
        assert_eq!(expand_ok(src).await, "live\n");
    }

    #[tokio::test]
    async fn test_dump_traces_calls_without_changing_output() {
        let src = "\
#pragma supdef begin m
[$1]
#pragma supdef end
#pragma supdef dump 1
m(a)
#pragma supdef dump 0
m(b)
";
        let out = expand_all(src).await.unwrap();
        assert_eq!(out.text, "[a]\n[b]\n");
        assert_eq!(out.dump_trace, vec!["m(a)"]);
    }

    #[tokio::test]
    async fn test_unterminated_argument_list() {
        let src = "\
#pragma supdef begin m
[$1]
#pragma supdef end
m(never closed
";
        assert!(matches!(
            expand_all(src).await.unwrap_err(),
            PrepError::DirectiveSyntax { .. }
        ));
    }

    #[test]
    fn test_split_args_cases() {
        assert_eq!(split_args(")").unwrap(), (vec![], 1));
        assert_eq!(split_args("a, b)").unwrap(), (
            vec!["a".to_string(), "b".to_string()],
            5
        ));
        assert_eq!(
            split_args("f(x, y), z)").unwrap().0,
            vec!["f(x, y)".to_string(), "z".to_string()]
        );
        assert_eq!(
            split_args("\"a,b\", c)").unwrap().0,
            vec!["\"a,b\"".to_string(), "c".to_string()]
        );
        assert!(split_args("a, (b").is_none());
    }
}
