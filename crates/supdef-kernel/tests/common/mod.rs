//! Shared test helpers: a shell-script execution flavor so runnable tests
//! need no C compiler, plus a counting wrapper for observing executions.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use supdef_kernel::{CompileOutput, SnippetUnit, Toolchain};

/// Rewrite `RETURN(expr)` lines to a printf-and-exit helper call.
fn rewrite_returns(body: &str) -> String {
    let mut out = String::new();
    for line in body.lines() {
        let t = line.trim();
        if let Some(inner) = t.strip_prefix("RETURN(").and_then(|r| r.strip_suffix(')')) {
            out.push_str(&format!("sd_return \"{inner}\"\n"));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// `sh` flavor: "compilation" marks the materialized script executable.
pub struct ShellToolchain {
    compiles: Arc<AtomicUsize>,
}

impl ShellToolchain {
    pub fn new() -> Self {
        Self {
            compiles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of how many snippets were ever compiled.
    pub fn compile_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.compiles)
    }
}

#[async_trait]
impl Toolchain for ShellToolchain {
    fn flavor(&self) -> &str {
        "sh"
    }

    fn source_extension(&self) -> &str {
        "sh"
    }

    fn materialize(&self, unit: &SnippetUnit) -> String {
        let mut out = String::from("#!/bin/sh\nsd_return() { printf '%s' \"$1\"; exit 0; }\n");
        out.push_str(&rewrite_returns(&unit.body));
        out
    }

    async fn compile(&self, source: &Path, artifact: &Path) -> std::io::Result<CompileOutput> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(source, artifact).await?;
        let mut perms = tokio::fs::metadata(artifact).await?.permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        tokio::fs::set_permissions(artifact, perms).await?;
        Ok(CompileOutput {
            status: 0,
            diagnostics: String::new(),
        })
    }
}
