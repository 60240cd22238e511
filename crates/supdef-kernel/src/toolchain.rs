//! Toolchain boundary for runnable macros.
//!
//! A [`Toolchain`] turns a snippet into a compilation unit and invokes an
//! external compiler, treated as a black box that yields an exit code,
//! diagnostics text, and an artifact path. Flavors resolve through a
//! registry; `c` and `cxx` are built in, and embedders (and tests) may
//! register their own.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::process::Command;

/// A materialized-but-uncompiled runnable snippet: declared headers plus
/// the body with call arguments already bound.
#[derive(Debug, Clone)]
pub struct SnippetUnit {
    pub name: String,
    pub includes: Vec<String>,
    pub body: String,
}

/// Result of one compiler invocation.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Compiler exit code; zero means the artifact exists.
    pub status: i32,
    /// Captured compiler stderr.
    pub diagnostics: String,
}

/// One execution flavor: how to materialize a unit and build it.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Flavor name this toolchain serves (e.g. `c`).
    fn flavor(&self) -> &str;

    /// File extension for materialized sources.
    fn source_extension(&self) -> &str;

    /// Render the full compilation-unit text for a snippet.
    fn materialize(&self, unit: &SnippetUnit) -> String;

    /// Build `source` into `artifact`.
    async fn compile(&self, source: &Path, artifact: &Path) -> std::io::Result<CompileOutput>;
}

/// Wrap a declared header for a generated `#include` line: bare names get
/// angle brackets, already-delimited ones pass through.
fn include_line(header: &str) -> String {
    let h = header.trim();
    if h.starts_with('"') || h.starts_with('<') {
        format!("#include {h}")
    } else {
        format!("#include <{h}>")
    }
}

/// Run a compiler command, capturing stderr as diagnostics.
async fn run_compiler(mut cmd: Command) -> std::io::Result<CompileOutput> {
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = cmd.output().await?;
    Ok(CompileOutput {
        status: output.status.code().unwrap_or(-1),
        diagnostics: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// C flavor: builds with `cc -std=c11`.
///
/// The generated prologue defines `RETURN(x)` to write the value to stdout
/// and leave `main` — integers print in decimal, strings verbatim, chosen
/// by C11 `_Generic` dispatch.
pub struct CcToolchain {
    pub compiler: String,
}

impl Default for CcToolchain {
    fn default() -> Self {
        Self {
            compiler: "cc".to_string(),
        }
    }
}

#[async_trait]
impl Toolchain for CcToolchain {
    fn flavor(&self) -> &str {
        "c"
    }

    fn source_extension(&self) -> &str {
        "c"
    }

    fn materialize(&self, unit: &SnippetUnit) -> String {
        let mut out = String::new();
        out.push_str("#include <stdio.h>\n#include <stdlib.h>\n");
        for header in &unit.includes {
            out.push_str(&include_line(header));
            out.push('\n');
        }
        out.push_str(concat!(
            "static int sd_put_long(long v) { printf(\"%ld\", v); return 0; }\n",
            "static int sd_put_str(const char *s) { fputs(s, stdout); return 0; }\n",
            "#define RETURN(x) return _Generic((x), \\\n",
            "    char *: sd_put_str, \\\n",
            "    const char *: sd_put_str, \\\n",
            "    default: sd_put_long)(x)\n",
        ));
        out.push_str("int main(void) {\n");
        out.push_str(&unit.body);
        out.push_str("\n;\nreturn 0;\n}\n");
        out
    }

    async fn compile(&self, source: &Path, artifact: &Path) -> std::io::Result<CompileOutput> {
        let mut cmd = Command::new(&self.compiler);
        cmd.arg("-std=c11")
            .arg("-O0")
            .arg("-o")
            .arg(artifact)
            .arg(source);
        run_compiler(cmd).await
    }
}

/// C++ flavor: builds with `c++ -std=c++17`; `RETURN(x)` resolves through
/// plain overloading, with `std::string` supported alongside C strings.
pub struct CxxToolchain {
    pub compiler: String,
}

impl Default for CxxToolchain {
    fn default() -> Self {
        Self {
            compiler: "c++".to_string(),
        }
    }
}

#[async_trait]
impl Toolchain for CxxToolchain {
    fn flavor(&self) -> &str {
        "cxx"
    }

    fn source_extension(&self) -> &str {
        "cc"
    }

    fn materialize(&self, unit: &SnippetUnit) -> String {
        let mut out = String::new();
        out.push_str("#include <cstdio>\n#include <string>\n");
        for header in &unit.includes {
            out.push_str(&include_line(header));
            out.push('\n');
        }
        out.push_str(concat!(
            "static int sd_put(long v) { std::printf(\"%ld\", v); return 0; }\n",
            "static int sd_put(const char *s) { std::fputs(s, stdout); return 0; }\n",
            "static int sd_put(const std::string &s) { std::fputs(s.c_str(), stdout); return 0; }\n",
            "#define RETURN(x) return sd_put(x)\n",
        ));
        out.push_str("int main() {\n");
        out.push_str(&unit.body);
        out.push_str("\n;\nreturn 0;\n}\n");
        out
    }

    async fn compile(&self, source: &Path, artifact: &Path) -> std::io::Result<CompileOutput> {
        let mut cmd = Command::new(&self.compiler);
        cmd.arg("-std=c++17")
            .arg("-O0")
            .arg("-o")
            .arg(artifact)
            .arg(source);
        run_compiler(cmd).await
    }
}

/// Flavor name → toolchain. Interior-mutable so embedders can register
/// flavors after the engine is built.
pub struct ToolchainRegistry {
    map: RwLock<HashMap<String, Arc<dyn Toolchain>>>,
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolchainRegistry {
    /// A registry with the built-in `c` and `cxx` flavors.
    pub fn new() -> Self {
        let registry = Self {
            map: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(CcToolchain::default()));
        registry.register(Arc::new(CxxToolchain::default()));
        registry
    }

    /// Register (or replace) a toolchain under its flavor name.
    pub fn register(&self, toolchain: Arc<dyn Toolchain>) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(toolchain.flavor().to_string(), toolchain);
    }

    pub fn get(&self, flavor: &str) -> Option<Arc<dyn Toolchain>> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.get(flavor).cloned()
    }

    pub fn flavors(&self) -> Vec<String> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}
