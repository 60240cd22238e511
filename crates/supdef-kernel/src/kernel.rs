//! The Engine — the heart of supdef.
//!
//! Owns and coordinates the core components:
//! - Macro table (one run-global table, or per-file by configuration)
//! - Toolchain registry (built-in flavors plus embedder registrations)
//! - Runner (runnable compilation and execution)
//! - Signal manager (deadline leases and the listener thread)
//! - Diagnostics counters (consulted by the caller for the exit code)
//!
//! # Architecture
//!
//! ```text
//! raw text → lexer (strip comments) → parser (directive tree)
//!          → expander ──┬── cond evaluator ── (runnable calls)
//!                       └── runner ── toolchain ── child process
//!                                        │
//!                               signal manager (deadline → cancel)
//! ```
//!
//! Each file runs its pipeline single-threaded; independent files may be
//! processed as parallel tasks sharing the global table behind its lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::ast::SourceUnit;
use crate::diag::Diagnostics;
use crate::errors::{Pos, PrepError, PrepResult};
use crate::expand::{ErrorPolicy, ExpandOptions, Expander, FileOutput};
use crate::lexer::{self, IncludeRef};
use crate::parser;
use crate::runner::Runner;
use crate::signals::SignalManager;
use crate::table::{MacroTable, Redefinition, SharedTable};
use crate::toolchain::{Toolchain, ToolchainRegistry};

/// How macro definitions are scoped across input files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableScope {
    /// One table for the whole run; files see each other's definitions.
    #[default]
    Global,
    /// Each file starts from an empty table.
    PerFile,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Re-scan depth bound for macro expansion.
    pub recursion_limit: usize,
    /// Policy when a macro name is defined twice.
    pub redefinition: Redefinition,
    /// Policy when a runnable call fails during expansion.
    pub error_policy: ErrorPolicy,
    /// Deadline applied to runnable executions unless overridden.
    pub default_deadline: Duration,
    /// Macro visibility across files.
    pub table_scope: TableScope,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 64,
            redefinition: Redefinition::default(),
            error_policy: ErrorPolicy::default(),
            default_deadline: Duration::from_secs(5),
            table_scope: TableScope::default(),
        }
    }
}

/// The preprocessing engine.
pub struct Engine {
    config: EngineConfig,
    include_paths: Vec<PathBuf>,
    table: SharedTable,
    toolchains: Arc<ToolchainRegistry>,
    signals: Arc<SignalManager>,
    diag: Arc<Diagnostics>,
    runner: Arc<Runner>,
}

impl Engine {
    /// Build an engine with a fresh context: its own table, diagnostics,
    /// signal manager, and scratch directory.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let toolchains = Arc::new(ToolchainRegistry::new());
        let signals = Arc::new(SignalManager::new());
        let diag = Arc::new(Diagnostics::new());
        let runner = Arc::new(
            Runner::new(Arc::clone(&toolchains), Arc::clone(&signals))
                .context("creating runnable scratch directory")?,
        );
        let table = MacroTable::shared(config.redefinition);
        Ok(Self {
            config,
            include_paths: Vec::new(),
            table,
            toolchains,
            signals,
            diag,
            runner,
        })
    }

    pub fn diag(&self) -> &Arc<Diagnostics> {
        &self.diag
    }

    pub fn signals(&self) -> &Arc<SignalManager> {
        &self.signals
    }

    /// Register an execution flavor beyond the built-ins.
    pub fn register_toolchain(&self, toolchain: Arc<dyn Toolchain>) {
        self.toolchains.register(toolchain);
    }

    /// Append a directory to the include search list.
    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    pub fn clear_include_paths(&mut self) {
        self.include_paths.clear();
    }

    fn options(&self) -> ExpandOptions {
        ExpandOptions {
            recursion_limit: self.config.recursion_limit,
            error_policy: self.config.error_policy,
            default_deadline: self.config.default_deadline,
            include_paths: self.include_paths.clone(),
        }
    }

    fn table_for_file(&self) -> SharedTable {
        match self.config.table_scope {
            TableScope::Global => Arc::clone(&self.table),
            TableScope::PerFile => MacroTable::shared(self.config.redefinition),
        }
    }

    /// Process in-memory source under a display name.
    ///
    /// Any error aborts this input only and increments the error counter.
    pub async fn process_str(
        &self,
        name: impl Into<PathBuf>,
        source: &str,
    ) -> PrepResult<FileOutput> {
        let file = name.into();
        debug!(file = %file.display(), "processing");
        let result = self.process_inner(&file, source).await;
        if let Err(e) = &result {
            self.diag.reg_error();
            error!(%e, "processing aborted");
        }
        result
    }

    async fn process_inner(&self, file: &Path, source: &str) -> PrepResult<FileOutput> {
        let stripped = lexer::strip_comments(file, source)?;
        let tree = parser::parse(file, &stripped)?;
        let unit = SourceUnit::new(file.to_path_buf(), stripped);
        let expander = Expander::new(
            self.table_for_file(),
            Arc::clone(&self.runner),
            Arc::clone(&self.diag),
            self.options(),
            unit,
        );
        expander.run(&tree).await
    }

    /// Process one input file.
    pub async fn process_file(&self, path: impl AsRef<Path>) -> PrepResult<FileOutput> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(source) => self.process_str(path.to_path_buf(), &source).await,
            Err(e) => {
                let err = PrepError::Include {
                    pos: Pos::new(path, 0),
                    msg: format!("reading input: {e}"),
                };
                self.diag.reg_error();
                error!(%err, "processing aborted");
                Err(err)
            }
        }
    }

    /// List a file's include references (host and directive forms, first
    /// seen order) without expanding anything.
    pub async fn scan_includes(&self, path: impl AsRef<Path>) -> PrepResult<Vec<IncludeRef>> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PrepError::Include {
                pos: Pos::new(path, 0),
                msg: format!("reading input: {e}"),
            })?;
        Ok(lexer::include_refs(&source).collect())
    }

    /// Process independent files as parallel tasks.
    ///
    /// With the default global scope every task shares the one locked
    /// table; results come back in completion-independent input order.
    pub async fn process_files(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
    ) -> Vec<(PathBuf, PrepResult<FileOutput>)> {
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let result = engine.process_file(&path).await;
                (path, result)
            }));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(pair) => results.push(pair),
                Err(e) => error!(%e, "file task panicked"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_process_str_comments_and_expansion() {
        let eng = engine();
        let src = "\
#pragma supdef begin m
[$1]
#pragma supdef end
m(a) // trailing comment
";
        let out = eng.process_str("in.c", src).await.unwrap();
        assert_eq!(out.text, "[a] \n");
        assert_eq!(eng.diag().get_errcount(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_counts_and_aborts_file() {
        let eng = engine();
        let err = eng
            .process_str("in.c", "#pragma supdef begin lost\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::UnterminatedDirective { .. }));
        assert_eq!(eng.diag().get_errcount(), 1);
    }

    #[tokio::test]
    async fn test_include_defines_and_splices() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "defs.sd",
            "#pragma supdef begin greet\nhello $1\n#pragma supdef end\nfrom-include\n",
        );
        let mut eng = engine();
        eng.add_include_path(dir.path());
        let src = "#pragma supdef include \"defs.sd\"\ngreet(world)\n";
        let out = eng.process_str("main.c", src).await.unwrap();
        assert_eq!(out.text, "from-include\nhello world\n");
    }

    #[tokio::test]
    async fn test_missing_include_is_error() {
        let eng = engine();
        let err = eng
            .process_str("main.c", "#pragma supdef include \"nope.sd\"\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::Include { .. }));
        assert_eq!(eng.diag().get_errcount(), 1);
    }

    #[tokio::test]
    async fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.sd", "#pragma supdef include \"b.sd\"\nA\n");
        write_file(dir.path(), "b.sd", "#pragma supdef include \"a.sd\"\nB\n");
        let main = write_file(dir.path(), "main.c", "#pragma supdef include \"a.sd\"\n");
        let eng = engine();
        let err = eng.process_file(&main).await.unwrap_err();
        match err {
            PrepError::Include { msg, .. } => assert!(msg.contains("cycle")),
            other => panic!("expected Include, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clear_include_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "defs.sd", "ok\n");
        let mut eng = engine();
        eng.add_include_path(dir.path());
        eng.clear_include_paths();
        let err = eng
            .process_str("main.c", "#pragma supdef include \"defs.sd\"\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::Include { .. }));
    }

    #[tokio::test]
    async fn test_scan_includes() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_file(
            dir.path(),
            "main.c",
            "#include <stdio.h>\n#pragma supdef include \"defs.sd\"\n",
        );
        let eng = engine();
        let refs = eng.scan_includes(&main).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].path, "stdio.h");
        assert_eq!(refs[1].path, "defs.sd");
    }

    #[tokio::test]
    async fn test_parallel_files_share_global_table() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = (0..4)
            .map(|i| {
                write_file(
                    dir.path(),
                    &format!("f{i}.c"),
                    &format!(
                        "#pragma supdef begin m{i}\nout{i}-$1\n#pragma supdef end\nm{i}(x)\n"
                    ),
                )
            })
            .collect();
        let eng = Arc::new(engine());
        let results = eng.process_files(files).await;
        assert_eq!(results.len(), 4);
        for (path, result) in results {
            let out = result.unwrap();
            let stem = path.file_stem().unwrap().to_string_lossy();
            let idx = stem.trim_start_matches('f');
            assert_eq!(out.text, format!("out{idx}-x\n"));
        }
    }

    #[tokio::test]
    async fn test_per_file_scope_isolates_tables() {
        let mut config = EngineConfig::default();
        config.table_scope = TableScope::PerFile;
        let eng = Engine::new(config).unwrap();
        eng.process_str("a.c", "#pragma supdef begin m\nx\n#pragma supdef end\n")
            .await
            .unwrap();
        // The second file does not see the first file's macro.
        let out = eng.process_str("b.c", "m()\n").await.unwrap();
        assert_eq!(out.text, "m()\n");
    }
}
