//! Runnable execution subsystem.
//!
//! Each runnable call walks one state machine:
//!
//! ```text
//! Pending → Compiling → {CompileFailed | Compiled}
//!                              │
//!                              ▼
//!                           Running → {Completed(value) | TimedOut | RuntimeFailed}
//! ```
//!
//! The snippet is materialized with the call arguments bound, compiled by
//! the flavor's toolchain, and executed as a child process. A deadline
//! lease is taken from the signal manager before the child starts; the
//! lease's cancellation event forces termination and yields `TimedOut` —
//! no partial value is ever salvaged. Every failure is terminal for the
//! call; nothing is retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::ast::{parse_fragments, substitute, Arity, MacroBody, MacroDefinition, RunnableBody};
use crate::errors::{Pos, PrepError, PrepResult};
use crate::signals::SignalManager;
use crate::toolchain::{SnippetUnit, ToolchainRegistry};

/// Where a call is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Compiling,
    CompileFailed,
    Compiled,
    Running,
    Completed(String),
    TimedOut,
    RuntimeFailed,
}

/// One runnable-macro call instance.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub name: String,
    pub args: Vec<String>,
    pub pos: Pos,
    pub deadline: Duration,
    /// Signal number leased for the deadline, once assigned.
    pub signo: Option<i32>,
    pub outcome: Outcome,
}

impl ExecutionRequest {
    pub fn new(name: String, args: Vec<String>, pos: Pos, deadline: Duration) -> Self {
        Self {
            name,
            args,
            pos,
            deadline,
            signo: None,
            outcome: Outcome::Pending,
        }
    }
}

/// Compiles and executes runnable snippets.
pub struct Runner {
    toolchains: Arc<ToolchainRegistry>,
    signals: Arc<SignalManager>,
    workdir: TempDir,
    seq: AtomicU64,
}

impl Runner {
    pub fn new(
        toolchains: Arc<ToolchainRegistry>,
        signals: Arc<SignalManager>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            toolchains,
            signals,
            workdir: TempDir::with_prefix("supdef-run")?,
            seq: AtomicU64::new(0),
        })
    }

    /// Execute one call of `def` (which must be runnable) and return its
    /// output value.
    pub async fn execute(
        &self,
        def: &MacroDefinition,
        args: &[String],
        pos: &Pos,
        deadline: Duration,
    ) -> PrepResult<String> {
        let MacroBody::Runnable(runnable) = &def.body else {
            return Err(PrepError::Compile {
                pos: pos.clone(),
                name: def.name.clone(),
                diagnostics: "macro has no runnable body".to_string(),
            });
        };
        let fixed = match def.arity {
            Arity::Fixed(n) | Arity::Variadic(n) => n,
        };
        let mut request =
            ExecutionRequest::new(def.name.clone(), args.to_vec(), pos.clone(), deadline);
        let result = self.run(&mut request, runnable, fixed).await;
        debug!(name = %request.name, outcome = ?request.outcome, "runnable finished");
        result
    }

    async fn run(
        &self,
        req: &mut ExecutionRequest,
        runnable: &RunnableBody,
        fixed: usize,
    ) -> PrepResult<String> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        req.outcome = Outcome::Compiling;
        let Some(toolchain) = self.toolchains.get(&runnable.flavor) else {
            req.outcome = Outcome::CompileFailed;
            return Err(PrepError::Compile {
                pos: req.pos.clone(),
                name: req.name.clone(),
                diagnostics: format!("no toolchain for flavor '{}'", runnable.flavor),
            });
        };

        // Bind call arguments over the snippet's parameter slots, then
        // materialize the full unit.
        let fragments = parse_fragments(&runnable.snippet);
        let body = substitute(&fragments, &req.args, fixed);
        let unit = SnippetUnit {
            name: req.name.clone(),
            includes: runnable.includes.clone(),
            body,
        };
        let source = self.workdir.path().join(format!(
            "{}_{}.{}",
            req.name,
            seq,
            toolchain.source_extension()
        ));
        let artifact = self.workdir.path().join(format!("{}_{}.bin", req.name, seq));

        let text = toolchain.materialize(&unit);
        if let Err(e) = tokio::fs::write(&source, &text).await {
            req.outcome = Outcome::CompileFailed;
            return Err(PrepError::Compile {
                pos: req.pos.clone(),
                name: req.name.clone(),
                diagnostics: format!("writing compilation unit: {e}"),
            });
        }

        let compiled = match toolchain.compile(&source, &artifact).await {
            Ok(out) => out,
            Err(e) => {
                req.outcome = Outcome::CompileFailed;
                return Err(PrepError::Compile {
                    pos: req.pos.clone(),
                    name: req.name.clone(),
                    diagnostics: format!("invoking toolchain: {e}"),
                });
            }
        };
        if compiled.status != 0 {
            req.outcome = Outcome::CompileFailed;
            return Err(PrepError::Compile {
                pos: req.pos.clone(),
                name: req.name.clone(),
                diagnostics: compiled.diagnostics,
            });
        }
        req.outcome = Outcome::Compiled;

        // Deadline lease comes before the child exists, so a child can
        // never outlive its cancellation path.
        let lease_id = format!("runnable:{}:{}", req.name, seq);
        let Some(signo) = self.signals.register_use(&lease_id) else {
            return Err(PrepError::SignalLeaseConflict {
                pos: req.pos.clone(),
                id: lease_id,
                msg: "every managed signal number is leased".to_string(),
            });
        };
        req.signo = Some(signo);
        let Some(token) = self.signals.token_for(signo) else {
            self.signals.unregister_one(&lease_id, signo);
            return Err(PrepError::SignalLeaseConflict {
                pos: req.pos.clone(),
                id: lease_id,
                msg: "lease lost before execution".to_string(),
            });
        };

        let deadline = req.deadline;
        let deadline_signals = Arc::clone(&self.signals);
        let guard = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            deadline_signals.deadline_expired(signo);
        });

        let mut cmd = Command::new(&artifact);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                guard.abort();
                self.signals.unregister_one(&lease_id, signo);
                req.outcome = Outcome::RuntimeFailed;
                return Err(PrepError::RuntimeFailed {
                    pos: req.pos.clone(),
                    name: req.name.clone(),
                    code: -1,
                    output: format!("spawning artifact: {e}"),
                });
            }
        };
        req.outcome = Outcome::Running;
        debug!(name = %req.name, signo, "runnable child started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let waited = {
            let wait = async {
                // Drain the pipes while waiting so a chatty child cannot
                // fill them and stall.
                tokio::join!(
                    child.wait(),
                    drain(stdout.as_mut()),
                    drain(stderr.as_mut()),
                )
            };
            tokio::pin!(wait);
            tokio::select! {
                res = &mut wait => Some(res),
                _ = token.cancelled() => None,
            }
        };
        guard.abort();

        let result = match waited {
            None => {
                // Deadline fired: forceful, irreversible termination.
                let _ = child.start_kill();
                let _ = child.wait().await;
                req.outcome = Outcome::TimedOut;
                Err(PrepError::TimedOut {
                    pos: req.pos.clone(),
                    name: req.name.clone(),
                    deadline: req.deadline,
                })
            }
            Some((Ok(status), out, _)) if status.success() => {
                let value = out.trim_end_matches('\n').to_string();
                req.outcome = Outcome::Completed(value.clone());
                Ok(value)
            }
            Some((Ok(status), out, err)) => {
                req.outcome = Outcome::RuntimeFailed;
                Err(PrepError::RuntimeFailed {
                    pos: req.pos.clone(),
                    name: req.name.clone(),
                    code: status.code().unwrap_or(-1),
                    output: if err.is_empty() { out } else { err },
                })
            }
            Some((Err(e), _, _)) => {
                req.outcome = Outcome::RuntimeFailed;
                Err(PrepError::RuntimeFailed {
                    pos: req.pos.clone(),
                    name: req.name.clone(),
                    code: -1,
                    output: format!("waiting for child: {e}"),
                })
            }
        };
        self.signals.unregister_one(&lease_id, signo);
        result
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<&mut R>) -> String {
    let mut buf = String::new();
    if let Some(r) = reader {
        let _ = r.read_to_string(&mut buf).await;
    }
    buf
}
