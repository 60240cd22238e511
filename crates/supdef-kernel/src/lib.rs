//! supdef-kernel: the core of the supdef preprocessor.
//!
//! This crate provides:
//!
//! - **Lexer**: comment stripping and include-reference scanning
//! - **Parser**: line-oriented directive parsing with an explicit block stack
//! - **AST**: directive tree and macro definition types
//! - **Expansion**: call-site matching, verbatim substitution, and re-scan
//! - **Conditions**: the `if` expression grammar and short-circuit evaluator
//! - **Runner**: compile-and-execute runnable macros under a deadline
//! - **Signals**: leasing of signal numbers and the deadline listener thread
//! - **Diagnostics**: process-wide error/warning counters
//!
//! The [`Engine`] ties the pieces together; the CLI crate drives it.

pub mod ast;
pub mod cond;
pub mod diag;
pub mod errors;
pub mod expand;
pub mod kernel;
pub mod lexer;
pub mod parser;
pub mod runner;
pub mod signals;
pub mod table;
pub mod toolchain;

pub use diag::Diagnostics;
pub use errors::{Pos, PrepError, PrepResult};
pub use expand::{ErrorPolicy, FileOutput};
pub use kernel::{Engine, EngineConfig, TableScope};
pub use lexer::{IncludeKind, IncludeRef};
pub use runner::{ExecutionRequest, Outcome};
pub use signals::SignalManager;
pub use table::Redefinition;
pub use toolchain::{CompileOutput, SnippetUnit, Toolchain, ToolchainRegistry};
