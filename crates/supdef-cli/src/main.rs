//! supdef CLI entry point.
//!
//! Usage:
//!   supdef [options] <file>...     # Preprocess files to stdout
//!   supdef -o out.c file.c         # Preprocess to a file
//!   supdef --list-includes file.c  # List include references, no expansion
//!
//! Options:
//!   -I <dir>          Append a directory to the include search path
//!   -o <file>         Write combined output to <file> instead of stdout
//!   --keep-going      Replace failed runnable calls with an inline error
//!                     marker instead of aborting the file
//!   --list-includes   Print include references and exit

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use tokio::runtime::Runtime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use supdef_kernel::{Engine, EngineConfig, ErrorPolicy, SignalManager};

fn main() -> ExitCode {
    // Block the managed signal set while this is still the only thread;
    // the runtime's workers inherit the mask, so deliveries reach only
    // the dedicated listener.
    SignalManager::init();

    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Default)]
struct Options {
    files: Vec<PathBuf>,
    include_paths: Vec<PathBuf>,
    output: Option<PathBuf>,
    keep_going: bool,
    list_includes: bool,
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(opts) = parse_args(&args)? else {
        return Ok(ExitCode::SUCCESS);
    };
    if opts.files.is_empty() {
        print_help();
        bail!("no input files");
    }

    let mut config = EngineConfig::default();
    if opts.keep_going {
        config.error_policy = ErrorPolicy::Marker;
    }
    let mut engine = Engine::new(config)?;
    for path in &opts.include_paths {
        engine.add_include_path(path);
    }

    let runtime = Runtime::new().context("Failed to create tokio runtime")?;
    engine
        .signals()
        .start()
        .context("starting signal listener")?;
    let code = runtime.block_on(drive(&engine, &opts));
    engine.signals().stop();
    code
}

fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut opts = Options::default();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("supdef {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--keep-going" => opts.keep_going = true,
            "--list-includes" => opts.list_includes = true,
            "-I" => {
                let dir = it.next().context("-I requires a directory argument")?;
                opts.include_paths.push(PathBuf::from(dir));
            }
            "-o" => {
                let path = it.next().context("-o requires a file argument")?;
                opts.output = Some(PathBuf::from(path));
            }
            other if other.starts_with("-I") => {
                opts.include_paths.push(PathBuf::from(&other[2..]));
            }
            other if other.starts_with('-') => {
                bail!("unknown option: {other}");
            }
            file => opts.files.push(PathBuf::from(file)),
        }
    }
    Ok(Some(opts))
}

async fn drive(engine: &Engine, opts: &Options) -> Result<ExitCode> {
    if opts.list_includes {
        for file in &opts.files {
            match engine.scan_includes(file).await {
                Ok(refs) => {
                    for r in refs {
                        println!("{}:{}: {}", file.display(), r.line, r.path);
                    }
                }
                Err(e) => {
                    engine.diag().reg_error();
                    eprintln!("{e}");
                }
            }
        }
    } else {
        let mut combined = String::new();
        for file in &opts.files {
            // Errors abort the offending file only; the counter decides
            // the final exit code.
            match engine.process_file(file).await {
                Ok(out) => combined.push_str(&out.text),
                Err(e) => eprintln!("{e}"),
            }
        }
        match &opts.output {
            Some(path) => std::fs::write(path, combined)
                .with_context(|| format!("writing output to {}", path.display()))?,
            None => print!("{combined}"),
        }
    }

    Ok(if engine.diag().get_errcount() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_help() {
    println!(
        "\
supdef {} — directive-driven preprocessor with runnable macros

Usage:
  supdef [options] <file>...

Options:
  -I <dir>          Append a directory to the include search path
  -o <file>         Write combined output to <file> instead of stdout
  --keep-going      Replace failed runnable calls with an inline error marker
  --list-includes   Print include references and exit
  -h, --help        Show this help
  -V, --version     Show version",
        env!("CARGO_PKG_VERSION")
    );
}
