//! Command-line entry point: compiles a serialized AST and executes it as
//! `__main__`, or prints its disassembly.
//!
//! The parser is an external collaborator; any front end that emits the
//! crate's JSON AST shape can feed this binary (see `tools/frontend.py` in
//! the repository for one built on the host language's own parser).

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use adder::ast::Module;
use adder::bytecode::code::CodeObject;
use adder::{code_for_module, module_from_ast, Const, VirtualMachine};

#[derive(Parser)]
#[command(name = "adder", version, about = "Compile and run a serialized module AST")]
struct Cli {
    /// Path to a JSON-serialized module AST.
    input: PathBuf,

    /// Name the module executes under.
    #[arg(long, default_value = "__main__")]
    module_name: String,

    /// Source filename to embed in code objects; defaults to the input path.
    #[arg(long)]
    filename: Option<String>,

    /// Print a disassembly instead of executing.
    #[arg(long)]
    dis: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(&Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("reading {}", cli.input.display()))?;
    let module: Module = serde_json::from_str(&text)
        .with_context(|| format!("parsing AST from {}", cli.input.display()))?;
    let filename = cli
        .filename
        .clone()
        .unwrap_or_else(|| cli.input.display().to_string());

    if cli.dis {
        let code = code_for_module(module, &filename, &cli.module_name)?;
        disassemble(&code, 0);
        return Ok(());
    }

    let mut vm = VirtualMachine::new();
    module_from_ast(module, &filename, &cli.module_name, &mut vm)
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    Ok(())
}

/// Prints one code object and, recursively, every code object in its
/// constants pool.
fn disassemble(code: &CodeObject, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{indent}{} <{}:{}> stacksize={} nlocals={} flags={:#04x}",
        code.name,
        code.filename,
        code.firstlineno,
        code.stacksize,
        code.nlocals,
        code.flags.bits()
    );
    for instr in code.instructions() {
        match instr {
            Ok(instr) => {
                let detail = instr.arg.map_or(String::new(), |arg| {
                    let arg = usize::from(arg);
                    let note = if instr.op.has_const() {
                        code.consts.get(arg).map(const_note)
                    } else if instr.op.has_name() {
                        code.names.get(arg).cloned()
                    } else if instr.op.has_local() {
                        code.varnames.get(arg).cloned()
                    } else if instr.op.has_free() {
                        code.deref_name(arg).map(str::to_owned)
                    } else if instr.op.has_jrel() {
                        Some(format!("to {}", instr.offset + 3 + arg))
                    } else {
                        None
                    };
                    match note {
                        Some(note) => format!(" {arg} ({note})"),
                        None => format!(" {arg}"),
                    }
                });
                println!(
                    "{indent}  {:>4}  line {:<4} {}{detail}",
                    instr.offset,
                    code.line_for_offset(instr.offset),
                    instr.op
                );
            }
            Err(err) => {
                println!("{indent}  !! {err}");
                break;
            }
        }
    }
    for constant in &code.consts {
        if let Const::Code(inner) = constant {
            disassemble(inner, depth + 1);
        }
    }
}

fn const_note(constant: &Const) -> String {
    match constant {
        Const::None => "None".to_owned(),
        Const::Bool(true) => "True".to_owned(),
        Const::Bool(false) => "False".to_owned(),
        Const::Int(number) => number.to_string(),
        Const::Float(number) => number.to_string(),
        Const::Str(text) => format!("{text:?}"),
        Const::Bytes(bytes) => format!("{} byte(s)", bytes.len()),
        Const::Tuple(items) => format!("tuple of {}", items.len()),
        Const::Code(code) => format!("code {}", code.name),
    }
}
