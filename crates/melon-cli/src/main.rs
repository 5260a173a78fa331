//! Melon command-line driver
//!
//! `melon run` compiles and executes a script; `melon disasm` prints the
//! compiled bytecode; `melon tokens` dumps the token stream.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use melon_runtime::{disassemble_function, Diagnostic, Lexer, Melon, MelonError, TokenKind};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "melon", version, about = "The Melon scripting language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a script
    Run {
        /// Path to the script file
        file: PathBuf,
    },
    /// Print the disassembly of a compiled script
    Disasm {
        /// Path to the script file
        file: PathBuf,
    },
    /// Dump the token stream of a script
    Tokens {
        /// Path to the script file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { file } => run(&file),
        Command::Disasm { file } => disasm(&file),
        Command::Tokens { file } => tokens(&file),
    }
}

fn read_source(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))
}

fn run(file: &Path) -> Result<()> {
    let source = read_source(file)?;
    let melon = Melon::new();
    match melon.eval(&source) {
        Ok(_) => Ok(()),
        Err(MelonError::Compile(diagnostics)) => {
            report(&diagnostics);
            bail!("could not compile {}", file.display());
        }
        Err(MelonError::Runtime(error)) => {
            bail!("runtime error: {}", error);
        }
    }
}

fn disasm(file: &Path) -> Result<()> {
    let source = read_source(file)?;
    let melon = Melon::new();
    match melon.compile(&source) {
        Ok(script) => {
            print!("{}", disassemble_function(&script.main));
            Ok(())
        }
        Err(diagnostics) => {
            report(&diagnostics);
            bail!("could not compile {}", file.display());
        }
    }
}

fn tokens(file: &Path) -> Result<()> {
    let source = read_source(file)?;
    let (tokens, diagnostics) = Lexer::new(source.as_str()).tokenize();
    for token in &tokens {
        if token.kind == TokenKind::Eof {
            break;
        }
        println!("{:?} {:?}", token.kind, token.lexeme);
    }
    if !diagnostics.is_empty() {
        report(&diagnostics);
        bail!("could not tokenize {}", file.display());
    }
    Ok(())
}

fn report(diagnostics: &[Diagnostic]) {
    let mut sorted = diagnostics.to_vec();
    melon_runtime::sort_diagnostics(&mut sorted);
    for diagnostic in &sorted {
        eprint!("{}", diagnostic.to_human_string());
    }
}
