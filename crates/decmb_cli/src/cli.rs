use std::path::PathBuf;

use clap::{Parser, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Pseudo,
    Disasm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectCli {
    D9,
    D10,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Path to the compiled script container
    pub path: Option<PathBuf>,

    /// Output mode
    #[arg(long, value_enum, default_value_t = DecompileModeCli::Pseudo)]
    pub mode: DecompileModeCli,

    /// Bytecode dialect of the container
    #[arg(long, value_enum, default_value_t = DialectCli::D10)]
    pub dialect: DialectCli,

    /// Generate shell completion and exit
    #[arg(long, value_enum)]
    pub completion: Option<Shell>,
}
