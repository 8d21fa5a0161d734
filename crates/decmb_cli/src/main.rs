use clap::{CommandFactory, Parser};

use crate::cli::{Cli, DecompileModeCli, DialectCli};

mod cli;

fn main() {
    let cli = Cli::parse();

    if let Some(shell) = cli.completion {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return;
    }

    let Some(path) = cli.path else {
        Cli::command().print_help().unwrap();
        std::process::exit(1);
    };

    let options = decmb_lib::DecompileOptions {
        mode: match cli.mode {
            DecompileModeCli::Pseudo => decmb_lib::DecompileMode::Pseudo,
            DecompileModeCli::Disasm => decmb_lib::DecompileMode::Disasm,
        },
        dialect: match cli.dialect {
            DialectCli::D9 => decmb_lib::Dialect::D9,
            DialectCli::D10 => decmb_lib::Dialect::D10,
        },
    };

    match std::fs::read(&path) {
        Ok(bytes) => match decmb_lib::decompile_with_options(&bytes, options) {
            Ok(out) => {
                print!("{out}");
            }
            Err(e) => {
                eprintln!("decompile error: {e}");
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("failed to read {path:?}: {e}");
            std::process::exit(1);
        }
    }
}
