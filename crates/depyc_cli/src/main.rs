use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, DecompileModeCli, TopLevel};

mod cli;

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { path, mode, python }) => {
            let mode = match mode {
                DecompileModeCli::Source => depyc_lib::DecompileMode::Source,
                DecompileModeCli::Disasm => depyc_lib::DecompileMode::Disasm,
            };
            let version = match python {
                Some(v) => depyc_lib::VersionSelect::Pinned(v),
                None => depyc_lib::VersionSelect::Auto,
            };
            match std::fs::read(&path) {
                Ok(bytes) => match depyc_lib::decompile_with_options(
                    &bytes,
                    depyc_lib::DecompileOptions { mode, version },
                ) {
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
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            Cli::command().print_help().unwrap();
        }
    }
}
