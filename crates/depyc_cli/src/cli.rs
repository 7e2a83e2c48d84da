use std::path::PathBuf;

use clap::{
    builder::{
        styling::{AnsiColor, Effects},
        Styles,
    },
    crate_description, crate_name, crate_version, Parser, Subcommand, ValueEnum,
};
use clap_complete::Shell;

use depyc_lib::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Source,
    Disasm,
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
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles a compiled Python (.pyc) file
    Decompile {
        /// Path to the .pyc file
        path: PathBuf,

        /// Output mode
        #[arg(long, value_enum, default_value_t = DecompileModeCli::Source)]
        mode: DecompileModeCli,

        /// Target interpreter version, e.g. 2.7 (default: from the magic number)
        #[arg(long, value_parser = parse_version)]
        python: Option<Version>,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn parse_version(text: &str) -> Result<Version, String> {
    let (major, minor) = text
        .split_once('.')
        .ok_or_else(|| format!("expected MAJOR.MINOR, got {text:?}"))?;
    let major = major
        .parse::<u8>()
        .map_err(|e| format!("bad major version: {e}"))?;
    let minor = minor
        .parse::<u8>()
        .map_err(|e| format!("bad minor version: {e}"))?;
    Ok(Version::new(major, minor))
}
