use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod extract;
mod image;
mod inspect;

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the image superblock.
    Info(inspect::InfoArgs),
    /// List a directory.
    Ls(inspect::LsArgs),
    /// Write a file's contents to stdout.
    Cat(inspect::CatArgs),
    /// Print one inode in detail.
    Stat(inspect::StatArgs),
    /// Extract a directory tree to the local filesystem.
    Extract(extract::ExtractArgs),
}

#[derive(Debug, Parser)]
struct Opt {
    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();

    let opt = Opt::parse();
    match opt.command {
        Commands::Info(args) => inspect::info(args),
        Commands::Ls(args) => inspect::ls(args),
        Commands::Cat(args) => inspect::cat(args),
        Commands::Stat(args) => inspect::stat(args),
        Commands::Extract(args) => extract::extract(args),
    }
}
