// Licensed under the Apache-2.0 license

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::LazyLock;

mod cargo;
mod deps;
mod env_image;
mod header;
mod precheckin;

pub(crate) static PROJECT_ROOT: LazyLock<PathBuf> = LazyLock::new(|| {
    let current_dir = std::env::current_dir().unwrap_or_default();
    std::env::var("CARGO_MANIFEST_DIR")
        .ok()
        .and_then(|dir| PathBuf::from(dir).parent().map(|p| p.to_path_buf()))
        .unwrap_or(current_dir)
});

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Xtask {
    #[command(subcommand)]
    xtask: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run clippy on all targets
    Clippy,
    /// Check that all files are formatted
    Format,
    /// Check that Cargo.lock doesn't need to be updated
    CargoLock,
    /// Add Apache-2.0 license header to files where it is missing
    HeaderFix,
    /// Check that all files have the Apache-2.0 license header
    HeaderCheck,
    /// Check that all dependencies come from the workspace
    Deps,
    /// Run tests
    Test,
    /// Run precheckin steps
    Precheckin,
    /// Boot-loader environment images
    EnvImage {
        #[command(subcommand)]
        subcommand: EnvImageCommands,
    },
}

#[derive(Subcommand)]
enum EnvImageCommands {
    /// Build an env image from a text file of `key=value` lines
    Create {
        /// Text file with one `key=value` entry per line
        #[arg(value_name = "INPUT", required = true)]
        input: PathBuf,

        /// Output file for the env image
        #[arg(value_name = "OUTPUT", required = true)]
        output: PathBuf,
    },
    /// Check the CRC of an env image and print its entries
    Verify {
        /// Env image, or a full flash dump starting at the env partition
        #[arg(value_name = "FILE", required = true)]
        file: PathBuf,
    },
}

fn main() {
    let cli = Xtask::parse();
    let result = match &cli.xtask {
        Commands::Clippy => cargo::clippy(),
        Commands::Precheckin => precheckin::precheckin(),
        Commands::Format => cargo::format(),
        Commands::CargoLock => cargo::cargo_lock(),
        Commands::HeaderFix => header::fix(),
        Commands::HeaderCheck => header::check(),
        Commands::Test => cargo::test(),
        Commands::Deps => deps::check(),
        Commands::EnvImage { subcommand } => match subcommand {
            EnvImageCommands::Create { input, output } => env_image::create(input, output),
            EnvImageCommands::Verify { file } => env_image::verify(file),
        },
    };
    result.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
}
